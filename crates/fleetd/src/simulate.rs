//! In-process placement simulation of a fleet plan.
//!
//! Every node in the plan is leased into a real registry, every deployment
//! is submitted, and the scheduler runs a fixed number of passes against an
//! executor that confirms each placement immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use fleet_core::RequestStatus;
use fleet_lease::LeaseRegistry;
use fleet_provision::{
    Assignment, BoxFuture, ChannelPublisher, CountersSnapshot, ProvisionContext,
    ProvisionExecutor, ProvisionFailureEvent, ProvisionResult,
};
use fleet_selector::NodeSelector;

use crate::config::FleetPlan;

/// Confirms every assignment.
struct ConfirmingExecutor;

impl ProvisionExecutor for ConfirmingExecutor {
    fn provision<'a>(&'a self, assignment: &'a Assignment) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            debug!(
                deployment = %assignment.request.key(),
                instance = assignment.request.instance_id,
                node = %assignment.node_id(),
                "simulated instance start"
            );
            Ok(())
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub passes: u32,
    pub nodes: Vec<NodeReport>,
    pub pending: Vec<PendingReport>,
    pub failures: Vec<ProvisionFailureEvent>,
    pub counters: CountersSnapshot,
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub identity: String,
    pub address: String,
    pub service_limit: u32,
    pub leased: bool,
    /// Running instances per `group/name`.
    pub instances: BTreeMap<String, u32>,
}

#[derive(Debug, Serialize)]
pub struct PendingReport {
    pub deployment: String,
    pub instance_id: u64,
    pub status: RequestStatus,
    pub reasons: Vec<String>,
}

pub async fn simulate(plan: &FleetPlan, passes: u32) -> anyhow::Result<SimulationReport> {
    plan.validate()?;

    let registry = LeaseRegistry::new(plan.lease_policy()?);
    let selector = Arc::new(NodeSelector::new().with_policy(plan.ordering_policy()?));
    selector.attach(&registry);

    let (publisher, mut events) = ChannelPublisher::new();
    let ctx = Arc::new(
        ProvisionContext::new(
            Arc::clone(&selector),
            Arc::new(ConfirmingExecutor),
            plan.dispatch_config()?,
        )
        .with_publisher(Arc::new(publisher)),
    );

    let lease_duration = plan.lease_duration()?;
    let mut nodes = Vec::with_capacity(plan.nodes.len());
    for spec in &plan.nodes {
        let node = Arc::new(spec.build()?);
        let leased = match registry.grant(Arc::clone(&node), lease_duration) {
            Ok(lease) => {
                debug!(node = %spec.identity, cookie = %lease.cookie, "node leased");
                true
            }
            Err(e) => {
                warn!(node = %spec.identity, error = %e, "lease denied");
                false
            }
        };
        nodes.push((node, leased));
    }

    for descriptor in &plan.deployments {
        ctx.submit(descriptor.clone());
    }

    for pass in 1..=passes {
        let dispatched = ctx.process_all();
        ctx.quiesce().await;
        info!(pass, dispatched, "simulation pass complete");
    }
    registry.shutdown();

    let mut failures = Vec::new();
    while let Ok(event) = events.try_recv() {
        failures.push(event);
    }

    let mut pending = Vec::new();
    for queue in [ctx.elastic(), ctx.replicated()] {
        for descriptor in &plan.deployments {
            for request in queue.pending_for(&descriptor.key()) {
                pending.push(PendingReport {
                    deployment: request.key().to_string(),
                    instance_id: request.instance_id,
                    status: request.status,
                    reasons: request.failure_reasons.clone(),
                });
            }
        }
    }

    let nodes = nodes
        .into_iter()
        .map(|(node, leased)| NodeReport {
            identity: node.identity().to_string(),
            address: node.address().to_string(),
            service_limit: node.service_limit(),
            leased,
            instances: node
                .counts_snapshot()
                .into_iter()
                .filter(|(_, counts)| counts.actual > 0)
                .map(|(key, counts)| (key.to_string(), counts.actual))
                .collect(),
        })
        .collect();

    Ok(SimulationReport {
        passes,
        nodes,
        pending,
        failures,
        counters: ctx.counters(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(text: &str) -> FleetPlan {
        FleetPlan::parse(text).unwrap()
    }

    #[tokio::test]
    async fn elastic_deployment_fills_capacity() {
        let plan = plan(
            r#"
[scheduler]
dispatch_interval = "0ms"

[[nodes]]
identity = "n1"
address = "10.0.0.1"
service_limit = 2

[[nodes]]
identity = "n2"
address = "10.0.0.2"
service_limit = 2

[[deployments]]
group = "shop"
name = "api"
planned = 3
"#,
        );

        let report = simulate(&plan, 1).await.unwrap();
        let placed: u32 = report
            .nodes
            .iter()
            .filter_map(|n| n.instances.get("shop/api"))
            .sum();
        assert_eq!(placed, 3);
        assert!(report.pending.is_empty());
        assert_eq!(report.counters.succeeded, 3);
    }

    #[tokio::test]
    async fn unplaceable_deployment_reports_reasons() {
        let plan = plan(
            r#"
[scheduler]
dispatch_interval = "0ms"

[[nodes]]
identity = "n1"
address = "10.0.0.1"
service_limit = 2

[[deployments]]
group = "shop"
name = "gpu-worker"
planned = 1
requirements = { gpu = "*" }
"#,
        );

        let report = simulate(&plan, 2).await.unwrap();
        assert_eq!(report.pending.len(), 1);
        assert!(!report.pending[0].reasons.is_empty());
        assert_eq!(report.counters.dispatched, 0);
        assert_eq!(report.counters.passes, 2);
    }

    #[tokio::test]
    async fn report_serializes() {
        let report = simulate(&FleetPlan::default(), 1).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["passes"], 1);
        assert!(json["nodes"].as_array().unwrap().is_empty());
    }
}
