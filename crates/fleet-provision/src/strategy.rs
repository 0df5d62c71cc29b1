//! Placement strategies — what a processing pass does with one request.
//!
//! The elastic strategy finds one node for one instance and the request
//! leaves the queue once dispatched. The replicated strategy spreads the
//! descriptor's planned count over every qualifying node and keeps its
//! request queued, so nodes that join later are considered on later passes.

use std::collections::HashMap;

use tracing::{debug, warn};

use fleet_core::{CapabilityError, DeploymentRequest, PlacementKind};
use fleet_lease::LeasedNode;
use fleet_selector::SelectionError;

use crate::context::ProvisionContext;

/// Instances to start on one node.
#[derive(Debug, Clone)]
pub struct Placement {
    pub node: LeasedNode,
    pub instances: u32,
}

pub trait PlacementStrategy: Send + Sync {
    fn kind(&self) -> PlacementKind;

    /// Whether a placed request is removed from its queue.
    fn consumes_request(&self) -> bool;

    /// Plan placements for `request`, recording rejection reasons on it.
    ///
    /// `target` restricts planning to nodes on one host. Permanent
    /// capability failures are reported to `ctx` and never escape.
    fn plan(
        &self,
        ctx: &ProvisionContext,
        request: &mut DeploymentRequest,
        target: Option<&str>,
    ) -> Vec<Placement>;
}

/// One instance on the first node the selector accepts.
#[derive(Debug, Default)]
pub struct ElasticPlacement;

impl PlacementStrategy for ElasticPlacement {
    fn kind(&self) -> PlacementKind {
        PlacementKind::Elastic
    }

    fn consumes_request(&self) -> bool {
        true
    }

    fn plan(
        &self,
        ctx: &ProvisionContext,
        request: &mut DeploymentRequest,
        target: Option<&str>,
    ) -> Vec<Placement> {
        let key = request.key();
        let mut excluded = ctx.uninstantiable_nodes(&key);
        if let Some(host) = target {
            excluded.extend(
                ctx.selector()
                    .by_host(host, false)
                    .into_iter()
                    .map(|n| n.identity().to_string()),
            );
        }

        // Each permanent rejection excludes one more node, so this ends.
        loop {
            let mut reasons = Vec::new();
            let outcome = ctx.selector().place(&request.descriptor, &excluded, &mut reasons);
            request.failure_reasons.extend(reasons);

            match outcome {
                Ok(Some(node)) => return vec![Placement { node, instances: 1 }],
                Ok(None) => return Vec::new(),
                Err(SelectionError::Permanent { node, reason }) => {
                    ctx.reject(request, &node, &reason);
                    excluded.push(node);
                }
            }
        }
    }
}

/// Copies on every qualifying node, bounded by the planned count.
///
/// A node may take `planned - (actual + in_flight)` instances of the
/// descriptor, further capped by its remaining service headroom, by the
/// per-machine limit left on its host, and by what is still missing
/// fleet-wide. Nodes are filled first-fit in selector order.
#[derive(Debug, Default)]
pub struct ReplicatedPlacement;

impl PlacementStrategy for ReplicatedPlacement {
    fn kind(&self) -> PlacementKind {
        PlacementKind::Replicated
    }

    fn consumes_request(&self) -> bool {
        false
    }

    fn plan(
        &self,
        ctx: &ProvisionContext,
        request: &mut DeploymentRequest,
        target: Option<&str>,
    ) -> Vec<Placement> {
        let descriptor = request.descriptor.clone();
        let key = descriptor.key();
        let live = ctx.selector().snapshot();

        let mut host_load: HashMap<String, u32> = HashMap::new();
        let mut placed = 0u32;
        for handle in &live {
            let total = handle.node().counts(&key).total();
            placed += total;
            *host_load.entry(handle.address().to_string()).or_default() += total;
        }

        let mut remaining = descriptor.planned.saturating_sub(placed);
        if remaining == 0 {
            debug!(deployment = %key, planned = descriptor.planned, "replicated deployment fully placed");
            return Vec::new();
        }

        let excluded = ctx.uninstantiable_nodes(&key);
        let mut qualifying = Vec::new();
        for handle in live {
            if target.is_some_and(|host| host != handle.address()) {
                continue;
            }
            if excluded.iter().any(|id| id == handle.identity()) {
                request.record_failure(format!("{}: un-instantiable", handle.identity()));
                continue;
            }
            match handle.node().can_provision(&descriptor) {
                Ok(true) => qualifying.push(handle),
                Ok(false) => {
                    request.record_failure(format!("{}: does not meet requirements", handle.identity()));
                }
                Err(CapabilityError::Transient(reason)) => {
                    warn!(node = %handle.identity(), deployment = %key, %reason, "transient capability check failure");
                    request.record_failure(format!("{}: {reason}", handle.identity()));
                }
                Err(CapabilityError::Permanent(reason)) => {
                    ctx.reject(request, handle.identity(), &reason);
                }
            }
        }

        let qualifying = ctx.selector().filter_isolation(&descriptor, qualifying);

        let mut placements = Vec::new();
        for handle in qualifying {
            if remaining == 0 {
                break;
            }
            let node = handle.node();
            let mut allowed = descriptor
                .planned
                .saturating_sub(node.counts(&key).total())
                .min(node.headroom())
                .min(remaining);
            if let Some(limit) = descriptor.machine_limit() {
                let used = host_load.get(handle.address()).copied().unwrap_or(0);
                allowed = allowed.min(limit.saturating_sub(used));
            }

            if allowed == 0 {
                request.record_failure(format!("{}: no room for another instance", handle.identity()));
                continue;
            }

            *host_load.entry(handle.address().to_string()).or_default() += allowed;
            remaining -= allowed;
            placements.push(Placement {
                node: handle,
                instances: allowed,
            });
        }

        if placements.is_empty() {
            debug!(deployment = %key, remaining, "no node can take a replicated instance");
        }
        placements
    }
}
