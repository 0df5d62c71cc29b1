//! Fleet plan file parser.
//!
//! A plan describes the scheduler's timing, the nodes to lease, and the
//! deployments to place:
//!
//! ```toml
//! [scheduler]
//! reaper_interval = "10s"
//! dispatch_interval = "0ms"
//! ordering = "least_active"
//!
//! [[nodes]]
//! identity = "n1"
//! address = "10.0.0.1"
//! service_limit = 8
//! labels = { arch = "x86_64" }
//!
//! [[deployments]]
//! group = "shop"
//! name = "api"
//! planned = 3
//! requirements = { arch = "x86_64" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use fleet_core::{DeploymentDescriptor, DescriptorKey, NodeDescriptor};
use fleet_lease::LeasePolicy;
use fleet_provision::DispatchConfig;
use fleet_selector::{LeastActive, OrderingPolicy, RegistrationOrder, RoundRobin};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetPlan {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub deployments: Vec<DeploymentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub reaper_interval: String,
    /// Lease granted to every node in the plan.
    pub lease_duration: String,
    pub max_lease_duration: String,
    pub dispatch_interval: String,
    pub process_interval: String,
    pub worker_pool_size: usize,
    /// `registration`, `round_robin` or `least_active`.
    pub ordering: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            reaper_interval: "10s".to_string(),
            lease_duration: "30s".to_string(),
            max_lease_duration: "5m".to_string(),
            dispatch_interval: "500ms".to_string(),
            process_interval: "5s".to_string(),
            worker_pool_size: 8,
            ordering: "registration".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub identity: String,
    pub address: String,
    pub service_limit: u32,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub dynamic_enabled: bool,
    /// Instances already running, keyed by `group/name`.
    #[serde(default)]
    pub running: BTreeMap<String, u32>,
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    pub fn build(&self) -> anyhow::Result<NodeDescriptor> {
        let node = NodeDescriptor::new(&self.identity, &self.address, self.service_limit)
            .with_labels(self.labels.clone())
            .with_dynamic_enabled(self.dynamic_enabled);
        for (deployment, &count) in &self.running {
            node.set_actual(&parse_key(deployment)?, count);
        }
        Ok(node)
    }
}

impl FleetPlan {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing plan {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check everything `simulate` would trip over.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.lease_policy()?;
        self.dispatch_config()?;
        self.ordering_policy()?;
        self.lease_duration()?;

        let mut identities = HashSet::new();
        for node in &self.nodes {
            if !identities.insert(node.identity.as_str()) {
                bail!("duplicate node identity: {}", node.identity);
            }
            if node.service_limit == 0 {
                bail!("node {} has a zero service limit", node.identity);
            }
            for deployment in node.running.keys() {
                parse_key(deployment).with_context(|| format!("node {}", node.identity))?;
            }
        }

        let mut keys = HashSet::new();
        for deployment in &self.deployments {
            let key = deployment.key();
            if !keys.insert(key.clone()) {
                bail!("duplicate deployment: {key}");
            }
            if deployment.max_per_machine == Some(0) {
                bail!("deployment {key} has max_per_machine = 0");
            }
        }
        Ok(())
    }

    pub fn lease_policy(&self) -> anyhow::Result<LeasePolicy> {
        let reaper_interval = parse_duration(&self.scheduler.reaper_interval)?;
        if reaper_interval.is_zero() {
            bail!("reaper_interval must be greater than zero");
        }
        Ok(LeasePolicy::default()
            .with_reaper_interval(reaper_interval)
            .with_max_duration(parse_duration(&self.scheduler.max_lease_duration)?))
    }

    pub fn lease_duration(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.scheduler.lease_duration)
    }

    pub fn dispatch_config(&self) -> anyhow::Result<DispatchConfig> {
        if self.scheduler.worker_pool_size == 0 {
            bail!("worker_pool_size must be at least 1");
        }
        let process_interval = parse_duration(&self.scheduler.process_interval)?;
        if process_interval.is_zero() {
            bail!("process_interval must be greater than zero");
        }
        Ok(DispatchConfig::default()
            .with_dispatch_interval(parse_duration(&self.scheduler.dispatch_interval)?)
            .with_process_interval(process_interval)
            .with_worker_pool_size(self.scheduler.worker_pool_size))
    }

    pub fn ordering_policy(&self) -> anyhow::Result<Arc<dyn OrderingPolicy>> {
        match self.scheduler.ordering.as_str() {
            "registration" => Ok(Arc::new(RegistrationOrder)),
            "round_robin" => Ok(Arc::new(RoundRobin)),
            "least_active" => Ok(Arc::new(LeastActive)),
            other => bail!("unknown ordering policy: {other}"),
        }
    }
}

/// Parse a duration string like "500ms", "10s", "5m", "1h".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value = digits
        .parse::<u64>()
        .with_context(|| format!("invalid duration: {s:?}"))?;
    let millis = value
        .checked_mul(unit_ms)
        .with_context(|| format!("duration out of range: {s:?}"))?;
    Ok(Duration::from_millis(millis))
}

fn parse_key(s: &str) -> anyhow::Result<DescriptorKey> {
    match s.split_once('/') {
        Some((group, name)) if !group.is_empty() && !name.is_empty() => {
            Ok(DescriptorKey::new(group, name))
        }
        _ => bail!("expected group/name, got {s:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use fleet_core::{MachineBoundary, PlacementKind};

    const PLAN: &str = r#"
[scheduler]
reaper_interval = "1s"
dispatch_interval = "0ms"
ordering = "round_robin"

[[nodes]]
identity = "n1"
address = "10.0.0.1"
service_limit = 4
labels = { arch = "x86_64" }
running = { "shop/api" = 1 }

[[nodes]]
identity = "n2"
address = "10.0.0.2"
service_limit = 2
dynamic_enabled = false

[[deployments]]
group = "shop"
name = "api"
planned = 3
max_per_machine = 1
machine_boundary = "physical"
requirements = { arch = "x86_64" }

[[deployments]]
group = "shop"
name = "agent"
planned = 2
kind = "replicated"
"#;

    #[test]
    fn parse_full_plan() {
        let plan = FleetPlan::parse(PLAN).unwrap();
        assert_eq!(plan.scheduler.ordering, "round_robin");
        assert_eq!(plan.scheduler.worker_pool_size, 8);
        assert_eq!(plan.nodes.len(), 2);
        assert!(!plan.nodes[1].dynamic_enabled);

        let api = &plan.deployments[0];
        assert_eq!(api.machine_limit(), Some(1));
        assert_eq!(api.machine_boundary, MachineBoundary::Physical);
        assert_eq!(plan.deployments[1].kind, PlacementKind::Replicated);
        plan.validate().unwrap();
    }

    #[test]
    fn node_spec_builds_counts() {
        let plan = FleetPlan::parse(PLAN).unwrap();
        let node = plan.nodes[0].build().unwrap();
        assert_eq!(node.counts(&DescriptorKey::new("shop", "api")).actual, 1);
        assert_eq!(node.labels().get("arch").map(String::as_str), Some("x86_64"));
    }

    #[test]
    fn empty_plan_uses_defaults() {
        let plan = FleetPlan::parse("").unwrap();
        let policy = plan.lease_policy().unwrap();
        assert_eq!(policy.reaper_interval, Duration::from_secs(10));
        let dispatch = plan.dispatch_config().unwrap();
        assert_eq!(dispatch.dispatch_interval, Duration::from_millis(500));
        plan.validate().unwrap();
    }

    #[test]
    fn validate_rejects_duplicate_nodes() {
        let mut plan = FleetPlan::parse(PLAN).unwrap();
        plan.nodes[1].identity = "n1".to_string();
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node identity"));
    }

    #[test]
    fn validate_rejects_unknown_ordering() {
        let mut plan = FleetPlan::parse(PLAN).unwrap();
        plan.scheduler.ordering = "random".to_string();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_running_key() {
        let mut plan = FleetPlan::parse(PLAN).unwrap();
        plan.nodes[0].running.insert("noslash".to_string(), 1);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn from_file_reads_plan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PLAN.as_bytes()).unwrap();
        let plan = FleetPlan::from_file(file.path()).unwrap();
        assert_eq!(plan.deployments.len(), 2);
    }

    #[test]
    fn from_file_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = FleetPlan::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn parse_duration_values() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        let err = parse_duration("18446744073709551615h").unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert!(parse_duration("18446744073709551615s").is_err());
        assert_eq!(
            parse_duration("18446744073709551615ms").unwrap(),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn validate_rejects_zero_intervals() {
        let mut plan = FleetPlan::parse(PLAN).unwrap();
        plan.scheduler.reaper_interval = "0s".to_string();
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("reaper_interval"));

        let mut plan = FleetPlan::parse(PLAN).unwrap();
        plan.scheduler.process_interval = "0ms".to_string();
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("process_interval"));
    }
}
