//! Node selector — the live node view and the placement pipeline.
//!
//! The selector's node list is mutated only through lease callbacks
//! (`register` on grant, `update` on renew, `remove` on expire/remove).
//! Every query works on a snapshot of that list, so filtering never races
//! with registry changes mid-computation. Between an expiration and its
//! callback the selector may still offer the expired node; that window is
//! tolerated.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{debug, error, info, warn};

use fleet_core::{CapabilityError, DeploymentDescriptor, NodeDescriptor, NodeId};
use fleet_lease::{LeaseCookie, LeaseListener, LeaseRegistry, LeasedNode, ListenerId};

use crate::error::{SelectionError, SelectionResult};
use crate::filter;
use crate::isolation::{AssociationMatcher, HostIsolation};
use crate::policy::{OrderingPolicy, RegistrationOrder};

pub struct NodeSelector {
    nodes: RwLock<Vec<LeasedNode>>,
    policy: Arc<dyn OrderingPolicy>,
    isolation: Arc<dyn AssociationMatcher>,
    /// Signalled when a node registers or renews.
    changed: Notify,
}

impl NodeSelector {
    /// A selector trying nodes in registration order, with host isolation.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            policy: Arc::new(RegistrationOrder),
            isolation: Arc::new(HostIsolation),
            changed: Notify::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn OrderingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_isolation_matcher(mut self, matcher: Arc<dyn AssociationMatcher>) -> Self {
        self.isolation = matcher;
        self
    }

    /// Subscribe to `registry` and seed the view with its current leases.
    ///
    /// The registry replays its live leases under its fan-out lock, so a
    /// lease that ends while attaching never lingers in the view.
    pub fn attach(self: &Arc<Self>, registry: &LeaseRegistry<Arc<NodeDescriptor>>) -> ListenerId {
        let id = registry.add_listener_with_replay(self.clone());
        info!(policy = self.policy.name(), nodes = self.len(), "node selector attached");
        id
    }

    /// Completes after the next node registration or renewal.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    // ── View maintenance (lease callbacks only) ─────────────────────

    fn register(&self, handle: LeasedNode) {
        {
            let mut nodes = self.write_nodes();
            match nodes.iter_mut().find(|n| n.cookie == handle.cookie) {
                Some(existing) => *existing = handle,
                None => {
                    debug!(node = %handle.identity(), address = %handle.address(), "node registered");
                    nodes.push(handle);
                }
            }
        }
        self.changed.notify_one();
    }

    fn update(&self, handle: LeasedNode) {
        self.register(handle);
    }

    fn remove(&self, cookie: LeaseCookie) -> bool {
        let mut nodes = self.write_nodes();
        let before = nodes.len();
        nodes.retain(|n| n.cookie != cookie);
        let removed = before != nodes.len();
        if removed {
            debug!(%cookie, "node removed from selector");
        }
        removed
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Point-in-time copy of the live nodes.
    pub fn snapshot(&self) -> Vec<LeasedNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nodes whose host matches `address` (or, with `inclusive = false`,
    /// does not match it).
    pub fn by_host(&self, address: &str, inclusive: bool) -> Vec<LeasedNode> {
        self.snapshot()
            .into_iter()
            .filter(|n| (n.address() == address) == inclusive)
            .collect()
    }

    /// Live nodes able to provision `descriptor`, in policy order.
    ///
    /// Transient capability failures skip the node; a permanent one aborts
    /// the scan and is returned.
    pub fn candidates_for(
        &self,
        descriptor: &DeploymentDescriptor,
    ) -> SelectionResult<Vec<LeasedNode>> {
        self.capable_among(descriptor, self.snapshot(), &mut Vec::new())
    }

    /// Apply the descriptor's per-machine limit.
    pub fn filter_machine_boundary(
        &self,
        descriptor: &DeploymentDescriptor,
        candidates: Vec<LeasedNode>,
    ) -> Vec<LeasedNode> {
        filter::machine_boundary(descriptor, candidates)
    }

    /// Drop candidates that would colocate with an isolated peer.
    pub fn filter_isolation(
        &self,
        descriptor: &DeploymentDescriptor,
        candidates: Vec<LeasedNode>,
    ) -> Vec<LeasedNode> {
        if !descriptor.is_isolated() {
            return candidates;
        }
        let known_hosts = self.known_isolation_hosts(descriptor);
        candidates
            .into_iter()
            .filter(|c| {
                let meets = self.isolation.meets_isolation(descriptor, c, &known_hosts);
                if !meets {
                    debug!(node = %c.identity(), deployment = %descriptor.key(), "isolation excludes node");
                }
                meets
            })
            .collect()
    }

    /// Hosts currently running (or provisioning) a peer named in the
    /// descriptor's isolation list.
    pub fn known_isolation_hosts(&self, descriptor: &DeploymentDescriptor) -> Vec<String> {
        let hosts: BTreeSet<String> = self
            .snapshot()
            .iter()
            .filter(|n| descriptor.isolation.iter().any(|peer| n.node().hosts_service(peer)))
            .map(|n| n.address().to_string())
            .collect();
        hosts.into_iter().collect()
    }

    /// First candidate with room for one more instance of `descriptor`.
    ///
    /// `Ok(None)` means no placement right now, which is expected.
    pub fn select(
        &self,
        descriptor: &DeploymentDescriptor,
        candidates: &[LeasedNode],
    ) -> SelectionResult<Option<LeasedNode>> {
        self.select_recording(descriptor, candidates, &mut Vec::new())
    }

    /// Like [`select`](Self::select), pushing one reason per rejected candidate.
    pub fn select_recording(
        &self,
        descriptor: &DeploymentDescriptor,
        candidates: &[LeasedNode],
        reasons: &mut Vec<String>,
    ) -> SelectionResult<Option<LeasedNode>> {
        let key = descriptor.key();

        for candidate in candidates {
            let node = candidate.node();
            let load = node.total_load();
            if load >= node.service_limit() {
                reasons.push(format!(
                    "{}: at service limit ({load}/{})",
                    node.identity(),
                    node.service_limit()
                ));
                continue;
            }

            let counts = node.counts(&key);
            if counts.actual >= descriptor.planned {
                reasons.push(format!(
                    "{}: already runs {} of {} planned instances",
                    node.identity(),
                    counts.actual,
                    descriptor.planned
                ));
                continue;
            }

            if !node.dynamic_enabled() {
                reasons.push(format!("{}: dynamic provisioning disabled", node.identity()));
                continue;
            }

            match node.can_provision(descriptor) {
                Ok(true) => {
                    self.policy.on_selected(&mut self.write_nodes(), candidate.cookie);
                    debug!(node = %node.identity(), deployment = %key, "node selected");
                    return Ok(Some(candidate.clone()));
                }
                Ok(false) => {
                    reasons.push(format!("{}: does not meet requirements", node.identity()));
                }
                Err(e) => self.capability_failure(candidate, descriptor, e, reasons)?,
            }
        }

        Ok(None)
    }

    /// The standard placement sequence: capability candidates (skipping
    /// `excluded` nodes without checking them), machine boundary, isolation,
    /// then selection.
    pub fn place(
        &self,
        descriptor: &DeploymentDescriptor,
        excluded: &[NodeId],
        reasons: &mut Vec<String>,
    ) -> SelectionResult<Option<LeasedNode>> {
        let live: Vec<LeasedNode> = self
            .snapshot()
            .into_iter()
            .filter(|n| !excluded.iter().any(|id| id == n.identity()))
            .collect();

        let candidates = self.capable_among(descriptor, live, reasons)?;
        if candidates.is_empty() {
            reasons.push(format!("no live node can provision {}", descriptor.key()));
            return Ok(None);
        }

        let bounded = self.filter_machine_boundary(descriptor, candidates);
        if bounded.is_empty() {
            reasons.push(format!(
                "every candidate host is at the per-machine limit for {}",
                descriptor.key()
            ));
            return Ok(None);
        }

        let isolated = self.filter_isolation(descriptor, bounded);
        if isolated.is_empty() {
            reasons.push(format!(
                "every candidate host runs an isolated peer of {}",
                descriptor.key()
            ));
            return Ok(None);
        }

        self.select_recording(descriptor, &isolated, reasons)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn capable_among(
        &self,
        descriptor: &DeploymentDescriptor,
        mut nodes: Vec<LeasedNode>,
        reasons: &mut Vec<String>,
    ) -> SelectionResult<Vec<LeasedNode>> {
        self.policy.arrange(&mut nodes);

        let mut capable = Vec::with_capacity(nodes.len());
        for candidate in nodes {
            match candidate.node().can_provision(descriptor) {
                Ok(true) => capable.push(candidate),
                Ok(false) => {
                    reasons.push(format!("{}: does not meet requirements", candidate.identity()));
                }
                Err(e) => self.capability_failure(&candidate, descriptor, e, reasons)?,
            }
        }
        Ok(capable)
    }

    /// Transient failures are logged and recorded; permanent ones become errors.
    fn capability_failure(
        &self,
        candidate: &LeasedNode,
        descriptor: &DeploymentDescriptor,
        error: CapabilityError,
        reasons: &mut Vec<String>,
    ) -> SelectionResult<()> {
        match error {
            CapabilityError::Transient(reason) => {
                warn!(node = %candidate.identity(), deployment = %descriptor.key(), %reason, "transient capability check failure");
                reasons.push(format!("{}: {reason}", candidate.identity()));
                Ok(())
            }
            CapabilityError::Permanent(reason) => {
                error!(node = %candidate.identity(), deployment = %descriptor.key(), %reason, "permanent provision failure");
                Err(SelectionError::Permanent {
                    node: candidate.identity().to_string(),
                    reason,
                })
            }
        }
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, Vec<LeasedNode>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NodeSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseListener<Arc<NodeDescriptor>> for NodeSelector {
    fn on_granted(&self, lease: &LeasedNode) -> anyhow::Result<()> {
        self.register(lease.clone());
        Ok(())
    }

    fn on_renewed(&self, lease: &LeasedNode) -> anyhow::Result<()> {
        self.update(lease.clone());
        Ok(())
    }

    fn on_expired(&self, lease: &LeasedNode) -> anyhow::Result<()> {
        self.remove(lease.cookie);
        Ok(())
    }

    fn on_removed(&self, lease: &LeasedNode) -> anyhow::Result<()> {
        self.remove(lease.cookie);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fleet_core::{CapabilityResult, DescriptorKey};
    use fleet_lease::{LeasePolicy, LeasedResource};
    use tokio::time::Instant;

    use crate::policy::{LeastActive, RoundRobin};

    fn node(id: &str, host: &str, limit: u32) -> Arc<NodeDescriptor> {
        Arc::new(NodeDescriptor::new(id, host, limit))
    }

    fn leased(cookie: u64, node: Arc<NodeDescriptor>) -> LeasedNode {
        LeasedResource {
            cookie: LeaseCookie(cookie),
            expiration: Instant::now() + Duration::from_secs(3600),
            resource: node,
        }
    }

    fn selector_with(nodes: Vec<LeasedNode>) -> NodeSelector {
        let selector = NodeSelector::new();
        for n in nodes {
            selector.register(n);
        }
        selector
    }

    fn ids(nodes: &[LeasedNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.identity()).collect()
    }

    fn failing(err: CapabilityError) -> Arc<dyn fleet_core::CapabilityMatcher> {
        Arc::new(
            move |_: &NodeDescriptor, _: &DeploymentDescriptor| -> CapabilityResult<bool> {
                Err(err.clone())
            },
        )
    }

    #[test]
    fn node_at_service_limit_is_skipped() {
        let full = node("full", "10.0.0.1", 5);
        full.set_actual(&DescriptorKey::new("g", "other"), 5);
        let free = node("free", "10.0.0.2", 5);
        let selector = selector_with(vec![leased(1, full), leased(2, free)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 3);

        let candidates = selector.candidates_for(&descriptor).unwrap();
        let mut reasons = Vec::new();
        let chosen = selector
            .select_recording(&descriptor, &candidates, &mut reasons)
            .unwrap()
            .unwrap();

        assert_eq!(chosen.identity(), "free");
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("service limit"));
    }

    #[test]
    fn in_flight_counts_toward_service_limit() {
        let n = node("n1", "10.0.0.1", 2);
        let key = DescriptorKey::new("g", "api");
        n.set_actual(&key, 1);
        n.begin_provision(&key);
        let selector = selector_with(vec![leased(1, n)]);

        let descriptor = DeploymentDescriptor::new("g", "api", 5);
        let candidates = selector.candidates_for(&descriptor).unwrap();
        assert!(selector.select(&descriptor, &candidates).unwrap().is_none());
    }

    #[test]
    fn node_already_at_planned_count_is_skipped() {
        let n = node("n1", "10.0.0.1", 10);
        n.set_actual(&DescriptorKey::new("g", "api"), 2);
        let selector = selector_with(vec![leased(1, n)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 2);

        let candidates = selector.candidates_for(&descriptor).unwrap();
        assert!(selector.select(&descriptor, &candidates).unwrap().is_none());
    }

    #[test]
    fn dynamic_disabled_node_is_skipped() {
        let off = Arc::new(NodeDescriptor::new("off", "10.0.0.1", 10).with_dynamic_enabled(false));
        let on = node("on", "10.0.0.2", 10);
        let selector = selector_with(vec![leased(1, off), leased(2, on)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 1);

        let candidates = selector.candidates_for(&descriptor).unwrap();
        let chosen = selector.select(&descriptor, &candidates).unwrap().unwrap();
        assert_eq!(chosen.identity(), "on");
    }

    #[test]
    fn transient_failure_skips_candidate() {
        let flaky = Arc::new(
            NodeDescriptor::new("flaky", "10.0.0.1", 10)
                .with_matcher(failing(CapabilityError::Transient("timeout".into()))),
        );
        let good = node("good", "10.0.0.2", 10);
        let selector = selector_with(vec![leased(1, flaky), leased(2, good)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 1);

        let candidates = selector.candidates_for(&descriptor).unwrap();
        assert_eq!(ids(&candidates), vec!["good"]);
    }

    #[test]
    fn permanent_failure_aborts_candidate_scan() {
        let broken = Arc::new(
            NodeDescriptor::new("broken", "10.0.0.1", 10)
                .with_matcher(failing(CapabilityError::Permanent("bad artifact".into()))),
        );
        let good = node("good", "10.0.0.2", 10);
        let selector = selector_with(vec![leased(1, broken), leased(2, good)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 1);

        let err = selector.candidates_for(&descriptor).unwrap_err();
        assert_eq!(err.node(), "broken");
        assert_eq!(err.reason(), "bad artifact");
    }

    #[test]
    fn place_skips_excluded_nodes_without_checking_them() {
        let broken = Arc::new(
            NodeDescriptor::new("broken", "10.0.0.1", 10)
                .with_matcher(failing(CapabilityError::Permanent("bad artifact".into()))),
        );
        let good = node("good", "10.0.0.2", 10);
        let selector = selector_with(vec![leased(1, broken), leased(2, good)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 1);

        let mut reasons = Vec::new();
        let chosen = selector
            .place(&descriptor, &["broken".to_string()], &mut reasons)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.identity(), "good");
    }

    #[test]
    fn place_with_no_capable_nodes_explains_why() {
        let n = node("n1", "10.0.0.1", 10);
        let selector = selector_with(vec![leased(1, n)]);
        let descriptor = DeploymentDescriptor::new("g", "api", 1).with_requirement("gpu", "*");

        let mut reasons = Vec::new();
        assert!(selector.place(&descriptor, &[], &mut reasons).unwrap().is_none());
        assert_eq!(reasons.len(), 2);
        assert!(reasons[1].contains("no live node"));
    }

    #[test]
    fn machine_boundary_scenario_two_hosts() {
        let selector = selector_with(vec![
            leased(1, node("a1", "host-a", 10)),
            leased(2, node("a2", "host-a", 10)),
            leased(3, node("b1", "host-b", 10)),
        ]);
        let descriptor = DeploymentDescriptor::new("g", "api", 3).with_machine_limit(1);

        let candidates = selector.candidates_for(&descriptor).unwrap();
        let bounded = selector.filter_machine_boundary(&descriptor, candidates);
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded.iter().filter(|n| n.address() == "host-a").count(), 1);
        assert_eq!(bounded.iter().filter(|n| n.address() == "host-b").count(), 1);
    }

    #[test]
    fn isolation_drops_hosts_running_a_peer() {
        let a = node("a", "host-a", 10);
        a.set_actual(&DescriptorKey::new("g", "primary-db"), 1);
        let b = node("b", "host-b", 10);
        let a_sibling = node("a2", "host-a", 10);
        let selector = selector_with(vec![leased(1, a), leased(2, a_sibling), leased(3, b)]);
        let descriptor = DeploymentDescriptor::new("g", "replica-db", 1).with_isolation("primary-db");

        assert_eq!(selector.known_isolation_hosts(&descriptor), vec!["host-a".to_string()]);
        let kept = selector.filter_isolation(&descriptor, selector.snapshot());
        assert_eq!(ids(&kept), vec!["b"]);
    }

    #[test]
    fn by_host_inclusive_and_exclusive() {
        let selector = selector_with(vec![
            leased(1, node("a1", "host-a", 10)),
            leased(2, node("b1", "host-b", 10)),
            leased(3, node("a2", "host-a", 10)),
        ]);
        assert_eq!(ids(&selector.by_host("host-a", true)), vec!["a1", "a2"]);
        assert_eq!(ids(&selector.by_host("host-a", false)), vec!["b1"]);
    }

    #[test]
    fn round_robin_rotates_selections() {
        let selector = NodeSelector::new().with_policy(Arc::new(RoundRobin));
        for (cookie, id) in [(1, "a"), (2, "b"), (3, "c")] {
            selector.register(leased(cookie, node(id, id, 10)));
        }
        let descriptor = DeploymentDescriptor::new("g", "api", 10);

        let mut picked = Vec::new();
        for _ in 0..4 {
            let candidates = selector.candidates_for(&descriptor).unwrap();
            let chosen = selector.select(&descriptor, &candidates).unwrap().unwrap();
            picked.push(chosen.identity().to_string());
        }
        assert_eq!(picked, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn least_active_prefers_emptier_nodes() {
        let busy = node("busy", "h1", 10);
        busy.set_actual(&DescriptorKey::new("g", "other"), 4);
        let idle = node("idle", "h2", 10);
        let selector = NodeSelector::new().with_policy(Arc::new(LeastActive));
        selector.register(leased(1, busy));
        selector.register(leased(2, idle));

        let descriptor = DeploymentDescriptor::new("g", "api", 1);
        let candidates = selector.candidates_for(&descriptor).unwrap();
        let chosen = selector.select(&descriptor, &candidates).unwrap().unwrap();
        assert_eq!(chosen.identity(), "idle");
    }

    #[test]
    fn selected_node_always_has_headroom() {
        let key = DescriptorKey::new("g", "api");
        let nodes: Vec<_> = (0..6u64)
            .map(|i| {
                let n = node(&format!("n{i}"), &format!("h{i}"), 3);
                n.set_actual(&DescriptorKey::new("g", "other"), (i % 4) as u32);
                leased(i + 1, n)
            })
            .collect();
        let selector = selector_with(nodes);
        let descriptor = DeploymentDescriptor::new("g", "api", 10);

        loop {
            let candidates = selector.candidates_for(&descriptor).unwrap();
            let Some(chosen) = selector.select(&descriptor, &candidates).unwrap() else {
                break;
            };
            let n = chosen.node();
            assert!(n.total_actual() + n.total_in_flight() < n.service_limit());
            n.begin_provision(&key);
        }

        for n in selector.snapshot() {
            assert!(n.node().total_load() <= n.node().service_limit());
        }
    }

    #[tokio::test]
    async fn lease_events_drive_the_view() {
        let registry = LeaseRegistry::new(LeasePolicy::default());
        let selector = Arc::new(NodeSelector::new());
        selector.attach(&registry);

        let lease = registry
            .grant(node("n1", "10.0.0.1", 10), Duration::from_secs(30))
            .unwrap();
        assert_eq!(ids(&selector.snapshot()), vec!["n1"]);

        let renewed = registry.renew(lease.cookie, Duration::from_secs(60)).unwrap();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.snapshot()[0].expiration, renewed.expiration);

        assert!(registry.remove(lease.cookie));
        assert!(selector.is_empty());
    }

    #[tokio::test]
    async fn attach_seeds_existing_leases() {
        let registry = LeaseRegistry::new(LeasePolicy::default());
        registry
            .grant(node("n1", "10.0.0.1", 10), Duration::from_secs(30))
            .unwrap();

        let selector = Arc::new(NodeSelector::new());
        selector.attach(&registry);
        assert_eq!(selector.len(), 1);

        // A grant after attach is not duplicated by the seed.
        registry
            .grant(node("n2", "10.0.0.2", 10), Duration::from_secs(30))
            .unwrap();
        assert_eq!(ids(&selector.snapshot()), vec!["n1", "n2"]);
    }

    #[tokio::test]
    async fn attach_seeds_only_live_leases() {
        let registry = LeaseRegistry::new(LeasePolicy::default());
        let a = registry
            .grant(node("n1", "10.0.0.1", 10), Duration::from_secs(30))
            .unwrap();
        let b = registry
            .grant(node("n2", "10.0.0.2", 10), Duration::from_secs(30))
            .unwrap();
        registry.remove(b.cookie);

        let selector = Arc::new(NodeSelector::new());
        selector.attach(&registry);
        assert_eq!(ids(&selector.snapshot()), vec!["n1"]);

        registry.remove(a.cookie);
        assert!(selector.is_empty());
    }

    #[tokio::test]
    async fn registration_signals_change() {
        let selector = NodeSelector::new();
        selector.register(leased(1, node("n1", "10.0.0.1", 10)));
        // notify_one stores a permit when nobody is waiting yet.
        tokio::time::timeout(Duration::from_secs(1), selector.changed())
            .await
            .expect("change notification");
    }
}
