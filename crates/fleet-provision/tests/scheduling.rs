//! End-to-end scheduling: registry, selector, queues and dispatch together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::{
    CapabilityError, CapabilityResult, DeploymentDescriptor, DeploymentRequest, DescriptorKey,
    NodeDescriptor, PlacementKind,
};
use fleet_lease::{LeaseListener, LeasePolicy, LeaseRegistry, LeasedNode};
use fleet_provision::{
    Assignment, BoxFuture, ChannelPublisher, DispatchConfig, ProvisionContext, ProvisionExecutor,
    ProvisionResult,
};
use fleet_selector::NodeSelector;

#[derive(Default)]
struct Confirming {
    placed: Mutex<Vec<(String, u64, String)>>,
}

impl Confirming {
    fn placed(&self) -> Vec<(String, u64, String)> {
        self.placed.lock().unwrap().clone()
    }
}

impl ProvisionExecutor for Confirming {
    fn provision<'a>(&'a self, assignment: &'a Assignment) -> BoxFuture<'a, ProvisionResult<()>> {
        Box::pin(async move {
            self.placed.lock().unwrap().push((
                assignment.request.descriptor.name.clone(),
                assignment.request.instance_id,
                assignment.node_id().to_string(),
            ));
            Ok(())
        })
    }
}

#[derive(Default)]
struct ExpiryCounter {
    expired: AtomicUsize,
}

impl LeaseListener<Arc<NodeDescriptor>> for ExpiryCounter {
    fn on_expired(&self, _lease: &LeasedNode) -> anyhow::Result<()> {
        self.expired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Scheduler {
    registry: LeaseRegistry<Arc<NodeDescriptor>>,
    selector: Arc<NodeSelector>,
    executor: Arc<Confirming>,
    ctx: Arc<ProvisionContext>,
}

fn scheduler(policy: LeasePolicy) -> Scheduler {
    let registry = LeaseRegistry::new(policy);
    let selector = Arc::new(NodeSelector::new());
    selector.attach(&registry);
    let executor = Arc::new(Confirming::default());
    let ctx = Arc::new(ProvisionContext::new(
        Arc::clone(&selector),
        executor.clone(),
        DispatchConfig::default().with_dispatch_interval(Duration::ZERO),
    ));
    Scheduler {
        registry,
        selector,
        executor,
        ctx,
    }
}

impl Scheduler {
    fn join(&self, node: NodeDescriptor) -> Arc<NodeDescriptor> {
        let node = Arc::new(node);
        self.registry
            .grant(Arc::clone(&node), Duration::from_secs(60))
            .unwrap();
        node
    }

    fn request(&self, descriptor: DeploymentDescriptor) -> DeploymentRequest {
        let allocator = self.ctx.allocator_for(&descriptor.key());
        DeploymentRequest::new(Arc::new(descriptor), allocator)
    }
}

#[tokio::test(start_paused = true)]
async fn unrenewed_lease_leaves_the_selector_view() {
    let s = scheduler(LeasePolicy::default().with_reaper_interval(Duration::from_secs(1)));
    let counter = Arc::new(ExpiryCounter::default());
    s.registry.add_listener(counter.clone());

    s.registry
        .grant(
            Arc::new(NodeDescriptor::new("n1", "10.0.0.1", 5)),
            Duration::from_secs(2),
        )
        .unwrap();
    assert_eq!(s.selector.len(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(s.selector.snapshot().is_empty());
    assert_eq!(counter.expired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn queued_request_waits_for_a_qualifying_node() {
    let s = scheduler(LeasePolicy::default());
    let request = s.request(DeploymentDescriptor::new("g", "api", 3));
    s.ctx.elastic().add(request, 0);

    assert_eq!(s.ctx.process_all(), 0);
    assert_eq!(s.ctx.elastic().len(), 1);
    let pending = s.ctx.elastic().pending_for(&DescriptorKey::new("g", "api"));
    assert!(!pending[0].failure_reasons.is_empty());

    s.join(NodeDescriptor::new("n1", "10.0.0.1", 10));

    assert_eq!(s.ctx.process_all(), 1);
    s.ctx.quiesce().await;
    assert_eq!(s.executor.placed().len(), 1);
    assert!(s.ctx.elastic().is_empty());
}

#[tokio::test]
async fn replicated_rollout_never_exceeds_planned_total() {
    let s = scheduler(LeasePolicy::default());
    for i in 1..=3 {
        s.join(NodeDescriptor::new(&format!("n{i}"), &format!("10.0.0.{i}"), 10));
    }
    s.ctx.submit(DeploymentDescriptor::new("g", "agent", 2).with_kind(PlacementKind::Replicated));

    assert_eq!(s.ctx.process_all(), 2);
    s.ctx.quiesce().await;
    assert_eq!(s.ctx.process_all(), 0);
    s.ctx.quiesce().await;

    assert_eq!(s.executor.placed().len(), 2);
    // The standing request stays queued for nodes that join later.
    assert_eq!(s.ctx.replicated().len(), 1);
}

#[tokio::test]
async fn replicated_rollout_spreads_over_capacity() {
    let s = scheduler(LeasePolicy::default());
    for i in 1..=3 {
        s.join(NodeDescriptor::new(&format!("n{i}"), &format!("10.0.0.{i}"), 1));
    }
    s.ctx.submit(DeploymentDescriptor::new("g", "agent", 2).with_kind(PlacementKind::Replicated));

    s.ctx.process_all();
    s.ctx.quiesce().await;

    let mut nodes: Vec<String> = s.executor.placed().into_iter().map(|(_, _, n)| n).collect();
    nodes.sort();
    assert_eq!(nodes, vec!["n1", "n2"]);
}

#[tokio::test]
async fn replicated_rollout_respects_machine_limit() {
    let s = scheduler(LeasePolicy::default());
    s.join(NodeDescriptor::new("a1", "host-a", 10));
    s.join(NodeDescriptor::new("a2", "host-a", 10));
    s.join(NodeDescriptor::new("b1", "host-b", 10));
    s.ctx.submit(
        DeploymentDescriptor::new("g", "agent", 4)
            .with_kind(PlacementKind::Replicated)
            .with_machine_limit(1),
    );

    assert_eq!(s.ctx.process_all(), 2);
    s.ctx.quiesce().await;

    let mut nodes: Vec<String> = s.executor.placed().into_iter().map(|(_, _, n)| n).collect();
    nodes.sort();
    assert_eq!(nodes, vec!["a1", "b1"]);
}

#[tokio::test]
async fn elastic_request_is_dispatched_exactly_once() {
    let s = scheduler(LeasePolicy::default());
    s.join(NodeDescriptor::new("n1", "10.0.0.1", 10));
    let request = s.request(DeploymentDescriptor::new("g", "api", 5));
    let instance = request.instance_id;
    s.ctx.elastic().add(request, 0);

    for _ in 0..3 {
        s.ctx.process_all();
    }
    s.ctx.quiesce().await;

    let placed = s.executor.placed();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].1, instance);
}

#[tokio::test]
async fn older_request_is_served_first() {
    let s = scheduler(LeasePolicy::default());
    s.join(NodeDescriptor::new("n1", "10.0.0.1", 1));

    let newer = s.request(DeploymentDescriptor::new("g", "newer", 1)).with_created_at(2_000);
    let older = s.request(DeploymentDescriptor::new("g", "older", 1)).with_created_at(1_000);
    s.ctx.elastic().add(newer, 0);
    s.ctx.elastic().add(older, 0);

    assert_eq!(s.ctx.process_all(), 1);
    s.ctx.quiesce().await;

    assert_eq!(s.executor.placed()[0].0, "older");
    let left = s.ctx.elastic().pending_for(&DescriptorKey::new("g", "newer"));
    assert!(left[0].failure_reasons.iter().any(|r| r.contains("service limit")));
}

#[tokio::test]
async fn withdrawing_an_unknown_descriptor_changes_nothing() {
    let s = scheduler(LeasePolicy::default());
    s.ctx.submit(DeploymentDescriptor::new("g", "api", 2));
    let before = s.ctx.elastic().keys();

    let removed = s
        .ctx
        .elastic()
        .remove_for_descriptor(&DescriptorKey::new("g", "missing"), None);

    assert!(removed.is_empty());
    assert_eq!(s.ctx.elastic().keys(), before);
}

#[tokio::test]
async fn permanent_capability_failure_is_not_retried_on_that_node() {
    let checks = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&checks);
    let broken = NodeDescriptor::new("broken", "10.0.0.1", 10).with_matcher(Arc::new(
        move |_: &NodeDescriptor, _: &DeploymentDescriptor| -> CapabilityResult<bool> {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Permanent("missing runtime".into()))
        },
    ));

    let registry = LeaseRegistry::new(LeasePolicy::default());
    let selector = Arc::new(NodeSelector::new());
    selector.attach(&registry);
    let executor = Arc::new(Confirming::default());
    let (publisher, mut events) = ChannelPublisher::new();
    let ctx = Arc::new(
        ProvisionContext::new(selector, executor.clone(), DispatchConfig::default())
            .with_publisher(Arc::new(publisher)),
    );
    registry
        .grant(Arc::new(broken), Duration::from_secs(60))
        .unwrap();

    let key = DescriptorKey::new("g", "api");
    ctx.submit(DeploymentDescriptor::new("g", "api", 1));

    assert_eq!(ctx.process_all(), 0);
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    assert!(ctx.is_uninstantiable(&key, "broken"));
    assert_eq!(events.try_recv().unwrap().reason, "missing runtime");

    assert_eq!(ctx.process_all(), 0);
    assert_eq!(checks.load(Ordering::SeqCst), 1);
    assert!(events.try_recv().is_err());

    let pending = ctx.elastic().pending_for(&key);
    assert_eq!(pending[0].status, fleet_core::RequestStatus::Uninstantiable);
    assert!(executor.placed().is_empty());
}
