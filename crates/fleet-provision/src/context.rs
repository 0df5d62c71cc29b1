//! Provision context — the glue between selector, queues and executor.
//!
//! The context owns both pending queues and hands every accepted placement
//! to a worker task: the node's in-flight count is raised at dispatch, the
//! task waits for its throttle slot and a worker permit, runs the executor,
//! and settles the outcome. Passes never wait for executions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use fleet_core::{
    DeploymentDescriptor, DeploymentRequest, DescriptorKey, InstanceIdAllocator, NodeId,
    PlacementKind, RequestStatus,
};
use fleet_selector::NodeSelector;

use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::{
    Assignment, FailureEventPublisher, ProvisionExecutor, ProvisionFailureEvent, TracingPublisher,
};
use crate::queue::PendingQueue;
use crate::strategy::Placement;
use crate::throttle::DispatchThrottle;

/// Dispatch timing and parallelism.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Minimum spacing between dispatches to one node.
    pub dispatch_interval: Duration,
    /// Executions allowed to run at once.
    pub worker_pool_size: usize,
    /// Period of the scheduling loop.
    pub process_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(500),
            worker_pool_size: 8,
            process_interval: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    pub fn with_process_interval(mut self, interval: Duration) -> Self {
        self.process_interval = interval;
        self
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    passes: AtomicU64,
    dispatched: AtomicU64,
    succeeded: AtomicU64,
    transient_failures: AtomicU64,
    permanent_failures: AtomicU64,
}

/// Point-in-time view of the dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub passes: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    /// Executions that failed but may be retried.
    pub transient_failures: u64,
    /// Permanent rejections, from capability checks or executions.
    pub permanent_failures: u64,
}

pub struct ProvisionContext {
    selector: Arc<NodeSelector>,
    elastic: PendingQueue,
    replicated: PendingQueue,
    executor: Arc<dyn ProvisionExecutor>,
    publisher: Arc<dyn FailureEventPublisher>,
    workers: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    throttle: DispatchThrottle,
    uninstantiable: RwLock<HashSet<(DescriptorKey, NodeId)>>,
    allocators: Mutex<HashMap<DescriptorKey, Arc<InstanceIdAllocator>>>,
    counters: DispatchCounters,
    config: DispatchConfig,
}

impl ProvisionContext {
    pub fn new(
        selector: Arc<NodeSelector>,
        executor: Arc<dyn ProvisionExecutor>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            selector,
            elastic: PendingQueue::elastic(),
            replicated: PendingQueue::replicated(),
            executor,
            publisher: Arc::new(TracingPublisher),
            workers: Arc::new(Semaphore::new(config.worker_pool_size.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            throttle: DispatchThrottle::new(config.dispatch_interval),
            uninstantiable: RwLock::new(HashSet::new()),
            allocators: Mutex::new(HashMap::new()),
            counters: DispatchCounters::default(),
            config,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn FailureEventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn selector(&self) -> &NodeSelector {
        &self.selector
    }

    pub fn elastic(&self) -> &PendingQueue {
        &self.elastic
    }

    pub fn replicated(&self) -> &PendingQueue {
        &self.replicated
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn counters(&self) -> CountersSnapshot {
        let c = &self.counters;
        CountersSnapshot {
            passes: c.passes.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            transient_failures: c.transient_failures.load(Ordering::Relaxed),
            permanent_failures: c.permanent_failures.load(Ordering::Relaxed),
        }
    }

    /// The instance id source shared by every request for `key`.
    pub fn allocator_for(&self, key: &DescriptorKey) -> Arc<InstanceIdAllocator> {
        let mut allocators = self.allocators.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(allocators.entry(key.clone()).or_default())
    }

    /// Queue the requests a descriptor still needs.
    ///
    /// Elastic descriptors get one request per planned instance that is
    /// neither placed on a live node nor already pending. Replicated
    /// descriptors get a single standing request. Pending requests of an
    /// earlier revision are moved to this one. Returns the number of
    /// requests added.
    pub fn submit(&self, descriptor: DeploymentDescriptor) -> usize {
        let descriptor = Arc::new(descriptor);
        let key = descriptor.key();
        let allocator = self.allocator_for(&key);

        let added = match descriptor.kind {
            PlacementKind::Elastic => {
                self.elastic.update_descriptor(Arc::clone(&descriptor), None);
                let placed: u32 = self
                    .selector
                    .snapshot()
                    .iter()
                    .map(|n| n.node().counts(&key).total())
                    .sum();
                let pending = self.elastic.pending_for(&key).len() as u32;
                let missing = descriptor.planned.saturating_sub(placed + pending);
                for _ in 0..missing {
                    let request = DeploymentRequest::new(Arc::clone(&descriptor), Arc::clone(&allocator));
                    self.elastic.add(request, 0);
                }
                missing as usize
            }
            PlacementKind::Replicated => {
                if self.replicated.update_descriptor(Arc::clone(&descriptor), None) > 0 {
                    0
                } else {
                    self.replicated.add(DeploymentRequest::new(Arc::clone(&descriptor), allocator), 0);
                    1
                }
            }
        };

        info!(deployment = %key, kind = ?descriptor.kind, planned = descriptor.planned, added, "deployment submitted");
        added
    }

    /// Drop every pending request for `key` and forget its un-instantiable
    /// nodes. Dispatched instances are not recalled.
    pub fn withdraw(&self, key: &DescriptorKey) -> Vec<DeploymentRequest> {
        let mut removed = self.elastic.remove_for_descriptor(key, None);
        removed.extend(self.replicated.remove_for_descriptor(key, None));
        self.write_uninstantiable().retain(|(k, _)| k != key);
        removed
    }

    /// One pass over both queues. Returns the number of instances dispatched.
    ///
    /// Worker tasks are spawned on the current tokio runtime. Called outside
    /// one, the pass dispatches nothing and elastic requests stay queued.
    pub fn process_all(self: &Arc<Self>) -> usize {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        let dispatched = self.elastic.process(self) + self.replicated.process(self);
        self.throttle.prune();
        dispatched
    }

    /// Roll a replicated request out right away, to every qualifying node or
    /// to the nodes of one host.
    ///
    /// With `preserve_id` the first instance keeps the request's instance
    /// id; every other instance gets a fresh one. Returns the number of
    /// instances dispatched, which is zero outside a tokio runtime.
    pub fn deploy_replicated(
        self: &Arc<Self>,
        request: &DeploymentRequest,
        target_host: Option<&str>,
        preserve_id: bool,
    ) -> usize {
        let mut request = request.clone();
        request.clear_failures();
        let placements = self
            .replicated
            .strategy()
            .plan(self, &mut request, target_host);
        self.dispatch_placements(&request, placements, preserve_id)
    }

    /// Record that `key` can never run on `node`. Returns false if it was
    /// already recorded.
    pub fn mark_uninstantiable(&self, key: &DescriptorKey, node: &str) -> bool {
        self.write_uninstantiable()
            .insert((key.clone(), node.to_string()))
    }

    pub fn is_uninstantiable(&self, key: &DescriptorKey, node: &str) -> bool {
        self.uninstantiable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(key.clone(), node.to_string()))
    }

    /// Nodes that `key` can never run on, sorted.
    pub fn uninstantiable_nodes(&self, key: &DescriptorKey) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .uninstantiable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, node)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    /// Handle a permanent rejection of `request` by `node`.
    ///
    /// Marks the pairing un-instantiable, notes the reason on the request,
    /// and publishes a failure event the first time the pairing is marked.
    pub fn reject(&self, request: &mut DeploymentRequest, node: &str, reason: &str) {
        request.status = RequestStatus::Uninstantiable;
        request.record_failure(format!("{node}: {reason}"));
        self.counters.permanent_failures.fetch_add(1, Ordering::Relaxed);

        if self.mark_uninstantiable(&request.key(), node) {
            error!(deployment = %request.key(), %node, %reason, "deployment un-instantiable on node");
            self.publisher
                .publish(ProvisionFailureEvent::new(request, node, reason));
        }
    }

    /// Hand one assignment to a worker task.
    ///
    /// Reserves an in-flight slot on the node first. Returns false, leaving
    /// an elastic request queued at its slot, when the node has no room left
    /// or no tokio runtime is available to run the worker task.
    pub fn dispatch(self: &Arc<Self>, assignment: Assignment) -> bool {
        let key = assignment.request.key();

        if tokio::runtime::Handle::try_current().is_err() {
            warn!(deployment = %key, node = %assignment.node_id(), "no tokio runtime, placement left queued");
            self.requeue(assignment);
            return false;
        }

        let planned = assignment.request.descriptor.planned;
        let replicated = assignment.requeue_index.is_none();
        let reserved = assignment.node.node().try_reserve(&key, |counts| {
            if replicated {
                counts.total() < planned
            } else {
                counts.actual < planned
            }
        });
        if !reserved {
            debug!(deployment = %key, node = %assignment.node_id(), "node filled up before dispatch");
            self.requeue(assignment);
            return false;
        }

        let delay = self.throttle.reserve(assignment.node_id());
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

        debug!(
            deployment = %key,
            instance = assignment.request.instance_id,
            node = %assignment.node_id(),
            ?delay,
            "dispatching placement"
        );

        let ctx = Arc::clone(self);
        let mut tasks = self.lock_tasks();
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "provision worker task failed");
            }
        }
        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let outcome = match Arc::clone(&ctx.workers).acquire_owned().await {
                Ok(_permit) => ctx.execute(assignment.clone()).await,
                Err(_) => Err(ProvisionError::Transient("worker pool closed".to_string())),
            };
            ctx.settle(assignment, outcome);
        });
        true
    }

    /// Dispatch replicated placements, one assignment per instance.
    pub(crate) fn dispatch_placements(
        self: &Arc<Self>,
        request: &DeploymentRequest,
        placements: Vec<Placement>,
        preserve_id: bool,
    ) -> usize {
        let mut dispatched = 0;
        for placement in placements {
            for _ in 0..placement.instances {
                let instance = if preserve_id && dispatched == 0 {
                    request.clone()
                } else {
                    request.next_instance()
                };
                let accepted = self.dispatch(Assignment {
                    request: instance,
                    node: placement.node.clone(),
                    requeue_index: None,
                });
                if accepted {
                    dispatched += 1;
                }
            }
        }
        dispatched
    }

    /// Wait for every dispatched execution to settle.
    pub async fn quiesce(&self) {
        loop {
            let mut running = std::mem::take(&mut *self.lock_tasks());
            if running.is_empty() {
                break;
            }
            while let Some(joined) = running.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "provision worker task failed");
                }
            }
        }
    }

    /// Scheduling loop: process both queues every `process_interval` and
    /// whenever a node registers or renews, until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = if self.config.process_interval.is_zero() {
            warn!("process interval is zero, using 1ms");
            Duration::from_millis(1)
        } else {
            self.config.process_interval
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval = ?period,
            workers = self.config.worker_pool_size,
            "scheduling loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.selector.changed() => {
                    debug!("node view changed");
                }
                _ = shutdown.changed() => {
                    info!("scheduling loop shutting down");
                    break;
                }
            }

            self.process_all();
        }
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Run the executor in its own task so a panic settles as a transient
    /// failure instead of unwinding through the worker.
    async fn execute(self: &Arc<Self>, assignment: Assignment) -> ProvisionResult<()> {
        let executor = Arc::clone(&self.executor);
        let node = assignment.node_id().to_string();
        let instance = assignment.request.instance_id;
        match tokio::spawn(async move { executor.provision(&assignment).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%node, instance, error = %e, "provision executor task failed");
                Err(ProvisionError::Transient(format!("executor task failed: {e}")))
            }
        }
    }

    fn requeue(&self, assignment: Assignment) {
        if let Some(index) = assignment.requeue_index {
            self.elastic.add(assignment.request, index);
        }
    }

    fn settle(&self, assignment: Assignment, outcome: ProvisionResult<()>) {
        let Assignment {
            mut request,
            node,
            requeue_index,
        } = assignment;
        let key = request.key();
        let node_id = node.identity();

        match outcome {
            Ok(()) => {
                node.node().finish_provision(&key, true);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(deployment = %key, instance = request.instance_id, node = %node_id, "instance provisioned");
                if let Some(listener) = &request.listener {
                    listener.on_provisioned(&request, node_id);
                }
            }
            Err(ProvisionError::Transient(reason)) => {
                node.node().finish_provision(&key, false);
                self.counters.transient_failures.fetch_add(1, Ordering::Relaxed);
                warn!(deployment = %key, instance = request.instance_id, node = %node_id, %reason, "provision attempt failed, will retry");
                request.record_failure(format!("{node_id}: {reason}"));
                if let Some(listener) = &request.listener {
                    listener.on_failed(&request, &reason, false);
                }
                if let Some(index) = requeue_index {
                    self.elastic.add(request, index);
                }
            }
            Err(ProvisionError::Permanent(reason)) => {
                node.node().finish_provision(&key, false);
                self.reject(&mut request, node_id, &reason);
                if let Some(listener) = &request.listener {
                    listener.on_failed(&request, &reason, true);
                }
                if let Some(index) = requeue_index {
                    self.elastic.add(request, index);
                }
            }
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_uninstantiable(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashSet<(DescriptorKey, NodeId)>> {
        self.uninstantiable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProvisionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("nodes", &self.selector.len())
            .field("elastic", &self.elastic)
            .field("replicated", &self.replicated)
            .field("counters", &self.counters())
            .finish()
    }
}
