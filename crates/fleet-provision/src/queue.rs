//! Pending queue — deployment requests waiting for a placement.
//!
//! Requests are kept in a `BTreeMap` under their [`OrderingKey`], behind a
//! mutex. A processing pass snapshots the keys first and then works on one
//! entry at a time, so completions and submissions arriving mid-pass never
//! invalidate the iteration; they may or may not be seen by that pass.
//!
//! What a pass does with a request is decided by the injected
//! [`PlacementStrategy`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use fleet_core::{
    DeploymentDescriptor, DeploymentRequest, DescriptorKey, OrderingKey, PlacementKind,
    RequestListener,
};

use crate::context::ProvisionContext;
use crate::executor::Assignment;
use crate::strategy::{ElasticPlacement, PlacementStrategy, ReplicatedPlacement};

pub struct PendingQueue {
    strategy: Box<dyn PlacementStrategy>,
    entries: Mutex<BTreeMap<OrderingKey, DeploymentRequest>>,
    /// Next insertion sequence; 0 is reserved for "assign one".
    sequence: AtomicU64,
}

impl PendingQueue {
    pub fn new(strategy: Box<dyn PlacementStrategy>) -> Self {
        Self {
            strategy,
            entries: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(1),
        }
    }

    pub fn elastic() -> Self {
        Self::new(Box::new(ElasticPlacement))
    }

    pub fn replicated() -> Self {
        Self::new(Box::new(ReplicatedPlacement))
    }

    pub fn kind(&self) -> PlacementKind {
        self.strategy.kind()
    }

    /// Queue `request` and return its insertion index.
    ///
    /// An `index` of 0 assigns the next sequence number; any other value is
    /// reused, putting a returning request back into its original slot.
    pub fn add(&self, request: DeploymentRequest, index: u64) -> u64 {
        let index = if index == 0 {
            self.sequence.fetch_add(1, Ordering::Relaxed)
        } else {
            index
        };

        debug!(
            queue = ?self.kind(),
            deployment = %request.key(),
            instance = request.instance_id,
            index,
            "request queued"
        );
        self.lock().insert(request.ordering_key(index), request);
        index
    }

    /// Run one pass over the queue, dispatching through `ctx`.
    ///
    /// Returns the number of instances dispatched.
    pub fn process(&self, ctx: &Arc<ProvisionContext>) -> usize {
        let keys = self.keys();
        let mut dispatched = 0;

        for key in keys {
            let Some(mut request) = self.lock().get(&key).cloned() else {
                continue;
            };
            request.clear_failures();

            let placements = self.strategy.plan(ctx, &mut request, None);

            if placements.is_empty() {
                self.store_outcome(&key, &request);
                continue;
            }

            if self.strategy.consumes_request() {
                // Removal decides which pass owns the request.
                if self.lock().remove(&key).is_none() {
                    continue;
                }
                for placement in placements {
                    let accepted = ctx.dispatch(Assignment {
                        request: request.clone(),
                        node: placement.node,
                        requeue_index: Some(key.sequence),
                    });
                    if accepted {
                        dispatched += 1;
                    }
                }
            } else {
                self.store_outcome(&key, &request);
                dispatched += ctx.dispatch_placements(&request, placements, false);
            }
        }

        if dispatched > 0 {
            info!(queue = ?self.kind(), dispatched, pending = self.len(), "processing pass dispatched requests");
        }
        dispatched
    }

    /// Withdraw pending requests for `key`: all of them, or the first
    /// `count` in queue order.
    pub fn remove_for_descriptor(
        &self,
        key: &DescriptorKey,
        count: Option<usize>,
    ) -> Vec<DeploymentRequest> {
        let mut entries = self.lock();
        let doomed: Vec<OrderingKey> = entries
            .keys()
            .filter(|k| &k.descriptor == key)
            .take(count.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        let removed: Vec<DeploymentRequest> =
            doomed.iter().filter_map(|k| entries.remove(k)).collect();
        if !removed.is_empty() {
            info!(queue = ?self.kind(), deployment = %key, removed = removed.len(), "pending requests withdrawn");
        }
        removed
    }

    /// Point every pending request for the descriptor at its new revision.
    ///
    /// Instance ids are kept. When `listener` is given it replaces the
    /// requests' listener. Returns the number of requests updated.
    pub fn update_descriptor(
        &self,
        descriptor: Arc<DeploymentDescriptor>,
        listener: Option<Arc<dyn RequestListener>>,
    ) -> usize {
        let key = descriptor.key();
        let mut entries = self.lock();
        let mut updated = 0;
        for request in entries.values_mut().filter(|r| r.key() == key) {
            request.descriptor = Arc::clone(&descriptor);
            if let Some(listener) = &listener {
                request.listener = Some(Arc::clone(listener));
            }
            updated += 1;
        }
        if updated > 0 {
            debug!(queue = ?self.kind(), deployment = %key, revision = descriptor.revision, updated, "pending requests updated");
        }
        updated
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether any request for `key` is pending.
    pub fn contains(&self, key: &DescriptorKey) -> bool {
        self.lock().keys().any(|k| &k.descriptor == key)
    }

    /// Pending requests for `key` in queue order, with their failure reasons.
    pub fn pending_for(&self, key: &DescriptorKey) -> Vec<DeploymentRequest> {
        self.lock()
            .iter()
            .filter(|(k, _)| &k.descriptor == key)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Ordering keys in queue order.
    pub fn keys(&self) -> Vec<OrderingKey> {
        self.lock().keys().cloned().collect()
    }

    pub(crate) fn strategy(&self) -> &dyn PlacementStrategy {
        self.strategy.as_ref()
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Copy the attempt's reasons and status back onto the queued entry,
    /// leaving the descriptor alone in case it was updated meanwhile.
    fn store_outcome(&self, key: &OrderingKey, request: &DeploymentRequest) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.failure_reasons = request.failure_reasons.clone();
            entry.status = request.status;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<OrderingKey, DeploymentRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .finish()
    }
}
