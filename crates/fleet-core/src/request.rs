//! Pending deployment requests and their ordering.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::deployment::{DeploymentDescriptor, DescriptorKey};
use crate::epoch_millis;

/// Per-descriptor source of instance ids. Ids start at 1 and only grow.
#[derive(Debug)]
pub struct InstanceIdAllocator {
    next: AtomicU64,
}

impl InstanceIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Make sure ids handed out later never collide with `id`.
    pub fn observe(&self, id: u64) {
        self.next.fetch_max(id + 1, AtomicOrdering::Relaxed);
    }

    /// The id the next call to [`allocate`](Self::allocate) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(AtomicOrdering::Relaxed)
    }
}

impl Default for InstanceIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle status of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    /// At least one node rejected the request permanently.
    Uninstantiable,
}

/// Observer attached to pending requests, told how their dispatch ended.
pub trait RequestListener: Send + Sync {
    fn on_provisioned(&self, _request: &DeploymentRequest, _node: &str) {}

    fn on_failed(&self, _request: &DeploymentRequest, _reason: &str, _permanent: bool) {}
}

/// One pending attempt to satisfy (part of) a descriptor's planned count.
#[derive(Clone)]
pub struct DeploymentRequest {
    pub descriptor: Arc<DeploymentDescriptor>,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    /// Higher sorts first; 0 is normal.
    pub priority: u32,
    pub instance_id: u64,
    pub allocator: Arc<InstanceIdAllocator>,
    /// One human-readable reason per rejected candidate in the last attempt.
    pub failure_reasons: Vec<String>,
    pub status: RequestStatus,
    pub listener: Option<Arc<dyn RequestListener>>,
}

impl DeploymentRequest {
    /// Create a request, allocating its instance id from `allocator`.
    pub fn new(descriptor: Arc<DeploymentDescriptor>, allocator: Arc<InstanceIdAllocator>) -> Self {
        let instance_id = allocator.allocate();
        Self {
            descriptor,
            created_at: epoch_millis(),
            priority: 0,
            instance_id,
            allocator,
            failure_reasons: Vec::new(),
            status: RequestStatus::Pending,
            listener: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Use an explicit instance id (e.g. when replacing a failed instance).
    pub fn with_instance_id(mut self, instance_id: u64) -> Self {
        self.allocator.observe(instance_id);
        self.instance_id = instance_id;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn key(&self) -> DescriptorKey {
        self.descriptor.key()
    }

    /// A copy of this request carrying a freshly allocated instance id.
    pub fn next_instance(&self) -> Self {
        let mut copy = self.clone();
        copy.instance_id = self.allocator.allocate();
        copy.failure_reasons.clear();
        copy
    }

    pub fn ordering_key(&self, sequence: u64) -> OrderingKey {
        OrderingKey {
            priority: self.priority,
            descriptor: self.key(),
            instance_id: self.instance_id,
            created_at: self.created_at,
            sequence,
        }
    }

    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.failure_reasons.push(reason.into());
    }

    pub fn clear_failures(&mut self) {
        self.failure_reasons.clear();
    }
}

impl fmt::Debug for DeploymentRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentRequest")
            .field("descriptor", &self.key())
            .field("revision", &self.descriptor.revision)
            .field("instance_id", &self.instance_id)
            .field("priority", &self.priority)
            .field("created_at", &self.created_at)
            .field("status", &self.status)
            .field("failure_reasons", &self.failure_reasons)
            .finish()
    }
}

/// Total order of the pending queue.
///
/// 1. Higher priority first.
/// 2. Same descriptor: lower instance id first.
/// 3. Otherwise older `created_at` first, then lower insertion sequence.
///
/// Rule 2 agrees with rule 3 for requests created through one allocator,
/// since ids are handed out in creation order; that keeps the order total.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderingKey {
    pub priority: u32,
    pub descriptor: DescriptorKey,
    pub instance_id: u64,
    pub created_at: u64,
    pub sequence: u64,
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| {
                if self.descriptor == other.descriptor {
                    self.instance_id.cmp(&other.instance_id)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.descriptor.cmp(&other.descriptor))
            .then_with(|| self.instance_id.cmp(&other.instance_id))
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
