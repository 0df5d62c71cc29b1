//! Compute node descriptors.
//!
//! A `NodeDescriptor` is a node's capacity snapshot: its host address,
//! identity, hard service limit, per-deployment instance counts and the
//! capability check used to decide whether a deployment may run there.
//! Counts are updated in place (behind a lock) as instances are provisioned,
//! confirmed, or released, so the descriptor is shared as `Arc<NodeDescriptor>`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deployment::{DeploymentDescriptor, DescriptorKey};
use crate::error::CapabilityResult;

/// Stable identity token of a compute node.
pub type NodeId = String;

/// Instance counts for one deployment on one node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCounts {
    /// Confirmed running instances.
    pub actual: u32,
    /// Instances being provisioned but not yet confirmed.
    pub in_flight: u32,
}

impl InstanceCounts {
    pub fn total(&self) -> u32 {
        self.actual + self.in_flight
    }
}

/// Decides whether a node is able to host a deployment.
///
/// Implementations may perform remote calls; a failure that could succeed
/// on retry must be reported as [`CapabilityError::Transient`](crate::CapabilityError).
pub trait CapabilityMatcher: Send + Sync {
    fn can_provision(
        &self,
        node: &NodeDescriptor,
        descriptor: &DeploymentDescriptor,
    ) -> CapabilityResult<bool>;
}

impl<F> CapabilityMatcher for F
where
    F: Fn(&NodeDescriptor, &DeploymentDescriptor) -> CapabilityResult<bool> + Send + Sync,
{
    fn can_provision(
        &self,
        node: &NodeDescriptor,
        descriptor: &DeploymentDescriptor,
    ) -> CapabilityResult<bool> {
        self(node, descriptor)
    }
}

/// Default matcher: every requirement must be present in the node labels.
///
/// A requirement value of `"*"` only requires the label key to exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelMatcher;

impl CapabilityMatcher for LabelMatcher {
    fn can_provision(
        &self,
        node: &NodeDescriptor,
        descriptor: &DeploymentDescriptor,
    ) -> CapabilityResult<bool> {
        for (key, wanted) in &descriptor.requirements {
            match node.labels().get(key) {
                Some(_) if wanted == "*" => {}
                Some(v) if v == wanted => {}
                _ => {
                    debug!(
                        node = %node.identity(),
                        requirement = %key,
                        "node does not meet requirement"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

/// Capacity snapshot of a compute node.
pub struct NodeDescriptor {
    identity: NodeId,
    address: String,
    /// Max total instances of any kind.
    service_limit: u32,
    labels: BTreeMap<String, String>,
    /// Whether the node accepts new elastic placements.
    dynamic_enabled: AtomicBool,
    counts: Mutex<HashMap<DescriptorKey, InstanceCounts>>,
    matcher: Arc<dyn CapabilityMatcher>,
}

impl NodeDescriptor {
    /// Create a node descriptor using [`LabelMatcher`] for capability checks.
    pub fn new(identity: &str, address: &str, service_limit: u32) -> Self {
        Self {
            identity: identity.to_string(),
            address: address.to_string(),
            service_limit,
            labels: BTreeMap::new(),
            dynamic_enabled: AtomicBool::new(true),
            counts: Mutex::new(HashMap::new()),
            matcher: Arc::new(LabelMatcher),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Replace the capability matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn CapabilityMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_dynamic_enabled(self, enabled: bool) -> Self {
        self.dynamic_enabled.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn service_limit(&self) -> u32 {
        self.service_limit
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn dynamic_enabled(&self) -> bool {
        self.dynamic_enabled.load(Ordering::Relaxed)
    }

    pub fn set_dynamic_enabled(&self, enabled: bool) {
        self.dynamic_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Run the capability check for `descriptor` on this node.
    pub fn can_provision(&self, descriptor: &DeploymentDescriptor) -> CapabilityResult<bool> {
        self.matcher.can_provision(self, descriptor)
    }

    // ── Instance accounting ─────────────────────────────────────────

    /// Counts for one deployment on this node.
    pub fn counts(&self, key: &DescriptorKey) -> InstanceCounts {
        self.lock_counts().get(key).copied().unwrap_or_default()
    }

    /// Sum of confirmed instances across all deployments.
    pub fn total_actual(&self) -> u32 {
        self.lock_counts().values().map(|c| c.actual).sum()
    }

    /// Sum of in-flight instances across all deployments.
    pub fn total_in_flight(&self) -> u32 {
        self.lock_counts().values().map(|c| c.in_flight).sum()
    }

    /// `actual + in_flight` across all deployments.
    pub fn total_load(&self) -> u32 {
        self.lock_counts().values().map(InstanceCounts::total).sum()
    }

    /// Whether another instance of any kind still fits under the service limit.
    pub fn has_headroom(&self) -> bool {
        self.total_load() < self.service_limit
    }

    /// Remaining room under the service limit.
    pub fn headroom(&self) -> u32 {
        self.service_limit.saturating_sub(self.total_load())
    }

    /// True if the node runs (or is provisioning) an instance of a service named `name`.
    pub fn hosts_service(&self, name: &str) -> bool {
        self.lock_counts()
            .iter()
            .any(|(key, counts)| key.name == name && counts.total() > 0)
    }

    /// Record that an instance is being provisioned on this node.
    pub fn begin_provision(&self, key: &DescriptorKey) {
        let mut counts = self.lock_counts();
        counts.entry(key.clone()).or_default().in_flight += 1;
    }

    /// Reserve an in-flight slot for `key` if the node is under its service
    /// limit and `admit` accepts the deployment's current counts.
    ///
    /// The check and the increment happen under one lock, so concurrent
    /// passes can never push the node past its limit.
    pub fn try_reserve(&self, key: &DescriptorKey, admit: impl FnOnce(InstanceCounts) -> bool) -> bool {
        let mut counts = self.lock_counts();
        let load: u32 = counts.values().map(InstanceCounts::total).sum();
        if load >= self.service_limit {
            return false;
        }
        let current = counts.get(key).copied().unwrap_or_default();
        if !admit(current) {
            return false;
        }
        counts.entry(key.clone()).or_default().in_flight += 1;
        true
    }

    /// Record the outcome of a provisioning attempt started with
    /// [`begin_provision`](Self::begin_provision).
    pub fn finish_provision(&self, key: &DescriptorKey, succeeded: bool) {
        let mut counts = self.lock_counts();
        let entry = counts.entry(key.clone()).or_default();
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if succeeded {
            entry.actual += 1;
        }
    }

    /// Overwrite the confirmed instance count for a deployment.
    pub fn set_actual(&self, key: &DescriptorKey, actual: u32) {
        let mut counts = self.lock_counts();
        counts.entry(key.clone()).or_default().actual = actual;
    }

    /// Record that a running instance went away.
    pub fn release_instance(&self, key: &DescriptorKey) {
        let mut counts = self.lock_counts();
        if let Some(entry) = counts.get_mut(key) {
            entry.actual = entry.actual.saturating_sub(1);
        }
    }

    /// Copy of every per-deployment count on this node.
    pub fn counts_snapshot(&self) -> Vec<(DescriptorKey, InstanceCounts)> {
        let mut all: Vec<_> = self
            .lock_counts()
            .iter()
            .map(|(k, c)| (k.clone(), *c))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn lock_counts(&self) -> MutexGuard<'_, HashMap<DescriptorKey, InstanceCounts>> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("identity", &self.identity)
            .field("address", &self.address)
            .field("service_limit", &self.service_limit)
            .field("labels", &self.labels)
            .field("dynamic_enabled", &self.dynamic_enabled())
            .field("total_load", &self.total_load())
            .finish()
    }
}
