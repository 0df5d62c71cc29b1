//! Lease types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use fleet_core::NodeDescriptor;

/// Opaque handle identifying one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseCookie(pub u64);

impl fmt::Display for LeaseCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease-{:08x}", self.0)
    }
}

/// A resource that can be leased. At most one live lease may exist per
/// `lease_identity`.
pub trait Leasable: Clone + Send + Sync + 'static {
    fn lease_identity(&self) -> String;
}

impl Leasable for Arc<NodeDescriptor> {
    fn lease_identity(&self) -> String {
        self.identity().to_string()
    }
}

/// What the grantee gets back from `grant` and `renew`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub cookie: LeaseCookie,
    pub expiration: Instant,
    /// Duration actually granted (after policy clamping).
    pub duration: Duration,
}

/// A leased resource as tracked by the registry.
#[derive(Debug, Clone)]
pub struct LeasedResource<R> {
    pub cookie: LeaseCookie,
    pub expiration: Instant,
    pub resource: R,
}

impl<R> LeasedResource<R> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiration <= now
    }

    /// Time left before expiration (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.expiration.saturating_duration_since(Instant::now())
    }
}

/// Leased handle on a compute node, as the selector sees it.
pub type LeasedNode = LeasedResource<Arc<NodeDescriptor>>;

impl LeasedNode {
    pub fn node(&self) -> &NodeDescriptor {
        &self.resource
    }

    pub fn identity(&self) -> &str {
        self.resource.identity()
    }

    pub fn address(&self) -> &str {
        self.resource.address()
    }
}

/// Timing policy of a lease registry.
#[derive(Debug, Clone)]
pub struct LeasePolicy {
    /// How often the reaper sweeps for expired leases.
    pub reaper_interval: Duration,
    /// Longest duration a single grant or renewal may cover.
    pub max_duration: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(10),
            max_duration: Duration::from_secs(300),
        }
    }
}

impl LeasePolicy {
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }
}
