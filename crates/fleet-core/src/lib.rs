//! fleet-core — shared data model for the fleetgrid provisioning scheduler.
//!
//! The scheduler never builds nodes itself. Whatever discovers a compute
//! node constructs a [`NodeDescriptor`] and leases it into the registry;
//! the selector and the pending queues only observe it.
//!
//! # Components
//!
//! - **`node`** — Node capacity snapshot and capability matching
//! - **`deployment`** — Deployment descriptors and their identity
//! - **`request`** — Pending deployment requests and their ordering key
//! - **`error`** — Capability-check failure kinds

pub mod deployment;
pub mod error;
pub mod node;
pub mod request;

pub use deployment::{DeploymentDescriptor, DescriptorKey, MachineBoundary, PlacementKind};
pub use error::{CapabilityError, CapabilityResult};
pub use node::{CapabilityMatcher, InstanceCounts, LabelMatcher, NodeDescriptor, NodeId};
pub use request::{
    DeploymentRequest, InstanceIdAllocator, OrderingKey, RequestListener, RequestStatus,
};

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
