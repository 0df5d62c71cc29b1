//! Association matching for isolated deployments.

use fleet_core::DeploymentDescriptor;
use fleet_lease::LeasedNode;

/// Decides whether a candidate satisfies a descriptor's isolation
/// requirement, given the hosts already running an isolated peer.
pub trait AssociationMatcher: Send + Sync {
    fn meets_isolation(
        &self,
        descriptor: &DeploymentDescriptor,
        candidate: &LeasedNode,
        known_hosts: &[String],
    ) -> bool;
}

/// Default matcher: a candidate qualifies only if its host runs no peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIsolation;

impl AssociationMatcher for HostIsolation {
    fn meets_isolation(
        &self,
        _descriptor: &DeploymentDescriptor,
        candidate: &LeasedNode,
        known_hosts: &[String],
    ) -> bool {
        !known_hosts.iter().any(|h| h == candidate.address())
    }
}
