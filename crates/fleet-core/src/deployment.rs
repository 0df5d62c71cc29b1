//! Deployment descriptors — the scheduler's view of a service to place.
//!
//! Only the attributes the scheduler reads are modelled here. A descriptor
//! is immutable per revision; a new revision replaces the reference held by
//! pending requests (see `PendingQueue::update_descriptor`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a deployment descriptor across revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DescriptorKey {
    pub group: String,
    pub name: String,
}

impl DescriptorKey {
    pub fn new(group: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Scope that a `max_per_machine` limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineBoundary {
    /// Count every node sharing a host address as one machine.
    Physical,
    /// No machine scope; the limit is not enforced by the selector.
    #[default]
    Unscoped,
}

/// How instances of a deployment are spread over the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    /// Each request is placed on exactly one dynamically chosen node.
    #[default]
    Elastic,
    /// Instances are placed on every qualifying node up to the planned count.
    Replicated,
}

/// Description of a service to place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub name: String,
    /// Owning group (the deployment plan this service belongs to).
    pub group: String,
    #[serde(default)]
    pub revision: u64,
    /// Number of instances wanted.
    pub planned: u32,
    /// Maximum instances per machine; `None` means unbounded.
    #[serde(default)]
    pub max_per_machine: Option<u32>,
    #[serde(default)]
    pub machine_boundary: MachineBoundary,
    /// Names of peer services this one must not share a host with.
    #[serde(default)]
    pub isolation: Vec<String>,
    /// Capability requirements matched by the node's `CapabilityMatcher`.
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
    #[serde(default)]
    pub kind: PlacementKind,
}

impl DeploymentDescriptor {
    /// A descriptor with no constraints, mostly useful for tests and tooling.
    pub fn new(group: &str, name: &str, planned: u32) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            revision: 0,
            planned,
            max_per_machine: None,
            machine_boundary: MachineBoundary::Unscoped,
            isolation: Vec::new(),
            requirements: BTreeMap::new(),
            kind: PlacementKind::Elastic,
        }
    }

    pub fn key(&self) -> DescriptorKey {
        DescriptorKey::new(&self.group, &self.name)
    }

    /// The per-machine limit, if one is declared with a physical scope.
    pub fn machine_limit(&self) -> Option<u32> {
        match (self.max_per_machine, self.machine_boundary) {
            (Some(limit), MachineBoundary::Physical) if limit > 0 => Some(limit),
            _ => None,
        }
    }

    pub fn is_isolated(&self) -> bool {
        !self.isolation.is_empty()
    }

    pub fn with_machine_limit(mut self, limit: u32) -> Self {
        self.max_per_machine = Some(limit);
        self.machine_boundary = MachineBoundary::Physical;
        self
    }

    pub fn with_kind(mut self, kind: PlacementKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_requirement(mut self, key: &str, value: &str) -> Self {
        self.requirements.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_isolation(mut self, peer: &str) -> Self {
        self.isolation.push(peer.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_is_group_slash_name() {
        let d = DeploymentDescriptor::new("billing", "api", 3);
        assert_eq!(d.key().to_string(), "billing/api");
    }

    #[test]
    fn machine_limit_requires_physical_scope() {
        let mut d = DeploymentDescriptor::new("g", "svc", 3);
        d.max_per_machine = Some(2);
        assert_eq!(d.machine_limit(), None);

        d.machine_boundary = MachineBoundary::Physical;
        assert_eq!(d.machine_limit(), Some(2));

        d.max_per_machine = Some(0);
        assert_eq!(d.machine_limit(), None);
    }

    #[test]
    fn parse_from_json_with_defaults() {
        let d: DeploymentDescriptor = serde_json::from_str(
            r#"{"name":"worker","group":"batch","planned":2,"kind":"replicated"}"#,
        )
        .unwrap();
        assert_eq!(d.kind, PlacementKind::Replicated);
        assert_eq!(d.machine_boundary, MachineBoundary::Unscoped);
        assert!(d.requirements.is_empty());
        assert!(!d.is_isolated());
    }
}
