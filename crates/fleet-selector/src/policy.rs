//! Candidate ordering policies.
//!
//! A policy may reorder the candidate list before selection (`arrange`)
//! and reorder the selector's own node list once a node has been chosen
//! (`on_selected`).

use fleet_lease::{LeaseCookie, LeasedNode};

pub trait OrderingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reorder candidates before the selection scan.
    fn arrange(&self, _candidates: &mut Vec<LeasedNode>) {}

    /// Called with the selector's node list after `chosen` was selected.
    fn on_selected(&self, _nodes: &mut Vec<LeasedNode>, _chosen: LeaseCookie) {}
}

/// Nodes are tried in the order they registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistrationOrder;

impl OrderingPolicy for RegistrationOrder {
    fn name(&self) -> &'static str {
        "registration"
    }
}

/// The chosen node moves to the back, so successive selections rotate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl OrderingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn on_selected(&self, nodes: &mut Vec<LeasedNode>, chosen: LeaseCookie) {
        if let Some(pos) = nodes.iter().position(|n| n.cookie == chosen) {
            let node = nodes.remove(pos);
            nodes.push(node);
        }
    }
}

/// Candidates with the fewest instances (actual + in-flight) go first.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastActive;

impl OrderingPolicy for LeastActive {
    fn name(&self) -> &'static str {
        "least-active"
    }

    fn arrange(&self, candidates: &mut Vec<LeasedNode>) {
        candidates.sort_by_key(|n| n.node().total_load());
    }
}
