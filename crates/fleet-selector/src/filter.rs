//! Machine-boundary filtering.

use std::collections::HashMap;

use tracing::debug;

use fleet_core::DeploymentDescriptor;
use fleet_lease::LeasedNode;

/// Apply a descriptor's per-machine limit to a candidate list.
///
/// No-op unless the descriptor declares a positive limit scoped to the
/// physical machine. Otherwise candidates are grouped by host address; a
/// host whose running `actual + in_flight` count for the descriptor reaches
/// the limit while scanning its candidates (in list order) is dropped
/// entirely. Surviving hosts keep at most `limit` candidates, in list order.
/// The relative order of the survivors is preserved.
pub fn machine_boundary(
    descriptor: &DeploymentDescriptor,
    candidates: Vec<LeasedNode>,
) -> Vec<LeasedNode> {
    let Some(limit) = descriptor.machine_limit() else {
        return candidates;
    };
    let key = descriptor.key();

    let mut host_order: Vec<&str> = Vec::new();
    let mut by_host: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        let host = candidate.address();
        by_host
            .entry(host)
            .or_insert_with(|| {
                host_order.push(host);
                Vec::new()
            })
            .push(idx);
    }

    let mut keep = vec![false; candidates.len()];
    for host in host_order {
        let indices = &by_host[host];

        let mut running = 0u32;
        let saturated = indices.iter().any(|&idx| {
            running += candidates[idx].node().counts(&key).total();
            running >= limit
        });
        if saturated {
            debug!(%host, deployment = %key, limit, "host at per-machine limit, dropped");
            continue;
        }

        for &idx in indices.iter().take(limit as usize) {
            keep[idx] = true;
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(candidate, kept)| kept.then_some(candidate))
        .collect()
}
