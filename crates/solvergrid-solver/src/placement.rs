//! Placement of new solver instances.
//!
//! Every member answers `IsAvailable` (active and above the memory floor).
//! A new instance goes to one available member picked uniformly at random.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use solvergrid_cluster::Address;
use solvergrid_core::SolverKind;

use crate::error::SolverResult;

/// Resource figures of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub address: Address,
    pub active: bool,
    pub capacity_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub memory_floor_bytes: u64,
    /// Live instances across all containers.
    pub usage: u32,
    pub solvers: BTreeMap<SolverKind, u32>,
    pub is_master: bool,
    pub started_at: u64,
}

impl NodeInfo {
    pub fn free_memory(&self) -> u64 {
        self.capacity_memory_bytes.saturating_sub(self.used_memory_bytes)
    }

    pub fn is_available(&self) -> bool {
        self.active && self.free_memory() >= self.memory_floor_bytes
    }
}

/// Aggregate usage of the cluster, for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLoad {
    pub nodes: Vec<NodeInfo>,
    /// Members that did not answer.
    pub unreachable: Vec<Address>,
    pub total_usage: u32,
    pub free_memory_bytes: u64,
    pub available_nodes: u32,
}

impl ClusterLoad {
    pub fn aggregate(nodes: Vec<NodeInfo>, unreachable: Vec<Address>) -> Self {
        Self {
            total_usage: nodes.iter().map(|n| n.usage).sum(),
            free_memory_bytes: nodes.iter().map(NodeInfo::free_memory).sum(),
            available_nodes: nodes.iter().filter(|n| n.is_available()).count() as u32,
            nodes,
            unreachable,
        }
    }
}

/// Members that answered `IsAvailable` with true, in view order.
pub fn available_members(replies: Vec<(Address, SolverResult<bool>)>) -> Vec<Address> {
    replies
        .into_iter()
        .filter_map(|(address, reply)| match reply {
            Ok(true) => Some(address),
            Ok(false) => None,
            Err(e) => {
                debug!(node = %address, error = %e, "member skipped for placement");
                None
            }
        })
        .collect()
}

/// Pick one of `candidates` uniformly at random.
pub fn choose_node<R: Rng + ?Sized>(candidates: &[Address], rng: &mut R) -> Option<Address> {
    if candidates.is_empty() {
        return None;
    }
    let chosen = candidates[rng.gen_range(0..candidates.len())].clone();
    debug!(node = %chosen, candidates = candidates.len(), "placement chosen");
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::error::SolverError;

    fn node(name: &str, used: u64, active: bool) -> NodeInfo {
        NodeInfo {
            address: Address::new(name),
            active,
            capacity_memory_bytes: 1_000,
            used_memory_bytes: used,
            memory_floor_bytes: 200,
            usage: (used / 100) as u32,
            solvers: BTreeMap::new(),
            is_master: false,
            started_at: 0,
        }
    }

    #[test]
    fn availability_needs_activity_and_memory() {
        assert!(node("a", 800, true).is_available());
        assert!(!node("a", 900, true).is_available());
        assert!(!node("a", 0, false).is_available());
    }

    #[test]
    fn unavailable_and_failed_members_are_skipped() {
        let replies = vec![
            (Address::new("a"), Ok(true)),
            (Address::new("b"), Ok(false)),
            (Address::new("c"), Err(SolverError::Unavailable("timeout".into()))),
            (Address::new("d"), Ok(true)),
        ];
        assert_eq!(available_members(replies), vec![Address::new("a"), Address::new("d")]);
    }

    #[test]
    fn choice_is_uniform_and_seeded() {
        let candidates = vec![Address::new("a"), Address::new("b"), Address::new("c")];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts: HashMap<Address, u32> = HashMap::new();
        for _ in 0..3_000 {
            *counts.entry(choose_node(&candidates, &mut rng).unwrap()).or_default() += 1;
        }
        for address in &candidates {
            assert!((800..1_200).contains(&counts[address]), "{address}: {}", counts[address]);
        }

        let mut a = StdRng::seed_from_u64(1);
        let mut b = StdRng::seed_from_u64(1);
        assert_eq!(choose_node(&candidates, &mut a), choose_node(&candidates, &mut b));
        assert!(choose_node(&[], &mut a).is_none());
    }

    #[test]
    fn load_aggregates_nodes() {
        let load = ClusterLoad::aggregate(
            vec![node("a", 300, true), node("b", 900, true)],
            vec![Address::new("c")],
        );
        assert_eq!(load.total_usage, 12);
        assert_eq!(load.free_memory_bytes, 800);
        assert_eq!(load.available_nodes, 1);
        assert_eq!(load.unreachable.len(), 1);
    }
}
