//! NUMA topology used for placement decisions
//!
//! The scheduler only needs to know which node a CPU belongs to and how
//! far apart two nodes are. Without firmware tables the topology is
//! synthesized from the configured CPUs-per-node: CPU `c` lives on node
//! `c / cpus_per_node`, local distance 10, remote distance 20.
//!
//! ## Use in balancing
//!
//! When several destination CPUs are equally idle, the load balancer
//! prefers the one on the same node as the migrating entity's preferred
//! (or last) CPU, then the nearest node.

use alloc::vec::Vec;

use super::{
    config::SchedConfig,
    task::{CpuId, CpuSet},
};

/// NUMA node identifier
pub type NodeId = u32;

/// Relative latency of a node-local access.
pub const LOCAL_DISTANCE: u32 = 10;

/// Relative latency of a remote access.
pub const REMOTE_DISTANCE: u32 = 20;

/// NUMA topology information
#[derive(Debug, Clone)]
pub struct NumaTopology {
    /// Number of NUMA nodes
    node_count: usize,
    /// CPUs per node
    node_cpus: Vec<CpuSet>,
    /// Distance matrix (relative latency between nodes)
    distance_matrix: Vec<Vec<u32>>,
}

impl NumaTopology {
    /// Build the synthesized topology for a configuration.
    pub fn from_config(config: &SchedConfig) -> Self {
        let per_node = config.cpus_per_node.max(1);
        let node_count = config.numa_nodes().max(1);
        let mut node_cpus = alloc::vec![CpuSet::empty(); node_count];
        for cpu in 0..config.cpu_count {
            node_cpus[cpu / per_node].add(cpu as CpuId);
        }
        let distance_matrix = (0..node_count)
            .map(|from| {
                (0..node_count)
                    .map(|to| if from == to { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                    .collect()
            })
            .collect();
        Self {
            node_count,
            node_cpus,
            distance_matrix,
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Get node for a given CPU
    pub fn cpu_to_node(&self, cpu: CpuId) -> Option<NodeId> {
        self.node_cpus
            .iter()
            .position(|cpus| cpus.contains(cpu))
            .map(|node| node as NodeId)
    }

    /// CPUs belonging to a node
    pub fn node_cpus(&self, node: NodeId) -> CpuSet {
        self.node_cpus
            .get(node as usize)
            .copied()
            .unwrap_or(CpuSet::empty())
    }

    /// Get distance between two nodes
    pub fn distance(&self, from: NodeId, to: NodeId) -> u32 {
        if from as usize >= self.node_count || to as usize >= self.node_count {
            return u32::MAX;
        }
        self.distance_matrix[from as usize][to as usize]
    }

    /// Check if two CPUs are on the same node
    pub fn same_node(&self, cpu1: CpuId, cpu2: CpuId) -> bool {
        match (self.cpu_to_node(cpu1), self.cpu_to_node(cpu2)) {
            (Some(n1), Some(n2)) => n1 == n2,
            _ => false,
        }
    }

    /// Pick the CPU closest to `home` among `candidates`, lowest id on
    /// ties.
    pub fn closest(&self, candidates: CpuSet, home: CpuId) -> Option<CpuId> {
        let home_node = self.cpu_to_node(home)?;
        candidates.iter().min_by_key(|&cpu| {
            let dist = self
                .cpu_to_node(cpu)
                .map_or(u32::MAX, |node| self.distance(home_node, node));
            (dist, cpu)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_topology() {
        let topo = NumaTopology::from_config(&SchedConfig::with_cpus(12));
        assert_eq!(topo.node_count(), 2);
        assert_eq!(topo.cpu_to_node(7), Some(0));
        assert_eq!(topo.cpu_to_node(8), Some(1));
        assert_eq!(topo.cpu_to_node(12), None);
        assert_eq!(topo.node_cpus(1).count(), 4);
        assert!(topo.same_node(0, 7));
        assert!(!topo.same_node(7, 8));
        assert_eq!(topo.distance(0, 0), LOCAL_DISTANCE);
        assert_eq!(topo.distance(0, 1), REMOTE_DISTANCE);
        assert_eq!(topo.distance(0, 5), u32::MAX);
    }

    #[test]
    fn test_closest_prefers_home_node() {
        let config = SchedConfig::with_cpus(4).with_cpus_per_node(2);
        let topo = NumaTopology::from_config(&config);
        let mut tied = CpuSet::empty();
        tied.add(1);
        tied.add(3);
        assert_eq!(topo.closest(tied, 2), Some(3));
        assert_eq!(topo.closest(tied, 0), Some(1));
        assert_eq!(topo.closest(CpuSet::empty(), 0), None);
    }
}
