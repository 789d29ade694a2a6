// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Immutable CPU/NUMA snapshot.
//!
//! The kernel reports the machine topology once, at startup, through the
//! NUMA-map ioctl; this crate owns the copied result and answers every
//! affinity question from it. Nothing here is refreshed: CPU hot-add is
//! explicitly unsupported, so a one-shot snapshot is correct for the
//! life of the process and lookups cost nothing.
//!
//! Query misuse (a CPU outside the known range, or an offline CPU) is a
//! programmer error in a handler; it degrades to node 0 with a logged
//! warning rather than aborting, because crashing a worker would wedge
//! its channel kernel-side.

use abi::{CpuMask, NumaMap, NUMA_MAP_MAX_NODES};
use log::warn;

#[derive(Debug)]
pub struct Topology {
    map: NumaMap,
    possible_mask: CpuMask,
    online_mask: CpuMask,
    nr_cpu_ids: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TopologyError {
    /// The kernel reported more nodes than the wire struct can carry.
    TooManyNodes { nodes: u32 },
    /// A CPU appears in more than one node mask.
    OverlappingNodes { cpu: u32 },
    /// The map lists no online CPUs at all.
    NoOnlineCpus,
}

impl core::fmt::Display for TopologyError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooManyNodes { nodes } => {
                write!(f, "kernel reported {nodes} NUMA nodes, max {NUMA_MAP_MAX_NODES}")
            }
            Self::OverlappingNodes { cpu } => {
                write!(f, "cpu {cpu} claimed by more than one NUMA node")
            }
            Self::NoOnlineCpus => write!(f, "NUMA map contains no online cpus"),
        }
    }
}

impl std::error::Error for TopologyError {}

impl Topology {
    /// Builds the snapshot from a kernel-provided map, checking the
    /// one structural invariant: every online CPU belongs to exactly
    /// one node.
    pub fn new(map: NumaMap) -> Result<Self, TopologyError> {
        if map.possible_nodes as usize > NUMA_MAP_MAX_NODES {
            return Err(TopologyError::TooManyNodes {
                nodes: map.possible_nodes,
            });
        }

        let nodes = &map.masks[..map.possible_nodes as usize];
        let mut online_mask = CpuMask::EMPTY;
        for mask in nodes {
            if mask.intersects(&online_mask) {
                let cpu = mask
                    .iter()
                    .find(|&c| online_mask.is_set(c))
                    .unwrap_or(u32::MAX);
                return Err(TopologyError::OverlappingNodes { cpu });
            }
            online_mask.union_with(mask);
        }
        if online_mask.is_empty() {
            return Err(TopologyError::NoOnlineCpus);
        }

        let mut possible_mask = CpuMask::EMPTY;
        for cpu in 0..map.possible_cpus.min(abi::MAX_CPUS as u32) {
            possible_mask.set(cpu);
        }

        let nr_cpu_ids = online_mask.highest_plus_one().max(map.possible_cpus);

        Ok(Self {
            map,
            possible_mask,
            online_mask,
            nr_cpu_ids,
        })
    }

    /// NUMA node owning `cpu`. A CPU outside the snapshot degrades to
    /// node 0 with a warning; see the module comment.
    pub fn cpu_to_node(&self, cpu: u32) -> u32 {
        for (n, mask) in self.node_masks().iter().enumerate() {
            if mask.is_set(cpu) {
                return n as u32;
            }
        }
        warn!("cpu_to_node({cpu}): cpu unknown or offline, degrading to node 0");
        0
    }

    pub fn is_online(&self, cpu: u32) -> bool {
        self.online_mask.is_set(cpu)
    }

    /// First online CPU strictly after `cpu`, within `mask`.
    pub fn next_online(&self, cpu: u32, mask: &CpuMask) -> Option<u32> {
        (cpu + 1..self.nr_cpu_ids).find(|&c| self.online_mask.is_set(c) && mask.is_set(c))
    }

    /// Online CPUs in ascending index order.
    pub fn online_cpus(&self) -> impl Iterator<Item = u32> + '_ {
        self.online_mask.iter()
    }

    pub fn online_count(&self) -> u32 {
        self.online_mask.count()
    }

    pub fn possible_cpus(&self) -> u32 {
        self.map.possible_cpus
    }

    pub fn nr_nodes(&self) -> u32 {
        self.map.possible_nodes
    }

    pub fn nr_cpu_ids(&self) -> u32 {
        self.nr_cpu_ids
    }

    pub fn node_mask(&self, node: u32) -> Option<&CpuMask> {
        self.node_masks().get(node as usize)
    }

    pub fn possible_mask(&self) -> &CpuMask {
        &self.possible_mask
    }

    pub fn online_mask(&self) -> &CpuMask {
        &self.online_mask
    }

    fn node_masks(&self) -> &[CpuMask] {
        &self.map.masks[..self.map.possible_nodes as usize]
    }
}

/// Builds a map for tests and for synthetic relays: `nodes[n]` lists the
/// CPUs of node `n`.
pub fn synthetic_map(possible_cpus: u32, nodes: &[&[u32]]) -> NumaMap {
    let mut map = NumaMap::EMPTY;
    map.possible_cpus = possible_cpus;
    map.possible_nodes = nodes.len() as u32;
    for (n, cpus) in nodes.iter().enumerate() {
        for &cpu in *cpus {
            map.masks[n].set(cpu);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_node_map() {
        let topo = Topology::new(synthetic_map(4, &[&[0, 1], &[2, 3]])).unwrap();
        assert_eq!(topo.online_count(), 4);
        assert_eq!(topo.nr_nodes(), 2);
        assert_eq!(topo.nr_cpu_ids(), 4);
        assert_eq!(topo.cpu_to_node(0), 0);
        assert_eq!(topo.cpu_to_node(1), 0);
        assert_eq!(topo.cpu_to_node(2), 1);
        assert_eq!(topo.cpu_to_node(3), 1);
    }

    #[test]
    fn every_online_cpu_has_one_node() {
        let topo = Topology::new(synthetic_map(8, &[&[0, 2, 4], &[1, 3, 5]])).unwrap();
        for cpu in topo.online_cpus() {
            let node = topo.cpu_to_node(cpu);
            let hits = (0..topo.nr_nodes())
                .filter(|&n| topo.node_mask(n).unwrap().is_set(cpu))
                .count();
            assert_eq!(hits, 1);
            assert!(topo.node_mask(node).unwrap().is_set(cpu));
        }
    }

    #[test]
    fn overlapping_nodes_rejected() {
        let err = Topology::new(synthetic_map(4, &[&[0, 1], &[1, 2]])).unwrap_err();
        assert_eq!(err, TopologyError::OverlappingNodes { cpu: 1 });
    }

    #[test]
    fn empty_map_rejected() {
        assert_eq!(
            Topology::new(synthetic_map(4, &[])).unwrap_err(),
            TopologyError::NoOnlineCpus
        );
    }

    #[test]
    fn unknown_cpu_degrades_to_node_zero() {
        let topo = Topology::new(synthetic_map(4, &[&[0, 1], &[2, 3]])).unwrap();
        assert_eq!(topo.cpu_to_node(99), 0);
        assert!(!topo.is_online(99));
    }

    #[test]
    fn next_online_skips_holes() {
        // CPU 2 offline.
        let topo = Topology::new(synthetic_map(5, &[&[0, 1], &[3, 4]])).unwrap();
        let all = *topo.possible_mask();
        assert_eq!(topo.next_online(0, &all), Some(1));
        assert_eq!(topo.next_online(1, &all), Some(3));
        assert_eq!(topo.next_online(4, &all), None);
        assert_eq!(
            topo.online_cpus().collect::<Vec<_>>(),
            vec![0, 1, 3, 4]
        );
    }
}
