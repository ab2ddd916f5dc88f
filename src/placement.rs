//! Placement partition packing.
//!
//! Nodes of each role are spread across the role's placement group
//! partitions so a hardware fault takes out as few nodes as possible.
//! Explicit per-node overrides from the definition are honored first;
//! the remaining nodes are packed onto the least-loaded partition in
//! name order, so the assignment is deterministic for a given definition
//! and re-runs place recreated nodes where they were.

use std::collections::HashMap;

use crate::definition::NodeDefinition;

/// Assign a 1-based partition to every node.
///
/// `partition_count` is the partition count of the role's placement
/// group; the load counters cover all of them, including the last, so a
/// cluster with as many partitions as nodes lands exactly one node per
/// partition.
pub fn assign_partitions(
    nodes: &[&NodeDefinition],
    partition_count: u32,
) -> HashMap<String, u32> {
    let partition_count = partition_count.max(1) as usize;
    let mut load = vec![0u32; partition_count];
    let mut assignments = HashMap::with_capacity(nodes.len());

    // Overrides first, so automatic packing sees their load.
    for node in nodes {
        if let Some(partition) = node.placement_partition {
            let index = (partition as usize - 1).min(partition_count - 1);
            load[index] += 1;
            assignments.insert(node.name.clone(), index as u32 + 1);
        }
    }

    let mut remaining: Vec<_> = nodes
        .iter()
        .filter(|n| n.placement_partition.is_none())
        .collect();
    remaining.sort_by(|a, b| a.name.cmp(&b.name));

    for node in remaining {
        // Least-loaded partition; ties resolve to the lowest index.
        let index = load
            .iter()
            .enumerate()
            .min_by_key(|(i, count)| (**count, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);

        load[index] += 1;
        assignments.insert(node.name.clone(), index as u32 + 1);
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeRole, VolumeSpec};

    fn node(name: &str, partition: Option<u32>) -> NodeDefinition {
        NodeDefinition {
            name: name.to_string(),
            role: NodeRole::Worker,
            address: "10.100.1.10".parse().unwrap(),
            instance_type: None,
            os_volume: VolumeSpec::default(),
            data_volume: VolumeSpec::default(),
            placement_partition: partition,
            ingress: false,
        }
    }

    #[test]
    fn one_partition_per_node_when_counts_match() {
        // Regression: with N nodes over N partitions every partition must
        // be usable, including the last one.
        let nodes = [node("a", None), node("b", None), node("c", None)];
        let refs: Vec<_> = nodes.iter().collect();

        let assignments = assign_partitions(&refs, 3);
        let mut partitions: Vec<_> = assignments.values().copied().collect();
        partitions.sort_unstable();
        assert_eq!(partitions, [1, 2, 3]);
    }

    #[test]
    fn packing_is_least_loaded_with_lowest_index_ties() {
        let nodes = [
            node("a", None),
            node("b", None),
            node("c", None),
            node("d", None),
            node("e", None),
        ];
        let refs: Vec<_> = nodes.iter().collect();

        let assignments = assign_partitions(&refs, 2);
        assert_eq!(assignments["a"], 1);
        assert_eq!(assignments["b"], 2);
        assert_eq!(assignments["c"], 1);
        assert_eq!(assignments["d"], 2);
        assert_eq!(assignments["e"], 1);
    }

    #[test]
    fn max_load_is_the_ceiling_of_nodes_over_partitions() {
        let nodes: Vec<_> = (0..7).map(|i| node(&format!("n{i}"), None)).collect();
        let refs: Vec<_> = nodes.iter().collect();

        let assignments = assign_partitions(&refs, 3);
        let mut load = [0u32; 3];
        for partition in assignments.values() {
            load[*partition as usize - 1] += 1;
        }

        assert_eq!(*load.iter().max().unwrap(), 3); // ceil(7/3)
        assert_eq!(*load.iter().min().unwrap(), 2);
    }

    #[test]
    fn overrides_win_and_count_toward_load() {
        let nodes = [node("a", Some(2)), node("b", None), node("c", None)];
        let refs: Vec<_> = nodes.iter().collect();

        let assignments = assign_partitions(&refs, 2);
        assert_eq!(assignments["a"], 2);
        // Partition 2 already holds "a", so packing starts at 1; the
        // following tie also resolves to 1.
        assert_eq!(assignments["b"], 1);
        assert_eq!(assignments["c"], 1);
    }

    #[test]
    fn assignment_is_deterministic_regardless_of_input_order() {
        let nodes = [node("c", None), node("a", None), node("b", None)];
        let refs: Vec<_> = nodes.iter().collect();
        let forward = assign_partitions(&refs, 2);

        let mut reversed: Vec<_> = nodes.iter().collect();
        reversed.reverse();
        let backward = assign_partitions(&reversed, 2);

        assert_eq!(forward, backward);
    }
}
