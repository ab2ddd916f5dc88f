//! External SSH port assignment.
//!
//! Each node is reachable over SSH through a dedicated port on the load
//! balancer, drawn from the reserved external range. Assignments are
//! persisted as instance tags and recovered during discovery, so a port
//! once given to a node is never reassigned while the instance lives;
//! only nodes without a recovered port receive one, taking the lowest
//! free ports in order, control-plane nodes first and each group in name
//! order.

use std::collections::{BTreeSet, HashMap};

use crate::definition::ClusterDefinition;
use crate::{Error, Result};

/// Compute the full node-to-port map, preserving `existing` assignments
/// recovered from instance tags
pub fn assign_ssh_ports(
    definition: &ClusterDefinition,
    existing: &HashMap<String, u16>,
) -> Result<HashMap<String, u16>> {
    let network = &definition.network;

    let taken: BTreeSet<u16> = existing.values().copied().collect();
    let mut free = (network.first_external_ssh_port..=network.last_external_ssh_port)
        .filter(|port| !taken.contains(port));

    let mut assignments = HashMap::with_capacity(definition.nodes.len());

    for node in definition.sorted_control_plane_then_workers() {
        let port = match existing.get(&node.name) {
            Some(port) => *port,
            None => free.next().ok_or_else(|| {
                Error::capacity(format!(
                    "external SSH port range [{}-{}] is exhausted; node [{}] cannot \
                     be assigned a port",
                    network.first_external_ssh_port,
                    network.last_external_ssh_port,
                    node.name
                ))
            })?,
        };

        assignments.insert(node.name.clone(), port);
    }

    Ok(assignments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ClusterDefinition, NodeRole};

    fn definition() -> ClusterDefinition {
        ClusterDefinition::from_yaml(
            r#"
name: demo
environment: test
cloud:
  region: us-west-2
  availability_zone: us-west-2a
  vpc_subnet: 10.100.0.0/16
  public_subnet: 10.100.0.0/24
  node_subnet: 10.100.1.0/24
  default_instance_type: m5.large
  node_image: base-image
network:
  first_external_ssh_port: 2211
  last_external_ssh_port: 2220
nodes:
  - { name: cp-1, role: control-plane, address: 10.100.1.10 }
  - { name: cp-2, role: control-plane, address: 10.100.1.11 }
  - { name: cp-3, role: control-plane, address: 10.100.1.12 }
  - { name: worker-1, role: worker, address: 10.100.1.20 }
  - { name: worker-2, role: worker, address: 10.100.1.21 }
"#,
        )
        .unwrap()
    }

    #[test]
    fn fresh_cluster_fills_ports_control_plane_first() {
        let assignments = assign_ssh_ports(&definition(), &HashMap::new()).unwrap();

        assert_eq!(assignments["cp-1"], 2211);
        assert_eq!(assignments["cp-2"], 2212);
        assert_eq!(assignments["cp-3"], 2213);
        assert_eq!(assignments["worker-1"], 2214);
        assert_eq!(assignments["worker-2"], 2215);
    }

    #[test]
    fn recovered_assignments_are_never_moved() {
        let mut existing = HashMap::new();
        existing.insert("worker-1".to_string(), 2212u16);

        let assignments = assign_ssh_ports(&definition(), &existing).unwrap();

        // worker-1 keeps its port; new assignments skip over it.
        assert_eq!(assignments["worker-1"], 2212);
        assert_eq!(assignments["cp-1"], 2211);
        assert_eq!(assignments["cp-2"], 2213);
        assert_eq!(assignments["cp-3"], 2214);
        assert_eq!(assignments["worker-2"], 2215);
    }

    #[test]
    fn reassignment_is_stable_across_runs() {
        let definition = definition();
        let first = assign_ssh_ports(&definition, &HashMap::new()).unwrap();
        let second = assign_ssh_ports(&definition, &first).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exhausted_range_is_a_capacity_error() {
        let mut definition = definition();
        definition.network.last_external_ssh_port = 2214;

        // Four ports, five nodes, one port burned by a node no longer in
        // the definition.
        let mut existing = HashMap::new();
        existing.insert("old-node".to_string(), 2211u16);

        let err = assign_ssh_ports(&definition, &existing).unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
    }

    #[test]
    fn node_order_is_by_role_then_name() {
        let mut definition = definition();
        definition.nodes.reverse();

        let assignments = assign_ssh_ports(&definition, &HashMap::new()).unwrap();
        assert_eq!(assignments["cp-1"], 2211);
        assert_eq!(assignments["worker-2"], 2215);

        // Sanity: definition order itself no longer matches name order.
        assert_eq!(definition.nodes[0].role, NodeRole::Worker);
    }
}
