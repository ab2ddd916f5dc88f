//! Cluster definition and validation

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::types::{NetworkOptions, NodeRole, VolumeSpec};
use crate::{Error, Result, MANAGEMENT_EXTERNAL_PORT};

/// Cloud hosting options: where the cluster lands and how the network
/// and placement partitions are laid out
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CloudOptions {
    /// Target region
    pub region: String,
    /// Target availability zone within the region
    pub availability_zone: String,
    /// CIDR for the cluster's virtual network
    pub vpc_subnet: Ipv4Net,
    /// CIDR for the public subnet (load balancer and gateways)
    pub public_subnet: Ipv4Net,
    /// CIDR for the private node subnet
    pub node_subnet: Ipv4Net,
    /// Number of hardware-fault-isolation partitions for control-plane
    /// nodes; defaults to the control-plane node count
    #[serde(default)]
    pub control_plane_placement_partitions: Option<u32>,
    /// Number of partitions for worker nodes (default 1: placement is
    /// easiest for the provider to satisfy with a single partition)
    #[serde(default = "default_worker_partitions")]
    pub worker_placement_partitions: u32,
    /// Instance type used for nodes that don't specify one
    pub default_instance_type: String,
    /// Name of the node machine image to boot instances from
    pub node_image: String,
    /// Extra tags stamped onto every created resource
    #[serde(default)]
    pub resource_tags: Vec<(String, String)>,
}

fn default_worker_partitions() -> u32 {
    1
}

/// A single node in the cluster definition
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NodeDefinition {
    /// Node name, unique within the cluster
    pub name: String,
    /// Role the node plays
    #[serde(default)]
    pub role: NodeRole,
    /// Static private address within the node subnet
    pub address: Ipv4Addr,
    /// Instance type override
    #[serde(default)]
    pub instance_type: Option<String>,
    /// OS volume
    #[serde(default)]
    pub os_volume: VolumeSpec,
    /// Data volume
    #[serde(default)]
    pub data_volume: VolumeSpec,
    /// Explicit placement partition (1-based); wins over automatic packing
    #[serde(default)]
    pub placement_partition: Option<u32>,
    /// Whether the node receives user ingress traffic
    #[serde(default)]
    pub ingress: bool,
}

impl NodeDefinition {
    /// Returns true for control-plane nodes
    pub fn is_control_plane(&self) -> bool {
        self.role == NodeRole::ControlPlane
    }

    /// Returns true for worker nodes
    pub fn is_worker(&self) -> bool {
        self.role == NodeRole::Worker
    }
}

/// The declarative cluster definition: the immutable input to a hosting
/// manager. Topology is fixed at provisioning time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterDefinition {
    /// Cluster name; resource names and tags derive from it
    pub name: String,
    /// Deployment environment label (e.g. `production`, `test`), stamped
    /// onto every resource tag set
    pub environment: String,
    /// Cloud hosting options
    pub cloud: CloudOptions,
    /// Network policy
    pub network: NetworkOptions,
    /// The cluster's nodes
    pub nodes: Vec<NodeDefinition>,
}

impl ClusterDefinition {
    /// Parse a definition from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Control-plane nodes in definition order
    pub fn control_plane_nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.iter().filter(|n| n.is_control_plane())
    }

    /// Worker nodes in definition order
    pub fn worker_nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.iter().filter(|n| n.is_worker())
    }

    /// Nodes of the given role sorted ascending by name
    pub fn sorted_nodes(&self, role: NodeRole) -> Vec<&NodeDefinition> {
        let mut nodes: Vec<_> = self.nodes.iter().filter(|n| n.role == role).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    /// All nodes, control-plane first, each group sorted by name. This is
    /// the canonical processing order for deterministic allocations.
    pub fn sorted_control_plane_then_workers(&self) -> Vec<&NodeDefinition> {
        let mut nodes = self.sorted_nodes(NodeRole::ControlPlane);
        nodes.extend(self.sorted_nodes(NodeRole::Worker));
        nodes
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Effective control-plane partition count (defaults to the
    /// control-plane node count)
    pub fn control_plane_partitions(&self) -> u32 {
        self.cloud
            .control_plane_placement_partitions
            .unwrap_or_else(|| self.control_plane_nodes().count() as u32)
            .max(1)
    }

    /// Effective worker partition count
    pub fn worker_partitions(&self) -> u32 {
        self.cloud.worker_placement_partitions.max(1)
    }

    /// Ensure at least one node is marked for user ingress traffic: when
    /// none is, all workers are marked, falling back to the control-plane
    /// nodes for worker-less clusters.
    pub fn ensure_ingress_nodes(&mut self) {
        if self.nodes.iter().any(|n| n.ingress) {
            return;
        }

        let has_workers = self.nodes.iter().any(|n| n.is_worker());

        for node in &mut self.nodes {
            if node.is_worker() || !has_workers {
                node.ingress = true;
            }
        }
    }

    /// Validate the definition. Called before any provisioning step runs;
    /// every failure here is fatal and nothing has been created yet.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }

        if self.control_plane_nodes().count() == 0 {
            return Err(Error::validation(
                "cluster must define at least one control-plane node",
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate node name [{}]",
                    node.name
                )));
            }
        }

        // Subnet layout: both subnets inside the VPC block, nodes inside
        // the node subnet.
        for (label, subnet) in [
            ("public_subnet", &self.cloud.public_subnet),
            ("node_subnet", &self.cloud.node_subnet),
        ] {
            if !self.cloud.vpc_subnet.contains(subnet) {
                return Err(Error::validation(format!(
                    "{label} [{subnet}] is not contained in vpc_subnet [{}]",
                    self.cloud.vpc_subnet
                )));
            }
        }

        for node in &self.nodes {
            if !self.cloud.node_subnet.contains(&node.address) {
                return Err(Error::validation(format!(
                    "node [{}] address [{}] is outside the node subnet [{}]",
                    node.name, node.address, self.cloud.node_subnet
                )));
            }
        }

        let network = &self.network;
        if network.first_external_ssh_port > network.last_external_ssh_port {
            return Err(Error::validation(format!(
                "external SSH port range [{}-{}] is inverted",
                network.first_external_ssh_port, network.last_external_ssh_port
            )));
        }

        if network.external_ssh_port_count() < self.nodes.len() {
            return Err(Error::validation(format!(
                "external SSH port range [{}-{}] has {} ports but the cluster has {} nodes",
                network.first_external_ssh_port,
                network.last_external_ssh_port,
                network.external_ssh_port_count(),
                self.nodes.len()
            )));
        }

        let mut external_ports = HashSet::new();
        for rule in &network.ingress_rules {
            if rule.target == super::IngressTarget::Ssh {
                return Err(Error::validation(format!(
                    "ingress rule [{}]: the ssh target is engine-managed and cannot \
                     be used in user rules",
                    rule.name
                )));
            }

            if network.is_external_ssh_port(rule.external_port) {
                return Err(Error::validation(format!(
                    "ingress rule [{}]: external port {} collides with the reserved \
                     SSH range [{}-{}]",
                    rule.name,
                    rule.external_port,
                    network.first_external_ssh_port,
                    network.last_external_ssh_port
                )));
            }

            if rule.external_port == MANAGEMENT_EXTERNAL_PORT {
                return Err(Error::validation(format!(
                    "ingress rule [{}]: external port {} is reserved for the cluster \
                     management endpoint",
                    rule.name, rule.external_port
                )));
            }

            if !external_ports.insert(rule.external_port) {
                return Err(Error::validation(format!(
                    "ingress rule [{}]: external port {} is used by another rule",
                    rule.name, rule.external_port
                )));
            }
        }

        // Explicit placement overrides must land inside the role's
        // partition count.
        for node in &self.nodes {
            if let Some(partition) = node.placement_partition {
                let count = match node.role {
                    NodeRole::ControlPlane => self.control_plane_partitions(),
                    NodeRole::Worker => self.worker_partitions(),
                };

                if partition == 0 || partition > count {
                    return Err(Error::validation(format!(
                        "node [{}] placement partition {} is outside [1-{count}]",
                        node.name, partition
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{HealthCheck, IngressProtocol, IngressRule, IngressTarget};

    fn node(name: &str, role: NodeRole, last_octet: u8) -> NodeDefinition {
        NodeDefinition {
            name: name.to_string(),
            role,
            address: Ipv4Addr::new(10, 100, 1, last_octet),
            instance_type: None,
            os_volume: VolumeSpec::default(),
            data_volume: VolumeSpec::default(),
            placement_partition: None,
            ingress: false,
        }
    }

    fn definition() -> ClusterDefinition {
        ClusterDefinition {
            name: "test-cluster".to_string(),
            environment: "test".to_string(),
            cloud: CloudOptions {
                region: "us-west-2".to_string(),
                availability_zone: "us-west-2a".to_string(),
                vpc_subnet: "10.100.0.0/16".parse().unwrap(),
                public_subnet: "10.100.0.0/24".parse().unwrap(),
                node_subnet: "10.100.1.0/24".parse().unwrap(),
                control_plane_placement_partitions: None,
                worker_placement_partitions: 1,
                default_instance_type: "m5.large".to_string(),
                node_image: "base-image-2204".to_string(),
                resource_tags: vec![],
            },
            network: NetworkOptions {
                ingress_rules: vec![],
                first_external_ssh_port: 2211,
                last_external_ssh_port: 2220,
                nameservers: vec![],
                management_address_rules: vec![],
                ingress_health_check: HealthCheck::default(),
            },
            nodes: vec![
                node("cp-1", NodeRole::ControlPlane, 10),
                node("cp-2", NodeRole::ControlPlane, 11),
                node("worker-1", NodeRole::Worker, 20),
            ],
        }
    }

    #[test]
    fn valid_definition_passes() {
        definition().validate().unwrap();
    }

    #[test]
    fn rejects_cluster_without_control_plane() {
        let mut def = definition();
        def.nodes.retain(|n| n.is_worker());
        assert!(matches!(def.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let mut def = definition();
        def.nodes.push(node("cp-1", NodeRole::Worker, 30));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_node_address_outside_subnet() {
        let mut def = definition();
        def.nodes[0].address = Ipv4Addr::new(10, 100, 2, 10);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("outside the node subnet"));
    }

    #[test]
    fn rejects_ssh_range_smaller_than_node_count() {
        let mut def = definition();
        def.network.last_external_ssh_port = 2212;
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("SSH port range"));
    }

    #[test]
    fn rejects_ingress_rule_in_ssh_range() {
        let mut def = definition();
        def.network.ingress_rules.push(IngressRule {
            name: "web".to_string(),
            protocol: IngressProtocol::Tcp,
            external_port: 2215,
            node_port: 30080,
            target: IngressTarget::User,
            health_check: None,
            address_rules: vec![],
        });
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("collides with the reserved"));
    }

    fn ingress_rule(name: &str, external_port: u16) -> IngressRule {
        IngressRule {
            name: name.to_string(),
            protocol: IngressProtocol::Tcp,
            external_port,
            node_port: 30080,
            target: IngressTarget::User,
            health_check: None,
            address_rules: vec![],
        }
    }

    #[test]
    fn rejects_ingress_rule_on_management_port() {
        // A user rule on the management port would replace the kube-api
        // listener with the user's target group.
        let mut def = definition();
        def.network.ingress_rules.push(ingress_rule("hijack", 6443));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("reserved for the cluster management"));
    }

    #[test]
    fn rejects_duplicate_ingress_external_ports() {
        let mut def = definition();
        def.network.ingress_rules.push(ingress_rule("web", 8080));
        def.network.ingress_rules.push(ingress_rule("api", 8080));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("used by another rule"));
    }

    #[test]
    fn rejects_placement_override_out_of_range() {
        let mut def = definition();
        def.nodes[2].placement_partition = Some(2); // workers have 1 partition
        assert!(matches!(def.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn ensure_ingress_marks_workers_when_none_marked() {
        let mut def = definition();
        def.ensure_ingress_nodes();

        assert!(!def.node("cp-1").unwrap().ingress);
        assert!(def.node("worker-1").unwrap().ingress);
    }

    #[test]
    fn ensure_ingress_falls_back_to_control_plane() {
        let mut def = definition();
        def.nodes.retain(|n| n.is_control_plane());
        def.ensure_ingress_nodes();

        assert!(def.nodes.iter().all(|n| n.ingress));
    }

    #[test]
    fn ensure_ingress_respects_explicit_marks() {
        let mut def = definition();
        def.nodes[0].ingress = true;
        def.ensure_ingress_nodes();

        assert!(!def.node("worker-1").unwrap().ingress);
    }

    #[test]
    fn control_plane_partitions_default_to_node_count() {
        let def = definition();
        assert_eq!(def.control_plane_partitions(), 2);

        let mut def = definition();
        def.cloud.control_plane_placement_partitions = Some(3);
        assert_eq!(def.control_plane_partitions(), 3);
    }

    #[test]
    fn sorted_order_is_control_plane_then_workers_by_name() {
        let mut def = definition();
        def.nodes.reverse();

        let names: Vec<_> = def
            .sorted_control_plane_then_workers()
            .iter()
            .map(|n| n.name.as_str())
            .collect();

        assert_eq!(names, ["cp-1", "cp-2", "worker-1"]);
    }

    #[test]
    fn parses_from_yaml() {
        let yaml = r#"
name: demo
environment: test
cloud:
  region: us-west-2
  availability_zone: us-west-2a
  vpc_subnet: 10.100.0.0/16
  public_subnet: 10.100.0.0/24
  node_subnet: 10.100.1.0/24
  default_instance_type: m5.large
  node_image: base-image-2204
network:
  first_external_ssh_port: 2211
  last_external_ssh_port: 2220
nodes:
  - name: cp-1
    role: control-plane
    address: 10.100.1.10
"#;

        let def = ClusterDefinition::from_yaml(yaml).unwrap();
        assert_eq!(def.name, "demo");
        assert_eq!(def.nodes.len(), 1);
        assert!(def.nodes[0].is_control_plane());
        def.validate().unwrap();
    }
}
