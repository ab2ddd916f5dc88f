//! Deterministic resource naming and the cluster tag schema.
//!
//! Every provider resource the engine creates carries the cluster tag, a
//! `Name` tag derived from the cluster name, and any operator-supplied
//! tags from the definition. Discovery relies on the cluster tag to find
//! resources and on the `Name` tag to match them to their role, so both
//! must be assigned atomically with creation (or immediately after, for
//! resources whose create call cannot tag).

use crate::definition::{ClusterDefinition, IngressProtocol, IngressTarget};
use crate::provider::Tag;
use crate::{Error, Result};

/// The provider's display-name tag key
pub const NAME_TAG: &str = "Name";

/// Tag naming the owning cluster; the discovery filter key
pub const CLUSTER_TAG: &str = "gw:cluster";

/// Tag naming the cluster environment (production, staging, ...)
pub const ENVIRONMENT_TAG: &str = "gw:environment";

/// Instance tag holding the node's definition name
pub const NODE_NAME_TAG: &str = "gw:node.name";

/// Instance tag persisting the node's assigned external SSH port
pub const NODE_SSH_PORT_TAG: &str = "gw:node.ssh-port";

/// Instance tag recording that the first-boot payload has been cleared
pub const NODE_USER_DATA_TAG: &str = "gw:node.user-data";

/// VPC tag persisting whether external SSH access is currently enabled
pub const SSH_ENABLED_TAG: &str = "gw:vpc.ssh-enabled";

/// Longest name the provider accepts for load balancers and target groups
const MAX_BALANCER_NAME: usize = 32;

/// Builds the names and tag sets for one cluster's resources.
#[derive(Clone, Debug)]
pub struct ResourceNamer {
    cluster: String,
    environment: String,
    extra_tags: Vec<(String, String)>,
}

impl ResourceNamer {
    /// Create a namer for the given definition
    pub fn new(definition: &ClusterDefinition) -> Self {
        Self {
            cluster: definition.name.clone(),
            environment: definition.environment.clone(),
            extra_tags: definition.cloud.resource_tags.clone(),
        }
    }

    /// The cluster name
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The discovery filter matching this cluster's resources
    pub fn cluster_filter(&self) -> crate::provider::TagFilter {
        crate::provider::TagFilter::new(CLUSTER_TAG, self.cluster.as_str())
    }

    /// Name for a cluster-scoped resource: `{cluster}.{base}`
    pub fn resource_name(&self, base: &str) -> String {
        format!("{}.{}", self.cluster, base)
    }

    /// Name for a load balancer family resource, where the provider
    /// forbids dots and underscores and reserves the `internal-` prefix.
    ///
    /// Dots and underscores become dashes; a leading `internal-` is
    /// rewritten to `x-internal-`; names longer than the provider limit
    /// fail fast rather than being truncated, since truncation could
    /// silently collide two clusters' resources.
    pub fn balancer_name(&self, base: &str) -> Result<String> {
        let mut name = format!("{}-{}", self.cluster, base).replace(['.', '_'], "-");

        if name.starts_with("internal-") {
            name = format!("x-{name}");
        }

        if name.len() > MAX_BALANCER_NAME {
            return Err(Error::validation(format!(
                "load balancer resource name [{name}] exceeds {MAX_BALANCER_NAME} characters; \
                 use a shorter cluster name"
            )));
        }

        Ok(name)
    }

    /// Name for the target group handling `target` traffic arriving over
    /// `protocol` on the given node port
    pub fn target_group_name(
        &self,
        target: IngressTarget,
        protocol: IngressProtocol,
        port: u16,
    ) -> Result<String> {
        self.balancer_name(&format!("{target}-{}-{port}", protocol.as_balancer_protocol()))
    }

    /// Name for a node's per-instance external SSH target group, keyed by
    /// the external port so reassignment is impossible without a rename
    pub fn ssh_target_group_name(&self, external_port: u16) -> Result<String> {
        self.target_group_name(IngressTarget::Ssh, IngressProtocol::Tcp, external_port)
    }

    /// The full tag set for a new resource: display name, cluster and
    /// environment ownership, then operator tags from the definition
    pub fn tags(&self, name: &str) -> Vec<Tag> {
        self.tags_with(name, [])
    }

    /// [`Self::tags`] plus resource-specific tags
    pub fn tags_with(
        &self,
        name: &str,
        specific: impl IntoIterator<Item = Tag>,
    ) -> Vec<Tag> {
        let mut tags = vec![
            Tag::new(NAME_TAG, name),
            Tag::new(CLUSTER_TAG, self.cluster.as_str()),
            Tag::new(ENVIRONMENT_TAG, self.environment.as_str()),
        ];

        tags.extend(specific);
        tags.extend(
            self.extra_tags
                .iter()
                .map(|(k, v)| Tag::new(k.clone(), v.clone())),
        );

        tags
    }

    // Fixed resource names. One of each exists per cluster.

    /// The virtual network
    pub fn vpc(&self) -> String {
        self.resource_name("vpc")
    }

    /// The cluster security group
    pub fn security_group(&self) -> String {
        self.resource_name("sg")
    }

    /// The public subnet (load balancer, NAT gateway)
    pub fn public_subnet(&self) -> String {
        self.resource_name("public")
    }

    /// The node subnet
    pub fn node_subnet(&self) -> String {
        self.resource_name("node")
    }

    /// Route table for the public subnet
    pub fn public_route_table(&self) -> String {
        self.resource_name("public-route")
    }

    /// Route table for the node subnet
    pub fn node_route_table(&self) -> String {
        self.resource_name("node-route")
    }

    /// The internet gateway
    pub fn internet_gateway(&self) -> String {
        self.resource_name("igw")
    }

    /// The NAT gateway for node egress
    pub fn nat_gateway(&self) -> String {
        self.resource_name("nat")
    }

    /// The elastic address the load balancer answers on
    pub fn ingress_address(&self) -> String {
        self.resource_name("ingress-address")
    }

    /// The elastic address node egress NATs through
    pub fn egress_address(&self) -> String {
        self.resource_name("egress-address")
    }

    /// The two network ACL slots used for rotation
    pub fn network_acl(&self, slot: AclSlot) -> String {
        match slot {
            AclSlot::A => self.resource_name("acl-a"),
            AclSlot::B => self.resource_name("acl-b"),
        }
    }

    /// Placement group for control-plane nodes
    pub fn control_plane_placement_group(&self) -> String {
        self.resource_name("control-plane-placement")
    }

    /// Placement group for worker nodes
    pub fn worker_placement_group(&self) -> String {
        self.resource_name("worker-placement")
    }

    /// The load balancer's display name tag
    pub fn load_balancer(&self) -> String {
        self.resource_name("elb")
    }

    /// The load balancer's provider name
    pub fn load_balancer_name(&self) -> Result<String> {
        self.balancer_name("elb")
    }

    /// A node instance
    pub fn node_instance(&self, node_name: &str) -> String {
        self.resource_name(node_name)
    }

    /// A node's OS volume
    pub fn node_os_volume(&self, node_name: &str) -> String {
        self.resource_name(&format!("{node_name}.os"))
    }

    /// A node's data volume
    pub fn node_data_volume(&self, node_name: &str) -> String {
        self.resource_name(&format!("{node_name}.data"))
    }
}

/// Which of the two rotation ACLs a name refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclSlot {
    /// First slot
    A,
    /// Second slot
    B,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ClusterDefinition;

    fn namer_for(cluster: &str) -> ResourceNamer {
        ResourceNamer {
            cluster: cluster.to_string(),
            environment: "test".to_string(),
            extra_tags: vec![("team".to_string(), "infra".to_string())],
        }
    }

    #[test]
    fn resource_names_prefix_the_cluster() {
        let namer = namer_for("demo");
        assert_eq!(namer.vpc(), "demo.vpc");
        assert_eq!(namer.node_instance("worker-0"), "demo.worker-0");
        assert_eq!(namer.node_data_volume("worker-0"), "demo.worker-0.data");
    }

    #[test]
    fn balancer_names_substitute_dashes() {
        // Dots and underscores in the cluster name map to dashes.
        let namer = namer_for("my.cluster");
        assert_eq!(namer.balancer_name("elb").unwrap(), "my-cluster-elb");

        let namer = namer_for("my_cluster");
        assert_eq!(namer.balancer_name("elb").unwrap(), "my-cluster-elb");
    }

    #[test]
    fn balancer_names_avoid_reserved_prefix() {
        let namer = namer_for("internal.prod");
        assert_eq!(namer.balancer_name("elb").unwrap(), "x-internal-prod-elb");
    }

    #[test]
    fn overlong_balancer_names_fail_fast() {
        let namer = namer_for("a-cluster-with-a-very-long-name-indeed");
        let err = namer.balancer_name("elb").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn target_group_names_encode_target_protocol_and_port() {
        let namer = namer_for("demo");
        assert_eq!(
            namer
                .target_group_name(IngressTarget::Control, IngressProtocol::Tcp, 6443)
                .unwrap(),
            "demo-control-tcp-6443"
        );
        // HTTP ingress still forwards as TCP at the balancer.
        assert_eq!(
            namer
                .target_group_name(IngressTarget::User, IngressProtocol::Http, 30080)
                .unwrap(),
            "demo-user-tcp-30080"
        );
        assert_eq!(
            namer.ssh_target_group_name(2211).unwrap(),
            "demo-ssh-tcp-2211"
        );
    }

    #[test]
    fn tags_carry_ownership_and_operator_tags() {
        let namer = namer_for("demo");
        let tags = namer.tags("demo.vpc");

        let get = |key: &str| {
            tags.iter()
                .find(|t| t.key == key)
                .map(|t| t.value.as_str())
        };

        assert_eq!(get(NAME_TAG), Some("demo.vpc"));
        assert_eq!(get(CLUSTER_TAG), Some("demo"));
        assert_eq!(get(ENVIRONMENT_TAG), Some("test"));
        assert_eq!(get("team"), Some("infra"));
    }

    #[test]
    fn namer_reads_definition_fields() {
        let yaml = r#"
name: demo
environment: production
cloud:
  region: us-west-2
  availability_zone: us-west-2a
  vpc_subnet: 10.100.0.0/16
  public_subnet: 10.100.255.0/24
  node_subnet: 10.100.0.0/24
  default_instance_type: c5.large
  node_image: ubuntu-22.04
network:
  first_external_ssh_port: 2211
  last_external_ssh_port: 2220
nodes:
  - name: control-0
    role: control-plane
    address: 10.100.0.10
"#;
        let definition = ClusterDefinition::from_yaml(yaml).unwrap();
        let namer = ResourceNamer::new(&definition);

        assert_eq!(namer.cluster(), "demo");
        assert_eq!(namer.cluster_filter().key, CLUSTER_TAG);
        assert_eq!(namer.cluster_filter().value, "demo");
    }
}
