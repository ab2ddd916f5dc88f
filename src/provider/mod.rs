//! Abstract cloud provider surface
//!
//! This module defines the operations the reconciliation engine consumes
//! from a provider SDK, expressed abstractly so any provider maps onto
//! them: tag-filtered listing, resource creation, tagging, associations,
//! instance lifecycle, and load balancer management. The engine persists
//! no state of its own; everything it needs to resume lives in the tags
//! of the provider resources themselves.
//!
//! Concrete implementations register through [`ProviderRegistry`] under a
//! provider name and are selected explicitly; there is no reflection or
//! attribute scanning involved.

pub mod sim;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::definition::HealthCheck;
use crate::Result;

/// Opaque provider resource identifier
pub type ResourceId = String;

/// A single resource tag
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Tag {
    /// Tag key
    pub key: String,
    /// Tag value
    pub value: String,
}

impl Tag {
    /// Create a tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Helpers shared by every tagged resource record
pub trait Tagged {
    /// The resource's tags
    fn tags(&self) -> &[Tag];

    /// Value of the tag with the given key, if present
    fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags()
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.value.as_str())
    }
}

macro_rules! impl_tagged {
    ($($ty:ty),* $(,)?) => {
        $(impl Tagged for $ty {
            fn tags(&self) -> &[Tag] {
                &self.tags
            }
        })*
    };
}

/// Filter scoping list operations to one cluster's resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    /// Tag key to match
    pub key: String,
    /// Required tag value
    pub value: String,
}

impl TagFilter {
    /// Filter on the given key/value pair
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns true when the tag set satisfies the filter
    pub fn matches(&self, tags: &[Tag]) -> bool {
        tags.iter().any(|t| t.key == self.key && t.value == self.value)
    }
}

/// Virtual network record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vpc {
    /// Resource id
    pub id: ResourceId,
    /// Network CIDR
    pub cidr: Ipv4Net,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Subnet record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    /// Resource id
    pub id: ResourceId,
    /// Owning network
    pub vpc_id: ResourceId,
    /// Subnet CIDR
    pub cidr: Ipv4Net,
    /// Availability zone
    pub availability_zone: String,
    /// Tags
    pub tags: Vec<Tag>,
}

/// A route inside a route table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Destination CIDR (the default route uses `0.0.0.0/0`)
    pub destination: Ipv4Net,
    /// Gateway the destination routes through
    pub gateway_id: ResourceId,
}

/// Route table record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTable {
    /// Resource id
    pub id: ResourceId,
    /// Owning network
    pub vpc_id: ResourceId,
    /// Installed routes
    pub routes: Vec<Route>,
    /// Subnets associated with this table
    pub subnet_associations: Vec<ResourceId>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Internet gateway record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InternetGateway {
    /// Resource id
    pub id: ResourceId,
    /// Network the gateway is attached to, when attached
    pub attached_vpc: Option<ResourceId>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// NAT/egress gateway provisioning state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GatewayState {
    /// Still provisioning
    Pending,
    /// Ready to route traffic
    Available,
    /// Being deleted
    Deleting,
    /// Deleted (terminal; excluded from discovery)
    Deleted,
    /// Provisioning failed
    Failed,
}

/// NAT/egress gateway record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NatGateway {
    /// Resource id
    pub id: ResourceId,
    /// Subnet the gateway lives in
    pub subnet_id: ResourceId,
    /// Elastic address allocated to the gateway
    pub address_id: ResourceId,
    /// Provisioning state
    pub state: GatewayState,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Elastic/public address record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    /// Allocation id
    pub id: ResourceId,
    /// The public IP
    pub public_ip: Ipv4Addr,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Coarse-grained security group record. The engine keeps one permissive
/// group per cluster; fine-grained control is delegated to the ACLs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityGroup {
    /// Resource id
    pub id: ResourceId,
    /// Owning network
    pub vpc_id: ResourceId,
    /// Whether the allow-all ingress permission has been installed
    pub allows_all_ingress: bool,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Action an ACL entry takes on matching traffic
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclAction {
    /// Admit
    Allow,
    /// Reject
    Deny,
}

/// A single network ACL entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AclEntry {
    /// Rule number; entries evaluate in ascending order and the first
    /// match wins
    pub rule_number: u32,
    /// True for egress entries, false for ingress
    pub egress: bool,
    /// Source (ingress) or destination (egress) CIDR
    pub cidr: Ipv4Net,
    /// Port range the entry covers; `None` covers all ports
    pub port_range: Option<(u16, u16)>,
    /// Allow or deny
    pub action: AclAction,
}

/// Network ACL record: an ordered rule list attachable to subnets
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAcl {
    /// Resource id
    pub id: ResourceId,
    /// Owning network
    pub vpc_id: ResourceId,
    /// Entries, both directions
    pub entries: Vec<AclEntry>,
    /// Subnets currently associated with this ACL
    pub subnet_associations: Vec<ResourceId>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Placement group record (hardware-fault-isolation partitions)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementGroup {
    /// Group name (placement groups are keyed by name)
    pub name: String,
    /// Number of partitions
    pub partition_count: u32,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Compute instance lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceState {
    /// Provisioning or starting
    Pending,
    /// Running
    Running,
    /// Shutting down toward termination
    ShuttingDown,
    /// Terminated (terminal; excluded from discovery)
    Terminated,
    /// Stopping
    Stopping,
    /// Stopped
    Stopped,
}

impl InstanceState {
    /// Returns true for the stopped state.
    ///
    /// Deliberately compares against `Stopped`, not `Stopping`; the
    /// distinction matters because a stopped instance is restarted during
    /// a resumed run while a stopping one is an error.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Returns true for states the engine never puts an instance in
    /// during provisioning; finding one is fatal
    pub fn is_unexpected_during_provisioning(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopping | Self::Terminated)
    }
}

/// A volume attached to an instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeAttachment {
    /// Volume id
    pub volume_id: ResourceId,
    /// Block device name (e.g. `/dev/sda1`)
    pub device_name: String,
}

/// Compute instance record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    /// Resource id
    pub id: ResourceId,
    /// Lifecycle state
    pub state: InstanceState,
    /// Static private address
    pub private_ip: Ipv4Addr,
    /// Subnet the instance lives in
    pub subnet_id: ResourceId,
    /// Instance type
    pub instance_type: String,
    /// Attached volumes
    pub volumes: Vec<VolumeAttachment>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Point-in-time instance status used by boot waits
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceStatus {
    /// Lifecycle state
    pub state: InstanceState,
    /// True once the provider's boot-readiness probe passes
    pub ready: bool,
}

/// Specification for creating a compute instance
#[derive(Clone, Debug)]
pub struct InstanceSpec {
    /// Machine image to boot from
    pub image_id: ResourceId,
    /// Instance type
    pub instance_type: String,
    /// Subnet to create the instance in
    pub subnet_id: ResourceId,
    /// Static private address
    pub private_ip: Ipv4Addr,
    /// Security group ids
    pub security_group_ids: Vec<ResourceId>,
    /// Base64-encoded first-boot payload
    pub user_data: String,
    /// Placement group name
    pub placement_group: String,
    /// Placement partition (1-based)
    pub placement_partition: u32,
    /// Volumes to create with the instance: (device name, volume type,
    /// size GiB)
    pub volumes: Vec<(String, String, u32)>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Target group record: a named pool of backend instances
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetGroup {
    /// Resource id
    pub id: ResourceId,
    /// Unique group name
    pub name: String,
    /// Owning network
    pub vpc_id: ResourceId,
    /// Node port targets receive traffic on
    pub port: u16,
    /// Health-check policy
    pub health_check: HealthCheck,
    /// Registered instance ids
    pub targets: Vec<ResourceId>,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Health of a single registered target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetHealth {
    /// Still registering
    Initial,
    /// Probes failing
    Unhealthy,
    /// Probes passing
    Healthy,
}

/// Listener record: external port mapped to a target group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    /// Resource id
    pub id: ResourceId,
    /// Owning load balancer
    pub load_balancer_id: ResourceId,
    /// External port
    pub port: u16,
    /// Target group traffic forwards to
    pub target_group_id: ResourceId,
}

/// Load balancer record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadBalancer {
    /// Resource id
    pub id: ResourceId,
    /// Unique balancer name
    pub name: String,
    /// Subnet the balancer fronts
    pub subnet_id: ResourceId,
    /// Elastic address the balancer answers on
    pub address_id: ResourceId,
    /// Tags
    pub tags: Vec<Tag>,
}

/// Instance type capability record used by the capacity check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceTypeInfo {
    /// Type name
    pub name: String,
    /// Virtual CPU count
    pub vcpus: u32,
    /// Memory in MiB
    pub memory_mib: u64,
    /// Supported CPU architectures
    pub architectures: Vec<String>,
}

/// Machine image record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Image {
    /// Resource id
    pub id: ResourceId,
    /// Image name
    pub name: String,
    /// Tags
    pub tags: Vec<Tag>,
}

impl_tagged!(
    Vpc,
    Subnet,
    RouteTable,
    InternetGateway,
    NatGateway,
    Address,
    SecurityGroup,
    NetworkAcl,
    PlacementGroup,
    Instance,
    TargetGroup,
    LoadBalancer,
    Image,
);

/// The provider operations the reconciliation engine consumes.
///
/// Every listing accepts a [`TagFilter`] scoping results to one cluster.
/// All calls are potentially blocking network I/O; implementations are
/// expected to surface transient failures as [`crate::Error::Provider`]
/// so callers can retry within their bounded timeouts.
#[async_trait]
pub trait CloudApi: Send + Sync {
    // --- capability verification -------------------------------------

    /// List the region names available to the account
    async fn list_regions(&self) -> Result<Vec<String>>;

    /// List the instance types offered in the connected region
    async fn list_instance_types(&self) -> Result<Vec<InstanceTypeInfo>>;

    /// List machine images matching the filter
    async fn list_images(&self, filter: &TagFilter) -> Result<Vec<Image>>;

    // --- tags ---------------------------------------------------------

    /// Add or overwrite tags on an existing resource
    async fn create_tags(&self, resource_id: &ResourceId, tags: Vec<Tag>) -> Result<()>;

    // --- network topology ---------------------------------------------

    /// List virtual networks matching the filter
    async fn list_vpcs(&self, filter: &TagFilter) -> Result<Vec<Vpc>>;

    /// Create a virtual network
    async fn create_vpc(&self, cidr: Ipv4Net, tags: Vec<Tag>) -> Result<Vpc>;

    /// List security groups matching the filter
    async fn list_security_groups(&self, filter: &TagFilter) -> Result<Vec<SecurityGroup>>;

    /// Create a security group in the network
    async fn create_security_group(
        &self,
        vpc_id: &ResourceId,
        name: &str,
        tags: Vec<Tag>,
    ) -> Result<SecurityGroup>;

    /// Install the allow-all ingress permission on a security group
    async fn authorize_all_ingress(&self, group_id: &ResourceId) -> Result<()>;

    /// List subnets matching the filter
    async fn list_subnets(&self, filter: &TagFilter) -> Result<Vec<Subnet>>;

    /// Create a subnet in the network
    async fn create_subnet(
        &self,
        vpc_id: &ResourceId,
        cidr: Ipv4Net,
        availability_zone: &str,
        tags: Vec<Tag>,
    ) -> Result<Subnet>;

    /// List route tables matching the filter
    async fn list_route_tables(&self, filter: &TagFilter) -> Result<Vec<RouteTable>>;

    /// Create a route table in the network
    async fn create_route_table(&self, vpc_id: &ResourceId, tags: Vec<Tag>) -> Result<RouteTable>;

    /// Associate a subnet with a route table
    async fn associate_route_table(
        &self,
        route_table_id: &ResourceId,
        subnet_id: &ResourceId,
    ) -> Result<()>;

    /// Install a route in a route table
    async fn create_route(
        &self,
        route_table_id: &ResourceId,
        destination: Ipv4Net,
        gateway_id: &ResourceId,
    ) -> Result<()>;

    /// List internet gateways matching the filter
    async fn list_internet_gateways(&self, filter: &TagFilter) -> Result<Vec<InternetGateway>>;

    /// Create an internet gateway
    async fn create_internet_gateway(&self, tags: Vec<Tag>) -> Result<InternetGateway>;

    /// Attach an internet gateway to a network
    async fn attach_internet_gateway(
        &self,
        gateway_id: &ResourceId,
        vpc_id: &ResourceId,
    ) -> Result<()>;

    /// List NAT gateways matching the filter (implementations include
    /// gateways in every state; discovery excludes terminal ones)
    async fn list_nat_gateways(&self, filter: &TagFilter) -> Result<Vec<NatGateway>>;

    /// Create a NAT gateway backed by the given address allocation
    async fn create_nat_gateway(
        &self,
        subnet_id: &ResourceId,
        address_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<NatGateway>;

    /// List elastic addresses matching the filter
    async fn list_addresses(&self, filter: &TagFilter) -> Result<Vec<Address>>;

    /// Allocate an elastic address; the caller tags it immediately after
    async fn allocate_address(&self) -> Result<Address>;

    // --- network ACLs --------------------------------------------------

    /// List network ACLs matching the filter
    async fn list_network_acls(&self, filter: &TagFilter) -> Result<Vec<NetworkAcl>>;

    /// Create a network ACL in the network
    async fn create_network_acl(&self, vpc_id: &ResourceId, tags: Vec<Tag>)
        -> Result<NetworkAcl>;

    /// Replace the full entry list of an ACL
    async fn replace_acl_entries(&self, acl_id: &ResourceId, entries: Vec<AclEntry>)
        -> Result<()>;

    /// Atomically associate the subnet with the given ACL, replacing any
    /// previous association. This is the rotation cutover.
    async fn replace_subnet_acl_association(
        &self,
        subnet_id: &ResourceId,
        acl_id: &ResourceId,
    ) -> Result<()>;

    // --- placement -----------------------------------------------------

    /// List placement groups matching the filter
    async fn list_placement_groups(&self, filter: &TagFilter) -> Result<Vec<PlacementGroup>>;

    /// Create a partition placement group
    async fn create_placement_group(
        &self,
        name: &str,
        partition_count: u32,
        tags: Vec<Tag>,
    ) -> Result<PlacementGroup>;

    // --- instances -----------------------------------------------------

    /// List instances matching the filter (implementations include
    /// instances in every state; discovery excludes terminated ones)
    async fn list_instances(&self, filter: &TagFilter) -> Result<Vec<Instance>>;

    /// Create and boot an instance
    async fn run_instance(&self, spec: InstanceSpec) -> Result<Instance>;

    /// Start a stopped instance
    async fn start_instance(&self, instance_id: &ResourceId) -> Result<()>;

    /// Stop a running instance
    async fn stop_instance(&self, instance_id: &ResourceId) -> Result<()>;

    /// Terminate an instance
    async fn terminate_instance(&self, instance_id: &ResourceId) -> Result<()>;

    /// Describe an instance's current status; `None` while the create
    /// operation is still propagating
    async fn describe_instance_status(
        &self,
        instance_id: &ResourceId,
    ) -> Result<Option<InstanceStatus>>;

    /// Clear the first-boot payload retained by the provider (it contains
    /// a one-time credential)
    async fn clear_instance_user_data(&self, instance_id: &ResourceId) -> Result<()>;

    // --- load balancing ------------------------------------------------

    /// List load balancers matching the filter
    async fn list_load_balancers(&self, filter: &TagFilter) -> Result<Vec<LoadBalancer>>;

    /// Create a network load balancer fronted by the given address
    async fn create_load_balancer(
        &self,
        name: &str,
        subnet_id: &ResourceId,
        address_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<LoadBalancer>;

    /// List the target groups in a network
    async fn list_target_groups(&self, vpc_id: &ResourceId) -> Result<Vec<TargetGroup>>;

    /// Create a target group
    async fn create_target_group(
        &self,
        vpc_id: &ResourceId,
        name: &str,
        port: u16,
        health_check: HealthCheck,
        tags: Vec<Tag>,
    ) -> Result<TargetGroup>;

    /// Replace a target group's registered members with the given set
    async fn set_targets(
        &self,
        target_group_id: &ResourceId,
        targets: Vec<ResourceId>,
    ) -> Result<()>;

    /// Describe the health of a target group's members
    async fn describe_target_health(
        &self,
        target_group_id: &ResourceId,
    ) -> Result<Vec<(ResourceId, TargetHealth)>>;

    /// Delete a target group
    async fn delete_target_group(&self, target_group_id: &ResourceId) -> Result<()>;

    /// List a load balancer's listeners
    async fn list_listeners(&self, load_balancer_id: &ResourceId) -> Result<Vec<Listener>>;

    /// Create a listener forwarding an external port to a target group
    async fn create_listener(
        &self,
        load_balancer_id: &ResourceId,
        port: u16,
        target_group_id: &ResourceId,
    ) -> Result<Listener>;

    /// Delete a listener
    async fn delete_listener(&self, listener_id: &ResourceId) -> Result<()>;

    // --- teardown ------------------------------------------------------

    /// Delete a load balancer
    async fn delete_load_balancer(&self, load_balancer_id: &ResourceId) -> Result<()>;

    /// Delete a network ACL
    async fn delete_network_acl(&self, acl_id: &ResourceId) -> Result<()>;

    /// Delete a NAT gateway
    async fn delete_nat_gateway(&self, gateway_id: &ResourceId) -> Result<()>;

    /// Detach and delete an internet gateway
    async fn delete_internet_gateway(&self, gateway_id: &ResourceId) -> Result<()>;

    /// Delete a subnet
    async fn delete_subnet(&self, subnet_id: &ResourceId) -> Result<()>;

    /// Delete a route table
    async fn delete_route_table(&self, route_table_id: &ResourceId) -> Result<()>;

    /// Delete a security group
    async fn delete_security_group(&self, group_id: &ResourceId) -> Result<()>;

    /// Delete a placement group
    async fn delete_placement_group(&self, name: &str) -> Result<()>;

    /// Delete a virtual network
    async fn delete_vpc(&self, vpc_id: &ResourceId) -> Result<()>;

    /// Release an elastic address allocation
    async fn release_address(&self, address_id: &ResourceId) -> Result<()>;
}

/// Constructor for a provider's [`CloudApi`] implementation; receives the
/// provider-specific connection options as free-form key/value pairs.
pub type CloudApiConstructor =
    fn(options: &HashMap<String, String>) -> Result<Arc<dyn CloudApi>>;

/// Explicit provider registry mapping provider names to constructors.
///
/// Selection is by name; adding a provider means adding a registration,
/// never scanning for annotated types.
#[derive(Default)]
pub struct ProviderRegistry {
    constructors: HashMap<String, CloudApiConstructor>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider constructor under a name
    pub fn register(&mut self, name: impl Into<String>, constructor: CloudApiConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    /// Construct the named provider's API client
    pub fn connect(
        &self,
        name: &str,
        options: &HashMap<String, String>,
    ) -> Result<Arc<dyn CloudApi>> {
        let constructor = self.constructors.get(name).ok_or_else(|| {
            crate::Error::validation(format!(
                "unknown hosting provider [{name}]; registered: {:?}",
                self.names()
            ))
        })?;

        constructor(options)
    }

    /// Names of the registered providers, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_filter_matches_any_position() {
        let filter = TagFilter::new("gw:cluster", "demo");
        let tags = vec![Tag::new("Name", "demo.vpc"), Tag::new("gw:cluster", "demo")];

        assert!(filter.matches(&tags));
        assert!(!filter.matches(&[Tag::new("gw:cluster", "other")]));
        assert!(!filter.matches(&[]));
    }

    #[test]
    fn stopped_predicate_matches_stopped_state() {
        // Regression: the stopped check must not match Stopping.
        assert!(InstanceState::Stopped.is_stopped());
        assert!(!InstanceState::Stopping.is_stopped());
        assert!(!InstanceState::Running.is_stopped());
    }

    #[test]
    fn unexpected_states_are_the_three_teardown_states() {
        for state in [
            InstanceState::ShuttingDown,
            InstanceState::Stopping,
            InstanceState::Terminated,
        ] {
            assert!(state.is_unexpected_during_provisioning());
        }

        for state in [
            InstanceState::Pending,
            InstanceState::Running,
            InstanceState::Stopped,
        ] {
            assert!(!state.is_unexpected_during_provisioning());
        }
    }

    #[test]
    fn registry_rejects_unknown_provider() {
        let registry = ProviderRegistry::new();
        let err = registry.connect("nonesuch", &HashMap::new()).err().unwrap();
        assert!(err.to_string().contains("unknown hosting provider"));
    }

    #[test]
    fn registry_constructs_registered_provider() {
        fn make_sim(_options: &HashMap<String, String>) -> Result<Arc<dyn CloudApi>> {
            Ok(Arc::new(sim::SimCloud::new("us-west-2")))
        }

        let mut registry = ProviderRegistry::new();
        registry.register("sim", make_sim);

        assert_eq!(registry.names(), ["sim"]);
        registry.connect("sim", &HashMap::new()).unwrap();
    }
}
