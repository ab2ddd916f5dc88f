//! Cluster resource discovery.
//!
//! Before any provisioning step mutates anything, the engine takes a
//! [`ResourceSnapshot`]: every provider listing is filtered by the cluster
//! tag, results are matched to their role through the `Name` tag, and
//! resources in terminal states (terminated instances, deleted gateways)
//! are ignored so a re-run after teardown starts clean. The snapshot also
//! recovers the engine's persisted state from tags: each node's external
//! SSH port and whether external SSH is currently enabled.
//!
//! Discovery is read-only and is retaken whenever a step needs a fresh
//! view; nothing in the snapshot is cached across steps that mutate.

use std::collections::HashMap;

use tracing::debug;

use crate::names::{
    AclSlot, ResourceNamer, CLUSTER_TAG, NAME_TAG, NODE_NAME_TAG, NODE_SSH_PORT_TAG,
    SSH_ENABLED_TAG,
};
use crate::provider::{
    Address, CloudApi, GatewayState, Instance, InstanceState, InternetGateway, LoadBalancer,
    NatGateway, NetworkAcl, PlacementGroup, RouteTable, SecurityGroup, Subnet, TagFilter, Tagged,
    Vpc,
};
use crate::{Error, Result};

/// Point-in-time view of one cluster's provider resources
#[derive(Clone, Debug, Default)]
pub struct ResourceSnapshot {
    /// The virtual network
    pub vpc: Option<Vpc>,
    /// The cluster security group
    pub security_group: Option<SecurityGroup>,
    /// The public subnet
    pub public_subnet: Option<Subnet>,
    /// The node subnet
    pub node_subnet: Option<Subnet>,
    /// Route table for the public subnet
    pub public_route_table: Option<RouteTable>,
    /// Route table for the node subnet
    pub node_route_table: Option<RouteTable>,
    /// The internet gateway
    pub internet_gateway: Option<InternetGateway>,
    /// The NAT gateway (excluding deleted/deleting ones)
    pub nat_gateway: Option<NatGateway>,
    /// Elastic address reserved for the load balancer
    pub ingress_address: Option<Address>,
    /// Elastic address reserved for node egress
    pub egress_address: Option<Address>,
    /// First network ACL rotation slot
    pub acl_a: Option<NetworkAcl>,
    /// Second network ACL rotation slot
    pub acl_b: Option<NetworkAcl>,
    /// Control-plane placement group
    pub control_plane_placement: Option<PlacementGroup>,
    /// Worker placement group
    pub worker_placement: Option<PlacementGroup>,
    /// The load balancer
    pub load_balancer: Option<LoadBalancer>,
    /// Live instances keyed by node name (terminated ones excluded)
    pub instances: HashMap<String, Instance>,
    /// External SSH ports recovered from instance tags
    pub ssh_ports: HashMap<String, u16>,
    /// Whether external SSH access is currently enabled, from the VPC tag
    pub ssh_enabled: bool,
}

impl ResourceSnapshot {
    /// The instance provisioned for a node, if any
    pub fn instance(&self, node_name: &str) -> Option<&Instance> {
        self.instances.get(node_name)
    }
}

fn find_named<T: Tagged + Clone>(items: &[T], name: &str) -> Option<T> {
    items
        .iter()
        .find(|item| item.tag_value(NAME_TAG) == Some(name))
        .cloned()
}

/// Take a snapshot of the cluster's resources.
///
/// Fails with [`Error::Conflict`] when a network with this cluster's name
/// exists but is not tagged as belonging to it; provisioning must never
/// adopt or modify resources it cannot prove it owns.
pub async fn discover(api: &dyn CloudApi, namer: &ResourceNamer) -> Result<ResourceSnapshot> {
    let filter = namer.cluster_filter();

    // Ownership check first: look the network up by display name, not by
    // cluster tag, so a foreign network with a colliding name is detected
    // rather than invisible.
    let name_matches = api
        .list_vpcs(&TagFilter::new(NAME_TAG, namer.vpc()))
        .await?;

    for vpc in &name_matches {
        match vpc.tag_value(CLUSTER_TAG) {
            Some(cluster) if cluster == namer.cluster() => {}
            _ => {
                return Err(Error::conflict(format!(
                    "network [{}] exists but does not belong to cluster [{}]",
                    namer.vpc(),
                    namer.cluster()
                )));
            }
        }
    }

    let mut snapshot = ResourceSnapshot::default();

    let vpcs = api.list_vpcs(&filter).await?;
    snapshot.vpc = find_named(&vpcs, &namer.vpc());
    snapshot.ssh_enabled = snapshot
        .vpc
        .as_ref()
        .and_then(|v| v.tag_value(SSH_ENABLED_TAG))
        .map(|v| v == "true")
        .unwrap_or(false);

    let groups = api.list_security_groups(&filter).await?;
    snapshot.security_group = find_named(&groups, &namer.security_group());

    let subnets = api.list_subnets(&filter).await?;
    snapshot.public_subnet = find_named(&subnets, &namer.public_subnet());
    snapshot.node_subnet = find_named(&subnets, &namer.node_subnet());

    let tables = api.list_route_tables(&filter).await?;
    snapshot.public_route_table = find_named(&tables, &namer.public_route_table());
    snapshot.node_route_table = find_named(&tables, &namer.node_route_table());

    let igws = api.list_internet_gateways(&filter).await?;
    snapshot.internet_gateway = find_named(&igws, &namer.internet_gateway());

    let nats: Vec<_> = api
        .list_nat_gateways(&filter)
        .await?
        .into_iter()
        .filter(|g| !matches!(g.state, GatewayState::Deleting | GatewayState::Deleted))
        .collect();
    snapshot.nat_gateway = find_named(&nats, &namer.nat_gateway());

    let addresses = api.list_addresses(&filter).await?;
    snapshot.ingress_address = find_named(&addresses, &namer.ingress_address());
    snapshot.egress_address = find_named(&addresses, &namer.egress_address());

    let acls = api.list_network_acls(&filter).await?;
    snapshot.acl_a = find_named(&acls, &namer.network_acl(AclSlot::A));
    snapshot.acl_b = find_named(&acls, &namer.network_acl(AclSlot::B));

    let placements = api.list_placement_groups(&filter).await?;
    snapshot.control_plane_placement =
        find_named(&placements, &namer.control_plane_placement_group());
    snapshot.worker_placement = find_named(&placements, &namer.worker_placement_group());

    let balancers = api.list_load_balancers(&filter).await?;
    snapshot.load_balancer = find_named(&balancers, &namer.load_balancer());

    for instance in api.list_instances(&filter).await? {
        if instance.state == InstanceState::Terminated {
            continue;
        }

        let Some(node_name) = instance.tag_value(NODE_NAME_TAG).map(str::to_string) else {
            continue;
        };

        if let Some(port) = instance
            .tag_value(NODE_SSH_PORT_TAG)
            .and_then(|v| v.parse::<u16>().ok())
        {
            snapshot.ssh_ports.insert(node_name.clone(), port);
        }

        snapshot.instances.insert(node_name, instance);
    }

    debug!(
        cluster = %namer.cluster(),
        vpc = snapshot.vpc.is_some(),
        instances = snapshot.instances.len(),
        ssh_enabled = snapshot.ssh_enabled,
        "discovered cluster resources"
    );

    Ok(snapshot)
}
