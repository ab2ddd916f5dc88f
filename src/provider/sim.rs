//! In-memory cloud simulator.
//!
//! Backs the test suites: implements [`CloudApi`] over a mutexed state
//! table, with the eventual-consistency behaviors the engine has to cope
//! with in production scaled down to a few polls. NAT gateways report
//! `Pending` for the first couple of listings, instances boot after a
//! couple of status probes, and load balancer targets report `Initial`
//! health before turning `Healthy`.
//!
//! The simulator counts every create call so idempotence tests can assert
//! that a second provisioning pass creates nothing.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use super::{
    Address, AclEntry, CloudApi, GatewayState, Image, Instance, InstanceSpec, InstanceState,
    InstanceStatus, InstanceTypeInfo, InternetGateway, Listener, LoadBalancer, NatGateway,
    NetworkAcl, PlacementGroup, ResourceId, Route, RouteTable, SecurityGroup, Subnet, Tag,
    TagFilter, TargetGroup, TargetHealth, Vpc, VolumeAttachment,
};
use crate::definition::HealthCheck;
use crate::{Error, Result};

/// Number of listings before a new NAT gateway reports `Available`
const NAT_PENDING_POLLS: u32 = 2;

/// Number of status probes before a new instance reports running+ready
const BOOT_POLLS: u32 = 2;

/// Number of health probes before a registered target reports healthy
const HEALTH_POLLS: u32 = 2;

#[derive(Default)]
struct SimState {
    next_id: u64,
    create_calls: u64,
    vpcs: Vec<Vpc>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    internet_gateways: Vec<InternetGateway>,
    nat_gateways: Vec<NatGateway>,
    nat_pending: HashMap<ResourceId, u32>,
    addresses: Vec<Address>,
    security_groups: Vec<SecurityGroup>,
    network_acls: Vec<NetworkAcl>,
    placement_groups: Vec<PlacementGroup>,
    instances: Vec<Instance>,
    instance_boot: HashMap<ResourceId, u32>,
    instance_user_data: HashMap<ResourceId, String>,
    target_groups: Vec<TargetGroup>,
    target_health: HashMap<ResourceId, u32>,
    listeners: Vec<Listener>,
    load_balancers: Vec<LoadBalancer>,
    images: Vec<Image>,
    // Tags for resources without a first-class record (volumes).
    side_tags: HashMap<ResourceId, Vec<Tag>>,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> ResourceId {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }
}

/// The simulated cloud
pub struct SimCloud {
    region: String,
    state: Mutex<SimState>,
}

fn filtered<T: Clone>(items: &[T], filter: &TagFilter, tags: impl Fn(&T) -> &[Tag]) -> Vec<T> {
    items
        .iter()
        .filter(|item| filter.matches(tags(item)))
        .cloned()
        .collect()
}

fn merge_tags(existing: &mut Vec<Tag>, new: Vec<Tag>) {
    for tag in new {
        if let Some(slot) = existing.iter_mut().find(|t| t.key == tag.key) {
            slot.value = tag.value;
        } else {
            existing.push(tag);
        }
    }
}

impl SimCloud {
    /// Create an empty simulated region with a small instance type catalog
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Seed a machine image discoverable via its `Name` tag
    pub fn with_image(self, name: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id("ami");
            state.images.push(Image {
                id,
                name: name.to_string(),
                tags: vec![Tag::new("Name", name)],
            });
        }
        self
    }

    /// Total create-family calls made so far; idempotence tests snapshot
    /// this between passes
    pub fn create_calls(&self) -> u64 {
        self.state.lock().unwrap().create_calls
    }

    /// Tags recorded for a resource without a first-class record (volumes)
    pub fn side_tags(&self, id: &str) -> Vec<Tag> {
        self.state
            .lock()
            .unwrap()
            .side_tags
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// The first-boot payload currently retained for an instance
    pub fn user_data(&self, instance_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .instance_user_data
            .get(instance_id)
            .cloned()
    }

    /// Force an instance into a state out of band, simulating operator
    /// action or hardware failure between engine runs
    pub fn force_instance_state(&self, instance_id: &str, state: InstanceState) {
        let mut s = self.state.lock().unwrap();
        if let Some(instance) = s.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.state = state;
        }
    }

    /// Remove an instance entirely, as if terminated and aged out
    pub fn drop_instance(&self, instance_id: &str) {
        let mut s = self.state.lock().unwrap();
        s.instances.retain(|i| i.id != instance_id);
    }
}

#[async_trait]
impl CloudApi for SimCloud {
    async fn list_regions(&self) -> Result<Vec<String>> {
        Ok(vec![
            self.region.clone(),
            "us-east-1".to_string(),
            "eu-west-1".to_string(),
        ])
    }

    async fn list_instance_types(&self) -> Result<Vec<InstanceTypeInfo>> {
        Ok(vec![
            InstanceTypeInfo {
                name: "m5.large".to_string(),
                vcpus: 2,
                memory_mib: 8192,
                architectures: vec!["x86_64".to_string()],
            },
            InstanceTypeInfo {
                name: "c5.large".to_string(),
                vcpus: 2,
                memory_mib: 4096,
                architectures: vec!["x86_64".to_string()],
            },
            InstanceTypeInfo {
                name: "c5.xlarge".to_string(),
                vcpus: 4,
                memory_mib: 8192,
                architectures: vec!["x86_64".to_string()],
            },
        ])
    }

    async fn list_images(&self, filter: &TagFilter) -> Result<Vec<Image>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.images, filter, |i| &i.tags))
    }

    async fn create_tags(&self, resource_id: &ResourceId, tags: Vec<Tag>) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        macro_rules! try_merge {
            ($collection:ident) => {
                if let Some(item) = state.$collection.iter_mut().find(|i| &i.id == resource_id) {
                    merge_tags(&mut item.tags, tags);
                    return Ok(());
                }
            };
        }

        try_merge!(vpcs);
        try_merge!(subnets);
        try_merge!(route_tables);
        try_merge!(internet_gateways);
        try_merge!(nat_gateways);
        try_merge!(addresses);
        try_merge!(security_groups);
        try_merge!(network_acls);
        try_merge!(instances);
        try_merge!(target_groups);
        try_merge!(load_balancers);
        try_merge!(images);

        merge_tags(state.side_tags.entry(resource_id.clone()).or_default(), tags);
        Ok(())
    }

    async fn list_vpcs(&self, filter: &TagFilter) -> Result<Vec<Vpc>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.vpcs, filter, |v| &v.tags))
    }

    async fn create_vpc(&self, cidr: Ipv4Net, tags: Vec<Tag>) -> Result<Vpc> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let vpc = Vpc {
            id: state.next_id("vpc"),
            cidr,
            tags,
        };
        state.vpcs.push(vpc.clone());
        Ok(vpc)
    }

    async fn list_security_groups(&self, filter: &TagFilter) -> Result<Vec<SecurityGroup>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.security_groups, filter, |g| &g.tags))
    }

    async fn create_security_group(
        &self,
        vpc_id: &ResourceId,
        _name: &str,
        tags: Vec<Tag>,
    ) -> Result<SecurityGroup> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let group = SecurityGroup {
            id: state.next_id("sg"),
            vpc_id: vpc_id.clone(),
            allows_all_ingress: false,
            tags,
        };
        state.security_groups.push(group.clone());
        Ok(group)
    }

    async fn authorize_all_ingress(&self, group_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .security_groups
            .iter_mut()
            .find(|g| &g.id == group_id)
            .ok_or_else(|| Error::provider(format!("no such security group [{group_id}]")))?;
        group.allows_all_ingress = true;
        Ok(())
    }

    async fn list_subnets(&self, filter: &TagFilter) -> Result<Vec<Subnet>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.subnets, filter, |s| &s.tags))
    }

    async fn create_subnet(
        &self,
        vpc_id: &ResourceId,
        cidr: Ipv4Net,
        availability_zone: &str,
        tags: Vec<Tag>,
    ) -> Result<Subnet> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let subnet = Subnet {
            id: state.next_id("subnet"),
            vpc_id: vpc_id.clone(),
            cidr,
            availability_zone: availability_zone.to_string(),
            tags,
        };
        state.subnets.push(subnet.clone());
        Ok(subnet)
    }

    async fn list_route_tables(&self, filter: &TagFilter) -> Result<Vec<RouteTable>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.route_tables, filter, |t| &t.tags))
    }

    async fn create_route_table(
        &self,
        vpc_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<RouteTable> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let table = RouteTable {
            id: state.next_id("rtb"),
            vpc_id: vpc_id.clone(),
            routes: vec![],
            subnet_associations: vec![],
            tags,
        };
        state.route_tables.push(table.clone());
        Ok(table)
    }

    async fn associate_route_table(
        &self,
        route_table_id: &ResourceId,
        subnet_id: &ResourceId,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        for table in &mut state.route_tables {
            table.subnet_associations.retain(|s| s != subnet_id);
        }

        let table = state
            .route_tables
            .iter_mut()
            .find(|t| &t.id == route_table_id)
            .ok_or_else(|| Error::provider(format!("no such route table [{route_table_id}]")))?;
        table.subnet_associations.push(subnet_id.clone());
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &ResourceId,
        destination: Ipv4Net,
        gateway_id: &ResourceId,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let table = state
            .route_tables
            .iter_mut()
            .find(|t| &t.id == route_table_id)
            .ok_or_else(|| Error::provider(format!("no such route table [{route_table_id}]")))?;

        if let Some(route) = table.routes.iter_mut().find(|r| r.destination == destination) {
            route.gateway_id = gateway_id.clone();
        } else {
            table.routes.push(Route {
                destination,
                gateway_id: gateway_id.clone(),
            });
        }
        Ok(())
    }

    async fn list_internet_gateways(&self, filter: &TagFilter) -> Result<Vec<InternetGateway>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.internet_gateways, filter, |g| &g.tags))
    }

    async fn create_internet_gateway(&self, tags: Vec<Tag>) -> Result<InternetGateway> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let gateway = InternetGateway {
            id: state.next_id("igw"),
            attached_vpc: None,
            tags,
        };
        state.internet_gateways.push(gateway.clone());
        Ok(gateway)
    }

    async fn attach_internet_gateway(
        &self,
        gateway_id: &ResourceId,
        vpc_id: &ResourceId,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let gateway = state
            .internet_gateways
            .iter_mut()
            .find(|g| &g.id == gateway_id)
            .ok_or_else(|| Error::provider(format!("no such internet gateway [{gateway_id}]")))?;
        gateway.attached_vpc = Some(vpc_id.clone());
        Ok(())
    }

    async fn list_nat_gateways(&self, filter: &TagFilter) -> Result<Vec<NatGateway>> {
        let mut state = self.state.lock().unwrap();

        // Pending gateways become available after a few listings.
        let ready: Vec<ResourceId> = state
            .nat_pending
            .iter_mut()
            .filter_map(|(id, polls)| {
                if *polls > 0 {
                    *polls -= 1;
                    None
                } else {
                    Some(id.clone())
                }
            })
            .collect();

        for id in ready {
            state.nat_pending.remove(&id);
            if let Some(gateway) = state.nat_gateways.iter_mut().find(|g| g.id == id) {
                gateway.state = GatewayState::Available;
            }
        }

        Ok(filtered(&state.nat_gateways, filter, |g| &g.tags))
    }

    async fn create_nat_gateway(
        &self,
        subnet_id: &ResourceId,
        address_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<NatGateway> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let gateway = NatGateway {
            id: state.next_id("nat"),
            subnet_id: subnet_id.clone(),
            address_id: address_id.clone(),
            state: GatewayState::Pending,
            tags,
        };
        state.nat_pending.insert(gateway.id.clone(), NAT_PENDING_POLLS);
        state.nat_gateways.push(gateway.clone());
        Ok(gateway)
    }

    async fn list_addresses(&self, filter: &TagFilter) -> Result<Vec<Address>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.addresses, filter, |a| &a.tags))
    }

    async fn allocate_address(&self) -> Result<Address> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let octet = (state.next_id % 250 + 1) as u8;
        let address = Address {
            id: state.next_id("eip"),
            public_ip: Ipv4Addr::new(52, 10, 0, octet),
            tags: vec![],
        };
        state.addresses.push(address.clone());
        Ok(address)
    }

    async fn list_network_acls(&self, filter: &TagFilter) -> Result<Vec<NetworkAcl>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.network_acls, filter, |a| &a.tags))
    }

    async fn create_network_acl(
        &self,
        vpc_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<NetworkAcl> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let acl = NetworkAcl {
            id: state.next_id("acl"),
            vpc_id: vpc_id.clone(),
            entries: vec![],
            subnet_associations: vec![],
            tags,
        };
        state.network_acls.push(acl.clone());
        Ok(acl)
    }

    async fn replace_acl_entries(
        &self,
        acl_id: &ResourceId,
        entries: Vec<AclEntry>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let acl = state
            .network_acls
            .iter_mut()
            .find(|a| &a.id == acl_id)
            .ok_or_else(|| Error::provider(format!("no such network acl [{acl_id}]")))?;
        acl.entries = entries;
        Ok(())
    }

    async fn replace_subnet_acl_association(
        &self,
        subnet_id: &ResourceId,
        acl_id: &ResourceId,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        for acl in &mut state.network_acls {
            acl.subnet_associations.retain(|s| s != subnet_id);
        }

        let acl = state
            .network_acls
            .iter_mut()
            .find(|a| &a.id == acl_id)
            .ok_or_else(|| Error::provider(format!("no such network acl [{acl_id}]")))?;
        acl.subnet_associations.push(subnet_id.clone());
        Ok(())
    }

    async fn list_placement_groups(&self, filter: &TagFilter) -> Result<Vec<PlacementGroup>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.placement_groups, filter, |g| &g.tags))
    }

    async fn create_placement_group(
        &self,
        name: &str,
        partition_count: u32,
        tags: Vec<Tag>,
    ) -> Result<PlacementGroup> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let group = PlacementGroup {
            name: name.to_string(),
            partition_count,
            tags,
        };
        state.placement_groups.push(group.clone());
        Ok(group)
    }

    async fn list_instances(&self, filter: &TagFilter) -> Result<Vec<Instance>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.instances, filter, |i| &i.tags))
    }

    async fn run_instance(&self, spec: InstanceSpec) -> Result<Instance> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;

        let id = state.next_id("i");
        let volumes = spec
            .volumes
            .iter()
            .map(|(device, _, _)| VolumeAttachment {
                volume_id: state.next_id("vol"),
                device_name: device.clone(),
            })
            .collect();

        let instance = Instance {
            id: id.clone(),
            state: InstanceState::Pending,
            private_ip: spec.private_ip,
            subnet_id: spec.subnet_id.clone(),
            instance_type: spec.instance_type.clone(),
            volumes,
            tags: spec.tags.clone(),
        };

        state.instance_boot.insert(id.clone(), BOOT_POLLS);
        state.instance_user_data.insert(id, spec.user_data);
        state.instances.push(instance.clone());
        Ok(instance)
    }

    async fn start_instance(&self, instance_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| &i.id == instance_id)
            .ok_or_else(|| Error::provider(format!("no such instance [{instance_id}]")))?;

        if instance.state != InstanceState::Stopped {
            return Err(Error::provider(format!(
                "instance [{instance_id}] is not stopped"
            )));
        }

        instance.state = InstanceState::Pending;
        state.instance_boot.insert(instance_id.clone(), BOOT_POLLS);
        Ok(())
    }

    async fn stop_instance(&self, instance_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| &i.id == instance_id)
            .ok_or_else(|| Error::provider(format!("no such instance [{instance_id}]")))?;
        instance.state = InstanceState::Stopped;
        Ok(())
    }

    async fn terminate_instance(&self, instance_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let instance = state
            .instances
            .iter_mut()
            .find(|i| &i.id == instance_id)
            .ok_or_else(|| Error::provider(format!("no such instance [{instance_id}]")))?;
        instance.state = InstanceState::Terminated;
        Ok(())
    }

    async fn describe_instance_status(
        &self,
        instance_id: &ResourceId,
    ) -> Result<Option<InstanceStatus>> {
        let mut state = self.state.lock().unwrap();

        let booted = match state.instance_boot.get_mut(instance_id) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                false
            }
            Some(_) => true,
            None => true,
        };

        let instance = match state.instances.iter_mut().find(|i| &i.id == instance_id) {
            Some(instance) => instance,
            None => return Ok(None),
        };

        if booted && instance.state == InstanceState::Pending {
            instance.state = InstanceState::Running;
        }

        let ready = instance.state == InstanceState::Running && booted;
        Ok(Some(InstanceStatus {
            state: instance.state,
            ready,
        }))
    }

    async fn clear_instance_user_data(&self, instance_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .instance_user_data
            .insert(instance_id.clone(), String::new());
        Ok(())
    }

    async fn list_load_balancers(&self, filter: &TagFilter) -> Result<Vec<LoadBalancer>> {
        let state = self.state.lock().unwrap();
        Ok(filtered(&state.load_balancers, filter, |b| &b.tags))
    }

    async fn create_load_balancer(
        &self,
        name: &str,
        subnet_id: &ResourceId,
        address_id: &ResourceId,
        tags: Vec<Tag>,
    ) -> Result<LoadBalancer> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let balancer = LoadBalancer {
            id: state.next_id("elb"),
            name: name.to_string(),
            subnet_id: subnet_id.clone(),
            address_id: address_id.clone(),
            tags,
        };
        state.load_balancers.push(balancer.clone());
        Ok(balancer)
    }

    async fn list_target_groups(&self, vpc_id: &ResourceId) -> Result<Vec<TargetGroup>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .target_groups
            .iter()
            .filter(|g| &g.vpc_id == vpc_id)
            .cloned()
            .collect())
    }

    async fn create_target_group(
        &self,
        vpc_id: &ResourceId,
        name: &str,
        port: u16,
        health_check: HealthCheck,
        tags: Vec<Tag>,
    ) -> Result<TargetGroup> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let group = TargetGroup {
            id: state.next_id("tg"),
            name: name.to_string(),
            vpc_id: vpc_id.clone(),
            port,
            health_check,
            targets: vec![],
            tags,
        };
        state.target_health.insert(group.id.clone(), HEALTH_POLLS);
        state.target_groups.push(group.clone());
        Ok(group)
    }

    async fn set_targets(
        &self,
        target_group_id: &ResourceId,
        targets: Vec<ResourceId>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .target_groups
            .iter_mut()
            .find(|g| &g.id == target_group_id)
            .ok_or_else(|| Error::provider(format!("no such target group [{target_group_id}]")))?;
        group.targets = targets;
        Ok(())
    }

    async fn describe_target_health(
        &self,
        target_group_id: &ResourceId,
    ) -> Result<Vec<(ResourceId, TargetHealth)>> {
        let mut state = self.state.lock().unwrap();

        let health = match state.target_health.get_mut(target_group_id) {
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                TargetHealth::Initial
            }
            _ => TargetHealth::Healthy,
        };

        let group = state
            .target_groups
            .iter()
            .find(|g| &g.id == target_group_id)
            .ok_or_else(|| Error::provider(format!("no such target group [{target_group_id}]")))?;

        Ok(group.targets.iter().map(|t| (t.clone(), health)).collect())
    }

    async fn delete_target_group(&self, target_group_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.target_groups.retain(|g| &g.id != target_group_id);
        state.target_health.remove(target_group_id);
        Ok(())
    }

    async fn list_listeners(&self, load_balancer_id: &ResourceId) -> Result<Vec<Listener>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .listeners
            .iter()
            .filter(|l| &l.load_balancer_id == load_balancer_id)
            .cloned()
            .collect())
    }

    async fn create_listener(
        &self,
        load_balancer_id: &ResourceId,
        port: u16,
        target_group_id: &ResourceId,
    ) -> Result<Listener> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let listener = Listener {
            id: state.next_id("lsn"),
            load_balancer_id: load_balancer_id.clone(),
            port,
            target_group_id: target_group_id.clone(),
        };
        state.listeners.push(listener.clone());
        Ok(listener)
    }

    async fn delete_listener(&self, listener_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| &l.id != listener_id);
        Ok(())
    }

    async fn delete_load_balancer(&self, load_balancer_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| &l.load_balancer_id != load_balancer_id);
        state.load_balancers.retain(|b| &b.id != load_balancer_id);
        Ok(())
    }

    async fn delete_network_acl(&self, acl_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.network_acls.retain(|a| &a.id != acl_id);
        Ok(())
    }

    async fn delete_nat_gateway(&self, gateway_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.nat_gateways.retain(|g| &g.id != gateway_id);
        state.nat_pending.remove(gateway_id);
        Ok(())
    }

    async fn delete_internet_gateway(&self, gateway_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.internet_gateways.retain(|g| &g.id != gateway_id);
        Ok(())
    }

    async fn delete_subnet(&self, subnet_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.subnets.retain(|s| &s.id != subnet_id);
        Ok(())
    }

    async fn delete_route_table(&self, route_table_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.route_tables.retain(|t| &t.id != route_table_id);
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.security_groups.retain(|g| &g.id != group_id);
        Ok(())
    }

    async fn delete_placement_group(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.placement_groups.retain(|g| g.name != name);
        Ok(())
    }

    async fn delete_vpc(&self, vpc_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.vpcs.retain(|v| &v.id != vpc_id);
        Ok(())
    }

    async fn release_address(&self, address_id: &ResourceId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.addresses.retain(|a| &a.id != address_id);
        Ok(())
    }
}
