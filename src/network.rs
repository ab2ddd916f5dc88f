//! Network topology reconciliation.
//!
//! Builds the cluster's virtual network in dependency order, probing for
//! each resource before creating it so interrupted runs resume cleanly:
//! elastic addresses, the VPC, the cluster security group, the public and
//! node subnets with their route tables, the internet gateway, and the
//! NAT gateway the node subnet's default route egresses through.
//!
//! The NAT gateway is the slow resource here; creation is followed by a
//! bounded poll for the `Available` state, and finding the gateway in a
//! state the engine never put it in aborts the run.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::info;

use crate::definition::ClusterDefinition;
use crate::discovery::ResourceSnapshot;
use crate::names::{ResourceNamer, SSH_ENABLED_TAG};
use crate::provider::{CloudApi, GatewayState, Route, Tag};
use crate::retry::{poll_until, CancelFlag, PollConfig};
use crate::{Error, Result};

fn anywhere() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("/0 is a valid prefix")
}

/// Reconciles the cluster's network topology against the definition
pub struct NetworkReconciler<'a> {
    /// Provider API
    pub api: &'a dyn CloudApi,
    /// Cluster namer
    pub namer: &'a ResourceNamer,
    /// Cluster definition
    pub definition: &'a ClusterDefinition,
    /// Poll bounds for slow provider transitions
    pub poll: PollConfig,
    /// Cooperative cancellation
    pub cancel: CancelFlag,
}

impl NetworkReconciler<'_> {
    /// Bring the network topology to the desired state, updating the
    /// snapshot with every resource created or adopted
    pub async fn ensure(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        self.ensure_addresses(snapshot).await?;
        self.ensure_vpc(snapshot).await?;
        self.ensure_security_group(snapshot).await?;
        self.ensure_subnets(snapshot).await?;
        self.ensure_route_tables(snapshot).await?;
        self.ensure_internet_gateway(snapshot).await?;
        self.ensure_nat_gateway(snapshot).await?;
        Ok(())
    }

    /// Allocate and tag the ingress and egress elastic addresses.
    ///
    /// Allocation cannot tag atomically, so the tag call follows
    /// immediately; an allocation lost between the two calls is orphaned
    /// but harmless, and the next run allocates a fresh one.
    async fn ensure_addresses(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        if snapshot.ingress_address.is_none() {
            let mut address = self.api.allocate_address().await?;
            let tags = self.namer.tags(&self.namer.ingress_address());
            self.api.create_tags(&address.id, tags.clone()).await?;
            address.tags = tags;
            info!(address = %address.public_ip, "allocated ingress address");
            snapshot.ingress_address = Some(address);
        }

        if snapshot.egress_address.is_none() {
            let mut address = self.api.allocate_address().await?;
            let tags = self.namer.tags(&self.namer.egress_address());
            self.api.create_tags(&address.id, tags.clone()).await?;
            address.tags = tags;
            info!(address = %address.public_ip, "allocated egress address");
            snapshot.egress_address = Some(address);
        }

        Ok(())
    }

    async fn ensure_vpc(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        if snapshot.vpc.is_none() {
            let tags = self.namer.tags_with(
                &self.namer.vpc(),
                [Tag::new(SSH_ENABLED_TAG, "false")],
            );
            let vpc = self
                .api
                .create_vpc(self.definition.cloud.vpc_subnet, tags)
                .await?;
            info!(vpc = %vpc.id, cidr = %vpc.cidr, "created network");
            snapshot.vpc = Some(vpc);
            snapshot.ssh_enabled = false;
        }

        Ok(())
    }

    /// The cluster uses one wide-open security group; traffic admission
    /// is enforced by the network ACLs instead, which support ordered
    /// deny rules.
    async fn ensure_security_group(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let vpc = required(&snapshot.vpc, "network")?;

        let mut group = match snapshot.security_group.clone() {
            Some(group) => group,
            None => {
                let name = self.namer.security_group();
                let created = self
                    .api
                    .create_security_group(&vpc.id, &name, self.namer.tags(&name))
                    .await?;

                // Freshly created groups can lag out of listings; wait
                // until the group is visible before relying on it.
                let filter = self.namer.cluster_filter();
                let api = self.api;
                let id = created.id.clone();
                let (filter, id) = (&filter, &id);
                poll_until(
                    &self.poll,
                    &self.cancel,
                    "security group visibility",
                    move || async move {
                        let groups = api.list_security_groups(filter).await?;
                        Ok(groups.into_iter().find(|g| &g.id == id))
                    },
                )
                .await?
            }
        };

        if !group.allows_all_ingress {
            self.api.authorize_all_ingress(&group.id).await?;
            group.allows_all_ingress = true;
        }

        snapshot.security_group = Some(group);
        Ok(())
    }

    async fn ensure_subnets(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let vpc = required(&snapshot.vpc, "network")?;
        let zone = &self.definition.cloud.availability_zone;

        if snapshot.public_subnet.is_none() {
            let name = self.namer.public_subnet();
            let subnet = self
                .api
                .create_subnet(
                    &vpc.id,
                    self.definition.cloud.public_subnet,
                    zone,
                    self.namer.tags(&name),
                )
                .await?;
            info!(subnet = %subnet.id, cidr = %subnet.cidr, "created public subnet");
            snapshot.public_subnet = Some(subnet);
        }

        if snapshot.node_subnet.is_none() {
            let name = self.namer.node_subnet();
            let subnet = self
                .api
                .create_subnet(
                    &vpc.id,
                    self.definition.cloud.node_subnet,
                    zone,
                    self.namer.tags(&name),
                )
                .await?;
            info!(subnet = %subnet.id, cidr = %subnet.cidr, "created node subnet");
            snapshot.node_subnet = Some(subnet);
        }

        Ok(())
    }

    async fn ensure_route_tables(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let vpc = required(&snapshot.vpc, "network")?.clone();

        let public_subnet = required(&snapshot.public_subnet, "public subnet")?.id.clone();
        let node_subnet = required(&snapshot.node_subnet, "node subnet")?.id.clone();

        for (slot, name, subnet_id) in [
            (RouteTableSlot::Public, self.namer.public_route_table(), public_subnet),
            (RouteTableSlot::Node, self.namer.node_route_table(), node_subnet),
        ] {
            let existing = match slot {
                RouteTableSlot::Public => &snapshot.public_route_table,
                RouteTableSlot::Node => &snapshot.node_route_table,
            };

            let mut table = match existing.clone() {
                Some(table) => table,
                None => {
                    let table = self
                        .api
                        .create_route_table(&vpc.id, self.namer.tags(&name))
                        .await?;
                    info!(table = %table.id, name = %name, "created route table");
                    table
                }
            };

            if !table.subnet_associations.contains(&subnet_id) {
                self.api.associate_route_table(&table.id, &subnet_id).await?;
                table.subnet_associations.push(subnet_id);
            }

            match slot {
                RouteTableSlot::Public => snapshot.public_route_table = Some(table),
                RouteTableSlot::Node => snapshot.node_route_table = Some(table),
            }
        }

        Ok(())
    }

    async fn ensure_internet_gateway(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let vpc = required(&snapshot.vpc, "network")?.clone();

        let mut gateway = match snapshot.internet_gateway.clone() {
            Some(gateway) => gateway,
            None => {
                let name = self.namer.internet_gateway();
                let gateway = self
                    .api
                    .create_internet_gateway(self.namer.tags(&name))
                    .await?;
                info!(gateway = %gateway.id, "created internet gateway");
                gateway
            }
        };

        if gateway.attached_vpc.as_ref() != Some(&vpc.id) {
            self.api.attach_internet_gateway(&gateway.id, &vpc.id).await?;
            gateway.attached_vpc = Some(vpc.id.clone());
        }

        // Default route from the public subnet out through the gateway.
        let table = required(&snapshot.public_route_table, "public route table")?.clone();
        self.ensure_default_route(&table.id, &table.routes, &gateway.id).await?;
        if let Some(t) = snapshot.public_route_table.as_mut() {
            upsert_default_route(&mut t.routes, &gateway.id);
        }

        snapshot.internet_gateway = Some(gateway);
        Ok(())
    }

    async fn ensure_nat_gateway(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let public_subnet = required(&snapshot.public_subnet, "public subnet")?.id.clone();
        let egress = required(&snapshot.egress_address, "egress address")?.id.clone();

        let gateway = match snapshot.nat_gateway.clone() {
            Some(gateway) => gateway,
            None => {
                let name = self.namer.nat_gateway();
                let gateway = self
                    .api
                    .create_nat_gateway(&public_subnet, &egress, self.namer.tags(&name))
                    .await?;
                info!(gateway = %gateway.id, "created NAT gateway");
                gateway
            }
        };

        // NAT gateways take minutes to provision; wait for Available and
        // treat any other settled state as fatal since the engine only
        // ever creates them fresh.
        let filter = self.namer.cluster_filter();
        let name = self.namer.nat_gateway();
        let api = self.api;
        let id = gateway.id.clone();
        let (filter, name, id) = (&filter, &name, &id);
        let gateway = poll_until(
            &self.poll,
            &self.cancel,
            "NAT gateway available",
            move || async move {
                let gateways = api.list_nat_gateways(filter).await?;
                let current = gateways
                    .into_iter()
                    .find(|g| &g.id == id)
                    .ok_or_else(|| Error::provider(format!("NAT gateway [{name}] disappeared")))?;

                match current.state {
                    GatewayState::Available => Ok(Some(current)),
                    GatewayState::Pending => Ok(None),
                    state => Err(Error::provider(format!(
                        "NAT gateway [{name}] entered unexpected state [{state:?}]"
                    ))),
                }
            },
        )
        .await?;

        // Default route from the node subnet out through the NAT gateway.
        let table = required(&snapshot.node_route_table, "node route table")?.clone();
        self.ensure_default_route(&table.id, &table.routes, &gateway.id).await?;
        if let Some(t) = snapshot.node_route_table.as_mut() {
            upsert_default_route(&mut t.routes, &gateway.id);
        }

        snapshot.nat_gateway = Some(gateway);
        Ok(())
    }

    async fn ensure_default_route(
        &self,
        table_id: &str,
        routes: &[Route],
        gateway_id: &str,
    ) -> Result<()> {
        let destination = anywhere();
        let present = routes
            .iter()
            .any(|r| r.destination == destination && r.gateway_id == gateway_id);

        if !present {
            self.api
                .create_route(&table_id.to_string(), destination, &gateway_id.to_string())
                .await?;
        }

        Ok(())
    }
}

fn upsert_default_route(routes: &mut Vec<Route>, gateway_id: &str) {
    let destination = anywhere();
    if let Some(route) = routes.iter_mut().find(|r| r.destination == destination) {
        route.gateway_id = gateway_id.to_string();
    } else {
        routes.push(Route {
            destination,
            gateway_id: gateway_id.to_string(),
        });
    }
}

fn required<'a, T>(slot: &'a Option<T>, what: &str) -> Result<&'a T> {
    slot.as_ref()
        .ok_or_else(|| Error::provider(format!("{what} has not been provisioned yet")))
}

#[derive(Clone, Copy)]
enum RouteTableSlot {
    Public,
    Node,
}
