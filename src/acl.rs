//! Network ACL management.
//!
//! Traffic admission is enforced with provider network ACLs rather than
//! security group rules because ACL entries are ordered and support
//! explicit deny. Entry updates are not atomic, so the engine keeps two
//! ACLs per cluster and rotates between them: the full desired rule set
//! is written to whichever ACL the node subnet is not associated with,
//! then the subnet associations are swapped over, node subnet last. The
//! node subnet carries the cluster's traffic, so its single association
//! swap is the cutover point: traffic is never filtered by a half-written
//! rule list, and a crash anywhere mid-rotation leaves the old ACL live
//! on the node subnet. The next run classifies slots by the node-subnet
//! association, rewrites the other slot, and completes the swap.
//!
//! Whether external SSH is admitted is part of the desired rule set and
//! is persisted as a tag on the VPC, so a resumed run regenerates the
//! same rules without any local state.

use ipnet::Ipv4Net;
use tracing::info;

use crate::definition::{AddressRule, AddressRuleAction, ClusterDefinition, IngressRule};
use crate::discovery::ResourceSnapshot;
use crate::names::{AclSlot, ResourceNamer, SSH_ENABLED_TAG};
use crate::provider::{AclAction, AclEntry, CloudApi, NetworkAcl, Tag};
use crate::{Error, Result};

/// First rule number of the intra-cluster band
pub const FIRST_INTERNAL_RULE: u32 = 1;

/// First rule number of the external SSH band
pub const FIRST_SSH_RULE: u32 = 1_000;

/// First rule number of the ingress band
pub const FIRST_INGRESS_RULE: u32 = 2_000;

/// First rule number of the egress band
pub const FIRST_EGRESS_RULE: u32 = 2_000;

/// The trailing deny-everything rule
pub const DENY_ALL_RULE: u32 = 32_767;

fn anywhere() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::UNSPECIFIED, 0).expect("/0 is a valid prefix")
}

fn action(rule: &AddressRule) -> AclAction {
    match rule.action {
        AddressRuleAction::Allow => AclAction::Allow,
        AddressRuleAction::Deny => AclAction::Deny,
    }
}

/// Build the complete desired entry list for the cluster.
///
/// `rules` is the effective ingress rule list (user rules plus the
/// engine's management rule); `ssh_enabled` decides whether the external
/// SSH band is emitted. The output is deterministic for a given input,
/// which is what makes the no-change fast path a simple equality check.
pub fn build_entries(
    definition: &ClusterDefinition,
    rules: &[IngressRule],
    ssh_enabled: bool,
) -> Vec<AclEntry> {
    let mut entries = Vec::new();
    let network = &definition.network;

    // Intra-cluster traffic is unrestricted.
    entries.push(AclEntry {
        rule_number: FIRST_INTERNAL_RULE,
        egress: false,
        cidr: definition.cloud.vpc_subnet,
        port_range: None,
        action: AclAction::Allow,
    });

    // External SSH band, covering the whole reserved port range. The
    // management address rules scope who may connect; no rules means
    // anywhere.
    if ssh_enabled {
        let mut rule_number = FIRST_SSH_RULE;
        let port_range = Some((
            network.first_external_ssh_port,
            network.last_external_ssh_port,
        ));

        if network.management_address_rules.is_empty() {
            entries.push(AclEntry {
                rule_number,
                egress: false,
                cidr: anywhere(),
                port_range,
                action: AclAction::Allow,
            });
        } else {
            for address_rule in &network.management_address_rules {
                entries.push(AclEntry {
                    rule_number,
                    egress: false,
                    cidr: address_rule.subnet,
                    port_range,
                    action: action(address_rule),
                });
                rule_number += 1;
            }
        }
    }

    // One band entry per ingress rule and source filter.
    let mut rule_number = FIRST_INGRESS_RULE;
    for rule in rules {
        let port_range = Some((rule.external_port, rule.external_port));

        if rule.address_rules.is_empty() {
            entries.push(AclEntry {
                rule_number,
                egress: false,
                cidr: anywhere(),
                port_range,
                action: AclAction::Allow,
            });
            rule_number += 1;
        } else {
            for address_rule in &rule.address_rules {
                entries.push(AclEntry {
                    rule_number,
                    egress: false,
                    cidr: address_rule.subnet,
                    port_range,
                    action: action(address_rule),
                });
                rule_number += 1;
            }
        }
    }

    // Everything not explicitly admitted is rejected.
    entries.push(AclEntry {
        rule_number: DENY_ALL_RULE,
        egress: false,
        cidr: anywhere(),
        port_range: None,
        action: AclAction::Deny,
    });

    // Egress is unrestricted; the NAT gateway already constrains the
    // paths node traffic can take.
    entries.push(AclEntry {
        rule_number: FIRST_EGRESS_RULE,
        egress: true,
        cidr: anywhere(),
        port_range: None,
        action: AclAction::Allow,
    });
    entries.push(AclEntry {
        rule_number: DENY_ALL_RULE,
        egress: true,
        cidr: anywhere(),
        port_range: None,
        action: AclAction::Deny,
    });

    entries
}

/// Reconciles the two-slot ACL rotation
pub struct AclReconciler<'a> {
    /// Provider API
    pub api: &'a dyn CloudApi,
    /// Cluster namer
    pub namer: &'a ResourceNamer,
    /// Cluster definition
    pub definition: &'a ClusterDefinition,
}

impl AclReconciler<'_> {
    /// Bring the active ACL to the desired rule set and persist the SSH
    /// flag. No provider mutation happens when the active ACL already
    /// carries exactly the desired entries.
    pub async fn ensure(
        &self,
        snapshot: &mut ResourceSnapshot,
        rules: &[IngressRule],
        ssh_enabled: bool,
    ) -> Result<()> {
        let vpc = snapshot
            .vpc
            .clone()
            .ok_or_else(|| Error::provider("network has not been provisioned yet"))?;
        let public_subnet = snapshot
            .public_subnet
            .clone()
            .ok_or_else(|| Error::provider("public subnet has not been provisioned yet"))?;
        let node_subnet = snapshot
            .node_subnet
            .clone()
            .ok_or_else(|| Error::provider("node subnet has not been provisioned yet"))?;

        // Both slots must exist before rotation can work.
        for slot in [AclSlot::A, AclSlot::B] {
            let existing = match slot {
                AclSlot::A => &snapshot.acl_a,
                AclSlot::B => &snapshot.acl_b,
            };

            if existing.is_none() {
                let name = self.namer.network_acl(slot);
                let acl = self
                    .api
                    .create_network_acl(&vpc.id, self.namer.tags(&name))
                    .await?;
                info!(acl = %acl.id, name = %name, "created network acl");
                match slot {
                    AclSlot::A => snapshot.acl_a = Some(acl),
                    AclSlot::B => snapshot.acl_b = Some(acl),
                }
            }
        }

        let (acl_a, acl_b) = match (snapshot.acl_a.clone(), snapshot.acl_b.clone()) {
            (Some(a), Some(b)) => (a, b),
            _ => return Err(Error::provider("network acl slots missing after creation")),
        };

        let desired = build_entries(self.definition, rules, ssh_enabled);
        let subnets = [public_subnet.id.clone(), node_subnet.id.clone()];

        // Active slot = the one the node subnet is associated with. The
        // node subnet is where the cluster's traffic is filtered, so it
        // alone decides which slot is live.
        let (active, inactive) = if acl_a.subnet_associations.contains(&node_subnet.id) {
            (acl_a, acl_b)
        } else if acl_b.subnet_associations.contains(&node_subnet.id) {
            (acl_b, acl_a)
        } else {
            // Fresh cluster: nothing associated yet. Write slot A and
            // associate it.
            let target = acl_a;
            self.api.replace_acl_entries(&target.id, desired.clone()).await?;
            for subnet in &subnets {
                self.api.replace_subnet_acl_association(subnet, &target.id).await?;
            }
            self.persist_ssh_enabled(snapshot, &vpc.id, ssh_enabled).await?;
            self.refresh(snapshot).await?;
            info!(acl = %target.id, "installed initial network acl rules");
            return Ok(());
        };

        let associations_complete = subnets
            .iter()
            .all(|s| active.subnet_associations.contains(s));

        if active.entries == desired && associations_complete {
            self.persist_ssh_enabled(snapshot, &vpc.id, ssh_enabled).await?;
            return Ok(());
        }

        // Rotate: full desired rules into the inactive slot, then swap
        // the subnet associations over. `subnets` lists the node subnet
        // last; its swap is the cutover.
        self.api.replace_acl_entries(&inactive.id, desired).await?;
        for subnet in &subnets {
            self.api.replace_subnet_acl_association(subnet, &inactive.id).await?;
        }
        self.persist_ssh_enabled(snapshot, &vpc.id, ssh_enabled).await?;
        self.refresh(snapshot).await?;

        info!(
            from = %active.id,
            to = %inactive.id,
            ssh_enabled,
            "rotated network acl"
        );
        Ok(())
    }

    /// The ACL currently associated with the node subnet, if any
    pub fn active<'s>(&self, snapshot: &'s ResourceSnapshot) -> Option<&'s NetworkAcl> {
        let node = snapshot.node_subnet.as_ref()?;
        [&snapshot.acl_a, &snapshot.acl_b]
            .into_iter()
            .filter_map(|slot| slot.as_ref())
            .find(|acl| acl.subnet_associations.contains(&node.id))
    }

    async fn persist_ssh_enabled(
        &self,
        snapshot: &mut ResourceSnapshot,
        vpc_id: &str,
        ssh_enabled: bool,
    ) -> Result<()> {
        if snapshot.ssh_enabled != ssh_enabled {
            self.api
                .create_tags(
                    &vpc_id.to_string(),
                    vec![Tag::new(SSH_ENABLED_TAG, if ssh_enabled { "true" } else { "false" })],
                )
                .await?;
            snapshot.ssh_enabled = ssh_enabled;
        }
        Ok(())
    }

    async fn refresh(&self, snapshot: &mut ResourceSnapshot) -> Result<()> {
        let filter = self.namer.cluster_filter();
        let acls = self.api.list_network_acls(&filter).await?;

        let find = |name: String| {
            acls.iter()
                .find(|a| {
                    a.tags
                        .iter()
                        .any(|t| t.key == crate::names::NAME_TAG && t.value == name)
                })
                .cloned()
        };

        snapshot.acl_a = find(self.namer.network_acl(AclSlot::A));
        snapshot.acl_b = find(self.namer.network_acl(AclSlot::B));
        Ok(())
    }
}
