//! Node instance provisioning.
//!
//! Instances are created with a first-boot script that sets the initial
//! node credential and pins the static network configuration, then
//! polled until the provider reports them running and ready. A node
//! found stopped (the cluster was shut down between runs) is restarted
//! rather than recreated; a node found in a state the engine never put
//! it in aborts that node while its siblings continue.
//!
//! The boot payload carries a one-time credential, so once a node has
//! been fully provisioned the payload is cleared from the provider and
//! the instance is tagged so the cleanup itself is idempotent.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::info;

use crate::definition::{ClusterDefinition, NodeDefinition};
use crate::discovery::ResourceSnapshot;
use crate::names::{ResourceNamer, NODE_NAME_TAG, NODE_SSH_PORT_TAG, NODE_USER_DATA_TAG};
use crate::provider::{CloudApi, Instance, InstanceSpec, InstanceState, Tag};
use crate::retry::{poll_until, CancelFlag, PollConfig};
use crate::{Error, Result};

/// Block device of the OS volume
pub const OS_DEVICE: &str = "/dev/sda1";

/// Block device of the data volume
pub const DATA_DEVICE: &str = "/dev/sdb";

/// Tag value recording that the boot payload has been cleared
const USER_DATA_CLEARED: &str = "cleared";

/// Render the first-boot script for a node.
///
/// The script is guarded by a sentinel file so a reboot does not rerun
/// it: it sets the initial node credential, writes a static netplan
/// configuration for the node's fixed address, and disables the image's
/// own network autoconfiguration.
pub fn boot_script(
    definition: &ClusterDefinition,
    node: &NodeDefinition,
    password: &str,
) -> String {
    let subnet = definition.cloud.node_subnet;
    let prefix = subnet.prefix_len();
    // The subnet router always sits at the first host address.
    let gateway = Ipv4Addr::from(u32::from(subnet.network()) + 1);

    let nameservers = if definition.network.nameservers.is_empty() {
        // The provider resolver also sits at a fixed subnet offset.
        vec![Ipv4Addr::from(u32::from(subnet.network()) + 2)]
    } else {
        definition.network.nameservers.clone()
    };
    let nameserver_list = nameservers
        .iter()
        .map(|ns| ns.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"#cloud-boothook
#!/bin/bash
if [ ! -f /etc/node-init.done ]; then

    echo 'sysadmin:{password}' | chpasswd

    cat <<EOF > /etc/netplan/50-static.yaml
network:
  version: 2
  ethernets:
    eth0:
      dhcp4: no
      addresses: [{address}/{prefix}]
      gateway4: {gateway}
      nameservers:
        addresses: [{nameserver_list}]
EOF

    cat <<EOF > /etc/cloud/cloud.cfg.d/99-disable-network-config.cfg
network: {{config: disabled}}
EOF

    netplan apply
    touch /etc/node-init.done
fi
"#,
        address = node.address,
    )
}

/// Provisions and repairs node instances
pub struct InstanceReconciler<'a> {
    /// Provider API
    pub api: &'a dyn CloudApi,
    /// Cluster namer
    pub namer: &'a ResourceNamer,
    /// Cluster definition
    pub definition: &'a ClusterDefinition,
    /// Id of the node machine image
    pub image_id: String,
    /// Initial node credential baked into the boot payload
    pub node_password: String,
    /// Poll bounds for instance boot waits
    pub poll: PollConfig,
    /// Cooperative cancellation
    pub cancel: CancelFlag,
}

impl InstanceReconciler<'_> {
    /// Bring one node's instance to running-and-ready: create it if it is
    /// missing, restart it if it was stopped, and wait out the boot.
    ///
    /// Failures are reported as [`Error::NodeFailure`] so the caller can
    /// keep provisioning sibling nodes.
    pub async fn ensure_node(
        &self,
        snapshot: &ResourceSnapshot,
        node: &NodeDefinition,
        placement_group: &str,
        partition: u32,
        ssh_port: u16,
    ) -> Result<Instance> {
        let instance = match snapshot.instance(&node.name) {
            Some(existing) => {
                if existing.state.is_unexpected_during_provisioning() {
                    return Err(Error::node_failure(
                        node.name.as_str(),
                        format!(
                            "instance [{}] is in unexpected state [{:?}]",
                            existing.id, existing.state
                        ),
                    ));
                }
                existing.clone()
            }
            None => self.create_instance(snapshot, node, placement_group, partition, ssh_port).await?,
        };

        let instance = self.wait_ready(node, instance).await?;
        self.tag_volumes(node, &instance).await?;
        Ok(instance)
    }

    async fn create_instance(
        &self,
        snapshot: &ResourceSnapshot,
        node: &NodeDefinition,
        placement_group: &str,
        partition: u32,
        ssh_port: u16,
    ) -> Result<Instance> {
        let subnet = snapshot
            .node_subnet
            .as_ref()
            .ok_or_else(|| Error::provider("node subnet has not been provisioned yet"))?;
        let group = snapshot
            .security_group
            .as_ref()
            .ok_or_else(|| Error::provider("security group has not been provisioned yet"))?;

        let instance_type = node
            .instance_type
            .clone()
            .unwrap_or_else(|| self.definition.cloud.default_instance_type.clone());

        let script = boot_script(self.definition, node, &self.node_password);

        let spec = InstanceSpec {
            image_id: self.image_id.clone(),
            instance_type,
            subnet_id: subnet.id.clone(),
            private_ip: node.address,
            security_group_ids: vec![group.id.clone()],
            user_data: BASE64.encode(script),
            placement_group: placement_group.to_string(),
            placement_partition: partition,
            volumes: vec![
                (
                    OS_DEVICE.to_string(),
                    node.os_volume.volume_type.clone(),
                    node.os_volume.size_gib,
                ),
                (
                    DATA_DEVICE.to_string(),
                    node.data_volume.volume_type.clone(),
                    node.data_volume.size_gib,
                ),
            ],
            tags: self.namer.tags_with(
                &self.namer.node_instance(&node.name),
                [
                    Tag::new(NODE_NAME_TAG, node.name.as_str()),
                    Tag::new(NODE_SSH_PORT_TAG, ssh_port.to_string()),
                ],
            ),
        };

        let instance = self
            .api
            .run_instance(spec)
            .await
            .map_err(|e| Error::node_failure(node.name.as_str(), e.to_string()))?;

        info!(
            node = %node.name,
            instance = %instance.id,
            partition,
            ssh_port,
            "created node instance"
        );
        Ok(instance)
    }

    /// Wait for running-and-ready, restarting a stopped instance along
    /// the way. The provider can briefly report nothing at all for a
    /// fresh instance; that simply means keep waiting.
    async fn wait_ready(&self, node: &NodeDefinition, instance: Instance) -> Result<Instance> {
        let api = self.api;
        let id = instance.id.clone();
        let node_name = node.name.clone();
        let (id, node_name) = (&id, &node_name);

        poll_until(&self.poll, &self.cancel, "instance ready", move || async move {
            let status = match api.describe_instance_status(id).await? {
                Some(status) => status,
                None => return Ok(None),
            };

            if status.state.is_unexpected_during_provisioning() {
                return Err(Error::node_failure(
                    node_name.as_str(),
                    format!(
                        "instance [{id}] entered unexpected state [{:?}]",
                        status.state
                    ),
                ));
            }

            if status.state.is_stopped() {
                info!(node = %node_name, instance = %id, "restarting stopped instance");
                api.start_instance(id).await?;
                return Ok(None);
            }

            Ok((status.state == InstanceState::Running && status.ready).then_some(()))
        })
        .await
        .map_err(|e| match e {
            e @ (Error::NodeFailure { .. } | Error::Canceled) => e,
            other => Error::node_failure(node.name.as_str(), other.to_string()),
        })?;

        // Refresh the record so volume ids and state are current.
        let instances = self.api.list_instances(&self.namer.cluster_filter()).await?;
        instances
            .into_iter()
            .find(|i| i.id == instance.id)
            .ok_or_else(|| Error::node_failure(node.name.as_str(), "instance disappeared after boot"))
    }

    /// Stamp the OS and data volumes with their resource names. Volume
    /// ids only exist once the instance does, so this runs after boot.
    async fn tag_volumes(&self, node: &NodeDefinition, instance: &Instance) -> Result<()> {
        for volume in &instance.volumes {
            let name = match volume.device_name.as_str() {
                OS_DEVICE => self.namer.node_os_volume(&node.name),
                DATA_DEVICE => self.namer.node_data_volume(&node.name),
                _ => continue,
            };

            self.api
                .create_tags(&volume.volume_id, self.namer.tags(&name))
                .await?;
        }
        Ok(())
    }

    /// Drop the boot payload once the node is fully provisioned; it holds
    /// the initial credential and must not outlive provisioning. The
    /// completion tag makes the cleanup itself resumable.
    pub async fn clear_boot_payload(&self, instance: &Instance) -> Result<()> {
        let cleared = instance
            .tags
            .iter()
            .any(|t| t.key == NODE_USER_DATA_TAG && t.value == USER_DATA_CLEARED);
        if cleared {
            return Ok(());
        }

        self.api.clear_instance_user_data(&instance.id).await?;
        self.api
            .create_tags(
                &instance.id,
                vec![Tag::new(NODE_USER_DATA_TAG, USER_DATA_CLEARED)],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover;
    use crate::network::NetworkReconciler;
    use crate::provider::sim::SimCloud;
    use crate::provider::Tagged;

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
  - { name: worker-1, role: worker, address: 10.100.1.20 }
"#,
        )
        .unwrap()
    }

    async fn provisioned_network(
        sim: &SimCloud,
        definition: &ClusterDefinition,
    ) -> ResourceSnapshot {
        let namer = ResourceNamer::new(definition);
        let mut snapshot = discover(sim, &namer).await.unwrap();
        NetworkReconciler {
            api: sim,
            namer: &namer,
            definition,
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        }
        .ensure(&mut snapshot)
        .await
        .unwrap();
        snapshot
    }

    fn reconciler<'a>(
        sim: &'a SimCloud,
        namer: &'a ResourceNamer,
        definition: &'a ClusterDefinition,
    ) -> InstanceReconciler<'a> {
        InstanceReconciler {
            api: sim,
            namer,
            definition,
            image_id: "ami-0001".to_string(),
            node_password: "initial-secret".to_string(),
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn boot_script_pins_static_network() {
        let definition = definition();
        let node = definition.node("cp-1").unwrap();
        let script = boot_script(&definition, node, "swordfish");

        assert!(script.starts_with("#cloud-boothook"));
        assert!(script.contains("sysadmin:swordfish"));
        assert!(script.contains("addresses: [10.100.1.10/24]"));
        assert!(script.contains("gateway4: 10.100.1.1"));
        assert!(script.contains("/etc/node-init.done"));
        assert!(script.contains("config: disabled"));
    }

    #[test]
    fn boot_script_prefers_configured_nameservers() {
        let mut definition = definition();
        definition.network.nameservers = vec!["1.1.1.1".parse().unwrap()];
        let node = definition.node("cp-1").unwrap();

        let script = boot_script(&definition, node, "pw");
        assert!(script.contains("addresses: [1.1.1.1]"));
    }

    #[tokio::test]
    async fn creates_boots_and_tags_a_node() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let snapshot = provisioned_network(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        let node = definition.node("cp-1").unwrap();
        let instance = reconciler
            .ensure_node(&snapshot, node, "demo.control-plane-placement", 1, 2211)
            .await
            .unwrap();

        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.tag_value(NODE_NAME_TAG), Some("cp-1"));
        assert_eq!(instance.tag_value(NODE_SSH_PORT_TAG), Some("2211"));

        // The boot payload landed base64-encoded.
        let payload = sim.user_data(&instance.id).unwrap();
        let decoded = String::from_utf8(BASE64.decode(payload).unwrap()).unwrap();
        assert!(decoded.contains("sysadmin:initial-secret"));

        // Volumes were stamped with their names.
        let os = &instance.volumes[0];
        let tags = sim.side_tags(&os.volume_id);
        assert!(tags.iter().any(|t| t.value == "demo.cp-1.os"));
    }

    #[tokio::test]
    async fn second_ensure_adopts_the_existing_instance() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let snapshot = provisioned_network(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        let node = definition.node("cp-1").unwrap();
        let first = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        let creates = sim.create_calls();
        let snapshot = discover(&sim, &namer).await.unwrap();
        let second = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(sim.create_calls(), creates);
    }

    #[tokio::test]
    async fn stopped_instance_is_restarted_not_recreated() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let snapshot = provisioned_network(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        let node = definition.node("cp-1").unwrap();
        let instance = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        sim.stop_instance(&instance.id).await.unwrap();
        let creates = sim.create_calls();

        let snapshot = discover(&sim, &namer).await.unwrap();
        let restarted = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        assert_eq!(restarted.id, instance.id);
        assert_eq!(restarted.state, InstanceState::Running);
        assert_eq!(sim.create_calls(), creates);
    }

    #[tokio::test]
    async fn stopping_instance_fails_the_node() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let snapshot = provisioned_network(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        let node = definition.node("cp-1").unwrap();
        let instance = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        // Stopping is not stopped: a half-shut-down instance is an error,
        // not a restart candidate.
        sim.force_instance_state(&instance.id, InstanceState::Stopping);

        let snapshot = discover(&sim, &namer).await.unwrap();
        let err = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NodeFailure { node, .. } if node == "cp-1"));
    }

    #[tokio::test]
    async fn boot_payload_cleanup_is_idempotent() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let snapshot = provisioned_network(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        let node = definition.node("cp-1").unwrap();
        let instance = reconciler
            .ensure_node(&snapshot, node, "pg", 1, 2211)
            .await
            .unwrap();

        reconciler.clear_boot_payload(&instance).await.unwrap();
        assert_eq!(sim.user_data(&instance.id).unwrap(), "");

        // Re-discover: the completion tag short-circuits the second pass.
        let snapshot = discover(&sim, &namer).await.unwrap();
        let tagged = snapshot.instance("cp-1").unwrap();
        assert_eq!(tagged.tag_value(NODE_USER_DATA_TAG), Some(USER_DATA_CLEARED));
        reconciler.clear_boot_payload(tagged).await.unwrap();
    }
}
