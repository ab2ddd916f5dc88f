//! Load balancer and ingress reconciliation.
//!
//! The cluster fronts all external traffic with one network load
//! balancer on the public subnet, answering on the cluster's static
//! ingress address. Each ingress rule maps to a target group keyed by
//! (cluster, target population, protocol, node port) plus a listener on
//! the rule's external port; each node additionally gets a single-member
//! target group forwarding its assigned external SSH port to the node's
//! SSH port, with the listeners for those only present while external
//! SSH access is enabled.
//!
//! Target membership is fully re-registered on every pass rather than
//! diffed, so out-of-band changes are simply overwritten. Listeners not
//! accounted for by the current rule set are deleted.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::definition::{
    ClusterDefinition, HealthCheck, IngressProtocol, IngressRule, IngressTarget,
};
use crate::discovery::ResourceSnapshot;
use crate::names::ResourceNamer;
use crate::provider::{CloudApi, LoadBalancer, ResourceId, TargetGroup, TargetHealth};
use crate::retry::{poll_until, CancelFlag, PollConfig};
use crate::{Error, Result, MANAGEMENT_EXTERNAL_PORT, MANAGEMENT_NODE_PORT};

/// The effective ingress rule list: the engine's cluster management rule
/// followed by the user rules from the definition.
///
/// The management rule forwards the management API port to the
/// control-plane nodes and inherits the management address filters.
pub fn effective_rules(definition: &ClusterDefinition) -> Vec<IngressRule> {
    let mut rules = vec![IngressRule {
        name: "management".to_string(),
        protocol: IngressProtocol::Tcp,
        external_port: MANAGEMENT_EXTERNAL_PORT,
        node_port: MANAGEMENT_NODE_PORT,
        target: IngressTarget::Control,
        health_check: None,
        address_rules: definition.network.management_address_rules.clone(),
    }];

    rules.extend(definition.network.ingress_rules.iter().cloned());
    rules
}

/// One desired target group with its listener port, if any
struct DesiredGroup {
    name: String,
    node_port: u16,
    health_check: HealthCheck,
    targets: Vec<ResourceId>,
    listener_port: Option<u16>,
}

/// Reconciles the load balancer, target groups and listeners
pub struct IngressReconciler<'a> {
    /// Provider API
    pub api: &'a dyn CloudApi,
    /// Cluster namer
    pub namer: &'a ResourceNamer,
    /// Cluster definition
    pub definition: &'a ClusterDefinition,
    /// Poll bounds for target health waits
    pub poll: PollConfig,
    /// Cooperative cancellation
    pub cancel: CancelFlag,
}

impl IngressReconciler<'_> {
    /// Bring the balancer, its target groups and listeners to the desired
    /// state. `ssh_ports` is the complete node port map; `ssh_enabled`
    /// gates the SSH listeners (the groups themselves always exist so the
    /// port mapping survives a disable/enable cycle).
    pub async fn ensure(
        &self,
        snapshot: &mut ResourceSnapshot,
        ssh_ports: &HashMap<String, u16>,
        ssh_enabled: bool,
    ) -> Result<()> {
        let vpc = snapshot
            .vpc
            .clone()
            .ok_or_else(|| Error::provider("network has not been provisioned yet"))?;

        let balancer = self.ensure_balancer(snapshot).await?;
        let desired = self.desired_groups(snapshot, ssh_ports, ssh_enabled)?;

        // Target groups: adopt by name or create, then overwrite the
        // registered targets wholesale.
        let existing = self.api.list_target_groups(&vpc.id).await?;
        let mut group_ids: HashMap<String, ResourceId> = HashMap::new();

        for group in &desired {
            let id = match existing.iter().find(|g| g.name == group.name) {
                Some(found) => found.id.clone(),
                None => {
                    let created = self
                        .api
                        .create_target_group(
                            &vpc.id,
                            &group.name,
                            group.node_port,
                            group.health_check.clone(),
                            self.namer.tags(&group.name),
                        )
                        .await?;
                    info!(group = %group.name, port = group.node_port, "created target group");
                    created.id
                }
            };

            self.api.set_targets(&id, group.targets.clone()).await?;
            group_ids.insert(group.name.clone(), id);
        }

        // Drop groups this cluster owns that no rule accounts for.
        let ours = self.namer.cluster_filter();
        for group in &existing {
            let owned = ours.matches(&group.tags);
            if owned && !desired.iter().any(|d| d.name == group.name) {
                info!(group = %group.name, "deleting stale target group");
                self.delete_group_listeners(&balancer.id, &group.id).await?;
                self.api.delete_target_group(&group.id).await?;
            }
        }

        // Listeners: one per desired (port, group); anything else on the
        // balancer is stale and gets removed, including SSH listeners
        // after a disable.
        let listeners = self.api.list_listeners(&balancer.id).await?;
        let mut wanted: HashMap<u16, &ResourceId> = HashMap::new();
        for group in &desired {
            if let Some(port) = group.listener_port {
                if let Some(id) = group_ids.get(&group.name) {
                    wanted.insert(port, id);
                }
            }
        }

        for listener in &listeners {
            match wanted.get(&listener.port) {
                Some(group_id) if *group_id == &listener.target_group_id => {
                    wanted.remove(&listener.port);
                }
                _ => {
                    debug!(port = listener.port, "removing stale listener");
                    self.api.delete_listener(&listener.id).await?;
                }
            }
        }

        for (port, group_id) in wanted {
            self.api.create_listener(&balancer.id, port, group_id).await?;
            debug!(port, "created listener");
        }

        Ok(())
    }

    /// Wait until every rule target group with registered members reports
    /// all targets healthy
    pub async fn wait_healthy(&self, snapshot: &ResourceSnapshot) -> Result<()> {
        let vpc = snapshot
            .vpc
            .as_ref()
            .ok_or_else(|| Error::provider("network has not been provisioned yet"))?;

        let groups: Vec<TargetGroup> = self
            .api
            .list_target_groups(&vpc.id)
            .await?
            .into_iter()
            .filter(|g| self.namer.cluster_filter().matches(&g.tags) && !g.targets.is_empty())
            .collect();

        let api = self.api;
        for group in &groups {
            let id = &group.id;
            poll_until(&self.poll, &self.cancel, "target health", move || async move {
                let health = api.describe_target_health(id).await?;
                let all_healthy = health.iter().all(|(_, h)| *h == TargetHealth::Healthy);
                Ok(all_healthy.then_some(()))
            })
            .await?;
        }

        Ok(())
    }

    async fn ensure_balancer(&self, snapshot: &mut ResourceSnapshot) -> Result<LoadBalancer> {
        if let Some(balancer) = snapshot.load_balancer.clone() {
            return Ok(balancer);
        }

        let subnet = snapshot
            .public_subnet
            .as_ref()
            .ok_or_else(|| Error::provider("public subnet has not been provisioned yet"))?;
        let address = snapshot
            .ingress_address
            .as_ref()
            .ok_or_else(|| Error::provider("ingress address has not been provisioned yet"))?;

        let name = self.namer.load_balancer_name()?;
        let balancer = self
            .api
            .create_load_balancer(
                &name,
                &subnet.id,
                &address.id,
                self.namer.tags(&self.namer.load_balancer()),
            )
            .await?;

        info!(balancer = %balancer.id, name = %name, "created load balancer");
        snapshot.load_balancer = Some(balancer.clone());
        Ok(balancer)
    }

    fn desired_groups(
        &self,
        snapshot: &ResourceSnapshot,
        ssh_ports: &HashMap<String, u16>,
        ssh_enabled: bool,
    ) -> Result<Vec<DesiredGroup>> {
        let mut desired = Vec::new();

        for rule in effective_rules(self.definition) {
            let name =
                self.namer
                    .target_group_name(rule.target, rule.protocol, rule.node_port)?;

            let nodes: Vec<&str> = match rule.target {
                IngressTarget::Control => self
                    .definition
                    .control_plane_nodes()
                    .map(|n| n.name.as_str())
                    .collect(),
                IngressTarget::User => self
                    .definition
                    .nodes
                    .iter()
                    .filter(|n| n.ingress)
                    .map(|n| n.name.as_str())
                    .collect(),
                IngressTarget::Ssh => {
                    return Err(Error::validation(
                        "the ssh target is engine-managed and cannot appear in rules",
                    ))
                }
            };

            let targets = nodes
                .iter()
                .filter_map(|name| snapshot.instance(name))
                .map(|i| i.id.clone())
                .collect();

            desired.push(DesiredGroup {
                name,
                node_port: rule.node_port,
                health_check: rule
                    .health_check
                    .clone()
                    .unwrap_or_else(|| self.definition.network.ingress_health_check.clone()),
                targets,
                listener_port: Some(rule.external_port),
            });
        }

        // Per-node SSH forwarding, named by the external port so a port
        // can never silently migrate between nodes.
        for node in self.definition.sorted_control_plane_then_workers() {
            let Some(port) = ssh_ports.get(&node.name) else {
                continue;
            };

            let targets = snapshot
                .instance(&node.name)
                .map(|i| vec![i.id.clone()])
                .unwrap_or_default();

            desired.push(DesiredGroup {
                name: self.namer.ssh_target_group_name(*port)?,
                node_port: crate::INTERNAL_SSH_PORT,
                health_check: self.definition.network.ingress_health_check.clone(),
                targets,
                listener_port: ssh_enabled.then_some(*port),
            });
        }

        Ok(desired)
    }

    async fn delete_group_listeners(
        &self,
        balancer_id: &ResourceId,
        group_id: &ResourceId,
    ) -> Result<()> {
        for listener in self.api.list_listeners(balancer_id).await? {
            if &listener.target_group_id == group_id {
                self.api.delete_listener(&listener.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover;
    use crate::instance::InstanceReconciler;
    use crate::network::NetworkReconciler;
    use crate::ports::assign_ssh_ports;
    use crate::provider::sim::SimCloud;

    fn definition() -> ClusterDefinition {
        let mut definition = ClusterDefinition::from_yaml(
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
  ingress_rules:
    - name: web
      protocol: http
      external_port: 80
      node_port: 30080
      target: user
nodes:
  - { name: cp-1, role: control-plane, address: 10.100.1.10 }
  - { name: worker-1, role: worker, address: 10.100.1.20 }
"#,
        )
        .unwrap();
        definition.ensure_ingress_nodes();
        definition
    }

    async fn provision(
        sim: &SimCloud,
        definition: &ClusterDefinition,
    ) -> (ResourceSnapshot, HashMap<String, u16>) {
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

        let ports = assign_ssh_ports(definition, &snapshot.ssh_ports).unwrap();

        let instances = InstanceReconciler {
            api: sim,
            namer: &namer,
            definition,
            image_id: "ami-0001".to_string(),
            node_password: "pw".to_string(),
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        };
        for node in definition.sorted_control_plane_then_workers() {
            instances
                .ensure_node(&snapshot, node, "pg", 1, ports[&node.name])
                .await
                .unwrap();
        }

        let snapshot = discover(sim, &namer).await.unwrap();
        (snapshot, ports)
    }

    fn reconciler<'a>(
        sim: &'a SimCloud,
        namer: &'a ResourceNamer,
        definition: &'a ClusterDefinition,
    ) -> IngressReconciler<'a> {
        IngressReconciler {
            api: sim,
            namer,
            definition,
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn management_rule_leads_the_effective_rules() {
        let rules = effective_rules(&definition());
        assert_eq!(rules[0].target, IngressTarget::Control);
        assert_eq!(rules[0].external_port, 6443);
        assert_eq!(rules[1].name, "web");
    }

    #[tokio::test]
    async fn builds_balancer_groups_and_listeners() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        reconciler(&sim, &namer, &definition)
            .ensure(&mut snapshot, &ports, false)
            .await
            .unwrap();

        let balancer = snapshot.load_balancer.clone().unwrap();
        assert_eq!(balancer.name, "demo-elb");

        let vpc = snapshot.vpc.clone().unwrap();
        let groups = sim.list_target_groups(&vpc.id).await.unwrap();
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();

        // Management + web + one SSH group per node.
        assert!(names.contains(&"demo-control-tcp-6443"));
        assert!(names.contains(&"demo-user-tcp-30080"));
        assert!(names.contains(&"demo-ssh-tcp-2211"));
        assert!(names.contains(&"demo-ssh-tcp-2212"));

        // SSH disabled: only the two rule listeners exist.
        let listeners = sim.list_listeners(&balancer.id).await.unwrap();
        let mut ports_open: Vec<_> = listeners.iter().map(|l| l.port).collect();
        ports_open.sort_unstable();
        assert_eq!(ports_open, [80, 6443]);

        // The management group points at the control-plane instance only.
        let management = groups.iter().find(|g| g.name == "demo-control-tcp-6443").unwrap();
        assert_eq!(
            management.targets,
            vec![snapshot.instance("cp-1").unwrap().id.clone()]
        );
    }

    #[tokio::test]
    async fn second_pass_creates_nothing() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();
        let creates = sim.create_calls();

        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();
        assert_eq!(sim.create_calls(), creates);
    }

    #[tokio::test]
    async fn drifted_targets_are_reregistered() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();

        let vpc = snapshot.vpc.clone().unwrap();
        let group = sim
            .list_target_groups(&vpc.id)
            .await
            .unwrap()
            .into_iter()
            .find(|g| g.name == "demo-control-tcp-6443")
            .unwrap();

        // Out-of-band deregistration.
        sim.set_targets(&group.id, vec![]).await.unwrap();

        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();
        let group = sim
            .list_target_groups(&vpc.id)
            .await
            .unwrap()
            .into_iter()
            .find(|g| g.name == "demo-control-tcp-6443")
            .unwrap();
        assert_eq!(group.targets.len(), 1);
    }

    #[tokio::test]
    async fn ssh_listeners_follow_the_enable_flag() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        reconciler.ensure(&mut snapshot, &ports, true).await.unwrap();

        let balancer = snapshot.load_balancer.clone().unwrap();
        let listeners = sim.list_listeners(&balancer.id).await.unwrap();
        assert!(listeners.iter().any(|l| l.port == 2211));
        assert!(listeners.iter().any(|l| l.port == 2212));

        // Disable: SSH listeners go away, groups stay.
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();
        let listeners = sim.list_listeners(&balancer.id).await.unwrap();
        assert!(!listeners.iter().any(|l| l.port == 2211));

        let vpc = snapshot.vpc.clone().unwrap();
        let groups = sim.list_target_groups(&vpc.id).await.unwrap();
        assert!(groups.iter().any(|g| g.name == "demo-ssh-tcp-2211"));
    }

    #[tokio::test]
    async fn removed_rule_cleans_up_group_and_listener() {
        let sim = SimCloud::new("us-west-2");
        let mut definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        let original = definition.clone();
        let reconciler = IngressReconciler {
            api: &sim,
            namer: &namer,
            definition: &original,
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        };
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();

        // Drop the web rule and reconcile with the updated definition.
        definition.network.ingress_rules.clear();
        let reconciler = IngressReconciler {
            api: &sim,
            namer: &namer,
            definition: &definition,
            poll: PollConfig::fast(),
            cancel: CancelFlag::new(),
        };
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();

        let vpc = snapshot.vpc.clone().unwrap();
        let groups = sim.list_target_groups(&vpc.id).await.unwrap();
        assert!(!groups.iter().any(|g| g.name == "demo-user-tcp-30080"));

        let balancer = snapshot.load_balancer.clone().unwrap();
        let listeners = sim.list_listeners(&balancer.id).await.unwrap();
        assert!(!listeners.iter().any(|l| l.port == 80));
    }

    #[tokio::test]
    async fn waits_for_targets_to_turn_healthy() {
        let sim = SimCloud::new("us-west-2");
        let definition = definition();
        let namer = ResourceNamer::new(&definition);
        let (mut snapshot, ports) = provision(&sim, &definition).await;

        let reconciler = reconciler(&sim, &namer, &definition);
        reconciler.ensure(&mut snapshot, &ports, false).await.unwrap();
        reconciler.wait_healthy(&snapshot).await.unwrap();
    }
}
