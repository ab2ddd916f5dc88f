//! Cluster hosting manager.
//!
//! [`CloudHostingManager`] drives the full cluster lifecycle against a
//! [`CloudApi`]: an ordered pipeline of idempotent provisioning steps,
//! post-provisioning cleanup, start/stop, SSH access toggling, and
//! teardown. Every step re-discovers current state before mutating, so
//! an interrupted run resumes by simply running the manager again.
//!
//! Providers are selected through the explicit
//! [`crate::provider::ProviderRegistry`]; the manager itself is
//! provider-agnostic.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::acl::AclReconciler;
use crate::definition::{ClusterDefinition, NodeRole};
use crate::discovery::{discover, ResourceSnapshot};
use crate::ingress::{effective_rules, IngressReconciler};
use crate::instance::InstanceReconciler;
use crate::names::{ResourceNamer, NAME_TAG};
use crate::network::NetworkReconciler;
use crate::placement::assign_partitions;
use crate::ports::assign_ssh_ports;
use crate::provider::{CloudApi, InstanceState, TagFilter};
use crate::retry::{poll_until, retry_with_backoff, CancelFlag, PollConfig, RetryConfig};
use crate::steps::{LogRecorder, Pipeline, StepFn, StepRecorder};
use crate::{Error, Result};

/// Tunables for a hosting manager
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    /// Initial node credential baked into each node's boot payload
    pub node_password: String,
    /// Upper bound on nodes touched concurrently by per-node steps
    pub node_parallelism: usize,
    /// Poll bounds for slow provider transitions
    pub poll: PollConfig,
    /// Retry policy for transient provider failures
    pub retry: RetryConfig,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            node_password: String::new(),
            node_parallelism: 8,
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Whether a cluster can be deployed, with any blocking constraints
#[derive(Clone, Debug, Default)]
pub struct ResourceAvailability {
    /// True when nothing blocks deployment
    pub deployable: bool,
    /// Human-readable reasons when not deployable
    pub constraints: Vec<String>,
}

/// Cluster lifecycle operations offered by every hosting backend
#[async_trait]
pub trait HostingManager: Send + Sync {
    /// Whether the backend can host this cluster as defined
    async fn resource_availability(&self) -> Result<ResourceAvailability>;

    /// Provision the cluster to match its definition; safe to re-run
    async fn provision(&self) -> Result<()>;

    /// Start every stopped node instance
    async fn start_cluster(&self) -> Result<()>;

    /// Stop every running node instance
    async fn stop_cluster(&self) -> Result<()>;

    /// Tear down every resource the cluster owns
    async fn remove_cluster(&self) -> Result<()>;

    /// Open external SSH access through the load balancer
    async fn enable_ssh(&self) -> Result<()>;

    /// Close external SSH access
    async fn disable_ssh(&self) -> Result<()>;

    /// The public address and port a node's SSH is reachable on
    async fn ssh_endpoint(&self, node_name: &str) -> Result<(Ipv4Addr, u16)>;

    /// The cluster's public ingress address
    async fn cluster_address(&self) -> Result<Ipv4Addr>;
}

/// Shared mutable state threaded through the provisioning pipeline
#[derive(Default)]
struct ProvisionState {
    snapshot: ResourceSnapshot,
    image_id: String,
    ssh_ports: HashMap<String, u16>,
}

/// Hosting manager for tag-discoverable cloud providers
pub struct CloudHostingManager {
    api: Arc<dyn CloudApi>,
    definition: ClusterDefinition,
    namer: ResourceNamer,
    options: ManagerOptions,
    recorder: Arc<dyn StepRecorder>,
    cancel: CancelFlag,
}

impl CloudHostingManager {
    /// Validate the definition and construct a manager. The definition's
    /// ingress node marking is normalized here; topology problems are
    /// rejected before anything touches the provider.
    pub fn new(
        api: Arc<dyn CloudApi>,
        definition: ClusterDefinition,
        options: ManagerOptions,
    ) -> Result<Self> {
        Self::with_recorder(api, definition, options, Arc::new(LogRecorder))
    }

    /// [`Self::new`] with an injected step recorder
    pub fn with_recorder(
        api: Arc<dyn CloudApi>,
        mut definition: ClusterDefinition,
        options: ManagerOptions,
        recorder: Arc<dyn StepRecorder>,
    ) -> Result<Self> {
        if options.node_password.is_empty() {
            return Err(Error::validation("node password must not be empty"));
        }

        definition.ensure_ingress_nodes();
        definition.validate()?;

        let namer = ResourceNamer::new(&definition);
        // Balancer names are derived from the cluster name; fail fast on
        // an overlong one before provisioning starts.
        namer.load_balancer_name()?;

        Ok(Self {
            api,
            definition,
            namer,
            options,
            recorder,
            cancel: CancelFlag::new(),
        })
    }

    /// The cancellation flag; cancel it to stop a running operation at
    /// its next step or poll boundary
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// The normalized definition the manager operates on
    pub fn definition(&self) -> &ClusterDefinition {
        &self.definition
    }

    /// Confirm the target region exists and every node's instance type is
    /// offered there
    pub async fn verify_capacity(&self) -> Result<()> {
        let api = self.api.as_ref();

        let regions =
            retry_with_backoff(&self.options.retry, "list regions", move || api.list_regions())
                .await?;
        if !regions.contains(&self.definition.cloud.region) {
            return Err(Error::validation(format!(
                "region [{}] is not available",
                self.definition.cloud.region
            )));
        }

        let types = retry_with_backoff(&self.options.retry, "list instance types", move || {
            api.list_instance_types()
        })
        .await?;

        for node in &self.definition.nodes {
            let wanted = node
                .instance_type
                .as_deref()
                .unwrap_or(&self.definition.cloud.default_instance_type);

            if !types.iter().any(|t| t.name == wanted) {
                return Err(Error::capacity(format!(
                    "instance type [{wanted}] for node [{}] is not offered in region [{}]",
                    node.name, self.definition.cloud.region
                )));
            }
        }

        Ok(())
    }

    /// Resolve the node machine image named by the definition
    pub async fn resolve_image(&self) -> Result<String> {
        let api = self.api.as_ref();
        let filter = TagFilter::new(NAME_TAG, self.definition.cloud.node_image.as_str());

        let filter = &filter;
        let images = retry_with_backoff(&self.options.retry, "list images", move || {
            api.list_images(filter)
        })
        .await?;

        images
            .first()
            .map(|image| image.id.clone())
            .ok_or_else(|| {
                Error::validation(format!(
                    "node image [{}] was not found",
                    self.definition.cloud.node_image
                ))
            })
    }

    async fn take_snapshot(&self) -> Result<ResourceSnapshot> {
        discover(self.api.as_ref(), &self.namer).await
    }

    /// Placement group name and partition for one node
    fn placement_for(&self, node_name: &str) -> Result<(String, u32)> {
        let node = self
            .definition
            .node(node_name)
            .ok_or_else(|| Error::validation(format!("unknown node [{node_name}]")))?;

        let (group, nodes, count) = match node.role {
            NodeRole::ControlPlane => (
                self.namer.control_plane_placement_group(),
                self.definition.sorted_nodes(NodeRole::ControlPlane),
                self.definition.control_plane_partitions(),
            ),
            NodeRole::Worker => (
                self.namer.worker_placement_group(),
                self.definition.sorted_nodes(NodeRole::Worker),
                self.definition.worker_partitions(),
            ),
        };

        let partitions = assign_partitions(&nodes, count);
        let partition = partitions.get(node_name).copied().unwrap_or(1);
        Ok((group, partition))
    }

    async fn ensure_placement_groups(&self, snapshot: &ResourceSnapshot) -> Result<()> {
        let wanted = [
            (
                &snapshot.control_plane_placement,
                self.namer.control_plane_placement_group(),
                self.definition.control_plane_partitions(),
            ),
            (
                &snapshot.worker_placement,
                self.namer.worker_placement_group(),
                self.definition.worker_partitions(),
            ),
        ];

        for (existing, name, partitions) in wanted {
            if existing.is_none() {
                self.api
                    .create_placement_group(&name, partitions, self.namer.tags(&name))
                    .await?;
                info!(group = %name, partitions, "created placement group");
            }
        }

        Ok(())
    }

    fn instance_reconciler<'a>(
        &'a self,
        image_id: String,
    ) -> InstanceReconciler<'a> {
        InstanceReconciler {
            api: self.api.as_ref(),
            namer: &self.namer,
            definition: &self.definition,
            image_id,
            node_password: self.options.node_password.clone(),
            poll: self.options.poll.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn ingress_reconciler(&self) -> IngressReconciler<'_> {
        IngressReconciler {
            api: self.api.as_ref(),
            namer: &self.namer,
            definition: &self.definition,
            poll: self.options.poll.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Wait until one instance reports running and ready
    async fn wait_instance_running(&self, instance_id: &str) -> Result<()> {
        let api = self.api.as_ref();

        poll_until(
            &self.options.poll,
            &self.cancel,
            "instance running",
            move || async move {
                match api.describe_instance_status(&instance_id.to_string()).await? {
                    Some(status) if status.state == InstanceState::Running && status.ready => {
                        Ok(Some(()))
                    }
                    Some(status) if status.state.is_unexpected_during_provisioning() => {
                        Err(Error::provider(format!(
                            "instance [{instance_id}] entered unexpected state [{:?}]",
                            status.state
                        )))
                    }
                    _ => Ok(None),
                }
            },
        )
        .await
    }

    /// Wait until one instance reports stopped
    async fn wait_instance_stopped(&self, instance_id: &str) -> Result<()> {
        let api = self.api.as_ref();

        poll_until(
            &self.options.poll,
            &self.cancel,
            "instance stopped",
            move || async move {
                match api.describe_instance_status(&instance_id.to_string()).await? {
                    Some(status) if status.state == InstanceState::Stopped => Ok(Some(())),
                    _ => Ok(None),
                }
            },
        )
        .await
    }
}

#[async_trait]
impl HostingManager for CloudHostingManager {
    async fn resource_availability(&self) -> Result<ResourceAvailability> {
        // Cloud capacity is elastic; the only hard constraints are the
        // region and its instance-type offerings.
        match self.verify_capacity().await {
            Ok(()) => Ok(ResourceAvailability {
                deployable: true,
                constraints: Vec::new(),
            }),
            Err(e @ (Error::Validation(_) | Error::Capacity(_))) => Ok(ResourceAvailability {
                deployable: false,
                constraints: vec![e.to_string()],
            }),
            Err(e) => Err(e),
        }
    }

    async fn provision(&self) -> Result<()> {
        let state = Arc::new(Mutex::new(ProvisionState::default()));
        let mut pipeline = Pipeline::new(
            self.recorder.clone(),
            self.cancel.clone(),
            self.options.node_parallelism,
        );

        pipeline.add_global("verify region and capacity", move || self.verify_capacity());

        pipeline.add_global("resolve node image", {
            let state = state.clone();
            move || async move {
                state.lock().await.image_id = self.resolve_image().await?;
                Ok(())
            }
        });

        pipeline.add_global("discover cluster resources", {
            let state = state.clone();
            move || async move {
                state.lock().await.snapshot = self.take_snapshot().await?;
                Ok(())
            }
        });

        pipeline.add_global("provision network", {
            let state = state.clone();
            move || async move {
                let mut state = state.lock().await;
                NetworkReconciler {
                    api: self.api.as_ref(),
                    namer: &self.namer,
                    definition: &self.definition,
                    poll: self.options.poll.clone(),
                    cancel: self.cancel.clone(),
                }
                .ensure(&mut state.snapshot)
                .await
            }
        });

        pipeline.add_global("ensure placement groups", {
            let state = state.clone();
            move || async move {
                let state = state.lock().await;
                self.ensure_placement_groups(&state.snapshot).await
            }
        });

        pipeline.add_global("assign external ssh ports", {
            let state = state.clone();
            move || async move {
                let mut state = state.lock().await;
                state.ssh_ports = assign_ssh_ports(&self.definition, &state.snapshot.ssh_ports)?;
                Ok(())
            }
        });

        pipeline.add_global("install network acls", {
            let state = state.clone();
            move || async move {
                let mut state = state.lock().await;
                let rules = effective_rules(&self.definition);
                let ssh_enabled = state.snapshot.ssh_enabled;
                AclReconciler {
                    api: self.api.as_ref(),
                    namer: &self.namer,
                    definition: &self.definition,
                }
                .ensure(&mut state.snapshot, &rules, ssh_enabled)
                .await
            }
        });

        let node_runs: Vec<(String, StepFn<'_>)> = self
            .definition
            .sorted_control_plane_then_workers()
            .into_iter()
            .map(|node| {
                let state = state.clone();
                let name = node.name.clone();
                let run: StepFn<'_> = Box::new(move || {
                    Box::pin(async move {
                        let (snapshot, image_id, port) = {
                            let state = state.lock().await;
                            let port = *state.ssh_ports.get(&name).ok_or_else(|| {
                                Error::node_failure(name.as_str(), "no ssh port assigned")
                            })?;
                            (state.snapshot.clone(), state.image_id.clone(), port)
                        };

                        let (group, partition) = self.placement_for(&name)?;
                        self.instance_reconciler(image_id)
                            .ensure_node(&snapshot, node, &group, partition, port)
                            .await?;
                        Ok(())
                    })
                });
                (node.name.clone(), run)
            })
            .collect();
        pipeline.add_per_node("provision node instances", node_runs);

        pipeline.add_global("refresh discovery", {
            let state = state.clone();
            move || async move {
                let mut state = state.lock().await;
                state.snapshot = self.take_snapshot().await?;
                Ok(())
            }
        });

        pipeline.add_global("configure load balancer", {
            let state = state.clone();
            move || async move {
                let mut state = state.lock().await;
                let ProvisionState {
                    ref mut snapshot,
                    ref ssh_ports,
                    ..
                } = *state;
                let ssh_enabled = snapshot.ssh_enabled;
                self.ingress_reconciler()
                    .ensure(snapshot, ssh_ports, ssh_enabled)
                    .await
            }
        });

        pipeline.add_global("wait for target health", {
            let state = state.clone();
            move || async move {
                let state = state.lock().await;
                self.ingress_reconciler().wait_healthy(&state.snapshot).await
            }
        });

        let cleanup_runs: Vec<(String, StepFn<'_>)> = self
            .definition
            .sorted_control_plane_then_workers()
            .into_iter()
            .map(|node| {
                let state = state.clone();
                let name = node.name.clone();
                let run: StepFn<'_> = Box::new(move || {
                    Box::pin(async move {
                        let instance = {
                            let state = state.lock().await;
                            state.snapshot.instance(&name).cloned()
                        };

                        let Some(instance) = instance else {
                            return Err(Error::node_failure(
                                name.as_str(),
                                "instance missing after provisioning",
                            ));
                        };

                        let image_id = state.lock().await.image_id.clone();
                        self.instance_reconciler(image_id)
                            .clear_boot_payload(&instance)
                            .await
                    })
                });
                (node.name.clone(), run)
            })
            .collect();
        pipeline.add_per_node("clear boot payloads", cleanup_runs);

        pipeline.run().await?;
        info!(cluster = %self.namer.cluster(), "cluster provisioned");
        Ok(())
    }

    async fn start_cluster(&self) -> Result<()> {
        let snapshot = self.take_snapshot().await?;

        for (name, instance) in &snapshot.instances {
            if instance.state.is_stopped() {
                info!(node = %name, "starting instance");
                self.api.start_instance(&instance.id).await?;
            }
        }

        for instance in snapshot.instances.values() {
            self.wait_instance_running(&instance.id).await?;
        }

        Ok(())
    }

    async fn stop_cluster(&self) -> Result<()> {
        let snapshot = self.take_snapshot().await?;

        for (name, instance) in &snapshot.instances {
            if !instance.state.is_stopped() {
                info!(node = %name, "stopping instance");
                self.api.stop_instance(&instance.id).await?;
            }
        }

        for instance in snapshot.instances.values() {
            self.wait_instance_stopped(&instance.id).await?;
        }

        Ok(())
    }

    async fn remove_cluster(&self) -> Result<()> {
        let snapshot = self.take_snapshot().await?;
        let api = self.api.as_ref();

        // Balancer first so nothing routes to dying instances.
        if let Some(balancer) = &snapshot.load_balancer {
            api.delete_load_balancer(&balancer.id).await?;
        }

        if let Some(vpc) = &snapshot.vpc {
            for group in api.list_target_groups(&vpc.id).await? {
                if self.namer.cluster_filter().matches(&group.tags) {
                    api.delete_target_group(&group.id).await?;
                }
            }
        }

        for instance in snapshot.instances.values() {
            api.terminate_instance(&instance.id).await?;
        }

        for name in [
            self.namer.control_plane_placement_group(),
            self.namer.worker_placement_group(),
        ] {
            api.delete_placement_group(&name).await?;
        }

        if let Some(gateway) = &snapshot.nat_gateway {
            api.delete_nat_gateway(&gateway.id).await?;
        }
        if let Some(gateway) = &snapshot.internet_gateway {
            api.delete_internet_gateway(&gateway.id).await?;
        }
        for acl in [&snapshot.acl_a, &snapshot.acl_b].into_iter().flatten() {
            api.delete_network_acl(&acl.id).await?;
        }
        for subnet in [&snapshot.public_subnet, &snapshot.node_subnet]
            .into_iter()
            .flatten()
        {
            api.delete_subnet(&subnet.id).await?;
        }
        for table in [&snapshot.public_route_table, &snapshot.node_route_table]
            .into_iter()
            .flatten()
        {
            api.delete_route_table(&table.id).await?;
        }
        if let Some(group) = &snapshot.security_group {
            api.delete_security_group(&group.id).await?;
        }
        if let Some(vpc) = &snapshot.vpc {
            api.delete_vpc(&vpc.id).await?;
        }
        for address in [&snapshot.ingress_address, &snapshot.egress_address]
            .into_iter()
            .flatten()
        {
            api.release_address(&address.id).await?;
        }

        info!(cluster = %self.namer.cluster(), "cluster removed");
        Ok(())
    }

    async fn enable_ssh(&self) -> Result<()> {
        let mut snapshot = self.take_snapshot().await?;
        let rules = effective_rules(&self.definition);

        AclReconciler {
            api: self.api.as_ref(),
            namer: &self.namer,
            definition: &self.definition,
        }
        .ensure(&mut snapshot, &rules, true)
        .await?;

        let ports = assign_ssh_ports(&self.definition, &snapshot.ssh_ports)?;
        self.ingress_reconciler().ensure(&mut snapshot, &ports, true).await
    }

    async fn disable_ssh(&self) -> Result<()> {
        let mut snapshot = self.take_snapshot().await?;
        let rules = effective_rules(&self.definition);

        AclReconciler {
            api: self.api.as_ref(),
            namer: &self.namer,
            definition: &self.definition,
        }
        .ensure(&mut snapshot, &rules, false)
        .await?;

        let ports = assign_ssh_ports(&self.definition, &snapshot.ssh_ports)?;
        self.ingress_reconciler().ensure(&mut snapshot, &ports, false).await
    }

    async fn ssh_endpoint(&self, node_name: &str) -> Result<(Ipv4Addr, u16)> {
        let snapshot = self.take_snapshot().await?;

        let address = snapshot
            .ingress_address
            .as_ref()
            .ok_or_else(|| Error::provider("ingress address has not been provisioned yet"))?;

        let port = snapshot.ssh_ports.get(node_name).copied().ok_or_else(|| {
            Error::validation(format!("node [{node_name}] has no assigned ssh port"))
        })?;

        Ok((address.public_ip, port))
    }

    async fn cluster_address(&self) -> Result<Ipv4Addr> {
        let snapshot = self.take_snapshot().await?;
        snapshot
            .ingress_address
            .as_ref()
            .map(|a| a.public_ip)
            .ok_or_else(|| Error::provider("ingress address has not been provisioned yet"))
    }
}
