//! Idempotent cluster hosting engine.
//!
//! This crate provisions and manages the lifecycle of clusters on cloud
//! infrastructure. The core design is a tag-based reconciliation loop:
//! every provisioning operation first discovers what already exists by
//! listing provider resources tagged with the cluster name, then creates
//! only what is missing. The engine itself is stateless between runs;
//! all resumable state (assigned SSH ports, the SSH-enabled flag, node
//! identity) is persisted in the tags of the provider resources, so an
//! interrupted run can be restarted from scratch and converges to the
//! same result.
//!
//! Modules:
//!
//! - [`definition`]: the declarative cluster model (nodes, network policy)
//! - [`provider`]: the abstract cloud API and its in-memory simulator
//! - [`names`]: deterministic resource naming and the tag schema
//! - [`discovery`]: the tag-filtered resource snapshot
//! - [`network`], [`acl`]: VPC topology and network ACL rotation
//! - [`placement`], [`ports`]: partition packing and SSH port assignment
//! - [`instance`], [`ingress`]: node instances and the load balancer
//! - [`steps`]: the idempotent step pipeline
//! - [`manager`]: the hosting manager tying the pieces together

pub mod acl;
pub mod definition;
pub mod discovery;
pub mod error;
pub mod ingress;
pub mod instance;
pub mod manager;
pub mod names;
pub mod network;
pub mod placement;
pub mod ports;
pub mod provider;
pub mod retry;
pub mod steps;

pub use error::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Default port nodes listen on for SSH
pub const INTERNAL_SSH_PORT: u16 = 22;

/// Node port of the cluster management API endpoint
pub const MANAGEMENT_NODE_PORT: u16 = 6443;

/// External balancer port of the cluster management API endpoint
pub const MANAGEMENT_EXTERNAL_PORT: u16 = 6443;
