//! Declarative cluster definition model
//!
//! These types describe the desired cluster: node roles and counts,
//! per-node sizing and placement hints, and the network policy (subnets,
//! ingress rules, the external SSH port range, address filters). The
//! definition is the immutable input to a hosting manager; the engine
//! never mutates it after validation.

mod cluster;
mod types;

pub use cluster::{ClusterDefinition, CloudOptions, NodeDefinition};
pub use types::{
    AddressRule, AddressRuleAction, HealthCheck, IngressProtocol, IngressRule, IngressTarget,
    NetworkOptions, NodeRole, VolumeSpec,
};
