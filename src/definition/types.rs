//! Supporting types for the cluster definition

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Control-plane node
    ControlPlane,
    /// Worker node
    #[default]
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Protocol for an ingress rule. The engine deploys a network (L4) load
/// balancer, so HTTP and HTTPS both forward as plain TCP; the distinction
/// is kept for in-cluster routing layers.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngressProtocol {
    /// Raw TCP
    #[default]
    Tcp,
    /// HTTP (forwarded as TCP)
    Http,
    /// HTTPS (forwarded as TCP)
    Https,
}

impl IngressProtocol {
    /// The protocol as seen by the network load balancer
    pub fn as_balancer_protocol(&self) -> &'static str {
        "tcp"
    }
}

impl std::fmt::Display for IngressProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// The node population an ingress rule forwards to.
///
/// Serialized tokens are embedded in target group names and must never
/// contain a dash (the name format uses dashes as separators).
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IngressTarget {
    /// The control-plane nodes (cluster management traffic)
    Control,
    /// Nodes the definition marks for user ingress traffic
    User,
    /// A single node's external SSH forwarding (engine-managed; not valid
    /// in user ingress rules)
    Ssh,
}

impl std::fmt::Display for IngressTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::User => write!(f, "user"),
            Self::Ssh => write!(f, "ssh"),
        }
    }
}

/// Whether an address rule admits or rejects matching traffic
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressRuleAction {
    /// Admit traffic from the subnet
    Allow,
    /// Reject traffic from the subnet
    Deny,
}

/// Source address allow/deny entry applied to ingress or SSH traffic
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AddressRule {
    /// Allow or deny
    pub action: AddressRuleAction,
    /// The source subnet the rule matches
    pub subnet: Ipv4Net,
}

impl AddressRule {
    /// Allow traffic from the given subnet
    pub fn allow(subnet: Ipv4Net) -> Self {
        Self {
            action: AddressRuleAction::Allow,
            subnet,
        }
    }

    /// Deny traffic from the given subnet
    pub fn deny(subnet: Ipv4Net) -> Self {
        Self {
            action: AddressRuleAction::Deny,
            subnet,
        }
    }
}

/// Health-check policy for a load balancer target group
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct HealthCheck {
    /// Seconds between probes
    pub interval_seconds: u16,
    /// Consecutive probe results required to change target health
    pub threshold_count: u16,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            threshold_count: 2,
        }
    }
}

/// A single external traffic rule: external balancer port forwarded to a
/// node port on a target node population
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct IngressRule {
    /// Rule name (diagnostics only)
    pub name: String,
    /// Forwarding protocol
    #[serde(default)]
    pub protocol: IngressProtocol,
    /// Externally reachable balancer port
    pub external_port: u16,
    /// Port traffic is forwarded to on the target nodes
    pub node_port: u16,
    /// Which node population receives the traffic
    pub target: IngressTarget,
    /// Health-check override; the network default applies when absent
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    /// Source address allow/deny list for this rule
    #[serde(default)]
    pub address_rules: Vec<AddressRule>,
}

/// Cluster network policy
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkOptions {
    /// User ingress rules (the engine adds the cluster management rule)
    #[serde(default)]
    pub ingress_rules: Vec<IngressRule>,
    /// First port of the external SSH range reserved on the load balancer
    pub first_external_ssh_port: u16,
    /// Last port (inclusive) of the external SSH range
    pub last_external_ssh_port: u16,
    /// Nameservers configured on the nodes; the provider's resolver is
    /// used when empty
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    /// Source address rules applied to cluster management traffic
    #[serde(default)]
    pub management_address_rules: Vec<AddressRule>,
    /// Default health check for ingress target groups
    #[serde(default)]
    pub ingress_health_check: HealthCheck,
}

impl NetworkOptions {
    /// Returns true when `port` lies in the reserved external SSH range
    pub fn is_external_ssh_port(&self, port: u16) -> bool {
        self.first_external_ssh_port <= port && port <= self.last_external_ssh_port
    }

    /// Number of ports in the external SSH range
    pub fn external_ssh_port_count(&self) -> usize {
        (self.last_external_ssh_port as usize + 1)
            .saturating_sub(self.first_external_ssh_port as usize)
    }
}

/// Volume class and size for a node disk
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct VolumeSpec {
    /// Provider volume class (e.g. `gp2`)
    pub volume_type: String,
    /// Size in GiB
    pub size_gib: u32,
}

impl Default for VolumeSpec {
    fn default() -> Self {
        Self {
            volume_type: "gp2".to_string(),
            size_gib: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_target_tokens_never_contain_dashes() {
        for target in [IngressTarget::Control, IngressTarget::User, IngressTarget::Ssh] {
            assert!(
                !target.to_string().contains('-'),
                "target token {target} would corrupt target group names"
            );
        }
    }

    #[test]
    fn http_and_https_forward_as_tcp() {
        assert_eq!(IngressProtocol::Http.as_balancer_protocol(), "tcp");
        assert_eq!(IngressProtocol::Https.as_balancer_protocol(), "tcp");
        assert_eq!(IngressProtocol::Tcp.as_balancer_protocol(), "tcp");
    }

    #[test]
    fn ssh_port_range_is_inclusive() {
        let network = NetworkOptions {
            ingress_rules: vec![],
            first_external_ssh_port: 2211,
            last_external_ssh_port: 2220,
            nameservers: vec![],
            management_address_rules: vec![],
            ingress_health_check: HealthCheck::default(),
        };

        assert!(network.is_external_ssh_port(2211));
        assert!(network.is_external_ssh_port(2220));
        assert!(!network.is_external_ssh_port(2221));
        assert_eq!(network.external_ssh_port_count(), 10);
    }
}
