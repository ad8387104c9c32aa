use ipnet::Ipv4Net;
use thiserror::Error;

use crate::topology::NodeRole;

pub use crate::{
    config::BootstrapConfigError,
    execution::ExecutionError,
    installer::InstallationError,
    lock::LockError,
    network::NetworkError,
    orchestrator::{OrchestrationError, RunFailure},
    pki::CertificationError,
    provisioner::{ProviderError, ProvisioningError},
    state::StateError,
};

/// Rejections raised before any provider call is made.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Cluster name '{}' is not a valid DNS label!", .0)]
    InvalidClusterName(String),
    #[error("Role '{}' must have at least one node!", .0)]
    EmptyRole(NodeRole),
    #[error("Address range {range} of role '{role}' is outside of the network CIDR {network}!")]
    RoleRangeOutsideNetwork {
        role: NodeRole,
        range: Ipv4Net,
        network: Ipv4Net,
    },
    #[error("Address ranges of roles '{first}' ({first_range}) and '{second}' ({second_range}) overlap!")]
    OverlappingRoleRanges {
        first: NodeRole,
        first_range: Ipv4Net,
        second: NodeRole,
        second_range: Ipv4Net,
    },
    #[error("Role '{role}' can fit {capacity} addresses in its range, but {count} nodes were requested!")]
    RoleRangeExhausted {
        role: NodeRole,
        count: u32,
        capacity: u32,
    },
    #[error("Pod CIDR {pod_cidr} overlaps the network CIDR {network}!")]
    PodRangeOverlapsNetwork { pod_cidr: Ipv4Net, network: Ipv4Net },
    #[error("Service CIDR {service_cidr} overlaps {other}!")]
    ServiceRangeOverlaps {
        service_cidr: Ipv4Net,
        other: Ipv4Net,
    },
    #[error("'{rule}' would allow ingress from the unrestricted range ({source_cidr})! Restrict it to a specific CIDR.")]
    UnrestrictedIngress { rule: String, source_cidr: Ipv4Net },
    #[error("Node index {index} is out of range for role '{role}'!")]
    NodeIndexOutOfRange { role: NodeRole, index: u32 },
}
