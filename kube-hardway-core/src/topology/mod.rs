use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use ipnet::Ipv4Net;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

pub mod addressing;

pub use addressing::{node_address, role_capacity};

/// Roles are declared in installation order: etcd, then controllers, then workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Etcd,
    Controller,
    Worker,
}

impl NodeRole {
    pub const ALL: [NodeRole; 3] = [NodeRole::Etcd, NodeRole::Controller, NodeRole::Worker];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Etcd => "etcd",
            NodeRole::Controller => "controller",
            NodeRole::Worker => "worker",
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct InvalidNodeRole(pub String);

impl Display for InvalidNodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}' is not a valid node role!", self.0)
    }
}

impl std::error::Error for InvalidNodeRole {}

impl FromStr for NodeRole {
    type Err = InvalidNodeRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "etcd" => Ok(NodeRole::Etcd),
            "controller" => Ok(NodeRole::Controller),
            "worker" => Ok(NodeRole::Worker),
            other => Err(InvalidNodeRole(other.to_owned())),
        }
    }
}

/// Static address allocation rule of a single role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSpec {
    /// number of nodes with this role
    pub count: u32,
    /// sub-range of the network CIDR reserved for this role
    pub address_range: Ipv4Net,
    /// offset of the first node's address from the start of the range
    #[serde(default = "default_first_host_offset")]
    pub first_host_offset: u32,
    /// instance size passed to the provider as-is
    #[serde(default)]
    pub instance_type: Option<String>,
}

fn default_first_host_offset() -> u32 {
    0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTopology {
    /// cluster identifier, used for resource names and run locking
    pub name: String,
    /// infrastructure network
    pub network_cidr: Ipv4Net,
    pub etcd: RoleSpec,
    pub controller: RoleSpec,
    pub worker: RoleSpec,
    /// the only external range allowed to reach the cluster
    pub allowed_ingress: Ipv4Net,
    /// range the control plane carves per-node pod subnets from
    pub pod_cidr: Ipv4Net,
    /// range of in-cluster service addresses
    pub service_cidr: Ipv4Net,
    /// public DNS name of the API endpoint, if any
    #[serde(default)]
    pub cluster_dns_name: Option<String>,
}

impl ClusterTopology {
    pub fn role(&self, role: NodeRole) -> &RoleSpec {
        match role {
            NodeRole::Etcd => &self.etcd,
            NodeRole::Controller => &self.controller,
            NodeRole::Worker => &self.worker,
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = (NodeRole, &RoleSpec)> {
        NodeRole::ALL.into_iter().map(|role| (role, self.role(role)))
    }

    pub fn node_count(&self) -> u32 {
        self.roles().map(|(_, spec)| spec.count).sum()
    }

    /// First usable address of the service range, taken by the `kubernetes` service.
    pub fn kubernetes_service_address(&self) -> Option<std::net::Ipv4Addr> {
        self.service_cidr.hosts().next()
    }

    /// Tenth address of the service range, the conventional cluster DNS service address.
    pub fn dns_service_address(&self) -> Option<std::net::Ipv4Addr> {
        self.service_cidr.hosts().nth(9)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        debug!("Validating '{}' cluster topology...", self.name);

        if !is_dns_label(&self.name) {
            return Err(ConfigurationError::InvalidClusterName(self.name.clone()));
        }

        for (role, spec) in self.roles() {
            if spec.count == 0 {
                return Err(ConfigurationError::EmptyRole(role));
            }

            if !self.network_cidr.contains(&spec.address_range) {
                return Err(ConfigurationError::RoleRangeOutsideNetwork {
                    role,
                    range: spec.address_range,
                    network: self.network_cidr,
                });
            }

            let capacity = role_capacity(spec);
            if spec.count > capacity {
                return Err(ConfigurationError::RoleRangeExhausted {
                    role,
                    count: spec.count,
                    capacity,
                });
            }

            for index in 0..spec.count {
                node_address(self, role, index)?;
            }
        }

        let roles = self.roles().collect::<Vec<_>>();
        for (i, (first, first_spec)) in roles.iter().enumerate() {
            for (second, second_spec) in roles.iter().skip(i + 1) {
                if overlaps(&first_spec.address_range, &second_spec.address_range) {
                    return Err(ConfigurationError::OverlappingRoleRanges {
                        first: *first,
                        first_range: first_spec.address_range,
                        second: *second,
                        second_range: second_spec.address_range,
                    });
                }
            }
        }

        if overlaps(&self.pod_cidr, &self.network_cidr) {
            return Err(ConfigurationError::PodRangeOverlapsNetwork {
                pod_cidr: self.pod_cidr,
                network: self.network_cidr,
            });
        }

        for other in [self.network_cidr, self.pod_cidr] {
            if overlaps(&self.service_cidr, &other) {
                return Err(ConfigurationError::ServiceRangeOverlaps {
                    service_cidr: self.service_cidr,
                    other,
                });
            }
        }

        if self.allowed_ingress.prefix_len() == 0 {
            return Err(ConfigurationError::UnrestrictedIngress {
                rule: "allowedIngress".to_owned(),
                source_cidr: self.allowed_ingress,
            });
        }

        Ok(())
    }
}

/// Two CIDR blocks either nest or are disjoint, so checking both network addresses is enough.
pub fn overlaps(first: &Ipv4Net, second: &Ipv4Net) -> bool {
    first.contains(&second.network()) || second.contains(&first.network())
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::error::ConfigurationError;

    use super::{overlaps, ClusterTopology, NodeRole, RoleSpec};

    pub fn sample_topology() -> ClusterTopology {
        ClusterTopology {
            name: "hardway".to_owned(),
            network_cidr: "10.43.0.0/16".parse().unwrap(),
            etcd: RoleSpec {
                count: 3,
                address_range: "10.43.0.16/28".parse().unwrap(),
                first_host_offset: 4,
                instance_type: None,
            },
            controller: RoleSpec {
                count: 3,
                address_range: "10.43.0.0/28".parse().unwrap(),
                first_host_offset: 10,
                instance_type: None,
            },
            worker: RoleSpec {
                count: 3,
                address_range: "10.43.0.32/27".parse().unwrap(),
                first_host_offset: 0,
                instance_type: None,
            },
            allowed_ingress: "203.0.113.0/24".parse().unwrap(),
            pod_cidr: "10.200.0.0/16".parse().unwrap(),
            service_cidr: "10.32.0.0/24".parse().unwrap(),
            cluster_dns_name: Some("hardway.example.com".to_owned()),
        }
    }

    #[test]
    fn sample_topology_is_valid() {
        sample_topology().validate().unwrap();
    }

    #[test]
    fn overlapping_etcd_and_controller_ranges_are_rejected() {
        let mut topology = sample_topology();
        topology.etcd.address_range = "10.43.0.8/29".parse().unwrap();

        let error = topology.validate().unwrap_err();

        assert!(matches!(
            error,
            ConfigurationError::OverlappingRoleRanges {
                first: NodeRole::Etcd,
                second: NodeRole::Controller,
                ..
            }
        ));
    }

    #[test]
    fn node_on_the_network_address_is_rejected_up_front() {
        let mut topology = sample_topology();
        topology.controller.first_host_offset = 0;

        assert_eq!(
            topology.validate(),
            Err(ConfigurationError::NodeIndexOutOfRange {
                role: NodeRole::Controller,
                index: 0
            })
        );
    }

    #[test]
    fn node_on_the_broadcast_address_is_rejected_up_front() {
        let mut topology = sample_topology();
        topology.network_cidr = "10.43.0.0/26".parse().unwrap();
        topology.worker.first_host_offset = 29;

        assert_eq!(
            topology.validate(),
            Err(ConfigurationError::NodeIndexOutOfRange {
                role: NodeRole::Worker,
                index: 2
            })
        );
    }

    #[test]
    fn empty_role_is_rejected() {
        let mut topology = sample_topology();
        topology.worker.count = 0;

        assert_eq!(
            topology.validate(),
            Err(ConfigurationError::EmptyRole(NodeRole::Worker))
        );
    }

    #[test]
    fn pod_range_inside_network_is_rejected() {
        let mut topology = sample_topology();
        topology.pod_cidr = "10.43.128.0/17".parse().unwrap();

        assert!(matches!(
            topology.validate(),
            Err(ConfigurationError::PodRangeOverlapsNetwork { .. })
        ));
    }

    #[test]
    fn unrestricted_ingress_is_rejected() {
        let mut topology = sample_topology();
        topology.allowed_ingress = "0.0.0.0/0".parse().unwrap();

        assert!(matches!(
            topology.validate(),
            Err(ConfigurationError::UnrestrictedIngress { .. })
        ));
    }

    #[test]
    fn role_range_too_small_is_rejected() {
        let mut topology = sample_topology();
        topology.controller.count = 7;

        assert!(matches!(
            topology.validate(),
            Err(ConfigurationError::RoleRangeExhausted {
                role: NodeRole::Controller,
                count: 7,
                ..
            })
        ));
    }

    #[test]
    fn overlap_detects_nested_and_ignores_adjacent_blocks() {
        let net = |raw: &str| raw.parse().unwrap();

        assert!(overlaps(&net("10.0.0.0/8"), &net("10.1.2.0/24")));
        assert!(overlaps(&net("10.1.2.0/24"), &net("10.0.0.0/8")));
        assert!(!overlaps(&net("10.43.0.0/28"), &net("10.43.0.16/28")));
    }
}
