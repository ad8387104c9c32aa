use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
};

use data_encoding::HEXLOWER;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::ConfigurationError,
    node::NodeId,
    topology::{node_address, ClusterTopology, NodeRole},
};

pub const API_SERVER_PORT: u16 = 6443;
pub const SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Network,
    Subnet,
    SecurityRule,
    IamRole,
    Instance,
    LoadBalancer,
}

impl ResourceKind {
    /// Resources of a lower tier must exist before any resource of a higher one is created.
    pub fn tier(&self) -> u8 {
        match self {
            ResourceKind::Network => 0,
            ResourceKind::Subnet => 1,
            ResourceKind::SecurityRule | ResourceKind::IamRole => 2,
            ResourceKind::Instance => 3,
            ResourceKind::LoadBalancer => 4,
        }
    }

    /// Failures in these tiers leave nothing to attach the remaining resources to.
    pub fn is_foundation(&self) -> bool {
        self.tier() <= ResourceKind::Subnet.tier()
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::SecurityRule => "security-rule",
            ResourceKind::IamRole => "iam-role",
            ResourceKind::Instance => "instance",
            ResourceKind::LoadBalancer => "load-balancer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn instance(node: &NodeId) -> Self {
        Self::new(ResourceKind::Instance, node.to_string())
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Tcp,
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResourceSpec {
    #[serde(rename_all = "camelCase")]
    Network { name: String, cidr: Ipv4Net },
    #[serde(rename_all = "camelCase")]
    Subnet {
        name: String,
        network: String,
        cidr: Ipv4Net,
    },
    #[serde(rename_all = "camelCase")]
    SecurityRule {
        name: String,
        network: String,
        source: Ipv4Net,
        protocol: Protocol,
        port: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    IamRole { name: String },
    #[serde(rename_all = "camelCase")]
    Instance {
        node: NodeId,
        role: NodeRole,
        subnet: String,
        private_address: Ipv4Addr,
        assign_public_address: bool,
        /// workers forward pod traffic for other nodes
        source_dest_check: bool,
        instance_type: Option<String>,
        iam_role: String,
    },
    #[serde(rename_all = "camelCase")]
    LoadBalancer {
        name: String,
        subnet: String,
        port: u16,
        targets: Vec<Ipv4Addr>,
    },
}

impl ResourceSpec {
    pub fn key(&self) -> ResourceKey {
        match self {
            ResourceSpec::Network { name, .. } => ResourceKey::new(ResourceKind::Network, name),
            ResourceSpec::Subnet { name, .. } => ResourceKey::new(ResourceKind::Subnet, name),
            ResourceSpec::SecurityRule { name, .. } => {
                ResourceKey::new(ResourceKind::SecurityRule, name)
            }
            ResourceSpec::IamRole { name } => ResourceKey::new(ResourceKind::IamRole, name),
            ResourceSpec::Instance { node, .. } => ResourceKey::instance(node),
            ResourceSpec::LoadBalancer { name, .. } => {
                ResourceKey::new(ResourceKind::LoadBalancer, name)
            }
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.key().kind
    }

    pub fn node(&self) -> Option<NodeId> {
        match self {
            ResourceSpec::Instance { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Digest of the serialized spec; a changed digest means the resource needs an update.
    pub fn fingerprint(&self) -> String {
        // serializing a plain data enum into memory doesn't fail
        let serialized = serde_json::to_vec(self).unwrap_or_default();

        HEXLOWER.encode(&Sha256::digest(&serialized))
    }
}

/// Document submitted to the provider for a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDocument {
    pub spec: ResourceSpec,
    pub fingerprint: String,
    /// provider id of the resource being updated
    pub existing_id: Option<String>,
}

impl ResourceDocument {
    pub fn new(spec: ResourceSpec, existing_id: Option<String>) -> Self {
        Self {
            fingerprint: spec.fingerprint(),
            spec,
            existing_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredState {
    pub cluster: String,
    pub resources: Vec<ResourceSpec>,
}

impl DesiredState {
    pub fn for_topology(topology: &ClusterTopology) -> Result<Self, ConfigurationError> {
        topology.validate()?;

        let cluster = topology.name.as_str();
        let network = cluster.to_owned();
        let subnet = format!("{cluster}-nodes");
        let iam_role = format!("{cluster}-node");

        let mut resources = vec![
            ResourceSpec::Network {
                name: network.clone(),
                cidr: topology.network_cidr,
            },
            ResourceSpec::Subnet {
                name: subnet.clone(),
                network: network.clone(),
                cidr: topology.network_cidr,
            },
            ResourceSpec::IamRole {
                name: iam_role.clone(),
            },
        ];

        let rule = |suffix: &str, source: Ipv4Net, protocol: Protocol, port: Option<u16>| {
            ResourceSpec::SecurityRule {
                name: format!("{cluster}-allow-{suffix}"),
                network: network.clone(),
                source,
                protocol,
                port,
            }
        };

        resources.extend([
            rule("internal", topology.network_cidr, Protocol::All, None),
            rule("pods", topology.pod_cidr, Protocol::All, None),
            rule("ssh", topology.allowed_ingress, Protocol::Tcp, Some(SSH_PORT)),
            rule("api", topology.allowed_ingress, Protocol::Tcp, Some(API_SERVER_PORT)),
            rule("icmp", topology.allowed_ingress, Protocol::Icmp, None),
        ]);

        let mut controller_addresses = Vec::new();
        for (role, spec) in topology.roles() {
            for index in 0..spec.count {
                let private_address = node_address(topology, role, index)?;

                if role == NodeRole::Controller {
                    controller_addresses.push(private_address);
                }

                resources.push(ResourceSpec::Instance {
                    node: NodeId::new(role, index),
                    role,
                    subnet: subnet.clone(),
                    private_address,
                    assign_public_address: true,
                    source_dest_check: role != NodeRole::Worker,
                    instance_type: spec.instance_type.clone(),
                    iam_role: iam_role.clone(),
                });
            }
        }

        resources.push(ResourceSpec::LoadBalancer {
            name: format!("{cluster}-api"),
            subnet,
            port: API_SERVER_PORT,
            targets: controller_addresses,
        });

        let desired = Self {
            cluster: cluster.to_owned(),
            resources,
        };
        desired.validate()?;

        Ok(desired)
    }

    /// Rejects any rule opening the cluster to the unrestricted range.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for resource in &self.resources {
            if let ResourceSpec::SecurityRule { name, source, .. } = resource {
                if source.prefix_len() == 0 {
                    return Err(ConfigurationError::UnrestrictedIngress {
                        rule: name.clone(),
                        source_cidr: *source,
                    });
                }
            }
        }

        Ok(())
    }

    pub fn instances(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources
            .iter()
            .filter(|resource| resource.kind() == ResourceKind::Instance)
    }
}
