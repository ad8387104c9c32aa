use std::{collections::BTreeMap, net::Ipv4Addr, path::Path};

use ini::Ini;
use log::{debug, warn};
use serde::Serialize;

use crate::{
    node::{NodeId, NodeRecord, NodeStatus},
    topology::NodeRole,
};

pub const ALL_GROUP_NAME: &str = "all";
pub const EXCLUDED_GROUP_NAME: &str = "excluded";
pub const PUBLIC_ADDRESSES_GROUP_NAME: &str = "public";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryHost {
    pub id: NodeId,
    pub address: Ipv4Addr,
    pub public_address: Option<Ipv4Addr>,
}

impl InventoryHost {
    pub fn role(&self) -> NodeRole {
        self.id.role()
    }

    /// Hostname the node registers with, equal to its identifier.
    pub fn hostname(&self) -> String {
        self.id.to_string()
    }
}

/// Hosts of one role, sorted ascending by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InventoryGroup {
    hosts: Vec<InventoryHost>,
}

impl InventoryGroup {
    fn from_unsorted(mut hosts: Vec<InventoryHost>) -> Self {
        hosts.sort_by_key(|host| host.id);

        Self { hosts }
    }

    pub fn hosts(&self) -> &[InventoryHost] {
        &self.hosts
    }

    pub fn iter(&self) -> impl Iterator<Item = &InventoryHost> {
        self.hosts.iter()
    }

    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.hosts.iter().map(|host| host.address).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn get(&self, id: &NodeId) -> Option<&InventoryHost> {
        self.hosts.iter().find(|host| &host.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExclusionReason {
    NotReady(NodeStatus),
    MissingAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedNode {
    pub id: NodeId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    groups: BTreeMap<NodeRole, InventoryGroup>,
    all: InventoryGroup,
    excluded: Vec<ExcludedNode>,
}

impl Inventory {
    /// Groups ready nodes by role, using nothing but the records themselves.
    ///
    /// Nodes that aren't ready, or don't have a private address yet, are
    /// kept out of every group and listed in [`Inventory::excluded`].
    pub fn resolve<'a>(records: impl IntoIterator<Item = &'a NodeRecord>) -> Self {
        let mut by_role: BTreeMap<NodeRole, Vec<InventoryHost>> = BTreeMap::new();
        let mut excluded = Vec::new();

        for record in records {
            let reason = match (record.status, record.private_address) {
                (NodeStatus::Ready, Some(address)) => {
                    by_role.entry(record.role).or_default().push(InventoryHost {
                        id: record.id,
                        address,
                        public_address: record.public_address,
                    });

                    continue;
                }
                (NodeStatus::Ready, None) => ExclusionReason::MissingAddress,
                (status, _) => ExclusionReason::NotReady(status),
            };

            warn!(
                "Excluding '{}' from the inventory ({reason:?})!",
                record.id
            );
            excluded.push(ExcludedNode {
                id: record.id,
                reason,
            });
        }

        excluded.sort_by_key(|node| node.id);

        let all = InventoryGroup::from_unsorted(by_role.values().flatten().cloned().collect());
        let groups = NodeRole::ALL
            .into_iter()
            .map(|role| {
                (
                    role,
                    InventoryGroup::from_unsorted(by_role.remove(&role).unwrap_or_default()),
                )
            })
            .collect();

        debug!(
            "Resolved inventory: {} host(s), {} excluded",
            all.len(),
            excluded.len()
        );

        Self {
            groups,
            all,
            excluded,
        }
    }

    pub fn group(&self, role: NodeRole) -> &InventoryGroup {
        // every role gets a (possibly empty) group in `resolve`
        &self.groups[&role]
    }

    pub fn all(&self) -> &InventoryGroup {
        &self.all
    }

    pub fn excluded(&self) -> &[ExcludedNode] {
        &self.excluded
    }

    /// Renders the inventory group file: one section per role, the flattened
    /// `all` group, public addresses and the excluded nodes.
    pub fn render(&self) -> std::io::Result<String> {
        let mut ini = Ini::new();

        for role in NodeRole::ALL {
            let mut section = ini.with_section(Some(role.as_str()));
            for host in self.group(role).iter() {
                section.set(host.id.to_string(), host.address.to_string());
            }
        }

        let mut section = ini.with_section(Some(ALL_GROUP_NAME));
        for host in self.all.iter() {
            section.set(host.id.to_string(), host.address.to_string());
        }

        let mut section = ini.with_section(Some(PUBLIC_ADDRESSES_GROUP_NAME));
        for host in self.all.iter() {
            if let Some(public_address) = host.public_address {
                section.set(host.id.to_string(), public_address.to_string());
            }
        }

        let mut section = ini.with_section(Some(EXCLUDED_GROUP_NAME));
        for node in &self.excluded {
            let reason = match node.reason {
                ExclusionReason::NotReady(status) => status.to_string(),
                ExclusionReason::MissingAddress => "missing-address".to_owned(),
            };
            section.set(node.id.to_string(), reason);
        }

        let mut buffer = Vec::new();
        ini.write_to(&mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))
    }

    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        debug!("Writing inventory to '{}'...", path.display());

        tokio::fs::write(path, self.render()?).await
    }
}
