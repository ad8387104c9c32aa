use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::NodeRole;

/// Stable node identifier, rendered as `<role>-<index>` (e.g. `worker-0`).
///
/// Ordering follows the role and then the numeric index, so `worker-2` sorts
/// before `worker-10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    role: NodeRole,
    index: u32,
}

impl NodeId {
    pub fn new(role: NodeRole, index: u32) -> Self {
        Self { role, index }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.role, self.index)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{}' is not a valid node identifier!", .0)]
pub struct InvalidNodeId(pub String);

impl FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidNodeId(s.to_owned());
        let (role, index) = s.rsplit_once('-').ok_or_else(invalid)?;

        Ok(Self {
            role: role.parse().map_err(|_| invalid())?,
            index: index.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for NodeId {
    type Error = InvalidNodeId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    /// provider-side identifier of the instance, once it exists
    #[serde(default)]
    pub resource_id: Option<String>,
    /// static private address, set once the provider reports it
    #[serde(default)]
    pub private_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub public_address: Option<Ipv4Addr>,
    #[serde(default)]
    pub status: NodeStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeRecordError {
    #[error("Node '{id}' was provisioned as '{existing}' and can't become '{requested}'!")]
    RoleChange {
        id: NodeId,
        existing: NodeRole,
        requested: NodeRole,
    },
    #[error("Node record '{existing}' can't be updated with data of '{requested}'!")]
    IdentifierChange { existing: NodeId, requested: NodeId },
}

impl NodeRecord {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            role: id.role(),
            resource_id: None,
            private_address: None,
            public_address: None,
            status: NodeStatus::Pending,
            updated_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == NodeStatus::Ready
    }

    /// Updates the record in place with freshly observed data.
    ///
    /// Identifier and role are fixed for the lifetime of a record.
    pub fn update_from(&mut self, observed: &NodeRecord) -> Result<(), NodeRecordError> {
        if observed.id != self.id {
            return Err(NodeRecordError::IdentifierChange {
                existing: self.id,
                requested: observed.id,
            });
        }

        if observed.role != self.role {
            return Err(NodeRecordError::RoleChange {
                id: self.id,
                existing: self.role,
                requested: observed.role,
            });
        }

        if observed.resource_id.is_some() {
            self.resource_id = observed.resource_id.clone();
        }
        if observed.private_address.is_some() {
            self.private_address = observed.private_address;
        }
        if observed.public_address.is_some() {
            self.public_address = observed.public_address;
        }

        self.status = observed.status;
        self.updated_at = observed.updated_at;

        Ok(())
    }
}
