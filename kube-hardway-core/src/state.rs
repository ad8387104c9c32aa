use std::{
    collections::BTreeMap,
    fs::File,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    installer::RoleState,
    node::{NodeId, NodeRecord},
    provisioner::LoadBalancerEndpoint,
    topology::NodeRole,
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Io error: {}", .0)]
    IoError(std::io::Error),
    #[error("Serialization error: {}", .0)]
    SerializationError(serde_yaml::Error),
    #[error("Deserialization error: {}", .0)]
    DeserializationError(serde_yaml::Error),
    #[error("State file belongs to cluster '{found}', not '{expected}'!")]
    ClusterMismatch { expected: String, found: String },
}

/// Everything a run learned about the cluster, persisted after each barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterState {
    pub cluster: String,
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerEndpoint>,
    /// last observed installation state per role
    #[serde(default)]
    pub roles: BTreeMap<NodeRole, RoleState>,
    #[serde(default)]
    pub routes_installed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterState {
    pub fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_owned(),
            nodes: BTreeMap::new(),
            load_balancer: None,
            roles: BTreeMap::new(),
            routes_installed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn role_state(&self, role: NodeRole) -> RoleState {
        self.roles.get(&role).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored state, or a fresh one when nothing was persisted yet.
    pub fn load_or_create(&self, cluster: &str) -> Result<ClusterState, StateError> {
        debug!("Used state path: {:?}", self.path);

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(ClusterState::new(cluster))
            }
            Err(error) => return Err(StateError::IoError(error)),
        };

        let state: ClusterState =
            serde_yaml::from_reader(file).map_err(StateError::DeserializationError)?;

        if state.cluster != cluster {
            return Err(StateError::ClusterMismatch {
                expected: cluster.to_owned(),
                found: state.cluster,
            });
        }

        Ok(state)
    }

    /// Writes the state through a temporary file, so an interrupted write never truncates it.
    pub fn save(&self, state: &mut ClusterState) -> Result<(), StateError> {
        state.updated_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StateError::IoError)?;
        }

        let temporary = self.path.with_extension("yaml.tmp");
        let file = File::options()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temporary)
            .map_err(StateError::IoError)?;

        serde_yaml::to_writer(file, state).map_err(StateError::SerializationError)?;
        std::fs::rename(&temporary, &self.path).map_err(StateError::IoError)?;

        debug!("Cluster state saved to {:?}", self.path);

        Ok(())
    }
}
