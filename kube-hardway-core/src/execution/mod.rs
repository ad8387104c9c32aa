use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{inventory::InventoryHost, node::NodeId};

pub mod ssh;

pub use ssh::{SshConfig, SshExecutor};

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Couldn't start '{program}'! {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("Remote command on '{node}' timed out after {}s!", .timeout.as_secs())]
    Timeout { node: NodeId, timeout: Duration },
    #[error("Remote command on '{node}' failed with status {status}! {stderr}")]
    Failed {
        node: NodeId,
        status: i32,
        stderr: String,
    },
    #[error("Io error while talking to '{node}': {source}")]
    Io {
        node: NodeId,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// File to be placed on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl RemoteFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode,
        }
    }
}

/// Ordered task execution on cluster nodes.
///
/// Every script runs with root privileges on the target node.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs a shell script, returning its output regardless of the exit status.
    async fn run(&self, host: &InventoryHost, script: &str) -> Result<CommandOutput, ExecutionError>;

    /// Atomically writes a file with the given permissions, creating parent directories.
    async fn upload(&self, host: &InventoryHost, file: &RemoteFile) -> Result<(), ExecutionError>;

    /// Runs a shell script and turns a non-zero exit status into an error.
    async fn run_checked(
        &self,
        host: &InventoryHost,
        script: &str,
    ) -> Result<CommandOutput, ExecutionError> {
        let output = self.run(host, script).await?;

        if !output.success() {
            return Err(ExecutionError::Failed {
                node: host.id,
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(output)
    }
}

/// Quotes a value for safe interpolation into a POSIX shell script.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c))
    {
        return value.to_owned();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}
