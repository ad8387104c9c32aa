use std::{net::Ipv4Addr, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{inventory::InventoryHost, retry::duration_secs};

use super::{shell_quote, CommandOutput, ExecutionError, RemoteExecutor, RemoteFile};

const SSH_PROGRAM: &str = "ssh";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    /// connect through the node's public address when it has one
    pub use_public_address: bool,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
    /// extra `-o` options passed verbatim to ssh
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "ubuntu".to_owned(),
            port: 22,
            identity_file: None,
            use_public_address: true,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            options: vec!["StrictHostKeyChecking=accept-new".to_owned()],
        }
    }
}

/// Remote execution over the system's OpenSSH client.
///
/// Scripts are streamed over stdin to `sudo sh -s`, so nothing has to be
/// quoted twice.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    config: SshConfig,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn target_address(&self, host: &InventoryHost) -> Ipv4Addr {
        match (self.config.use_public_address, host.public_address) {
            (true, Some(public)) => public,
            _ => host.address,
        }
    }

    fn command(&self, host: &InventoryHost, remote_command: &str) -> Command {
        let mut command = Command::new(SSH_PROGRAM);

        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ))
            .arg("-p")
            .arg(self.config.port.to_string());

        for option in &self.config.options {
            command.arg("-o").arg(option);
        }

        if let Some(identity_file) = &self.config.identity_file {
            command.arg("-i").arg(identity_file);
        }

        command
            .arg(format!("{}@{}", self.config.user, self.target_address(host)))
            .arg("--")
            .arg(remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }

    async fn execute(
        &self,
        host: &InventoryHost,
        remote_command: &str,
        input: &[u8],
    ) -> Result<CommandOutput, ExecutionError> {
        let mut child = self
            .command(host, remote_command)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: SSH_PROGRAM.to_owned(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .map_err(|source| ExecutionError::Io {
                    node: host.id,
                    source,
                })?;
            // dropping stdin closes it, the remote shell waits for EOF
        }

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutionError::Timeout {
                node: host.id,
                timeout: self.config.command_timeout,
            })?
            .map_err(|source| ExecutionError::Io {
                node: host.id,
                source,
            })?;

        Ok(CommandOutput {
            // ssh reports its own failures as 255, a signal-killed process has no code
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &InventoryHost, script: &str) -> Result<CommandOutput, ExecutionError> {
        debug!("Running remote script on '{}'...", host.id);
        trace!("{script}");

        self.execute(host, "sudo sh -s", script.as_bytes()).await
    }

    async fn upload(&self, host: &InventoryHost, file: &RemoteFile) -> Result<(), ExecutionError> {
        debug!("Uploading '{}' to '{}'...", file.path.display(), host.id);

        let output = self
            .execute(host, &upload_command(file), &file.contents)
            .await?;

        if !output.success() {
            return Err(ExecutionError::Failed {
                node: host.id,
                status: output.status,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(())
    }
}

fn upload_command(file: &RemoteFile) -> String {
    let path = file.path.to_string_lossy();
    let temporary = format!("{path}.kube-hardway.tmp");
    let directory = file
        .path
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .filter(|parent| !parent.is_empty())
        .unwrap_or_else(|| "/".to_owned());

    let script = format!(
        "mkdir -p {directory} && umask 077 && cat > {temporary} && chmod {mode:o} {temporary} && mv -f {temporary} {path}",
        directory = shell_quote(&directory),
        temporary = shell_quote(&temporary),
        mode = file.mode,
        path = shell_quote(&path),
    );

    format!("sudo sh -c {}", shell_quote(&script))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use crate::{
        execution::RemoteFile,
        inventory::InventoryHost,
        node::NodeId,
        topology::NodeRole,
    };

    use super::{upload_command, SshConfig, SshExecutor};

    fn host(public_address: Option<Ipv4Addr>) -> InventoryHost {
        InventoryHost {
            id: NodeId::new(NodeRole::Worker, 0),
            address: Ipv4Addr::new(10, 43, 0, 30),
            public_address,
        }
    }

    #[test]
    fn upload_writes_through_a_temporary_file() {
        let file = RemoteFile::new("/etc/etcd/kubernetes-key.pem", "secret", 0o600);

        let command = upload_command(&file);

        assert!(command.starts_with("sudo sh -c '"));
        assert!(command.contains("mkdir -p /etc/etcd"));
        assert!(command.contains("chmod 600 /etc/etcd/kubernetes-key.pem.kube-hardway.tmp"));
        assert!(command.contains("mv -f /etc/etcd/kubernetes-key.pem.kube-hardway.tmp /etc/etcd/kubernetes-key.pem"));
    }

    #[test]
    fn public_address_is_preferred_when_configured() {
        let public = Ipv4Addr::new(198, 51, 100, 3);
        let executor = SshExecutor::new(SshConfig::default());

        assert_eq!(executor.target_address(&host(Some(public))), public);
        assert_eq!(
            executor.target_address(&host(None)),
            Ipv4Addr::new(10, 43, 0, 30)
        );

        let executor = SshExecutor::new(SshConfig {
            use_public_address: false,
            ..Default::default()
        });

        assert_eq!(
            executor.target_address(&host(Some(public))),
            Ipv4Addr::new(10, 43, 0, 30)
        );
    }
}
