use std::fmt::{Display, Formatter};

use log::debug;
use thiserror::Error;

use crate::{
    execution::{ExecutionError, RemoteExecutor},
    inventory::InventoryHost,
    retry::{retry_with_backoff, RetryExhausted, RetryPolicy},
    topology::NodeRole,
};

#[derive(Debug, Error)]
pub enum ProbeFailure {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("exited with status {status}: {output}")]
    Unhealthy { status: i32, output: String },
}

/// Nodes a probe is run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    /// every host of the probed role
    EachHost,
    /// the first host of the probed role only
    FirstHost,
    /// the first host of another (already verified) role
    FirstOf(NodeRole),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub name: String,
    pub target: ProbeTarget,
    /// healthy when it exits with 0
    pub script: String,
}

impl Probe {
    pub fn port(port: u16) -> Self {
        Self {
            name: format!("port {port}"),
            target: ProbeTarget::EachHost,
            script: format!("timeout 2 bash -c '</dev/tcp/127.0.0.1/{port}'"),
        }
    }

    pub fn cluster_health(name: &str, target: ProbeTarget, script: String) -> Self {
        Self {
            name: name.to_owned(),
            target,
            script,
        }
    }

    /// Runs the probe until it passes or the policy gives up.
    pub async fn wait<E: RemoteExecutor + ?Sized>(
        &self,
        executor: &E,
        host: &InventoryHost,
        policy: &RetryPolicy,
    ) -> Result<(), RetryExhausted<ProbeFailure>> {
        let name = format!("Probe '{}' on '{}'", self.name, host.id);

        retry_with_backoff(policy, &name, || async {
            let output = executor.run(host, &self.script).await?;

            if !output.success() {
                return Err(ProbeFailure::Unhealthy {
                    status: output.status,
                    output: format!("{}{}", output.stdout, output.stderr)
                        .trim()
                        .to_owned(),
                });
            }

            debug!("{name} passed");

            Ok(())
        })
        .await
    }
}

impl Display for Probe {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::{
        inventory::InventoryHost, node::NodeId, retry::RetryPolicy, testing::RecordingExecutor,
        topology::NodeRole,
    };

    use super::{Probe, ProbeFailure};

    fn host() -> InventoryHost {
        InventoryHost {
            id: NodeId::new(NodeRole::Etcd, 0),
            address: "10.43.0.20".parse().unwrap(),
            public_address: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_healthy_probe_gives_up_after_every_attempt() {
        let executor = RecordingExecutor::default();
        executor.fail_scripts_containing("/dev/tcp/127.0.0.1/2379", u32::MAX);
        let probe = Probe::port(2379);
        let started = Instant::now();

        let error = probe
            .wait(
                &executor,
                &host(),
                &RetryPolicy::fixed(5, Duration::from_secs(5)),
            )
            .await
            .unwrap_err();

        assert_eq!(error.attempts, 5);
        assert!(matches!(error.last_error, ProbeFailure::Unhealthy { .. }));
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(executor.count_scripts_containing("/dev/tcp/127.0.0.1/2379"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_passes_once_the_service_comes_up() {
        let executor = RecordingExecutor::default();
        executor.fail_scripts_containing("/dev/tcp/127.0.0.1/6443", 2);

        Probe::port(6443)
            .wait(
                &executor,
                &host(),
                &RetryPolicy::fixed(5, Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(executor.count_scripts_containing("/dev/tcp/127.0.0.1/6443"), 3);
    }
}
