use std::collections::BTreeMap;

use futures::future::join_all;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    execution::{ExecutionError, RemoteExecutor},
    inventory::{Inventory, InventoryHost},
    node::NodeId,
    pki::CertificateBundle,
    retry::RetryPolicy,
    topology::{ClusterTopology, NodeRole},
};

pub mod plan;
pub mod probe;
pub mod roles;
pub mod state;
pub mod tasks;
pub mod units;

pub use plan::{InstallationPlan, PlanError, Stage};
pub use probe::{Probe, ProbeTarget};
pub use state::{InvalidTransition, RoleProgress, RoleState};
pub use tasks::Task;

use self::tasks::{apply_pending, HostConvergence};

#[derive(Debug, Error)]
pub enum InstallationError {
    #[error("Role '{role}' can't be installed, '{dependency}' isn't verified!")]
    DependencyNotVerified { role: NodeRole, dependency: NodeRole },
    #[error("There are no ready '{}' nodes to install on!", .0)]
    EmptyGroup(NodeRole),
    #[error("Couldn't render {what} for '{node}'! {message}")]
    Render {
        node: NodeId,
        what: String,
        message: String,
    },
    #[error("Task '{task}' of role '{role}' failed on '{node}'! {source}")]
    Task {
        role: NodeRole,
        node: NodeId,
        task: String,
        source: ExecutionError,
    },
    #[error("Probe '{probe}' of role '{role}' failed on '{node}' after {attempts} attempt(s)! {last_error}")]
    ProbeExhausted {
        role: NodeRole,
        node: NodeId,
        probe: String,
        attempts: u32,
        last_error: String,
    },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

impl InstallationError {
    pub fn node(&self) -> Option<NodeId> {
        match self {
            InstallationError::Render { node, .. }
            | InstallationError::Task { node, .. }
            | InstallationError::ProbeExhausted { node, .. } => Some(*node),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentVersions {
    pub kubernetes: String,
    pub etcd: String,
    pub containerd: String,
    pub runc: String,
    pub cni_plugins: String,
}

impl Default for ComponentVersions {
    fn default() -> Self {
        Self {
            kubernetes: "1.28.2".to_owned(),
            etcd: "3.5.9".to_owned(),
            containerd: "1.7.6".to_owned(),
            runc: "1.1.9".to_owned(),
            cni_plugins: "1.3.0".to_owned(),
        }
    }
}

/// Download URL templates, `{version}` and `{binary}` are substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadUrls {
    pub kubernetes: String,
    pub etcd: String,
    pub containerd: String,
    pub runc: String,
    pub cni_plugins: String,
}

impl Default for DownloadUrls {
    fn default() -> Self {
        Self {
            kubernetes: "https://dl.k8s.io/v{version}/bin/linux/amd64/{binary}".to_owned(),
            etcd: "https://github.com/etcd-io/etcd/releases/download/v{version}/etcd-v{version}-linux-amd64.tar.gz".to_owned(),
            containerd: "https://github.com/containerd/containerd/releases/download/v{version}/containerd-{version}-linux-amd64.tar.gz".to_owned(),
            runc: "https://github.com/opencontainers/runc/releases/download/v{version}/runc.amd64".to_owned(),
            cni_plugins: "https://github.com/containernetworking/plugins/releases/download/v{version}/cni-plugins-linux-amd64-v{version}.tgz".to_owned(),
        }
    }
}

fn expand(template: &str, version: &str, binary: &str) -> String {
    template
        .replace("{version}", version)
        .replace("{binary}", binary)
}

impl DownloadUrls {
    pub fn kubernetes_url(&self, version: &str, binary: &str) -> String {
        expand(&self.kubernetes, version, binary)
    }

    pub fn etcd_url(&self, version: &str) -> String {
        expand(&self.etcd, version, "etcd")
    }

    pub fn containerd_url(&self, version: &str) -> String {
        expand(&self.containerd, version, "containerd")
    }

    pub fn runc_url(&self, version: &str) -> String {
        expand(&self.runc, version, "runc")
    }

    pub fn cni_plugins_url(&self, version: &str) -> String {
        expand(&self.cni_plugins, version, "cni-plugins")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallerConfig {
    pub versions: ComponentVersions,
    pub downloads: DownloadUrls,
    /// attempts and delay of every readiness probe
    pub readiness: RetryPolicy,
    pub cluster_domain: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            versions: ComponentVersions::default(),
            downloads: DownloadUrls::default(),
            readiness: RetryPolicy::default(),
            cluster_domain: "cluster.local".to_owned(),
        }
    }
}

/// Everything rendered configuration is derived from.
#[derive(Debug, Clone, Copy)]
pub struct InstallContext<'a> {
    pub topology: &'a ClusterTopology,
    pub inventory: &'a Inventory,
    pub bundle: &'a CertificateBundle,
    /// API server URL workers connect to
    pub api_endpoint: &'a str,
}

#[derive(Debug, Default)]
pub struct InstallationReport {
    pub states: BTreeMap<NodeRole, RoleState>,
    pub errors: Vec<InstallationError>,
    pub tasks_applied: usize,
    pub tasks_unchanged: usize,
}

impl InstallationReport {
    pub fn state(&self, role: NodeRole) -> RoleState {
        self.states.get(&role).copied().unwrap_or_default()
    }

    pub fn is_verified(&self) -> bool {
        self.errors.is_empty()
            && self
                .states
                .values()
                .all(|state| *state == RoleState::Verified)
    }
}

pub struct Installer<'a, E: ?Sized> {
    executor: &'a E,
    config: &'a InstallerConfig,
}

impl<'a, E: RemoteExecutor + ?Sized> Installer<'a, E> {
    pub fn new(executor: &'a E, config: &'a InstallerConfig) -> Self {
        Self { executor, config }
    }

    /// Runs every stage of the plan in order.
    ///
    /// A stage only starts once all of its dependencies are verified, so a
    /// failed role leaves every role depending on it `not-started`.
    pub async fn install(
        &self,
        plan: &InstallationPlan,
        context: &InstallContext<'_>,
    ) -> InstallationReport {
        let mut report = InstallationReport::default();

        for stage in plan.stages() {
            let mut progress = RoleProgress::new(stage.role);

            if let Some(dependency) = stage
                .depends_on
                .iter()
                .find(|dependency| report.state(**dependency) != RoleState::Verified)
            {
                warn!(
                    "Skipping '{}' installation, '{dependency}' isn't verified!",
                    stage.role
                );
                report.errors.push(InstallationError::DependencyNotVerified {
                    role: stage.role,
                    dependency: *dependency,
                });
                report.states.insert(stage.role, progress.state());
                continue;
            }

            if let Err(error) = self
                .install_role(&mut progress, context, &mut report)
                .await
            {
                error!("Couldn't install '{}'! {error}", stage.role);
                progress.fail();
                report.errors.push(error);
            }

            report.states.insert(stage.role, progress.state());
        }

        report
    }

    async fn install_role(
        &self,
        progress: &mut RoleProgress,
        context: &InstallContext<'_>,
        report: &mut InstallationReport,
    ) -> Result<(), InstallationError> {
        let role = progress.role();
        let group = context.inventory.group(role);

        if group.is_empty() {
            return Err(InstallationError::EmptyGroup(role));
        }

        info!("Installing '{role}' on {} node(s)...", group.len());

        let host_tasks = group
            .iter()
            .map(|host| roles::host_tasks(role, host, context, self.config).map(|tasks| (host, tasks)))
            .collect::<Result<Vec<_>, _>>()?;

        let checks = join_all(
            host_tasks
                .iter()
                .map(|(host, tasks)| self.pending_tasks(host, tasks)),
        )
        .await;

        let mut pending = Vec::with_capacity(checks.len());
        for ((host, _), check) in host_tasks.iter().zip(checks) {
            match check {
                Ok(check) => pending.push(check),
                Err((task, source)) => {
                    progress.advance(RoleState::Installing)?;

                    return Err(InstallationError::Task {
                        role,
                        node: host.id,
                        task,
                        source,
                    });
                }
            }
        }

        if pending.iter().flatten().any(|pending| *pending) {
            progress.advance(RoleState::Installing)?;

            let results = join_all(host_tasks.iter().zip(&pending).map(
                |((host, tasks), pending)| apply_pending(self.executor, host, tasks, pending),
            ))
            .await;

            let mut failure = None;
            for ((host, _), result) in host_tasks.iter().zip(results) {
                match result {
                    Ok(HostConvergence { applied, unchanged }) => {
                        info!(
                            "'{}': {} task(s) applied, {unchanged} unchanged",
                            host.id,
                            applied.len()
                        );
                        report.tasks_applied += applied.len();
                        report.tasks_unchanged += unchanged;
                    }
                    Err((task, source)) => {
                        let error = InstallationError::Task {
                            role,
                            node: host.id,
                            task,
                            source,
                        };

                        // the first failure is returned, the rest only logged
                        if failure.is_none() {
                            failure = Some(error);
                        } else {
                            error!("{error}");
                        }
                    }
                }
            }

            if let Some(error) = failure {
                return Err(error);
            }
        } else {
            info!("'{role}' is already up to date on every node");
            report.tasks_unchanged += pending.iter().map(Vec::len).sum::<usize>();
        }

        progress.advance(RoleState::Started)?;

        for probe in roles::role_probes(role, context) {
            self.wait_for_probe(role, &probe, context).await?;
        }

        progress.advance(RoleState::Verified)?;
        info!("'{role}' is verified");

        Ok(())
    }

    async fn pending_tasks(
        &self,
        host: &InventoryHost,
        tasks: &[Task],
    ) -> Result<Vec<bool>, (String, ExecutionError)> {
        let mut pending = Vec::with_capacity(tasks.len());

        for task in tasks {
            let converged = task
                .is_converged(self.executor, host)
                .await
                .map_err(|error| (task.to_string(), error))?;

            pending.push(!converged);
        }

        Ok(pending)
    }

    async fn wait_for_probe(
        &self,
        role: NodeRole,
        probe: &Probe,
        context: &InstallContext<'_>,
    ) -> Result<(), InstallationError> {
        let hosts = match probe.target {
            ProbeTarget::EachHost => context.inventory.group(role).hosts(),
            ProbeTarget::FirstHost => first(context.inventory.group(role).hosts()),
            ProbeTarget::FirstOf(other) => first(context.inventory.group(other).hosts()),
        };

        if hosts.is_empty() {
            if let ProbeTarget::FirstOf(other) = probe.target {
                return Err(InstallationError::EmptyGroup(other));
            }

            return Err(InstallationError::EmptyGroup(role));
        }

        let results = join_all(
            hosts
                .iter()
                .map(|host| probe.wait(self.executor, host, &self.config.readiness)),
        )
        .await;

        for (host, result) in hosts.iter().zip(results) {
            if let Err(exhausted) = result {
                return Err(InstallationError::ProbeExhausted {
                    role,
                    node: host.id,
                    probe: probe.name.clone(),
                    attempts: exhausted.attempts,
                    last_error: exhausted.last_error.to_string(),
                });
            }
        }

        Ok(())
    }
}

fn first(hosts: &[InventoryHost]) -> &[InventoryHost] {
    &hosts[..hosts.len().min(1)]
}
