use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    path::PathBuf,
};

use data_encoding::HEXLOWER;
use log::debug;
use sha2::{Digest, Sha256};

use crate::{
    execution::{shell_quote, ExecutionError, RemoteExecutor, RemoteFile},
    inventory::InventoryHost,
};

/// Where fetched artifacts record the URL they came from.
pub const SOURCE_MARKER_DIRECTORY: &str = "/var/lib/kube-hardway/sources";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryInstall {
    /// a single executable downloaded as-is
    Executable { destination: PathBuf },
    /// a gzipped tarball unpacked into a directory
    Archive {
        directory: PathBuf,
        strip_components: u32,
        /// paths (relative to `directory`) the archive provides
        provides: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArtifact {
    pub name: String,
    pub url: String,
    pub install: BinaryInstall,
}

impl BinaryArtifact {
    pub fn executable(name: &str, url: String, directory: &str) -> Self {
        Self {
            name: name.to_owned(),
            url,
            install: BinaryInstall::Executable {
                destination: PathBuf::from(directory).join(name),
            },
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        PathBuf::from(SOURCE_MARKER_DIRECTORY).join(&self.name)
    }

    pub fn provided_paths(&self) -> Vec<PathBuf> {
        match &self.install {
            BinaryInstall::Executable { destination } => vec![destination.clone()],
            BinaryInstall::Archive {
                directory,
                provides,
                ..
            } => provides.iter().map(|path| directory.join(path)).collect(),
        }
    }

    fn install_script(&self) -> String {
        let url = shell_quote(&self.url);

        match &self.install {
            BinaryInstall::Executable { destination } => {
                let destination = shell_quote(&destination.to_string_lossy());

                format!(
                    "set -e
tmp=$(mktemp)
curl -fsSL --retry 3 -o \"$tmp\" {url}
install -D -m 0755 \"$tmp\" {destination}
rm -f \"$tmp\"
"
                )
            }
            BinaryInstall::Archive {
                directory,
                strip_components,
                provides,
            } => {
                let directory = shell_quote(&directory.to_string_lossy());
                // only the listed members are unpacked, wherever they sit in the archive
                let members = provides
                    .iter()
                    .map(|member| shell_quote(&format!("*/{member}")))
                    .collect::<Vec<_>>()
                    .join(" ");

                format!(
                    "set -e
tmp=$(mktemp)
curl -fsSL --retry 3 -o \"$tmp\" {url}
mkdir -p {directory}
tar -xzf \"$tmp\" -C {directory} --strip-components={strip_components} --no-same-owner --wildcards {members}
rm -f \"$tmp\"
"
                )
            }
        }
    }
}

/// Single idempotent installation step.
///
/// Every task first inspects the node and only acts when the observed state
/// differs from the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Upload(RemoteFile),
    FetchBinary(BinaryArtifact),
    /// generic step, `check` exiting with 0 means it's already done
    Ensure {
        name: String,
        check: String,
        apply: String,
    },
    /// enables and (re)starts a unit, restarting it only when one of its inputs changed
    EnableService { unit: String, inputs: Vec<PathBuf> },
}

impl Display for Task {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Upload(file) => write!(f, "upload {}", file.path.display()),
            Task::FetchBinary(artifact) => write!(f, "fetch {}", artifact.name),
            Task::Ensure { name, .. } => write!(f, "ensure {name}"),
            Task::EnableService { unit, .. } => write!(f, "enable {unit}"),
        }
    }
}

pub fn checksum(contents: &[u8]) -> String {
    HEXLOWER.encode(&Sha256::digest(contents))
}

/// `stdout` holds the `sha256sum` line followed by the octal mode printed by `stat -c %a`.
fn upload_matches(stdout: &str, file: &RemoteFile) -> bool {
    let mut lines = stdout.lines();
    let sum = lines.next().and_then(|line| line.split_whitespace().next());
    let mode = lines.next().map(str::trim);

    sum == Some(checksum(&file.contents).as_str())
        && mode == Some(format!("{:o}", file.mode).as_str())
}

impl Task {
    pub fn upload(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>, mode: u32) -> Self {
        Task::Upload(RemoteFile::new(path, contents, mode))
    }

    pub fn service(unit: &str, inputs: impl IntoIterator<Item = PathBuf>) -> Self {
        Task::EnableService {
            unit: unit.to_owned(),
            inputs: inputs.into_iter().collect(),
        }
    }

    /// Paths on the node this task writes.
    pub fn outputs(&self) -> Vec<PathBuf> {
        match self {
            Task::Upload(file) => vec![file.path.clone()],
            Task::FetchBinary(artifact) => artifact.provided_paths(),
            Task::Ensure { .. } | Task::EnableService { .. } => vec![],
        }
    }

    /// Compares the node's state with the target, `true` meaning nothing has to be done.
    pub async fn is_converged<E: RemoteExecutor + ?Sized>(
        &self,
        executor: &E,
        host: &InventoryHost,
    ) -> Result<bool, ExecutionError> {
        let converged = match self {
            Task::Upload(file) => {
                let path = shell_quote(&file.path.to_string_lossy());
                let output = executor
                    .run(host, &format!("sha256sum {path} && stat -c %a {path}"))
                    .await?;

                output.success() && upload_matches(&output.stdout, file)
            }
            Task::FetchBinary(artifact) => {
                let output = executor
                    .run(
                        host,
                        &format!(
                            "cat {}",
                            shell_quote(&artifact.marker_path().to_string_lossy())
                        ),
                    )
                    .await?;

                output.success() && output.stdout.trim() == artifact.url
            }
            Task::Ensure { check, .. } => executor.run(host, check).await?.success(),
            Task::EnableService { unit, .. } => {
                let output = executor
                    .run(host, &format!("systemctl is-active {}", shell_quote(unit)))
                    .await?;

                output.success() && output.stdout.trim() == "active"
            }
        };

        debug!(
            "'{self}' on '{}' is {}",
            host.id,
            if converged { "converged" } else { "pending" }
        );

        Ok(converged)
    }

    pub async fn apply<E: RemoteExecutor + ?Sized>(
        &self,
        executor: &E,
        host: &InventoryHost,
    ) -> Result<(), ExecutionError> {
        debug!("Applying '{self}' on '{}'...", host.id);

        match self {
            Task::Upload(file) => executor.upload(host, file).await,
            Task::FetchBinary(artifact) => {
                executor
                    .run_checked(host, &artifact.install_script())
                    .await?;
                executor
                    .upload(
                        host,
                        &RemoteFile::new(artifact.marker_path(), artifact.url.clone(), 0o644),
                    )
                    .await
            }
            Task::Ensure { apply, .. } => executor.run_checked(host, apply).await.map(|_| ()),
            Task::EnableService { unit, .. } => {
                let unit = shell_quote(unit);

                executor
                    .run_checked(
                        host,
                        &format!(
                            "systemctl daemon-reload\nsystemctl enable {unit}\nsystemctl restart {unit}\n"
                        ),
                    )
                    .await
                    .map(|_| ())
            }
        }
    }
}

/// Result of converging one host.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostConvergence {
    pub applied: Vec<String>,
    pub unchanged: usize,
}

/// Applies pending tasks of a host in order.
///
/// `pending` holds the result of [`Task::is_converged`] for every task, taken
/// before anything was applied. Services are restarted when they were pending
/// or when a task writing one of their inputs was applied in this pass.
pub async fn apply_pending<E: RemoteExecutor + ?Sized>(
    executor: &E,
    host: &InventoryHost,
    tasks: &[Task],
    pending: &[bool],
) -> Result<HostConvergence, (String, ExecutionError)> {
    let mut changed = HashSet::new();
    let mut convergence = HostConvergence::default();

    for (task, pending) in tasks.iter().zip(pending) {
        let needed = match task {
            Task::EnableService { inputs, .. } => {
                *pending || inputs.iter().any(|input| changed.contains(input))
            }
            _ => *pending,
        };

        if !needed {
            convergence.unchanged += 1;
            continue;
        }

        task.apply(executor, host)
            .await
            .map_err(|error| (task.to_string(), error))?;

        changed.extend(task.outputs());
        convergence.applied.push(task.to_string());
    }

    Ok(convergence)
}
