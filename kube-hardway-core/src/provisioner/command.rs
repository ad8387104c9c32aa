use std::{io::ErrorKind, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use log::{debug, trace};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::retry::duration_secs;

use super::{ObservedResource, ObservedState, Provider, ProviderError, ResourceDocument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCommandConfig {
    /// program implementing the provider protocol
    pub command: PathBuf,
    /// arguments passed before the action name
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderRequest<'a, T: Serialize> {
    cluster: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a T>,
}

/// Provider backed by an external program.
///
/// The program is invoked as `<command> <args...> <action>`, where the action
/// is `observe`, `apply` or `destroy`. It receives a JSON request on stdin
/// and answers with JSON on stdout: the list of observed resources, the
/// applied resource, or nothing.
#[derive(Debug, Clone)]
pub struct ExternalCommandProvider {
    config: ProviderCommandConfig,
}

impl ExternalCommandProvider {
    pub fn new(config: ProviderCommandConfig) -> Self {
        Self { config }
    }

    async fn invoke<T: Serialize>(
        &self,
        action: &str,
        request: &ProviderRequest<'_, T>,
    ) -> Result<String, ProviderError> {
        let input = serde_json::to_vec(request)?;
        let program = self.config.command.to_string_lossy().into_owned();

        debug!("Invoking provider '{program}' ({action})...");
        trace!("{}", String::from_utf8_lossy(&input));

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProviderError::Spawn { program, source })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(&input).await {
                // the program doesn't have to read its request
                Err(error) if error.kind() == ErrorKind::BrokenPipe => {}
                result => result?,
            }
        }

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProviderError::Timeout(self.config.timeout))??;

        if !output.status.success() {
            return Err(ProviderError::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!("{stdout}");

        Ok(stdout)
    }

    async fn invoke_parsed<T: Serialize, R: DeserializeOwned>(
        &self,
        action: &str,
        request: &ProviderRequest<'_, T>,
    ) -> Result<R, ProviderError> {
        let stdout = self.invoke(action, request).await?;

        Ok(serde_json::from_str(&stdout)?)
    }
}

#[async_trait]
impl Provider for ExternalCommandProvider {
    async fn observe(&self, cluster: &str) -> Result<ObservedState, ProviderError> {
        let request = ProviderRequest::<()> {
            cluster,
            payload: None,
        };

        self.invoke_parsed("observe", &request).await
    }

    async fn apply(
        &self,
        cluster: &str,
        document: &ResourceDocument,
    ) -> Result<ObservedResource, ProviderError> {
        let request = ProviderRequest {
            cluster,
            payload: Some(document),
        };

        let applied: ObservedResource = self.invoke_parsed("apply", &request).await?;

        if applied.key != document.spec.key() {
            return Err(ProviderError::Rejected {
                resource: document.spec.key(),
                message: format!("provider answered with '{}' instead", applied.key),
            });
        }

        Ok(applied)
    }

    async fn destroy(
        &self,
        cluster: &str,
        resource: &ObservedResource,
    ) -> Result<(), ProviderError> {
        let request = ProviderRequest {
            cluster,
            payload: Some(resource),
        };

        self.invoke("destroy", &request).await.map(|_| ())
    }
}
