use std::path::Path;

use anyhow::Context;
use kube_hardway_core::{
    config::BootstrapConfig,
    execution::SshExecutor,
    kubernetes::KubeConnector,
    orchestrator::Orchestrator,
    provisioner::ExternalCommandProvider,
};
use log::{debug, warn};
use tokio::sync::watch;

pub type ClusterOrchestrator = Orchestrator<ExternalCommandProvider, SshExecutor, KubeConnector>;

pub struct BootstrapContext {
    pub config: BootstrapConfig,
}

impl BootstrapContext {
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let config = BootstrapConfig::load(config_path)
            .with_context(|| format!("Couldn't load cluster config '{}'!", config_path.display()))?;

        debug!(
            "Loaded '{}' cluster config, state in '{}'",
            config.cluster_name(),
            config.state_directory.display()
        );

        Ok(Self { config })
    }

    pub fn orchestrator(&self, api_endpoint: Option<String>) -> ClusterOrchestrator {
        Orchestrator::new(
            self.config.clone(),
            ExternalCommandProvider::new(self.config.provider.clone()),
            SshExecutor::new(self.config.ssh.clone()),
            KubeConnector,
        )
        .with_api_endpoint(api_endpoint)
    }

    /// Orchestrator that stops at the next barrier on Ctrl-C.
    pub fn abortable_orchestrator(&self, api_endpoint: Option<String>) -> ClusterOrchestrator {
        let (abort, aborted) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping at the next barrier...");
                abort.send_replace(true);
            }
        });

        self.orchestrator(api_endpoint).with_abort(aborted)
    }
}
