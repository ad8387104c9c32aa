use async_trait::async_trait;

use crate::network::PodSubnetSource;

pub mod kubeconfig;
pub mod nodes;
pub mod operations;
pub mod smoke;

pub use nodes::KubePodSubnetSource;

/// Opens the control-plane API once the cluster is up.
#[async_trait]
pub trait ControlPlaneConnector: Send + Sync {
    type Source: PodSubnetSource;

    /// Connects with an admin kubeconfig document.
    async fn connect(&self, kubeconfig: &str) -> anyhow::Result<Self::Source>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KubeConnector;

#[async_trait]
impl ControlPlaneConnector for KubeConnector {
    type Source = KubePodSubnetSource;

    async fn connect(&self, kubeconfig: &str) -> anyhow::Result<Self::Source> {
        let client = operations::create_client(kubeconfig).await?;

        Ok(KubePodSubnetSource::new(client))
    }
}
