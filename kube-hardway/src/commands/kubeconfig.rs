use anyhow::Context;
use log::info;

use crate::{cli::KubeconfigArgs, context::BootstrapContext};

pub async fn kubeconfig(args: KubeconfigArgs, context: BootstrapContext) -> anyhow::Result<()> {
    let kubeconfig = context
        .orchestrator(args.api_endpoint)
        .kubeconfig()
        .await
        .context("Couldn't write the admin kubeconfig!")?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, kubeconfig)
                .with_context(|| format!("Couldn't write '{}'!", path.display()))?;
            info!("Admin kubeconfig written to '{}'", path.display());
        }
        None => print!("{kubeconfig}"),
    }

    Ok(())
}
