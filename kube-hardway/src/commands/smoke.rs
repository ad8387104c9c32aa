use anyhow::Context;
use kube_hardway_core::kubernetes::{operations::create_client, smoke::run_smoke_test};
use log::info;

use crate::{cli::SmokeArgs, context::BootstrapContext};

pub async fn smoke(args: SmokeArgs, context: BootstrapContext) -> anyhow::Result<()> {
    let kubeconfig = context
        .orchestrator(args.api_endpoint)
        .kubeconfig()
        .await
        .context("Couldn't prepare the admin kubeconfig!")?;
    let client = create_client(&kubeconfig)
        .await
        .context("Couldn't initialize k8s API client!")?;

    let report = run_smoke_test(&client, &context.config.installer.readiness, !args.keep)
        .await
        .context("Smoke test failed!")?;

    info!(
        "Smoke test passed: {} ready node(s), {} available replica(s)",
        report.ready_nodes.len(),
        report.available_replicas
    );

    Ok(())
}
