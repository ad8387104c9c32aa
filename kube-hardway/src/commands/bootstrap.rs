use anyhow::Context;
use kube_hardway_core::{
    node::NodeRecord,
    orchestrator::{RunMode, RunReport},
};
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    cli::BootstrapArgs,
    context::BootstrapContext,
    output::{CliPrint, TableCellOption, TableOutputRow},
};

pub async fn bootstrap(args: BootstrapArgs, context: BootstrapContext) -> anyhow::Result<()> {
    info!(
        "Bootstrapping '{}' cluster...",
        context.config.cluster_name()
    );

    let orchestrator = context.abortable_orchestrator(args.api_endpoint);
    let report = match orchestrator.run(RunMode::Full).await {
        Ok(report) => report,
        Err(error) => {
            log_partial_report(&error.report);
            return Err(error).context("Couldn't bootstrap the cluster!");
        }
    };

    if let Some(endpoint) = &report.api_endpoint {
        info!("API endpoint: {endpoint}");
    }
    info!(
        "Admin kubeconfig written to '{}'",
        context.config.kubeconfig_path().display()
    );

    node_views(&report).print(args.output)?;

    Ok(())
}

fn log_partial_report(report: &RunReport) {
    match report.completed.last() {
        Some(barrier) => warn!("The run got past the '{barrier}' barrier, rerun to resume"),
        None => warn!("The run didn't get past any barrier"),
    }

    if let Some(provisioning) = &report.provisioning {
        for failure in &provisioning.failures {
            error!("{failure}");
        }
    }

    for excluded in &report.excluded {
        warn!("'{}' was left out of the inventory", excluded.id);
    }

    if let Some(installation) = &report.installation {
        for (role, state) in &installation.states {
            info!("Role '{role}' is {state}");
        }
        for installation_error in &installation.errors {
            error!("{installation_error}");
        }
    }

    if let Some(network) = &report.network {
        for node in &network.unassigned {
            warn!("'{node}' has no pod subnet assigned");
        }
    }
}

fn node_views(report: &RunReport) -> Vec<NodeView> {
    report
        .provisioning
        .iter()
        .flat_map(|provisioning| provisioning.records.values())
        .map(NodeView::from)
        .collect()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    pub node: String,
    pub role: String,
    pub status: String,
    pub private_address: TableCellOption<String>,
    pub public_address: TableCellOption<String>,
}

impl From<&NodeRecord> for NodeView {
    fn from(value: &NodeRecord) -> Self {
        NodeView {
            node: value.id.to_string(),
            role: value.role.to_string(),
            status: value.status.to_string(),
            private_address: value.private_address.map(|a| a.to_string()).into(),
            public_address: value.public_address.map(|a| a.to_string()).into(),
        }
    }
}

impl TableOutputRow for NodeView {
    fn header() -> Vec<&'static str> {
        vec!["NODE", "ROLE", "STATUS", "PRIVATE ADDRESS", "PUBLIC ADDRESS"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.role.clone(),
            self.status.clone(),
            self.private_address.to_string(),
            self.public_address.to_string(),
        ]
    }
}
