use anyhow::Context;
use kube_hardway_core::{network::PodRoute, orchestrator::RunMode};
use log::info;
use serde::Serialize;

use crate::{
    cli::RoutesArgs,
    context::BootstrapContext,
    output::{CliPrint, TableOutputRow},
};

pub async fn routes(args: RoutesArgs, context: BootstrapContext) -> anyhow::Result<()> {
    info!(
        "Reconciling pod routes of '{}' cluster...",
        context.config.cluster_name()
    );

    let report = context
        .abortable_orchestrator(args.api_endpoint)
        .run(RunMode::RoutesOnly)
        .await
        .context("Couldn't reconcile pod routes!")?;

    report
        .network
        .iter()
        .flat_map(|network| network.routes.iter())
        .map(RouteView::from)
        .collect::<Vec<_>>()
        .print(args.output)?;

    Ok(())
}

#[derive(Serialize)]
struct RouteView {
    pub node: String,
    pub destination: String,
    pub gateway: String,
}

impl From<&PodRoute> for RouteView {
    fn from(value: &PodRoute) -> Self {
        RouteView {
            node: value.node.to_string(),
            destination: value.destination.to_string(),
            gateway: value.gateway.to_string(),
        }
    }
}

impl TableOutputRow for RouteView {
    fn header() -> Vec<&'static str> {
        vec!["NODE", "DESTINATION", "GATEWAY"]
    }

    fn cells(&self) -> Vec<String> {
        vec![
            self.node.clone(),
            self.destination.clone(),
            self.gateway.clone(),
        ]
    }
}
