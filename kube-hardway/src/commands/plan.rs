use anyhow::Context;
use kube_hardway_core::provisioner::Operation;
use log::{info, warn};
use serde::Serialize;

use crate::{
    cli::PlanArgs,
    context::BootstrapContext,
    output::{CliPrint, TableOutputRow},
};

pub async fn plan(args: PlanArgs, context: BootstrapContext) -> anyhow::Result<()> {
    let plan = context
        .orchestrator(None)
        .plan()
        .await
        .context("Couldn't compute the provisioning plan!")?;

    for orphan in &plan.orphans {
        warn!("'{orphan}' isn't part of the topology anymore");
    }

    if plan.is_empty() {
        info!("Cluster resources are up to date");
    }

    plan.operations
        .iter()
        .map(OperationView::from)
        .collect::<Vec<_>>()
        .print(args.output)?;

    Ok(())
}

#[derive(Serialize)]
struct OperationView {
    pub operation: &'static str,
    pub resource: String,
}

impl From<&Operation> for OperationView {
    fn from(value: &Operation) -> Self {
        OperationView {
            operation: value.verb(),
            resource: value.key().to_string(),
        }
    }
}

impl TableOutputRow for OperationView {
    fn header() -> Vec<&'static str> {
        vec!["OPERATION", "RESOURCE"]
    }

    fn cells(&self) -> Vec<String> {
        vec![self.operation.to_owned(), self.resource.clone()]
    }
}
