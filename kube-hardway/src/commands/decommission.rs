use anyhow::Context;
use kube_hardway_core::node::NodeId;
use log::info;

use crate::{cli::DecommissionArgs, context::BootstrapContext};

pub async fn decommission(args: DecommissionArgs, context: BootstrapContext) -> anyhow::Result<()> {
    let node: NodeId = args.node.parse()?;

    info!("Decommissioning '{node}'...");

    let inventory = context
        .orchestrator(None)
        .decommission(node)
        .await
        .with_context(|| format!("Couldn't decommission '{node}'!"))?;

    info!(
        "'{node}' is gone, {} node(s) left in the inventory",
        inventory.all().len()
    );

    Ok(())
}
