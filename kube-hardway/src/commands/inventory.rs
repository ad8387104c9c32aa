use anyhow::Context;
use log::{info, warn};

use crate::{cli::InventoryArgs, context::BootstrapContext};

pub async fn inventory(args: InventoryArgs, context: BootstrapContext) -> anyhow::Result<()> {
    let inventory = context
        .orchestrator(None)
        .inventory()
        .await
        .context("Couldn't regenerate the inventory!")?;

    for excluded in inventory.excluded() {
        warn!("'{}' was left out: {:?}", excluded.id, excluded.reason);
    }

    info!(
        "Inventory written to '{}'",
        context.config.inventory_path().display()
    );

    if args.print {
        let rendered = inventory
            .render()
            .context("Couldn't render the inventory!")?;
        print!("{rendered}");
    }

    Ok(())
}
