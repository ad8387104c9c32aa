use clap::Parser;
use cli::{Commands, GlobalArgs, LogLevel};
use commands::{
    bootstrap::bootstrap, decommission::decommission, inventory::inventory,
    kubeconfig::kubeconfig, plan::plan, routes::routes, smoke::smoke,
};
use context::BootstrapContext;
use env_logger::Target;
use log::LevelFilter;

use crate::cli::Cli;

mod cli;
mod commands;
mod context;
mod output;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    configure_logging(&cli.global_args);

    let context = BootstrapContext::load(&cli.global_args.config)?;

    match cli.command {
        Commands::Bootstrap(args) => bootstrap(args, context).await?,
        Commands::Plan(args) => plan(args, context).await?,
        Commands::Routes(args) => routes(args, context).await?,
        Commands::Smoke(args) => smoke(args, context).await?,
        Commands::Inventory(args) => inventory(args, context).await?,
        Commands::Kubeconfig(args) => kubeconfig(args, context).await?,
        Commands::Decommission(args) => decommission(args, context).await?,
    }

    Ok(())
}

fn configure_logging(global_args: &GlobalArgs) {
    let log_level = global_args.get_log_level();
    let mut logger = env_logger::builder();

    logger
        .format_timestamp(None)
        .format_module_path(matches!(log_level, LogLevel::Trace))
        .format_target(false)
        .format_level(false)
        .target(Target::Stderr);

    match log_level {
        LogLevel::Normal => {
            logger.filter(Some("kube_hardway"), LevelFilter::Info);
            logger.filter(Some("kube_hardway_core"), LevelFilter::Info);
        }
        LogLevel::Verbose => {
            logger.filter(Some("kube_hardway"), LevelFilter::Debug);
            logger.filter(Some("kube_hardway_core"), LevelFilter::Debug);
        }
        LogLevel::Trace => {
            logger.filter(None, LevelFilter::Debug);
        }
    }

    logger.init();
}
