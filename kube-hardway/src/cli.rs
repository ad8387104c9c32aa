use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kube_hardway_core::config::DEFAULT_CONFIG_FILENAME;

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    #[command(flatten)]
    pub global_args: GlobalArgs,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// cluster configuration file
    #[arg(short = 'c', long, global = true, default_value = DEFAULT_CONFIG_FILENAME)]
    pub config: PathBuf,
    /// enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose_logging: bool,
    /// enable trace output (more detailed than verbose, overrides it if present)
    #[arg(long = "trace", global = true)]
    pub trace_logging: bool,
}

impl GlobalArgs {
    pub fn get_log_level(&self) -> LogLevel {
        if self.trace_logging {
            return LogLevel::Trace;
        }

        if self.verbose_logging {
            return LogLevel::Verbose;
        }

        LogLevel::Normal
    }
}

pub enum LogLevel {
    Normal,
    Verbose,
    Trace,
}

#[derive(Debug, Subcommand)]
#[command(arg_required_else_help = true)]
pub enum Commands {
    /// provision, certify, install and network the whole cluster
    #[command(alias = "b")]
    Bootstrap(BootstrapArgs),
    /// show the provider operations a bootstrap would execute
    #[command(alias = "p")]
    Plan(PlanArgs),
    /// (re)install pod routes on an already bootstrapped cluster
    #[command(alias = "r")]
    Routes(RoutesArgs),
    /// deploy a test workload and wait for it to become available
    #[command(alias = "s")]
    Smoke(SmokeArgs),
    /// regenerate the inventory file from the cluster state
    #[command(alias = "i")]
    Inventory(InventoryArgs),
    /// write the admin kubeconfig of the cluster
    #[command(alias = "k")]
    Kubeconfig(KubeconfigArgs),
    /// destroy a single node and drop it from the cluster state
    Decommission(DecommissionArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[value()]
pub enum OutputFormat {
    /// human readable table
    #[value(name = "table")]
    Table,
    /// human readable table with column headers
    #[value(name = "table-with-headers")]
    TableWithHeaders,
    /// JSON
    #[value(name = "json")]
    Json,
    /// pretty printed JSON
    #[value(name = "json-pretty")]
    JsonPretty,
    /// YAML
    #[value(name = "yaml")]
    Yaml,
}

#[derive(Debug, Args)]
pub struct BootstrapArgs {
    /// overrides the API endpoint written into kubeconfigs (load balancer URL by default)
    #[arg(long)]
    pub api_endpoint: Option<String>,
    /// output format of the node summary
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct RoutesArgs {
    /// API endpoint reachable from this machine
    #[arg(long)]
    pub api_endpoint: Option<String>,
    #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::TableWithHeaders)]
    pub output: OutputFormat,
}

#[derive(Debug, Args)]
pub struct SmokeArgs {
    /// API endpoint reachable from this machine
    #[arg(long)]
    pub api_endpoint: Option<String>,
    /// leave the test namespace in place afterwards
    #[arg(long)]
    pub keep: bool,
}

#[derive(Debug, Args)]
pub struct InventoryArgs {
    /// print the inventory to stdout as well
    #[arg(long)]
    pub print: bool,
}

#[derive(Debug, Args)]
pub struct KubeconfigArgs {
    /// API endpoint reachable from this machine
    #[arg(long)]
    pub api_endpoint: Option<String>,
    /// if set, the kubeconfig is also written to this file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DecommissionArgs {
    /// node to destroy, e.g. worker-2
    pub node: String,
}
