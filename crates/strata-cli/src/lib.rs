//! Strata CLI library

pub mod commands;
pub mod config;
pub mod error;
pub mod prompt;

pub use error::{Error, Result};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use commands::Session;

/// Strata - deployments spanning several Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Config file (default: ~/.strata/config.json)
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Kubeconfig file (default: kube defaults)
    #[arg(long, global = true, env = "STRATA_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Lease validity window in seconds
    #[arg(long, global = true, env = "STRATA_LEASE_DURATION")]
    pub lease_duration: Option<u64>,

    /// Maximum seconds to wait for a contended lock
    #[arg(long, global = true, env = "STRATA_LOCK_WAIT")]
    pub lock_wait: Option<u64>,

    /// Never prompt; unmapped clusters use the active context
    #[arg(long, global = true)]
    pub non_interactive: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create, inspect, check and destroy deployments
    #[command(subcommand)]
    Deployment(commands::deployment::DeploymentCommand),

    /// Add and remove consensus nodes
    #[command(subcommand)]
    Node(commands::node::NodeCommand),

    /// Inspect or clear a deployment lock
    #[command(subcommand)]
    Lock(commands::lock::LockCommand),

    /// Map cluster references to kubeconfig contexts
    #[command(subcommand)]
    ClusterRef(commands::cluster_ref::ClusterRefCommand),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        let mut session = Session::open(&self.global)?;
        match self.command {
            Commands::Deployment(cmd) => commands::deployment::run(cmd, &mut session).await,
            Commands::Node(cmd) => commands::node::run(cmd, &mut session).await,
            Commands::Lock(cmd) => commands::lock::run(cmd, &mut session).await,
            Commands::ClusterRef(cmd) => commands::cluster_ref::run(cmd, &mut session).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "strata",
            "lock",
            "status",
            "deploy",
            "--lock-wait",
            "5",
            "--non-interactive",
        ])
        .unwrap();
        assert_eq!(cli.global.lock_wait, Some(5));
        assert!(cli.global.non_interactive);
        assert!(matches!(cli.command, Commands::Lock(_)));
    }
}
