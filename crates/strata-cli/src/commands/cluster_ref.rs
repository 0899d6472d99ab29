//! `strata cluster-ref` - map cluster references to kubeconfig contexts

use clap::{Args, Subcommand};
use tracing::info;

use super::Session;
use crate::{Error, Result};

#[derive(Subcommand, Debug)]
pub enum ClusterRefCommand {
    /// Map a cluster reference to a kubeconfig context
    Connect(ConnectArgs),
    /// Forget a cluster reference
    Disconnect(DisconnectArgs),
    /// List mapped cluster references
    List,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    /// Cluster reference used by deployments
    pub reference: String,

    /// Kubeconfig context backing the reference
    #[arg(long)]
    pub context: String,
}

#[derive(Args, Debug)]
pub struct DisconnectArgs {
    /// Cluster reference to forget
    pub reference: String,
}

pub async fn run(cmd: ClusterRefCommand, session: &mut Session) -> Result<()> {
    match cmd {
        ClusterRefCommand::Connect(args) => connect(args, session).await,
        ClusterRefCommand::Disconnect(args) => disconnect(args, session),
        ClusterRefCommand::List => {
            list(session);
            Ok(())
        }
    }
}

async fn connect(args: ConnectArgs, session: &mut Session) -> Result<()> {
    let contexts = session.connector().available_contexts().await?;
    if !contexts.contains(&args.context) {
        return Err(Error::validation(format!(
            "context '{}' not found in kubeconfig",
            args.context
        )));
    }

    let previous = session
        .config
        .cluster_refs
        .insert(args.reference.clone(), args.context.clone());
    session.save()?;
    info!(cluster = %args.reference, context = %args.context, "Connected cluster reference");

    match previous {
        Some(old) if old != args.context => println!(
            "Cluster '{}' now uses context '{}' (was '{}')",
            args.reference, args.context, old
        ),
        _ => println!("Cluster '{}' uses context '{}'", args.reference, args.context),
    }
    Ok(())
}

fn disconnect(args: DisconnectArgs, session: &mut Session) -> Result<()> {
    let used_by: Vec<&String> = session
        .config
        .deployments
        .iter()
        .filter(|(_, d)| d.clusters.contains(&args.reference))
        .map(|(name, _)| name)
        .collect();
    if !used_by.is_empty() {
        return Err(Error::validation(format!(
            "cluster '{}' is a member of deployment(s): {}",
            args.reference,
            used_by
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    if session.config.cluster_refs.remove(&args.reference).is_none() {
        return Err(Error::validation(format!(
            "cluster '{}' is not connected",
            args.reference
        )));
    }
    session.save()?;
    println!("Disconnected cluster '{}'", args.reference);
    Ok(())
}

fn list(session: &Session) {
    if session.config.cluster_refs.is_empty() {
        println!("No cluster references. Add one with `strata cluster-ref connect`.");
        return;
    }
    println!("{:<20} CONTEXT", "CLUSTER");
    for (reference, context) in &session.config.cluster_refs {
        println!("{:<20} {}", reference, context);
    }
}
