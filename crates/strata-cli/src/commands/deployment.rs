//! `strata deployment` - create, inspect, check and destroy deployments
//!
//! Every mutating subcommand runs as one unit of work under the deployment
//! lock on the primary cluster: acquire, load or modify the remote config,
//! release.

use clap::{Args, Subcommand};
use tracing::{info, warn};

use strata_config::{ClusterBinding, ConsistencyReport, RemoteConfigDocument};

use super::{confirm_destructive, report_outcome, Session};
use crate::config::DeploymentEntry;
use crate::{Error, Result};

#[derive(Subcommand, Debug)]
pub enum DeploymentCommand {
    /// Create a deployment and replicate its config to every member
    Create(CreateArgs),
    /// Add a member cluster
    AddCluster(ClusterArgs),
    /// Remove a member cluster that hosts no nodes
    RemoveCluster(ClusterArgs),
    /// Print a deployment's remote config
    Show(ShowArgs),
    /// Compare the remote config across member clusters
    Check(NameArgs),
    /// Delete the remote config from every member
    Destroy(DestroyArgs),
}

/// DNS layout for a member cluster
#[derive(Args, Debug, Clone, Default)]
pub struct DnsArgs {
    /// DNS suffix for services (default: cluster.local)
    #[arg(long)]
    pub dns_base: Option<String>,

    /// Hostname pattern for nodes (default: {nodeAlias}.{namespace}.svc.{dnsBase})
    #[arg(long)]
    pub dns_pattern: Option<String>,
}

impl DnsArgs {
    fn binding(&self, namespace: &str, deployment: &str) -> ClusterBinding {
        let mut binding = ClusterBinding::new(namespace, deployment);
        if let Some(base) = &self.dns_base {
            binding.dns_base = base.clone();
        }
        if let Some(pattern) = &self.dns_pattern {
            binding.dns_pattern = pattern.clone();
        }
        binding
    }
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Deployment name
    pub name: String,

    /// Namespace on every member cluster
    #[arg(long, short)]
    pub namespace: String,

    /// Member cluster references
    #[arg(long = "cluster", required = true, value_delimiter = ',')]
    pub clusters: Vec<String>,

    /// Cluster holding the lock and the authoritative copy (default: first cluster)
    #[arg(long)]
    pub primary: Option<String>,

    #[command(flatten)]
    pub dns: DnsArgs,
}

#[derive(Args, Debug)]
pub struct ClusterArgs {
    /// Deployment name
    pub name: String,

    /// Cluster reference
    pub cluster: String,

    #[command(flatten)]
    pub dns: DnsArgs,
}

#[derive(Args, Debug)]
pub struct NameArgs {
    /// Deployment name
    pub name: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Deployment name
    pub name: String,

    /// Read this member's copy instead of the primary's
    #[arg(long)]
    pub cluster: Option<String>,

    /// Print the raw document as YAML
    #[arg(long)]
    pub yaml: bool,
}

#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Deployment name
    pub name: String,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,
}

pub async fn run(cmd: DeploymentCommand, session: &mut Session) -> Result<()> {
    match cmd {
        DeploymentCommand::Create(args) => create(args, session).await,
        DeploymentCommand::AddCluster(args) => add_cluster(args, session).await,
        DeploymentCommand::RemoveCluster(args) => remove_cluster(args, session).await,
        DeploymentCommand::Show(args) => show(args, session).await,
        DeploymentCommand::Check(args) => check(args, session).await.map(|_| ()),
        DeploymentCommand::Destroy(args) => destroy(args, session).await,
    }
}

async fn create(args: CreateArgs, session: &mut Session) -> Result<()> {
    if session.config.deployments.contains_key(&args.name) {
        return Err(Error::DeploymentAlreadyExists { name: args.name });
    }

    let mut clusters: Vec<String> = Vec::new();
    for cluster in &args.clusters {
        if clusters.contains(cluster) {
            return Err(Error::validation(format!("cluster '{cluster}' listed twice")));
        }
        clusters.push(cluster.clone());
    }
    let primary = args
        .primary
        .clone()
        .or_else(|| clusters.first().cloned())
        .ok_or_else(|| Error::validation("at least one --cluster is required"))?;
    if !clusters.contains(&primary) {
        clusters.insert(0, primary.clone());
    }

    let book = session.address_book();
    session.map_references(&book, &clusters).await?;
    let manager = session.config_manager(book.clone(), &args.namespace);
    let binding = args.dns.binding(&args.namespace, &args.name);

    let (manager, name, primary_ref, members) = (&manager, &args.name, &primary, &clusters);
    let outcome = session
        .with_lock(&book, &args.namespace, name, primary_ref, move |liveness| async move {
            manager.load_or_create(name, primary_ref).await?;
            let outcome = manager
                .modify(primary_ref, &liveness, |doc| {
                    for member in members {
                        if !doc.clusters.contains_key(member) {
                            doc.add_cluster(member.clone(), binding.clone())?;
                        }
                    }
                    doc.record_command(format!("deployment create {name}"));
                    Ok(())
                })
                .await?;
            Ok(outcome)
        })
        .await?;

    session.config.deployments.insert(
        args.name.clone(),
        DeploymentEntry {
            namespace: args.namespace.clone(),
            primary,
            clusters,
        },
    );
    session.save()?;
    info!(deployment = %args.name, namespace = %args.namespace, "Deployment created");
    println!("Created deployment '{}' in namespace '{}'", args.name, args.namespace);
    report_outcome(&outcome)
}

async fn add_cluster(args: ClusterArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.name)?.clone();
    if entry.clusters.contains(&args.cluster) {
        return Err(Error::validation(format!(
            "cluster '{}' is already a member of '{}'",
            args.cluster, args.name
        )));
    }

    let book = session.address_book();
    session
        .map_references(&book, std::slice::from_ref(&args.cluster))
        .await?;
    let manager = session.config_manager(book.clone(), &entry.namespace);
    let binding = args.dns.binding(&entry.namespace, &args.name);

    let (manager, primary, cluster) = (&manager, &entry.primary, &args.cluster);
    let outcome = session
        .with_lock(&book, &entry.namespace, &args.name, primary, move |liveness| async move {
            let outcome = manager
                .modify(primary, &liveness, |doc| {
                    doc.add_cluster(cluster.clone(), binding.clone())?;
                    doc.record_command(format!("deployment add-cluster {cluster}"));
                    Ok(())
                })
                .await?;
            Ok(outcome)
        })
        .await?;

    if let Some(entry) = session.config.deployments.get_mut(&args.name) {
        entry.clusters.push(args.cluster.clone());
    }
    session.save()?;
    println!("Added cluster '{}' to '{}'", args.cluster, args.name);
    report_outcome(&outcome)
}

async fn remove_cluster(args: ClusterArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.name)?.clone();
    if args.cluster == entry.primary {
        return Err(Error::validation(format!(
            "cluster '{}' is the primary of '{}' and cannot be removed",
            args.cluster, args.name
        )));
    }
    if !entry.clusters.contains(&args.cluster) {
        return Err(Error::validation(format!(
            "cluster '{}' is not a member of '{}'",
            args.cluster, args.name
        )));
    }

    let book = session.address_book();
    let manager = session.config_manager(book.clone(), &entry.namespace);

    let (manager, primary, cluster) = (&manager, &entry.primary, &args.cluster);
    let outcome = session
        .with_lock(&book, &entry.namespace, &args.name, primary, move |liveness| async move {
            let outcome = manager
                .modify(primary, &liveness, |doc| {
                    doc.remove_cluster(cluster)?;
                    doc.record_command(format!("deployment remove-cluster {cluster}"));
                    Ok(())
                })
                .await?;
            Ok(outcome)
        })
        .await?;

    if let Some(entry) = session.config.deployments.get_mut(&args.name) {
        entry.clusters.retain(|c| c != &args.cluster);
    }
    session.save()?;
    println!("Removed cluster '{}' from '{}'", args.cluster, args.name);
    report_outcome(&outcome)
}

async fn show(args: ShowArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.name)?;
    let cluster = args.cluster.as_deref().unwrap_or(&entry.primary);
    let manager = session.config_manager(session.address_book(), &entry.namespace);
    let document = manager.load(cluster).await?;

    if args.yaml {
        print!("{}", document.to_yaml()?);
    } else {
        print_document(&document, cluster);
    }
    Ok(())
}

fn print_document(document: &RemoteConfigDocument, source: &str) {
    let meta = &document.metadata;
    println!("Deployment: {} (namespace {})", meta.name, meta.namespace);
    println!("Read from:  {source}");
    println!("Schema:     v{}", meta.schema_version);
    println!("Created:    {} by {}", meta.created_at.to_rfc3339(), meta.created_by);
    if let (Some(at), Some(by)) = (&meta.last_updated_at, &meta.last_updated_by) {
        println!("Updated:    {} by {}", at.to_rfc3339(), by);
    }

    println!();
    println!("{:<16} {:<20} DNS BASE", "CLUSTER", "NAMESPACE");
    for (reference, binding) in &document.clusters {
        println!(
            "{:<16} {:<20} {}",
            reference, binding.namespace, binding.dns_base
        );
    }

    println!();
    if document.consensus_nodes.is_empty() {
        println!("No consensus nodes.");
    } else {
        println!("{:<16} {:<6} {:<16} FQDN", "NODE", "ID", "CLUSTER");
        for node in document.nodes_sorted() {
            println!(
                "{:<16} {:<6} {:<16} {}",
                node.node_alias,
                node.node_id,
                node.cluster_reference,
                node.fqdn()
            );
        }
    }
}

async fn check(args: NameArgs, session: &mut Session) -> Result<ConsistencyReport> {
    let entry = session.config.deployment(&args.name)?.clone();
    let manager = session.config_manager(session.address_book(), &entry.namespace);
    let report = manager.validate_consistency(&entry.clusters).await?;

    if !report.resolved_contexts.is_empty() {
        session
            .config
            .cluster_refs
            .extend(report.resolved_contexts.clone());
        session.save()?;
    }
    print_report(&report);

    report.ensure_consistent()?;
    if !report.unreachable.is_empty() || !report.missing.is_empty() {
        let mut skipped = report.unreachable.clone();
        skipped.extend(report.missing.iter().cloned());
        return Err(Error::command_failed(format!(
            "could not compare {}",
            skipped.join(", ")
        )));
    }
    Ok(report)
}

fn print_report(report: &ConsistencyReport) {
    for (reference, context) in &report.resolved_contexts {
        println!("Mapped cluster '{reference}' to context '{context}'");
    }
    if let Some(reference) = &report.reference {
        println!("Compared against: {reference}");
    }
    println!("Reachable:   {}", report.probed.join(", "));
    if !report.unreachable.is_empty() {
        println!("Unreachable: {}", report.unreachable.join(", "));
    }
    if !report.missing.is_empty() {
        println!("Missing:     {}", report.missing.join(", "));
    }
    for (reference, reason) in &report.invalid {
        println!("Invalid:     {reference}: {reason}");
    }
    match &report.mismatch {
        Some(m) => println!(
            "Mismatch:    '{}' differs between {} and {}",
            m.field, m.cluster_a, m.cluster_b
        ),
        None if report.invalid.is_empty() => println!("Consistent"),
        None => {}
    }
}

async fn destroy(args: DestroyArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.name)?.clone();
    confirm_destructive(
        session,
        args.yes,
        &format!(
            "Delete the remote config of '{}' from {}?",
            args.name,
            entry.clusters.join(", ")
        ),
    )
    .await?;

    let book = session.address_book();
    let manager = session.config_manager(book.clone(), &entry.namespace);
    let (manager, clusters) = (&manager, &entry.clusters);
    let outcome = session
        .with_lock(&book, &entry.namespace, &args.name, &entry.primary, move |liveness| async move {
            Ok(manager.destroy(clusters, &liveness).await?)
        })
        .await?;

    for cluster in &outcome.deleted {
        println!("Deleted remote config from {cluster}");
    }
    for cluster in &outcome.absent {
        println!("No remote config on {cluster}");
    }
    if !outcome.failed.is_empty() {
        for (cluster, error) in &outcome.failed {
            eprintln!("  {cluster}: {error}");
        }
        warn!(deployment = %args.name, "Destroy incomplete, keeping local entry");
        return Err(Error::command_failed(
            "some copies could not be deleted; rerun destroy once the clusters are reachable",
        ));
    }

    session.config.deployments.remove(&args.name);
    session.save()?;
    println!("Destroyed deployment '{}'", args.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::node::{self, NodeAddArgs};
    use crate::commands::testing::Fixture;
    use strata_config::{CONFIG_MAP_NAME, DATA_KEY};

    fn create_args(clusters: &[&str]) -> CreateArgs {
        CreateArgs {
            name: "deploy".to_string(),
            namespace: "ns1".to_string(),
            clusters: clusters.iter().map(|c| c.to_string()).collect(),
            primary: None,
            dns: DnsArgs::default(),
        }
    }

    fn cluster_args(cluster: &str) -> ClusterArgs {
        ClusterArgs {
            name: "deploy".to_string(),
            cluster: cluster.to_string(),
            dns: DnsArgs::default(),
        }
    }

    fn name_args() -> NameArgs {
        NameArgs {
            name: "deploy".to_string(),
        }
    }

    #[tokio::test]
    async fn create_replicates_and_records_deployment() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();

        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        for cluster in ["east", "west"] {
            assert!(fixture
                .cluster(cluster)
                .config_map("ns1", CONFIG_MAP_NAME)
                .is_some());
        }
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());

        let saved = fixture.saved();
        let entry = &saved.deployments["deploy"];
        assert_eq!(entry.primary, "east");
        assert_eq!(entry.clusters, vec!["east", "west"]);

        let report = check(name_args(), &mut session).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.compared, vec!["east", "west"]);
    }

    #[tokio::test]
    async fn check_names_cluster_with_undecodable_copy() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        let west = fixture.cluster("west");
        let mut record = west.config_map("ns1", CONFIG_MAP_NAME).unwrap();
        record
            .data
            .insert(DATA_KEY.to_string(), "metadata: [".to_string());
        west.put_config_map(record);

        let err = check(name_args(), &mut session).await.unwrap_err();
        assert!(err.to_string().contains("'west'"));
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let fixture = Fixture::new(&["east"]);
        let mut session = fixture.session();
        create(create_args(&["east"]), &mut session).await.unwrap();

        let err = create(create_args(&["east"]), &mut session).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn create_with_duplicate_cluster_is_rejected() {
        let fixture = Fixture::new(&["east"]);
        let mut session = fixture.session();

        let err = create(create_args(&["east", "east"]), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn add_then_remove_cluster() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east"]), &mut session).await.unwrap();

        add_cluster(cluster_args("west"), &mut session).await.unwrap();
        assert!(fixture
            .cluster("west")
            .config_map("ns1", CONFIG_MAP_NAME)
            .is_some());
        assert_eq!(fixture.saved().deployments["deploy"].clusters, vec!["east", "west"]);

        remove_cluster(cluster_args("west"), &mut session).await.unwrap();
        assert!(fixture
            .cluster("west")
            .config_map("ns1", CONFIG_MAP_NAME)
            .is_none());
        assert_eq!(fixture.saved().deployments["deploy"].clusters, vec!["east"]);
    }

    #[tokio::test]
    async fn primary_cannot_be_removed() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        let err = remove_cluster(cluster_args("east"), &mut session)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("primary"));
    }

    #[tokio::test]
    async fn cluster_hosting_nodes_cannot_be_removed() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();
        node::add(
            NodeAddArgs {
                deployment: "deploy".to_string(),
                alias: "node1".to_string(),
                cluster: Some("west".to_string()),
            },
            &mut session,
        )
        .await
        .unwrap();

        let err = remove_cluster(cluster_args("west"), &mut session)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node1"));
        assert_eq!(fixture.saved().deployments["deploy"].clusters, vec!["east", "west"]);
    }

    #[tokio::test]
    async fn check_detects_missed_update() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        fixture.cluster("west").set_reachable(false);
        let err = node::add(
            NodeAddArgs {
                deployment: "deploy".to_string(),
                alias: "node1".to_string(),
                cluster: None,
            },
            &mut session,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("west"));

        fixture.cluster("west").set_reachable(true);
        let err = check(name_args(), &mut session).await.unwrap_err();
        match err {
            Error::Core(strata_common::Error::RemoteConfigMismatch {
                cluster_a,
                cluster_b,
                field,
            }) => {
                assert_eq!((cluster_a.as_str(), cluster_b.as_str()), ("east", "west"));
                assert_eq!(field, "consensusNodes");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_reports_unreachable_member() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        fixture.cluster("west").set_reachable(false);
        let err = check(name_args(), &mut session).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert!(err.to_string().contains("west"));
    }

    #[tokio::test]
    async fn destroy_requires_confirmation_when_not_interactive() {
        let fixture = Fixture::new(&["east"]);
        let mut session = fixture.session();
        create(create_args(&["east"]), &mut session).await.unwrap();

        let err = destroy(
            DestroyArgs {
                name: "deploy".to_string(),
                yes: false,
            },
            &mut session,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(fixture
            .cluster("east")
            .config_map("ns1", CONFIG_MAP_NAME)
            .is_some());
    }

    #[tokio::test]
    async fn destroy_deletes_every_copy() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = fixture.session();
        create(create_args(&["east", "west"]), &mut session).await.unwrap();

        destroy(
            DestroyArgs {
                name: "deploy".to_string(),
                yes: true,
            },
            &mut session,
        )
        .await
        .unwrap();

        for cluster in ["east", "west"] {
            assert!(fixture
                .cluster(cluster)
                .config_map("ns1", CONFIG_MAP_NAME)
                .is_none());
        }
        assert!(fixture.saved().deployments.is_empty());
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());
    }

    #[tokio::test]
    async fn unknown_deployment_is_reported() {
        let fixture = Fixture::new(&["east"]);
        let mut session = fixture.session();

        let err = check(name_args(), &mut session).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentNotFound { .. }));
        assert!(err.hint().is_some());
    }
}
