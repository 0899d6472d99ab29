//! `strata node` - add and remove consensus nodes

use clap::{Args, Subcommand};

use strata_config::ConsensusNode;

use super::{report_outcome, Session};
use crate::Result;

#[derive(Subcommand, Debug)]
pub enum NodeCommand {
    /// Place a new consensus node on a member cluster
    Add(NodeAddArgs),
    /// Remove a consensus node
    Remove(NodeRemoveArgs),
}

#[derive(Args, Debug)]
pub struct NodeAddArgs {
    /// Deployment name
    pub deployment: String,

    /// Node alias, unique within the deployment
    pub alias: String,

    /// Member cluster to place the node on (default: the primary)
    #[arg(long)]
    pub cluster: Option<String>,
}

#[derive(Args, Debug)]
pub struct NodeRemoveArgs {
    /// Deployment name
    pub deployment: String,

    /// Alias of the node to remove
    pub alias: String,
}

pub async fn run(cmd: NodeCommand, session: &mut Session) -> Result<()> {
    match cmd {
        NodeCommand::Add(args) => add(args, session).await,
        NodeCommand::Remove(args) => remove(args, session).await,
    }
}

pub(crate) async fn add(args: NodeAddArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.deployment)?.clone();
    let cluster = args.cluster.clone().unwrap_or_else(|| entry.primary.clone());
    let book = session.address_book();
    let context = book
        .context_for(&cluster)
        .ok_or_else(|| strata_common::Error::unknown_cluster(&cluster))?;
    let manager = session.config_manager(book.clone(), &entry.namespace);

    let (manager, primary, alias, cluster_ref) = (&manager, &entry.primary, &args.alias, &cluster);
    let outcome = session
        .with_lock(&book, &entry.namespace, &args.deployment, primary, move |liveness| async move {
            let outcome = manager
                .modify(primary, &liveness, |doc| {
                    let binding = doc
                        .clusters
                        .get(cluster_ref)
                        .cloned()
                        .ok_or_else(|| strata_common::Error::unknown_cluster(cluster_ref))?;
                    let id = doc.next_node_id();
                    doc.add_node(ConsensusNode::on_cluster(
                        alias.clone(),
                        id,
                        cluster_ref.clone(),
                        context.clone(),
                        &binding,
                    ))?;
                    doc.record_command(format!("node add {alias} --cluster {cluster_ref}"));
                    Ok(())
                })
                .await?;
            Ok(outcome)
        })
        .await?;

    if let Some(node) = outcome.document.node(&args.alias) {
        println!(
            "Added node '{}' (id {}) on '{}': {}",
            node.node_alias,
            node.node_id,
            node.cluster_reference,
            node.fqdn()
        );
    }
    report_outcome(&outcome)
}

async fn remove(args: NodeRemoveArgs, session: &mut Session) -> Result<()> {
    let entry = session.config.deployment(&args.deployment)?.clone();
    let book = session.address_book();
    let manager = session.config_manager(book.clone(), &entry.namespace);

    let (manager, primary, alias) = (&manager, &entry.primary, &args.alias);
    let outcome = session
        .with_lock(&book, &entry.namespace, &args.deployment, primary, move |liveness| async move {
            let outcome = manager
                .modify(primary, &liveness, |doc| {
                    doc.remove_node(alias)?;
                    doc.record_command(format!("node remove {alias}"));
                    Ok(())
                })
                .await?;
            Ok(outcome)
        })
        .await?;

    println!("Removed node '{}'", args.alias);
    report_outcome(&outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::Fixture;
    use crate::config::DeploymentEntry;
    use crate::Error;

    /// A deployment on east and west, created through the config manager
    async fn deployed(fixture: &Fixture) -> Session {
        let mut session = fixture.session();
        session.config.deployments.insert(
            "deploy".to_string(),
            DeploymentEntry {
                namespace: "ns1".to_string(),
                primary: "east".to_string(),
                clusters: vec!["east".to_string(), "west".to_string()],
            },
        );
        let book = session.address_book();
        let manager = session.config_manager(book.clone(), "ns1");
        let manager = &manager;
        session
            .with_lock(&book, "ns1", "deploy", "east", move |liveness| async move {
                manager.load_or_create("deploy", "east").await?;
                manager
                    .modify("east", &liveness, |doc| {
                        for cluster in ["east", "west"] {
                            doc.add_cluster(
                                cluster,
                                strata_config::ClusterBinding::new("ns1", "deploy"),
                            )?;
                        }
                        Ok(())
                    })
                    .await?;
                Ok(())
            })
            .await
            .unwrap();
        session
    }

    fn add_args(alias: &str, cluster: Option<&str>) -> NodeAddArgs {
        NodeAddArgs {
            deployment: "deploy".to_string(),
            alias: alias.to_string(),
            cluster: cluster.map(String::from),
        }
    }

    async fn load(session: &Session, cluster: &str) -> strata_config::RemoteConfigDocument {
        session
            .config_manager(session.address_book(), "ns1")
            .load(cluster)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn nodes_get_sequential_ids_and_history() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = deployed(&fixture).await;

        add(add_args("node1", None), &mut session).await.unwrap();
        add(add_args("node2", Some("west")), &mut session).await.unwrap();

        let doc = load(&session, "west").await;
        let node1 = doc.node("node1").unwrap();
        let node2 = doc.node("node2").unwrap();
        assert_eq!((node1.node_id, node2.node_id), (0, 1));
        assert_eq!(node1.cluster_reference, "east");
        assert_eq!(node2.context, "kind-west");
        assert_eq!(
            doc.command_history.last().map(String::as_str),
            Some("node add node2 --cluster west")
        );
        assert_eq!(doc.metadata.last_updated_by.as_deref(), Some("alice@laptop/1"));
    }

    #[tokio::test]
    async fn duplicate_alias_is_rejected_and_nothing_written() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = deployed(&fixture).await;
        add(add_args("node1", None), &mut session).await.unwrap();
        let writes = fixture.cluster("east").write_calls();

        let err = add(add_args("node1", Some("west")), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Core(strata_common::Error::Validation { .. })
        ));
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());
        // Only the lease create and delete touched the primary
        assert_eq!(fixture.cluster("east").write_calls(), writes + 2);
    }

    #[tokio::test]
    async fn node_on_unmapped_cluster_is_rejected() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = deployed(&fixture).await;

        let err = add(add_args("node1", Some("north")), &mut session)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Core(strata_common::Error::UnknownClusterReference { .. })
        ));
    }

    #[tokio::test]
    async fn remove_node_replicates() {
        let fixture = Fixture::new(&["east", "west"]);
        let mut session = deployed(&fixture).await;
        add(add_args("node1", None), &mut session).await.unwrap();

        remove(
            NodeRemoveArgs {
                deployment: "deploy".to_string(),
                alias: "node1".to_string(),
            },
            &mut session,
        )
        .await
        .unwrap();

        assert!(load(&session, "west").await.node("node1").is_none());
    }
}
