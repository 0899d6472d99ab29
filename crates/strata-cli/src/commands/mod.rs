//! CLI commands

use std::future::Future;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use strata_common::store::kubernetes::KubeConnector;
use strata_common::store::Connector;
use strata_common::ClusterAddressBook;
use strata_config::{ActiveContextSelector, ContextSelector, ModifyOutcome, RemoteConfigManager};
use strata_lock::{lease_name, LeaseHolder, LockConfig, LockLiveness, LockManager};

use crate::config::{self, StrataConfig};
use crate::prompt::{PromptContextSelector, Prompter};
use crate::{Error, GlobalArgs, Result};

pub mod cluster_ref;
pub mod deployment;
pub mod lock;
pub mod node;

/// Print where a modification landed; partial replication is an error
pub(crate) fn report_outcome(outcome: &ModifyOutcome) -> Result<()> {
    println!("Updated: {}", outcome.written.join(", "));
    if !outcome.removed.is_empty() {
        println!("Removed copies: {}", outcome.removed.join(", "));
    }
    if outcome.is_complete() {
        return Ok(());
    }
    for (cluster, error) in &outcome.failed_clusters {
        eprintln!("  {cluster}: {error}");
    }
    let failed: Vec<&str> = outcome
        .failed_clusters
        .iter()
        .map(|(c, _)| c.as_str())
        .collect();
    Err(Error::command_failed(format!(
        "not replicated to {}; run `strata deployment check` once they are reachable",
        failed.join(", ")
    )))
}

/// Require an explicit yes before a destructive step
pub(crate) async fn confirm_destructive(session: &Session, yes: bool, question: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    if !session.interactive() {
        return Err(Error::validation(
            "refusing to continue without --yes when not interactive",
        ));
    }
    if session.prompter.confirm(question).await? {
        Ok(())
    } else {
        Err(Error::Aborted)
    }
}

/// Everything a command needs: local config, cluster access and lock identity
pub struct Session {
    config_path: PathBuf,
    /// Local config, saved back with [`Session::save`]
    pub config: StrataConfig,
    lock: LockConfig,
    interactive: bool,
    connector: Arc<dyn Connector>,
    identity: LeaseHolder,
    prompter: Arc<Prompter>,
}

impl Session {
    /// Load the local config and connect through the resolved kubeconfig
    pub fn open(global: &GlobalArgs) -> Result<Self> {
        let config_path = config::resolve_config_path(global.config.as_deref())?;
        let config = config::load_config(&config_path)?;
        let kubeconfig = config::resolve_kubeconfig(global.kubeconfig.as_deref(), &config);
        let lock = config
            .lock
            .resolve(global.lease_duration, global.lock_wait)?;
        let interactive = !global.non_interactive && std::io::stdin().is_terminal();
        debug!(
            config = %config_path.display(),
            kubeconfig = ?kubeconfig,
            interactive,
            "Opened session"
        );

        Ok(Self {
            config_path,
            config,
            lock,
            interactive,
            connector: Arc::new(KubeConnector::new(kubeconfig)),
            identity: LeaseHolder::current(),
            prompter: Arc::new(Prompter::stdin()),
        })
    }

    /// A non-interactive session over `connector` with default lock timing
    pub fn with_connector(
        config_path: PathBuf,
        config: StrataConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config_path,
            config,
            lock: LockConfig::default(),
            interactive: false,
            connector,
            identity: LeaseHolder::current(),
            prompter: Arc::new(Prompter::stdin()),
        }
    }

    /// Override lock timing
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Override the lock holder
    pub fn with_identity(mut self, identity: LeaseHolder) -> Self {
        self.identity = identity;
        self
    }

    /// Identity written into leases and document audit fields
    pub fn identity(&self) -> String {
        self.identity.identity()
    }

    /// Whether prompts may be shown
    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// The connector commands open clusters through
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Write the local config back to disk
    pub fn save(&self) -> Result<()> {
        config::save_config(&self.config_path, &self.config)
    }

    /// Address book seeded from the configured cluster references
    pub fn address_book(&self) -> Arc<ClusterAddressBook> {
        Arc::new(ClusterAddressBook::new(
            self.connector.clone(),
            self.config.cluster_refs.clone(),
        ))
    }

    /// Picks contexts for unmapped references: a prompt when interactive,
    /// otherwise the active kubeconfig context
    pub fn context_selector(&self) -> Arc<dyn ContextSelector> {
        if self.interactive {
            Arc::new(PromptContextSelector::new(self.prompter.clone()))
        } else {
            Arc::new(ActiveContextSelector::new(self.connector.clone()))
        }
    }

    /// Remote config manager for `namespace`
    pub fn config_manager(
        &self,
        book: Arc<ClusterAddressBook>,
        namespace: &str,
    ) -> RemoteConfigManager {
        RemoteConfigManager::new(book, namespace, self.identity())
            .with_selector(self.context_selector())
    }

    /// Lock manager over the leases of `primary`
    pub async fn lock_manager(&self, book: &ClusterAddressBook, primary: &str) -> Result<LockManager> {
        let conn = book.resolve(primary).await?;
        Ok(LockManager::new(conn.leases(), self.lock.clone()))
    }

    /// Map every reference in `references` that has no context yet
    ///
    /// New mappings go into both the address book and the local config.
    pub async fn map_references(
        &mut self,
        book: &ClusterAddressBook,
        references: &[String],
    ) -> Result<()> {
        let unmapped: Vec<&String> = references
            .iter()
            .filter(|r| book.context_for(r).is_none())
            .collect();
        if unmapped.is_empty() {
            return Ok(());
        }

        let contexts = self.connector.available_contexts().await?;
        let selector = self.context_selector();
        for reference in unmapped {
            let context = selector.select(reference, &contexts).await?;
            info!(cluster = %reference, context = %context, "Mapped cluster reference");
            book.set_context(reference.clone(), context.clone());
            self.config.cluster_refs.insert(reference.clone(), context);
        }
        Ok(())
    }

    /// Run `work` under the deployment lock on `primary`
    ///
    /// The lock is released whatever `work` returns. Work still running when
    /// the heartbeat loses the lease is abandoned with `LockLost`.
    pub async fn with_lock<T, F, Fut>(
        &self,
        book: &ClusterAddressBook,
        namespace: &str,
        deployment: &str,
        primary: &str,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(LockLiveness) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let manager = self.lock_manager(book, primary).await?;
        let handle = manager
            .acquire(namespace, &lease_name(deployment), &self.identity())
            .await?;

        let result = handle.run_guarded(work(handle.liveness())).await;
        handle.release().await;
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;

    #[tokio::test]
    async fn with_lock_releases_after_work() {
        let fixture = Fixture::new(&["east"]);
        let session = fixture.session();
        let book = session.address_book();

        let value = session
            .with_lock(&book, "ns1", "deploy", "east", |liveness| async move {
                liveness.ensure_held()?;
                Ok(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());
    }

    #[tokio::test]
    async fn with_lock_releases_after_failed_work() {
        let fixture = Fixture::new(&["east"]);
        let session = fixture.session();
        let book = session.address_book();

        let err = session
            .with_lock(&book, "ns1", "deploy", "east", |_| async move {
                Err::<(), _>(Error::validation("nope"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation { .. }));
        assert!(fixture.cluster("east").lease("ns1", "deploy-lock").is_none());
    }

    #[tokio::test]
    async fn unmapped_references_use_active_context() {
        let fixture = Fixture::new(&["east", "west"]);
        fixture
            .connector
            .set_default_context(Some("kind-west".to_string()));
        let mut session = fixture.session();
        session.config.cluster_refs.remove("west");
        let book = session.address_book();

        session
            .map_references(&book, &["east".to_string(), "west".to_string()])
            .await
            .unwrap();

        assert_eq!(book.context_for("west").as_deref(), Some("kind-west"));
        assert_eq!(session.config.cluster_refs["west"], "kind-west");
    }

    #[tokio::test]
    async fn unmapped_reference_without_active_context_fails() {
        let fixture = Fixture::new(&["east"]);
        let mut session = fixture.session();
        session.config.cluster_refs.clear();
        let book = session.address_book();

        let err = session
            .map_references(&book, &["east".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Core(strata_common::Error::UnknownClusterReference { .. })
        ));
    }
}
