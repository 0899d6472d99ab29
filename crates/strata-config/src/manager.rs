//! Load, mutate, replicate and cross-check the remote config
//!
//! # Lock contract
//!
//! [`RemoteConfigManager::modify`] and [`RemoteConfigManager::destroy`]
//! must only be called while the deployment lock is held. The caller passes
//! the lock's [`LockLiveness`]; it is checked before the primary write and
//! again before fanning out, so a command whose lock was lost stops writing.
//!
//! # Replication
//!
//! The primary cluster's copy is authoritative and is written with
//! compare-and-swap. Other members are then overwritten concurrently. A
//! failed member write is reported in [`ModifyOutcome::failed_clusters`] and
//! does not roll back the primary; [`RemoteConfigManager::validate_consistency`]
//! surfaces any divergence left behind.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use strata_common::store::ConfigMapRecord;
use strata_common::{
    Clock, ClusterAddressBook, ClusterConnection, Error, Result, SystemClock,
    DEPLOYMENT_LABEL_KEY, FIELD_MANAGER, MANAGED_BY_LABEL_KEY,
};
use strata_lock::LockLiveness;

use crate::consistency::{ActiveContextSelector, ConsistencyReport, ContextSelector, Mismatch};
use crate::document::RemoteConfigDocument;
use crate::migration::{self, Upgraded};
use crate::{CONFIG_MAP_NAME, DATA_KEY};

/// Attempts at the primary compare-and-swap write before giving up
pub const MAX_CAS_ATTEMPTS: u32 = 3;

/// Result of a replicated modification
#[derive(Debug)]
pub struct ModifyOutcome {
    /// The document as written to the primary
    pub document: RemoteConfigDocument,
    /// Clusters holding the new document, primary first
    pub written: Vec<String>,
    /// Former members whose copy was deleted
    pub removed: Vec<String>,
    /// Clusters whose write or cleanup failed
    pub failed_clusters: Vec<(String, Error)>,
    /// Primary writes retried after a concurrent change
    pub conflict_retries: u32,
}

impl ModifyOutcome {
    /// True when every member holds the new document
    pub fn is_complete(&self) -> bool {
        self.failed_clusters.is_empty()
    }
}

/// Result of deleting every copy of a deployment's config
#[derive(Debug, Default)]
pub struct DestroyOutcome {
    /// Clusters whose copy was deleted
    pub deleted: Vec<String>,
    /// Clusters that had no copy
    pub absent: Vec<String>,
    /// Clusters where the delete failed
    pub failed: Vec<(String, Error)>,
}

/// Remote config access for one namespace
pub struct RemoteConfigManager {
    namespace: String,
    address_book: Arc<ClusterAddressBook>,
    actor: String,
    clock: Arc<dyn Clock>,
    selector: Arc<dyn ContextSelector>,
}

impl RemoteConfigManager {
    /// Create a manager acting as `actor`
    ///
    /// Unmapped cluster references resolve to the active kubeconfig context
    /// unless another selector is installed with [`Self::with_selector`].
    pub fn new(
        address_book: Arc<ClusterAddressBook>,
        namespace: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        let selector = Arc::new(ActiveContextSelector::new(
            address_book.connector().clone(),
        ));
        Self {
            namespace: namespace.into(),
            address_book,
            actor: actor.into(),
            clock: Arc::new(SystemClock),
            selector,
        }
    }

    /// Use `clock` for document timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `selector` for references without a context mapping
    pub fn with_selector(mut self, selector: Arc<dyn ContextSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Namespace holding the config
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Read the primary's copy, creating or migrating it as needed
    ///
    /// A missing copy is created at the current schema version. A stale copy
    /// is migrated and written back before returning; if another writer
    /// changes it first, the copy is re-read and migrated again only if it
    /// is still stale.
    pub async fn load_or_create(
        &self,
        deployment: &str,
        primary: &str,
    ) -> Result<RemoteConfigDocument> {
        let conn = self.address_book.resolve(primary).await?;
        let store = conn.config_maps();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let record = match store.read(&self.namespace, CONFIG_MAP_NAME).await {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    let document = RemoteConfigDocument::new(
                        deployment,
                        &self.namespace,
                        &self.actor,
                        self.clock.now(),
                    );
                    document.validate()?;
                    match store.create(&self.encode(&document)?).await {
                        Ok(_) => {
                            info!(
                                namespace = %self.namespace,
                                deployment = %deployment,
                                cluster = %primary,
                                "Created remote config"
                            );
                            return Ok(document);
                        }
                        Err(e) if e.is_already_exists() => {
                            store.read(&self.namespace, CONFIG_MAP_NAME).await?
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            };

            let upgraded = self.decode(&record)?;
            if upgraded.document.metadata.name != deployment {
                return Err(Error::validation_for_field(
                    "metadata.name",
                    format!(
                        "namespace '{}' already holds deployment '{}'",
                        self.namespace, upgraded.document.metadata.name
                    ),
                ));
            }
            if !upgraded.migrated() {
                return Ok(upgraded.document);
            }

            let mut updated = self.encode(&upgraded.document)?;
            updated.resource_version = record.resource_version.clone();
            match store.replace(&updated).await {
                Ok(_) => {
                    info!(
                        namespace = %self.namespace,
                        cluster = %primary,
                        from_versions = ?upgraded.applied,
                        schema_version = upgraded.document.metadata.schema_version,
                        "Migrated remote config"
                    );
                    return Ok(upgraded.document);
                }
                Err(e) if e.is_conflict() && attempt < MAX_CAS_ATTEMPTS => {
                    debug!(
                        namespace = %self.namespace,
                        cluster = %primary,
                        attempt,
                        "Remote config changed during migration, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read the primary's copy without writing anything
    ///
    /// A stale copy is migrated in memory only.
    pub async fn load(&self, primary: &str) -> Result<RemoteConfigDocument> {
        let conn = self.address_book.resolve(primary).await?;
        let record = conn
            .config_maps()
            .read(&self.namespace, CONFIG_MAP_NAME)
            .await?;
        Ok(self.decode(&record)?.document)
    }

    /// Apply `mutator` to the primary's copy and replicate the result
    ///
    /// The caller must hold the deployment lock. The mutator may run more
    /// than once if the primary copy changes concurrently.
    pub async fn modify<F>(
        &self,
        primary: &str,
        liveness: &LockLiveness,
        mut mutator: F,
    ) -> Result<ModifyOutcome>
    where
        F: FnMut(&mut RemoteConfigDocument) -> Result<()> + Send,
    {
        let conn = self.address_book.resolve(primary).await?;
        let store = conn.config_maps();

        let mut attempt = 0;
        let (previous, document) = loop {
            attempt += 1;
            let record = store.read(&self.namespace, CONFIG_MAP_NAME).await?;
            let previous = self.decode(&record)?.document;

            let mut document = previous.clone();
            mutator(&mut document)?;
            document.touch(&self.actor, self.clock.now());
            document.validate()?;
            if !document.clusters.contains_key(primary) {
                return Err(Error::validation_for_field(
                    "clusters",
                    format!("primary cluster '{primary}' must remain part of the deployment"),
                ));
            }

            liveness.ensure_held()?;
            let mut updated = self.encode(&document)?;
            updated.resource_version = record.resource_version.clone();
            match store.replace(&updated).await {
                Ok(_) => break (previous, document),
                Err(e) if e.is_conflict() && attempt < MAX_CAS_ATTEMPTS => {
                    debug!(
                        namespace = %self.namespace,
                        cluster = %primary,
                        attempt,
                        "Remote config changed concurrently, re-applying"
                    );
                }
                Err(e) => return Err(e),
            }
        };
        info!(namespace = %self.namespace, cluster = %primary, "Wrote remote config to primary");

        liveness.ensure_held()?;

        let members: Vec<&String> = document
            .clusters
            .keys()
            .filter(|r| r.as_str() != primary)
            .collect();
        let former: Vec<&String> = previous
            .clusters
            .keys()
            .filter(|r| r.as_str() != primary && !document.clusters.contains_key(*r))
            .collect();

        let doc = &document;
        let writes = join_all(members.iter().map(|reference| async move {
            (reference.to_string(), self.write_copy(reference, doc).await)
        }));
        let deletes = join_all(former.iter().map(|reference| async move {
            (reference.to_string(), self.delete_copy(reference).await)
        }));
        let (writes, deletes) = futures::join!(writes, deletes);

        let mut written = vec![primary.to_string()];
        let mut removed = Vec::new();
        let mut failed_clusters = Vec::new();
        for (reference, result) in writes {
            match result {
                Ok(()) => written.push(reference),
                Err(e) => {
                    warn!(cluster = %reference, error = %e, "Failed to replicate remote config");
                    failed_clusters.push((reference, e));
                }
            }
        }
        for (reference, result) in deletes {
            match result {
                Ok(_) => removed.push(reference),
                Err(e) => {
                    warn!(cluster = %reference, error = %e, "Failed to delete remote config from former member");
                    failed_clusters.push((reference, e));
                }
            }
        }

        Ok(ModifyOutcome {
            document,
            written,
            removed,
            failed_clusters,
            conflict_retries: attempt - 1,
        })
    }

    /// Compare every reachable copy against the first one read
    ///
    /// References are processed in order. Unmapped references are resolved
    /// through the context selector and the choice is recorded in both the
    /// address book and the report. A copy that cannot be decoded (corrupt,
    /// or written by a newer schema) is recorded as invalid and left out of
    /// the comparison. With a single reference only the connectivity probe
    /// runs.
    pub async fn validate_consistency(&self, references: &[String]) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();
        let mut baseline: Option<(&str, RemoteConfigDocument)> = None;

        for reference in references {
            let conn = self.connect(reference, &mut report).await?;
            if let Err(e) = conn.probe().await {
                warn!(cluster = %reference, context = %conn.context, error = %e, "Cluster unreachable");
                report.unreachable.push(reference.clone());
                continue;
            }
            report.probed.push(reference.clone());

            if references.len() == 1 {
                debug!(cluster = %reference, "Single-cluster deployment, skipping comparison");
                break;
            }

            let record = match conn
                .config_maps()
                .read(&self.namespace, CONFIG_MAP_NAME)
                .await
            {
                Ok(record) => record,
                Err(e) if e.is_not_found() => {
                    warn!(cluster = %reference, "Remote config missing");
                    report.missing.push(reference.clone());
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    warn!(cluster = %reference, error = %e, "Remote config unreadable");
                    report.unreachable.push(reference.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            let document = match self.decode(&record) {
                Ok(upgraded) => upgraded.document,
                Err(e) => {
                    warn!(cluster = %reference, error = %e, "Remote config undecodable");
                    report.invalid.push((reference.clone(), e.to_string()));
                    continue;
                }
            };
            report.compared.push(reference.clone());

            match &baseline {
                None => {
                    report.reference = Some(reference.clone());
                    baseline = Some((reference.as_str(), document));
                }
                Some((first, expected)) => {
                    if let Some(field) = expected.topology_difference(&document) {
                        warn!(
                            cluster_a = %first,
                            cluster_b = %reference,
                            field,
                            "Remote config mismatch"
                        );
                        report.mismatch = Some(Mismatch {
                            cluster_a: first.to_string(),
                            cluster_b: reference.clone(),
                            field: field.to_string(),
                        });
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Delete every copy of the config from `references`
    ///
    /// The caller must hold the deployment lock.
    pub async fn destroy(
        &self,
        references: &[String],
        liveness: &LockLiveness,
    ) -> Result<DestroyOutcome> {
        liveness.ensure_held()?;

        let results = join_all(references.iter().map(|reference| async move {
            (reference.clone(), self.delete_copy(reference).await)
        }))
        .await;

        let mut outcome = DestroyOutcome::default();
        for (reference, result) in results {
            match result {
                Ok(true) => outcome.deleted.push(reference),
                Ok(false) => outcome.absent.push(reference),
                Err(e) => {
                    warn!(cluster = %reference, error = %e, "Failed to delete remote config");
                    outcome.failed.push((reference, e));
                }
            }
        }
        info!(
            namespace = %self.namespace,
            deleted = outcome.deleted.len(),
            failed = outcome.failed.len(),
            "Destroyed remote config"
        );
        Ok(outcome)
    }

    async fn connect(
        &self,
        reference: &str,
        report: &mut ConsistencyReport,
    ) -> Result<ClusterConnection> {
        if self.address_book.context_for(reference).is_none() {
            let contexts = self.address_book.connector().available_contexts().await?;
            let context = self.selector.select(reference, &contexts).await?;
            info!(cluster = %reference, context = %context, "Resolved cluster reference");
            self.address_book.set_context(reference, context.clone());
            report
                .resolved_contexts
                .insert(reference.to_string(), context);
        }
        self.address_book.resolve(reference).await
    }

    async fn write_copy(&self, reference: &str, document: &RemoteConfigDocument) -> Result<()> {
        let conn = self.address_book.resolve(reference).await?;
        let store = conn.config_maps();
        let mut record = self.encode(document)?;

        match store.read(&self.namespace, CONFIG_MAP_NAME).await {
            Ok(existing) => {
                record.resource_version = existing.resource_version;
                store.replace(&record).await?;
            }
            Err(e) if e.is_not_found() => {
                store.create(&record).await?;
            }
            Err(e) => return Err(e),
        }
        debug!(cluster = %reference, "Replicated remote config");
        Ok(())
    }

    async fn delete_copy(&self, reference: &str) -> Result<bool> {
        let conn = self.address_book.resolve(reference).await?;
        match conn
            .config_maps()
            .delete(&self.namespace, CONFIG_MAP_NAME)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn encode(&self, document: &RemoteConfigDocument) -> Result<ConfigMapRecord> {
        Ok(ConfigMapRecord::new(&self.namespace, CONFIG_MAP_NAME)
            .with_label(DEPLOYMENT_LABEL_KEY, &document.metadata.name)
            .with_label(MANAGED_BY_LABEL_KEY, FIELD_MANAGER)
            .with_data(DATA_KEY, document.to_yaml()?))
    }

    fn decode(&self, record: &ConfigMapRecord) -> Result<Upgraded> {
        let yaml = record.data.get(DATA_KEY).ok_or_else(|| {
            Error::serialization_for_kind(
                "ConfigMap",
                format!(
                    "{}/{} has no '{DATA_KEY}' entry",
                    record.namespace, record.name
                ),
            )
        })?;
        migration::decode(yaml, &self.actor, self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::consistency::MockContextSelector;
    use crate::document::ClusterBinding;
    use strata_common::retry::RetryConfig;
    use strata_common::store::memory::{MemoryCluster, MemoryConnector};
    use strata_lock::{LockConfig, LockHandle, LockManager};

    const NS: &str = "ns1";

    struct Fixture {
        clusters: BTreeMap<&'static str, MemoryCluster>,
        book: Arc<ClusterAddressBook>,
        manager: RemoteConfigManager,
    }

    fn fixture(references: &[&'static str]) -> Fixture {
        let connector = Arc::new(MemoryConnector::new());
        let mut clusters = BTreeMap::new();
        let mut mappings = Vec::new();
        for reference in references {
            let cluster = MemoryCluster::new().with_read_retry(RetryConfig::none());
            connector.insert(format!("kind-{reference}"), cluster.clone());
            clusters.insert(*reference, cluster);
            mappings.push((reference.to_string(), format!("kind-{reference}")));
        }
        let book = Arc::new(ClusterAddressBook::new(connector, mappings));
        let manager = RemoteConfigManager::new(book.clone(), NS, "alice@laptop/1");
        Fixture {
            clusters,
            book,
            manager,
        }
    }

    async fn lock(cluster: &MemoryCluster) -> LockHandle {
        LockManager::new(Arc::new(cluster.clone()), LockConfig::default())
            .with_clock(cluster.clock())
            .acquire(NS, "deploy-lock", "alice@laptop/1")
            .await
            .unwrap()
    }

    fn add_members(
        references: &'static [&'static str],
    ) -> impl FnMut(&mut RemoteConfigDocument) -> Result<()> + Send {
        move |doc| {
            for reference in references {
                if !doc.clusters.contains_key(*reference) {
                    doc.add_cluster(*reference, ClusterBinding::new(NS, "deploy"))?;
                }
            }
            Ok(())
        }
    }

    fn stored(cluster: &MemoryCluster) -> RemoteConfigDocument {
        let record = cluster.config_map(NS, CONFIG_MAP_NAME).unwrap();
        migration::decode(&record.data[DATA_KEY], "test", chrono::Utc::now())
            .unwrap()
            .document
    }

    #[tokio::test]
    async fn load_or_create_writes_fresh_document_once() {
        let f = fixture(&["east"]);
        let east = &f.clusters["east"];

        let created = f.manager.load_or_create("deploy", "east").await.unwrap();
        assert_eq!(created.metadata.name, "deploy");
        assert_eq!(created.metadata.created_by, "alice@laptop/1");

        let record = east.config_map(NS, CONFIG_MAP_NAME).unwrap();
        assert_eq!(record.labels[DEPLOYMENT_LABEL_KEY], "deploy");
        assert_eq!(record.labels[MANAGED_BY_LABEL_KEY], FIELD_MANAGER);

        let writes = east.write_calls();
        let loaded = f.manager.load_or_create("deploy", "east").await.unwrap();
        assert_eq!(loaded, created);
        assert_eq!(east.write_calls(), writes);
    }

    #[tokio::test]
    async fn load_or_create_rejects_other_deployment() {
        let f = fixture(&["east"]);
        f.manager.load_or_create("deploy", "east").await.unwrap();
        let err = f
            .manager
            .load_or_create("other", "east")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already holds deployment 'deploy'"));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let f = fixture(&["east"]);
        assert!(f.manager.load("east").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn modify_replicates_to_every_member() {
        let f = fixture(&["east", "west", "south"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();

        let outcome = f
            .manager
            .modify("east", &handle.liveness(), add_members(&["east", "west", "south"]))
            .await
            .unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.written, vec!["east", "south", "west"]);
        assert_eq!(outcome.conflict_retries, 0);
        assert_eq!(
            outcome.document.metadata.last_updated_by.as_deref(),
            Some("alice@laptop/1")
        );
        for cluster in f.clusters.values() {
            assert_eq!(stored(cluster), outcome.document);
        }
        handle.release().await;
    }

    #[tokio::test]
    async fn modify_reapplies_after_concurrent_change() {
        let f = fixture(&["east"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();

        let east = f.clusters["east"].clone();
        let mut calls = 0;
        let outcome = f
            .manager
            .modify("east", &handle.liveness(), move |doc| {
                calls += 1;
                if calls == 1 {
                    // Bump the stored version behind the manager's back
                    let current = east.config_map(NS, CONFIG_MAP_NAME).unwrap();
                    east.put_config_map(current);
                }
                doc.add_cluster("east", ClusterBinding::new(NS, "deploy"))
            })
            .await
            .unwrap();

        assert_eq!(outcome.conflict_retries, 1);
        assert!(stored(&f.clusters["east"]).clusters.contains_key("east"));
    }

    #[tokio::test]
    async fn modify_gives_up_after_bounded_conflicts() {
        let f = fixture(&["east"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();

        let east = f.clusters["east"].clone();
        let err = f
            .manager
            .modify("east", &handle.liveness(), move |doc| {
                let current = east.config_map(NS, CONFIG_MAP_NAME).unwrap();
                east.put_config_map(current);
                add_members(&["east"])(doc)
            })
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn modify_refuses_without_lock() {
        let f = fixture(&["east"]);
        f.manager.load_or_create("deploy", "east").await.unwrap();
        let handle = lock(&f.clusters["east"]).await;
        let liveness = handle.liveness();
        handle.release().await;

        let writes = f.clusters["east"].write_calls();
        let err = f
            .manager
            .modify("east", &liveness, add_members(&["east"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));
        assert_eq!(f.clusters["east"].write_calls(), writes);
    }

    #[tokio::test]
    async fn mutator_error_writes_nothing() {
        let f = fixture(&["east"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        let before = f.clusters["east"].config_map(NS, CONFIG_MAP_NAME).unwrap();

        let err = f
            .manager
            .modify("east", &handle.liveness(), |doc| {
                doc.remove_node("missing").map(|_| ())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(
            f.clusters["east"].config_map(NS, CONFIG_MAP_NAME).unwrap(),
            before
        );
    }

    #[tokio::test]
    async fn removing_primary_is_rejected() {
        let f = fixture(&["east", "west"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        f.manager
            .modify("east", &handle.liveness(), add_members(&["east", "west"]))
            .await
            .unwrap();

        let err = f
            .manager
            .modify("east", &handle.liveness(), |doc| {
                doc.remove_cluster("east").map(|_| ())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("primary cluster 'east'"));
    }

    #[tokio::test]
    async fn removed_member_copy_is_deleted() {
        let f = fixture(&["east", "west"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        f.manager
            .modify("east", &handle.liveness(), add_members(&["east", "west"]))
            .await
            .unwrap();
        assert!(f.clusters["west"].config_map(NS, CONFIG_MAP_NAME).is_some());

        let outcome = f
            .manager
            .modify("east", &handle.liveness(), |doc| {
                doc.remove_cluster("west").map(|_| ())
            })
            .await
            .unwrap();
        assert_eq!(outcome.removed, vec!["west"]);
        assert_eq!(outcome.written, vec!["east"]);
        assert!(f.clusters["west"].config_map(NS, CONFIG_MAP_NAME).is_none());
    }

    #[tokio::test]
    async fn unmapped_reference_is_resolved_through_selector() {
        let f = fixture(&["east", "west"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        f.manager
            .modify("east", &handle.liveness(), add_members(&["east", "west"]))
            .await
            .unwrap();

        let mut selector = MockContextSelector::new();
        selector
            .expect_select()
            .withf(|reference, contexts| {
                reference == "remote" && contexts.iter().any(|c| c == "kind-west")
            })
            .times(1)
            .returning(|_, _| Ok("kind-west".to_string()));
        let manager = RemoteConfigManager::new(f.book.clone(), NS, "bob@desk/2")
            .with_selector(Arc::new(selector));

        let report = manager
            .validate_consistency(&["east".to_string(), "remote".to_string()])
            .await
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.compared, vec!["east", "remote"]);
        assert_eq!(report.resolved_contexts["remote"], "kind-west");
        assert_eq!(f.book.context_for("remote").as_deref(), Some("kind-west"));
    }

    #[tokio::test]
    async fn unresolvable_reference_fails_without_active_context() {
        let f = fixture(&["east"]);
        let err = f
            .manager
            .validate_consistency(&["east".to_string(), "nowhere".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownClusterReference { .. }));
    }

    #[tokio::test]
    async fn unreachable_and_missing_copies_are_reported() {
        let f = fixture(&["east", "west", "south"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        f.manager
            .modify("east", &handle.liveness(), add_members(&["east"]))
            .await
            .unwrap();
        f.clusters["west"].set_reachable(false);

        let refs: Vec<String> = ["east", "west", "south"].map(String::from).to_vec();
        let report = f.manager.validate_consistency(&refs).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.reference.as_deref(), Some("east"));
        assert_eq!(report.unreachable, vec!["west"]);
        assert_eq!(report.missing, vec!["south"]);
        assert_eq!(report.probed, vec!["east", "south"]);
    }

    #[tokio::test]
    async fn destroy_deletes_every_copy() {
        let f = fixture(&["east", "west", "south"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();
        f.manager
            .modify("east", &handle.liveness(), add_members(&["east", "west"]))
            .await
            .unwrap();

        let refs: Vec<String> = ["east", "west", "south"].map(String::from).to_vec();
        let outcome = f.manager.destroy(&refs, &handle.liveness()).await.unwrap();
        assert_eq!(outcome.deleted, vec!["east", "west"]);
        assert_eq!(outcome.absent, vec!["south"]);
        assert!(outcome.failed.is_empty());
        assert!(f
            .clusters
            .values()
            .all(|c| c.config_map(NS, CONFIG_MAP_NAME).is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loss_stops_fan_out() {
        let f = fixture(&["east", "west"]);
        let handle = lock(&f.clusters["east"]).await;
        f.manager.load_or_create("deploy", "east").await.unwrap();

        // Someone else takes the lease; the heartbeat notices on its next tick
        let east = f.clusters["east"].clone();
        let lease = east.lease(NS, "deploy-lock").unwrap();
        strata_common::store::LeaseStore::transfer(&east, &lease, "intruder")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let err = f
            .manager
            .modify("east", &handle.liveness(), add_members(&["east", "west"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockLost { .. }));
        assert!(f.clusters["west"].config_map(NS, CONFIG_MAP_NAME).is_none());
    }
}
