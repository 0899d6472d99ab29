//! Cluster reference resolution
//!
//! A deployment names its member clusters with user-chosen references
//! ("east", "west"). Each user maps those references to contexts in their
//! own kubeconfig, so the same deployment can be driven from different
//! machines. The address book turns a reference into a live connection,
//! opening at most one connection per distinct context.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{ClusterApi, ConfigMapStore, Connector, LeaseStore};
use crate::{Error, Result};

/// A resolved cluster reference
#[derive(Clone)]
pub struct ClusterConnection {
    /// The user-facing cluster reference
    pub reference: String,
    /// Kubeconfig context the reference maps to
    pub context: String,
    api: Arc<dyn ClusterApi>,
}

impl ClusterConnection {
    /// Lease store for this cluster
    pub fn leases(&self) -> Arc<dyn LeaseStore> {
        self.api.leases()
    }

    /// Config map store for this cluster
    pub fn config_maps(&self) -> Arc<dyn ConfigMapStore> {
        self.api.config_maps()
    }

    /// Check the cluster's API server is reachable
    pub async fn probe(&self) -> Result<()> {
        self.api.probe().await
    }
}

impl std::fmt::Debug for ClusterConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnection")
            .field("reference", &self.reference)
            .field("context", &self.context)
            .finish()
    }
}

/// Maps cluster references to contexts and caches one connection per context
pub struct ClusterAddressBook {
    mappings: RwLock<BTreeMap<String, String>>,
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, Arc<dyn ClusterApi>>>,
}

impl ClusterAddressBook {
    /// Create an address book from reference → context mappings
    pub fn new(
        connector: Arc<dyn Connector>,
        mappings: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            mappings: RwLock::new(mappings.into_iter().collect()),
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a reference to its context and a live connection
    ///
    /// Fails with `UnknownClusterReference` if the reference is unmapped.
    pub async fn resolve(&self, reference: &str) -> Result<ClusterConnection> {
        let context = self
            .context_for(reference)
            .ok_or_else(|| Error::unknown_cluster(reference))?;

        let mut connections = self.connections.lock().await;
        let api = match connections.get(&context) {
            Some(api) => api.clone(),
            None => {
                debug!(reference = %reference, context = %context, "Connecting to cluster");
                let api = self.connector.connect(&context).await?;
                connections.insert(context.clone(), api.clone());
                api
            }
        };

        Ok(ClusterConnection {
            reference: reference.to_string(),
            context,
            api,
        })
    }

    /// Every mapped reference, sorted
    pub fn list(&self) -> Vec<String> {
        self.mappings.read().keys().cloned().collect()
    }

    /// Context for a reference, if mapped
    pub fn context_for(&self, reference: &str) -> Option<String> {
        self.mappings.read().get(reference).cloned()
    }

    /// Record (or change) the context for a reference
    pub fn set_context(&self, reference: impl Into<String>, context: impl Into<String>) {
        self.mappings.write().insert(reference.into(), context.into());
    }

    /// Snapshot of all mappings, for persisting back to local config
    pub fn mappings(&self) -> BTreeMap<String, String> {
        self.mappings.read().clone()
    }

    /// The connector used to open clusters
    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryCluster, MemoryConnector};
    use crate::store::MockConnector;

    fn book() -> (Arc<MemoryConnector>, ClusterAddressBook) {
        let connector = Arc::new(MemoryConnector::new());
        connector.insert("kind-east", MemoryCluster::new());
        connector.insert("kind-west", MemoryCluster::new());
        let book = ClusterAddressBook::new(
            connector.clone(),
            [
                ("east".to_string(), "kind-east".to_string()),
                ("west".to_string(), "kind-west".to_string()),
                ("east-alias".to_string(), "kind-east".to_string()),
            ],
        );
        (connector, book)
    }

    #[tokio::test]
    async fn test_resolve_known_reference() {
        let (_, book) = book();
        let conn = book.resolve("east").await.unwrap();
        assert_eq!(conn.reference, "east");
        assert_eq!(conn.context, "kind-east");
        conn.probe().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_unknown_reference() {
        let (_, book) = book();
        let err = book.resolve("north").await.unwrap_err();
        assert!(matches!(err, Error::UnknownClusterReference { reference } if reference == "north"));
    }

    #[tokio::test]
    async fn test_one_connection_per_context() {
        let (connector, book) = book();
        book.resolve("east").await.unwrap();
        book.resolve("east").await.unwrap();
        book.resolve("east-alias").await.unwrap();
        assert_eq!(connector.connects(), 1);

        book.resolve("west").await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_set_context_adds_mapping() {
        let (_, book) = book();
        book.set_context("north", "kind-east");
        assert_eq!(book.context_for("north").as_deref(), Some("kind-east"));
        assert_eq!(book.list(), vec!["east", "east-alias", "north", "west"]);
        assert!(book.resolve("north").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let mut connector = MockConnector::new();
        let mut calls = 0;
        connector.expect_connect().times(2).returning(move |ctx| {
            calls += 1;
            if calls == 1 {
                Err(Error::kubeconfig(ctx, "context not found in kubeconfig"))
            } else {
                Ok(Arc::new(MemoryCluster::new()) as Arc<dyn ClusterApi>)
            }
        });

        let book = ClusterAddressBook::new(
            Arc::new(connector),
            [("east".to_string(), "kind-east".to_string())],
        );
        assert!(book.resolve("east").await.is_err());
        assert!(book.resolve("east").await.is_ok());
    }
}
