//! Cross-cluster consistency reporting

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use strata_common::store::Connector;
use strata_common::{Error, Result};

/// Chooses a kubeconfig context for a cluster reference that has none
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ContextSelector: Send + Sync {
    /// Pick one of `contexts` for `reference`
    async fn select(&self, reference: &str, contexts: &[String]) -> Result<String>;
}

/// Non-interactive selector: always picks the active kubeconfig context
pub struct ActiveContextSelector {
    connector: Arc<dyn Connector>,
}

impl ActiveContextSelector {
    /// Select through `connector`'s active context
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl ContextSelector for ActiveContextSelector {
    async fn select(&self, reference: &str, _contexts: &[String]) -> Result<String> {
        self.connector
            .default_context()
            .await?
            .ok_or_else(|| Error::unknown_cluster(reference))
    }
}

/// The first pair of clusters whose copies disagree
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// Cluster whose copy was read first
    pub cluster_a: String,
    /// Cluster whose copy differs from it
    pub cluster_b: String,
    /// Document section that differs
    pub field: String,
}

/// Outcome of a consistency check across member clusters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Cluster whose copy every other copy was compared against
    pub reference: Option<String>,
    /// Clusters that answered the connectivity probe
    pub probed: Vec<String>,
    /// Clusters whose copy was read, reference first
    pub compared: Vec<String>,
    /// Clusters that could not be reached
    pub unreachable: Vec<String>,
    /// Reachable clusters without a stored copy
    pub missing: Vec<String>,
    /// Clusters whose copy could not be decoded, with the reason
    pub invalid: Vec<(String, String)>,
    /// Context mappings chosen during the check
    pub resolved_contexts: BTreeMap<String, String>,
    /// First disagreement found
    pub mismatch: Option<Mismatch>,
}

impl ConsistencyReport {
    /// True when no disagreement was found and every copy read decoded
    pub fn is_consistent(&self) -> bool {
        self.mismatch.is_none() && self.invalid.is_empty()
    }

    /// Fail with `RemoteConfigMismatch` if two copies disagree, or with a
    /// serialization error naming the first cluster whose copy is invalid
    pub fn ensure_consistent(&self) -> Result<()> {
        if let Some(m) = &self.mismatch {
            return Err(Error::RemoteConfigMismatch {
                cluster_a: m.cluster_a.clone(),
                cluster_b: m.cluster_b.clone(),
                field: m.field.clone(),
            });
        }
        match self.invalid.first() {
            None => Ok(()),
            Some((cluster, reason)) => Err(Error::serialization_for_kind(
                "ConfigMap",
                format!("copy on '{cluster}' is invalid: {reason}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::store::memory::{MemoryCluster, MemoryConnector};

    #[tokio::test]
    async fn active_selector_uses_default_context() {
        let connector = Arc::new(MemoryConnector::new());
        connector.insert("kind-east", MemoryCluster::new());
        let selector = ActiveContextSelector::new(connector.clone());

        let err = selector
            .select("east", &["kind-east".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownClusterReference { .. }));

        connector.set_default_context(Some("kind-east".to_string()));
        assert_eq!(selector.select("east", &[]).await.unwrap(), "kind-east");
    }

    #[test]
    fn ensure_consistent_reports_pair() {
        let mut report = ConsistencyReport::default();
        report.ensure_consistent().unwrap();

        report.mismatch = Some(Mismatch {
            cluster_a: "east".to_string(),
            cluster_b: "west".to_string(),
            field: "consensusNodes".to_string(),
        });
        assert!(!report.is_consistent());
        match report.ensure_consistent().unwrap_err() {
            Error::RemoteConfigMismatch {
                cluster_a,
                cluster_b,
                field,
            } => {
                assert_eq!((cluster_a.as_str(), cluster_b.as_str()), ("east", "west"));
                assert_eq!(field, "consensusNodes");
            }
            other => panic!("expected RemoteConfigMismatch, got {other:?}"),
        }
    }

    #[test]
    fn invalid_copy_is_inconsistent() {
        let report = ConsistencyReport {
            invalid: vec![("west".to_string(), "schema version 99 is newer".to_string())],
            ..Default::default()
        };
        assert!(!report.is_consistent());
        let err = report.ensure_consistent().unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(err.to_string().contains("'west'"));
    }
}
