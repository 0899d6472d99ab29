//! The remote config document and its invariants

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_common::{Error, Result};

use crate::migration::CURRENT_SCHEMA_VERSION;

/// DNS base used when a cluster binding does not specify one
pub const DEFAULT_DNS_BASE: &str = "cluster.local";

/// Pattern used to derive node hostnames when none is specified
pub const DEFAULT_DNS_PATTERN: &str = "{nodeAlias}.{namespace}.svc.{dnsBase}";

/// Most recent commands kept in the document
pub const COMMAND_HISTORY_LIMIT: usize = 50;

const DOCUMENT_KIND: &str = "RemoteConfigDocument";

/// Identity and schema of a deployment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMetadata {
    /// Deployment name
    pub name: String,
    /// Namespace the deployment lives in on every member cluster
    pub namespace: String,
    /// Schema version of this document
    pub schema_version: u32,
    /// When the document was first written
    pub created_at: DateTime<Utc>,
    /// Who first wrote the document
    pub created_by: String,
    /// When the document was last modified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Who last modified the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_by: Option<String>,
}

/// How a deployment is laid out on one member cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBinding {
    /// Namespace on this cluster
    pub namespace: String,
    /// Deployment name on this cluster
    pub deployment: String,
    /// DNS suffix for services on this cluster
    pub dns_base: String,
    /// Hostname pattern for nodes on this cluster
    pub dns_pattern: String,
}

impl ClusterBinding {
    /// A binding using the default DNS settings
    pub fn new(namespace: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            deployment: deployment.into(),
            dns_base: DEFAULT_DNS_BASE.to_string(),
            dns_pattern: DEFAULT_DNS_PATTERN.to_string(),
        }
    }
}

/// A consensus node placed on one member cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusNode {
    /// Unique name of the node within the deployment
    pub node_alias: String,
    /// Numeric node id
    pub node_id: u64,
    /// Cluster the node runs on
    pub cluster_reference: String,
    /// Kubeconfig context of that cluster when the node was added
    pub context: String,
    /// Namespace the node runs in
    pub namespace: String,
    /// DNS suffix used for the node's hostname
    pub dns_base: String,
    /// Hostname pattern for the node
    pub dns_pattern: String,
}

impl ConsensusNode {
    /// A node on `cluster`, inheriting the binding's DNS settings
    pub fn on_cluster(
        node_alias: impl Into<String>,
        node_id: u64,
        cluster_reference: impl Into<String>,
        context: impl Into<String>,
        binding: &ClusterBinding,
    ) -> Self {
        Self {
            node_alias: node_alias.into(),
            node_id,
            cluster_reference: cluster_reference.into(),
            context: context.into(),
            namespace: binding.namespace.clone(),
            dns_base: binding.dns_base.clone(),
            dns_pattern: binding.dns_pattern.clone(),
        }
    }

    /// Hostname of the node, rendered from its DNS pattern
    pub fn fqdn(&self) -> String {
        self.dns_pattern
            .replace("{nodeAlias}", &self.node_alias)
            .replace("{namespace}", &self.namespace)
            .replace("{dnsBase}", &self.dns_base)
    }
}

/// One applied schema migration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Migration {
    /// Schema version the document had before this migration
    pub from_version: u32,
    /// When the migration ran
    pub migrated_at: DateTime<Utc>,
    /// Who ran it
    pub migrated_by: String,
}

/// The deployment topology, replicated to every member cluster
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigDocument {
    /// Deployment identity and schema
    pub metadata: DeploymentMetadata,
    /// Member clusters by reference
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterBinding>,
    /// Consensus nodes across all member clusters
    #[serde(default)]
    pub consensus_nodes: Vec<ConsensusNode>,
    /// Schema migrations applied so far, oldest first
    #[serde(default)]
    pub migration_history: Vec<Migration>,
    /// Recent commands that modified the deployment
    #[serde(default)]
    pub command_history: Vec<String>,
}

impl RemoteConfigDocument {
    /// A fresh document at the current schema version
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        created_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: DeploymentMetadata {
                name: name.into(),
                namespace: namespace.into(),
                schema_version: CURRENT_SCHEMA_VERSION,
                created_at: now,
                created_by: created_by.into(),
                last_updated_at: None,
                last_updated_by: None,
            },
            clusters: BTreeMap::new(),
            consensus_nodes: Vec::new(),
            migration_history: Vec::new(),
            command_history: Vec::new(),
        }
    }

    /// Check the document's invariants
    ///
    /// Node aliases are unique, every node's cluster is a member, and the
    /// migration history has strictly increasing `fromVersion`.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(Error::validation_for_field(
                "metadata.name",
                "deployment name must not be empty",
            ));
        }
        if self.metadata.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(Error::validation_for_field(
                "metadata.schemaVersion",
                format!(
                    "expected schema version {CURRENT_SCHEMA_VERSION}, found {}",
                    self.metadata.schema_version
                ),
            ));
        }

        let mut aliases = BTreeSet::new();
        for (i, node) in self.consensus_nodes.iter().enumerate() {
            if !aliases.insert(node.node_alias.as_str()) {
                return Err(Error::validation_for_field(
                    format!("consensusNodes[{i}].nodeAlias"),
                    format!("duplicate node alias '{}'", node.node_alias),
                ));
            }
            if !self.clusters.contains_key(&node.cluster_reference) {
                return Err(Error::validation_for_field(
                    format!("consensusNodes[{i}].clusterReference"),
                    format!(
                        "node '{}' references cluster '{}' which is not part of the deployment",
                        node.node_alias, node.cluster_reference
                    ),
                ));
            }
        }

        for pair in self.migration_history.windows(2) {
            if pair[1].from_version <= pair[0].from_version {
                return Err(Error::validation_for_field(
                    "migrationHistory",
                    format!(
                        "fromVersion must be strictly increasing, found {} after {}",
                        pair[1].from_version, pair[0].from_version
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Add a member cluster
    pub fn add_cluster(&mut self, reference: impl Into<String>, binding: ClusterBinding) -> Result<()> {
        let reference = reference.into();
        if self.clusters.contains_key(&reference) {
            return Err(Error::validation_for_field(
                "clusters",
                format!("cluster '{reference}' is already part of the deployment"),
            ));
        }
        self.clusters.insert(reference, binding);
        Ok(())
    }

    /// Remove a member cluster that no longer hosts any node
    pub fn remove_cluster(&mut self, reference: &str) -> Result<ClusterBinding> {
        let hosted: Vec<&str> = self
            .consensus_nodes
            .iter()
            .filter(|n| n.cluster_reference == reference)
            .map(|n| n.node_alias.as_str())
            .collect();
        if !hosted.is_empty() {
            return Err(Error::validation_for_field(
                "clusters",
                format!(
                    "cluster '{reference}' still hosts nodes: {}",
                    hosted.join(", ")
                ),
            ));
        }
        self.clusters
            .remove(reference)
            .ok_or_else(|| Error::unknown_cluster(reference))
    }

    /// Add a consensus node
    pub fn add_node(&mut self, node: ConsensusNode) -> Result<()> {
        if self.node(&node.node_alias).is_some() {
            return Err(Error::validation_for_field(
                "consensusNodes",
                format!("node alias '{}' is already in use", node.node_alias),
            ));
        }
        if !self.clusters.contains_key(&node.cluster_reference) {
            return Err(Error::unknown_cluster(&node.cluster_reference));
        }
        self.consensus_nodes.push(node);
        Ok(())
    }

    /// Remove a consensus node by alias
    pub fn remove_node(&mut self, alias: &str) -> Result<ConsensusNode> {
        let index = self
            .consensus_nodes
            .iter()
            .position(|n| n.node_alias == alias)
            .ok_or_else(|| {
                Error::validation_for_field("consensusNodes", format!("no node with alias '{alias}'"))
            })?;
        Ok(self.consensus_nodes.remove(index))
    }

    /// Node by alias
    pub fn node(&self, alias: &str) -> Option<&ConsensusNode> {
        self.consensus_nodes.iter().find(|n| n.node_alias == alias)
    }

    /// Lowest node id not yet used
    pub fn next_node_id(&self) -> u64 {
        self.consensus_nodes
            .iter()
            .map(|n| n.node_id + 1)
            .max()
            .unwrap_or(0)
    }

    /// Stamp the document as modified by `actor`
    pub fn touch(&mut self, actor: &str, now: DateTime<Utc>) {
        self.metadata.last_updated_at = Some(now);
        self.metadata.last_updated_by = Some(actor.to_string());
    }

    /// Append a command to the history, keeping the most recent entries
    pub fn record_command(&mut self, command: impl Into<String>) {
        self.command_history.push(command.into());
        if self.command_history.len() > COMMAND_HISTORY_LIMIT {
            let excess = self.command_history.len() - COMMAND_HISTORY_LIMIT;
            self.command_history.drain(..excess);
        }
    }

    /// Consensus nodes ordered by alias
    pub fn nodes_sorted(&self) -> Vec<&ConsensusNode> {
        let mut nodes: Vec<_> = self.consensus_nodes.iter().collect();
        nodes.sort_by(|a, b| a.node_alias.cmp(&b.node_alias));
        nodes
    }

    /// First topology section that differs from `other`, if any
    ///
    /// Only `clusters` and `consensusNodes` are compared; node order and
    /// bookkeeping fields are ignored.
    pub fn topology_difference(&self, other: &Self) -> Option<&'static str> {
        if self.clusters != other.clusters {
            return Some("clusters");
        }
        if self.nodes_sorted() != other.nodes_sorted() {
            return Some("consensusNodes");
        }
        None
    }

    /// Serialize for storage
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind(DOCUMENT_KIND, e.to_string()))
    }
}
