//! Replicated deployment configuration
//!
//! Every member cluster of a deployment stores its own copy of one logical
//! [`RemoteConfigDocument`]. The copy on the primary cluster is written
//! first under optimistic concurrency and then fanned out to the others.
//! Divergence between copies is detected by [`RemoteConfigManager::validate_consistency`]
//! and reported, never repaired automatically.

#![deny(missing_docs)]

pub mod consistency;
pub mod document;
pub mod manager;
pub mod migration;

pub use consistency::{ActiveContextSelector, ConsistencyReport, ContextSelector, Mismatch};
pub use document::{
    ClusterBinding, ConsensusNode, DeploymentMetadata, Migration, RemoteConfigDocument,
};
pub use manager::{DestroyOutcome, ModifyOutcome, RemoteConfigManager};
pub use migration::CURRENT_SCHEMA_VERSION;

/// Name of the config map holding a deployment's remote config
pub const CONFIG_MAP_NAME: &str = "strata-remote-config";

/// Data key under which the document is stored as YAML
pub const DATA_KEY: &str = "remote-config-data";
