//! Per-cluster storage primitives
//!
//! The lock and the remote config are built on two capabilities every
//! backend must provide: create, read, resource-version-checked replace, and
//! delete. [`LeaseStore`] covers the lease object used for mutual exclusion
//! and [`ConfigMapStore`] covers the key/value object holding the remote
//! config document.
//!
//! Two backends ship: [`kubernetes`] talks to a cluster's API server and
//! [`memory`] keeps everything in process.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::Result;

pub mod kubernetes;
pub mod memory;

/// Kind name used in errors about leases
pub const LEASE_KIND: &str = "Lease";

/// Kind name used in errors about config maps
pub const CONFIG_MAP_KIND: &str = "ConfigMap";

/// A lease as seen by one read, including the resource version the read observed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Namespace of the lease
    pub namespace: String,
    /// Name of the lease
    pub name: String,
    /// Current holder; empty when nobody holds it
    pub holder_identity: String,
    /// Validity window after each renewal
    pub lease_duration_seconds: i32,
    /// When the current holder acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the current holder last renewed the lease
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    pub transitions: i32,
    /// Resource version used for compare-and-swap writes
    pub resource_version: String,
}

impl LeaseRecord {
    /// Instant the lease stops being valid
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.renew_time
            .map(|rt| rt + chrono::Duration::seconds(i64::from(self.lease_duration_seconds)))
    }

    /// True once `renewTime + leaseDurationSeconds` is not in the future,
    /// or when the lease has no holder or no renew time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder_identity.is_empty() {
            return true;
        }
        match self.expires_at() {
            Some(expiry) => now >= expiry,
            None => true,
        }
    }

    /// True if `identity` is the recorded holder
    pub fn is_held_by(&self, identity: &str) -> bool {
        !identity.is_empty() && self.holder_identity == identity
    }
}

/// A key/value object as seen by one read
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigMapRecord {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Labels on the object
    pub labels: BTreeMap<String, String>,
    /// String payload
    pub data: BTreeMap<String, String>,
    /// Resource version observed by the read; `None` for objects not yet stored
    pub resource_version: Option<String>,
}

impl ConfigMapRecord {
    /// A new, unstored record
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set a data entry
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// CRUD over the server-side lease primitive for one cluster
///
/// `renew` and `transfer` are compare-and-swap writes against the
/// resource version in the passed record: at most one writer wins per
/// version, every other writer observes `Conflict`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create a lease held by `holder`; fails `AlreadyExists` if present
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration_seconds: i32,
    ) -> Result<LeaseRecord>;

    /// Read a lease; fails `NotFound` if absent
    ///
    /// Transient failures are retried before `TransientStore` is returned.
    async fn read(&self, namespace: &str, name: &str) -> Result<LeaseRecord>;

    /// Bump renewTime to now; fails `Conflict` on a stale resource version
    async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord>;

    /// Hand the lease to `new_holder`, incrementing transitions
    async fn transfer(&self, lease: &LeaseRecord, new_holder: &str) -> Result<LeaseRecord>;

    /// Delete a lease, optionally only if it still has `resource_version`
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()>;
}

/// CRUD over the server-side key/value object for one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Read an object; fails `NotFound` if absent
    async fn read(&self, namespace: &str, name: &str) -> Result<ConfigMapRecord>;

    /// Create an object; fails `AlreadyExists` if present
    async fn create(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord>;

    /// Replace an object wholesale; fails `Conflict` if `resource_version` is stale
    async fn replace(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord>;

    /// Delete an object; fails `NotFound` if absent
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Everything Strata needs from one cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lease store for this cluster
    fn leases(&self) -> Arc<dyn LeaseStore>;

    /// Config map store for this cluster
    fn config_maps(&self) -> Arc<dyn ConfigMapStore>;

    /// Check the cluster's API server is reachable
    async fn probe(&self) -> Result<()>;
}

/// Builds cluster connections from context names
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to the cluster behind `context`
    async fn connect(&self, context: &str) -> Result<Arc<dyn ClusterApi>>;

    /// The context that is active when nothing else is specified
    async fn default_context(&self) -> Result<Option<String>>;

    /// Every context this connector can open
    async fn available_contexts(&self) -> Result<Vec<String>>;
}
