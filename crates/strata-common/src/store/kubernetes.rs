//! Kubernetes backend: coordination.k8s.io/v1 Leases and core/v1 ConfigMaps
//!
//! Writes carry the resourceVersion from the record being replaced, so the
//! API server rejects a stale write with 409 Conflict. That is the only
//! synchronization between processes.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::Client;
use tracing::debug;

use super::{
    ClusterApi, ConfigMapRecord, ConfigMapStore, Connector, LeaseRecord, LeaseStore,
    CONFIG_MAP_KIND, LEASE_KIND,
};
use crate::clock::{Clock, SystemClock};
use crate::kube_utils::{self, classify_error, StoreOp};
use crate::retry::{retry_transient, RetryConfig};
use crate::{Error, Result};

/// Lease store backed by the cluster's coordination API
pub struct KubeLeaseStore {
    client: Client,
    clock: Arc<dyn Clock>,
    read_retry: RetryConfig,
}

impl KubeLeaseStore {
    /// Create a store with the system clock and the standard read retry policy
    pub fn new(client: Client) -> Self {
        Self {
            client,
            clock: Arc::new(SystemClock),
            read_retry: RetryConfig::store_read(),
        }
    }

    /// Override the read retry policy
    pub fn with_read_retry(mut self, read_retry: RetryConfig) -> Self {
        self.read_retry = read_retry;
        self
    }

    fn api(&self, namespace: &str) -> Api<Lease> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn replace(&self, updated: &LeaseRecord) -> Result<LeaseRecord> {
        let api = self.api(&updated.namespace);
        let lease = api
            .replace(&updated.name, &PostParams::default(), &to_lease(updated))
            .await
            .map_err(|e| {
                classify_error(
                    e,
                    StoreOp::Replace,
                    LEASE_KIND,
                    &updated.namespace,
                    &updated.name,
                )
            })?;
        from_lease(lease, &updated.namespace, &updated.name)
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration_seconds: i32,
    ) -> Result<LeaseRecord> {
        let now = self.clock.now();
        let record = LeaseRecord {
            namespace: namespace.to_string(),
            name: name.to_string(),
            holder_identity: holder.to_string(),
            lease_duration_seconds: duration_seconds,
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions: 0,
            resource_version: String::new(),
        };

        let created = self
            .api(namespace)
            .create(&PostParams::default(), &to_lease(&record))
            .await
            .map_err(|e| classify_error(e, StoreOp::Create, LEASE_KIND, namespace, name))?;
        debug!(namespace = %namespace, lease = %name, holder = %holder, "Created lease");
        from_lease(created, namespace, name)
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<LeaseRecord> {
        let api = &self.api(namespace);
        let lease = retry_transient(&self.read_retry, "read_lease", || async move {
            api.get(name)
                .await
                .map_err(|e| classify_error(e, StoreOp::Read, LEASE_KIND, namespace, name))
        })
        .await?;
        from_lease(lease, namespace, name)
    }

    async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord> {
        let mut updated = lease.clone();
        updated.renew_time = Some(self.clock.now());
        self.replace(&updated).await
    }

    async fn transfer(&self, lease: &LeaseRecord, new_holder: &str) -> Result<LeaseRecord> {
        let now = self.clock.now();
        let mut updated = lease.clone();
        updated.holder_identity = new_holder.to_string();
        updated.acquire_time = Some(now);
        updated.renew_time = Some(now);
        updated.transitions = lease.transitions + 1;
        self.replace(&updated).await
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()> {
        let params = DeleteParams {
            preconditions: resource_version.map(|rv| Preconditions {
                resource_version: Some(rv),
                uid: None,
            }),
            ..Default::default()
        };
        self.api(namespace)
            .delete(name, &params)
            .await
            .map_err(|e| classify_error(e, StoreOp::Delete, LEASE_KIND, namespace, name))?;
        debug!(namespace = %namespace, lease = %name, "Deleted lease");
        Ok(())
    }
}

fn to_lease(record: &LeaseRecord) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: Some(record.namespace.clone()),
            resource_version: (!record.resource_version.is_empty())
                .then(|| record.resource_version.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: (!record.holder_identity.is_empty())
                .then(|| record.holder_identity.clone()),
            lease_duration_seconds: Some(record.lease_duration_seconds),
            acquire_time: record.acquire_time.map(MicroTime),
            renew_time: record.renew_time.map(MicroTime),
            lease_transitions: Some(record.transitions),
            ..Default::default()
        }),
    }
}

fn from_lease(lease: Lease, namespace: &str, name: &str) -> Result<LeaseRecord> {
    let resource_version = lease.metadata.resource_version.ok_or_else(|| {
        Error::internal_with_context(
            "lease_store",
            format!("lease {namespace}/{name} missing resourceVersion"),
        )
    })?;
    let spec = lease.spec.unwrap_or_default();
    Ok(LeaseRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        holder_identity: spec.holder_identity.unwrap_or_default(),
        lease_duration_seconds: spec.lease_duration_seconds.unwrap_or(0),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        transitions: spec.lease_transitions.unwrap_or(0),
        resource_version,
    })
}

/// Config map store backed by the cluster's core API
pub struct KubeConfigMapStore {
    client: Client,
    read_retry: RetryConfig,
}

impl KubeConfigMapStore {
    /// Create a store with the standard read retry policy
    pub fn new(client: Client) -> Self {
        Self {
            client,
            read_retry: RetryConfig::store_read(),
        }
    }

    /// Override the read retry policy
    pub fn with_read_retry(mut self, read_retry: RetryConfig) -> Self {
        self.read_retry = read_retry;
        self
    }

    fn api(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ConfigMapStore for KubeConfigMapStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<ConfigMapRecord> {
        let api = &self.api(namespace);
        let cm = retry_transient(&self.read_retry, "read_config_map", || async move {
            api.get(name)
                .await
                .map_err(|e| classify_error(e, StoreOp::Read, CONFIG_MAP_KIND, namespace, name))
        })
        .await?;
        Ok(from_config_map(cm, namespace, name))
    }

    async fn create(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord> {
        let (namespace, name) = (&record.namespace, &record.name);
        let mut desired = to_config_map(record);
        desired.metadata.resource_version = None;
        let created = self
            .api(namespace)
            .create(&PostParams::default(), &desired)
            .await
            .map_err(|e| classify_error(e, StoreOp::Create, CONFIG_MAP_KIND, namespace, name))?;
        debug!(namespace = %namespace, config_map = %name, "Created config map");
        Ok(from_config_map(created, namespace, name))
    }

    async fn replace(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord> {
        let (namespace, name) = (&record.namespace, &record.name);
        if record.resource_version.is_none() {
            return Err(Error::internal_with_context(
                "config_map_store",
                format!("replace of {namespace}/{name} requires a resource version"),
            ));
        }
        let replaced = self
            .api(namespace)
            .replace(name, &PostParams::default(), &to_config_map(record))
            .await
            .map_err(|e| classify_error(e, StoreOp::Replace, CONFIG_MAP_KIND, namespace, name))?;
        debug!(namespace = %namespace, config_map = %name, "Replaced config map");
        Ok(from_config_map(replaced, namespace, name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| classify_error(e, StoreOp::Delete, CONFIG_MAP_KIND, namespace, name))?;
        debug!(namespace = %namespace, config_map = %name, "Deleted config map");
        Ok(())
    }
}

fn to_config_map(record: &ConfigMapRecord) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(record.name.clone()),
            namespace: Some(record.namespace.clone()),
            labels: (!record.labels.is_empty()).then(|| record.labels.clone()),
            resource_version: record.resource_version.clone(),
            ..Default::default()
        },
        data: Some(record.data.clone()),
        ..Default::default()
    }
}

fn from_config_map(cm: ConfigMap, namespace: &str, name: &str) -> ConfigMapRecord {
    ConfigMapRecord {
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels: cm.metadata.labels.unwrap_or_default(),
        data: cm.data.unwrap_or_default(),
        resource_version: cm.metadata.resource_version,
    }
}

/// One cluster reached through a kube client
pub struct KubeCluster {
    client: Client,
    leases: Arc<KubeLeaseStore>,
    config_maps: Arc<KubeConfigMapStore>,
}

impl KubeCluster {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            leases: Arc::new(KubeLeaseStore::new(client.clone())),
            config_maps: Arc::new(KubeConfigMapStore::new(client.clone())),
            client,
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn leases(&self) -> Arc<dyn LeaseStore> {
        self.leases.clone()
    }

    fn config_maps(&self) -> Arc<dyn ConfigMapStore> {
        self.config_maps.clone()
    }

    async fn probe(&self) -> Result<()> {
        kube_utils::probe(&self.client).await
    }
}

/// Opens clusters from kubeconfig contexts
#[derive(Clone, Debug, Default)]
pub struct KubeConnector {
    kubeconfig: Option<PathBuf>,
}

impl KubeConnector {
    /// Use an explicit kubeconfig file, or the kube defaults when `None`
    pub fn new(kubeconfig: Option<PathBuf>) -> Self {
        Self { kubeconfig }
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self, context: &str) -> Result<Arc<dyn ClusterApi>> {
        let client =
            kube_utils::create_client_for_context(self.kubeconfig.as_deref(), context).await?;
        Ok(Arc::new(KubeCluster::new(client)))
    }

    async fn default_context(&self) -> Result<Option<String>> {
        kube_utils::current_context(self.kubeconfig.as_deref())
    }

    async fn available_contexts(&self) -> Result<Vec<String>> {
        kube_utils::list_contexts(self.kubeconfig.as_deref())
    }
}
