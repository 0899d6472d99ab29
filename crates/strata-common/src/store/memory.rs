//! In-process backend with the same compare-and-swap semantics as the API server
//!
//! Each [`MemoryCluster`] behaves like one cluster: every write bumps a
//! per-cluster resource version, stale writes fail with `Conflict`, and
//! failures can be injected to exercise retry and partial-failure paths.
//! Clones share state, so a test can hand one clone to the code under test
//! and keep another to inspect or tamper with what was stored.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{
    ClusterApi, ConfigMapRecord, ConfigMapStore, Connector, LeaseRecord, LeaseStore,
    CONFIG_MAP_KIND, LEASE_KIND,
};
use crate::clock::{Clock, MonotonicClock};
use crate::kube_utils::{classify_status, StoreOp};
use crate::retry::{retry_transient, RetryConfig};
use crate::{Error, Result};

type ObjectKey = (String, String);

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
struct State {
    next_version: u64,
    leases: HashMap<ObjectKey, LeaseRecord>,
    config_maps: HashMap<ObjectKey, ConfigMapRecord>,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

struct Inner {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
    read_retry: Mutex<RetryConfig>,
    reachable: AtomicBool,
    read_faults: Mutex<VecDeque<u16>>,
    write_faults: Mutex<VecDeque<u16>>,
    read_calls: AtomicUsize,
    write_calls: AtomicUsize,
    probes: AtomicUsize,
}

/// One in-process cluster
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// A reachable, empty cluster on a monotonic clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    /// A reachable, empty cluster using `clock` for lease timestamps
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                clock,
                read_retry: Mutex::new(RetryConfig::store_read()),
                reachable: AtomicBool::new(true),
                read_faults: Mutex::new(VecDeque::new()),
                write_faults: Mutex::new(VecDeque::new()),
                read_calls: AtomicUsize::new(0),
                write_calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
            }),
        }
    }

    /// Override the read retry policy
    pub fn with_read_retry(self, read_retry: RetryConfig) -> Self {
        *self.inner.read_retry.lock() = read_retry;
        self
    }

    /// The clock used for lease timestamps
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    /// Make every operation fail as if the API server were down
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next reads with these status codes, in order
    pub fn fail_reads(&self, codes: impl IntoIterator<Item = u16>) {
        self.inner.read_faults.lock().extend(codes);
    }

    /// Fail the next writes (create, replace, delete) with these status codes
    pub fn fail_writes(&self, codes: impl IntoIterator<Item = u16>) {
        self.inner.write_faults.lock().extend(codes);
    }

    /// Read attempts seen so far, including failed ones
    pub fn read_calls(&self) -> usize {
        self.inner.read_calls.load(Ordering::SeqCst)
    }

    /// Write attempts seen so far, including failed ones
    pub fn write_calls(&self) -> usize {
        self.inner.write_calls.load(Ordering::SeqCst)
    }

    /// Connectivity probes seen so far
    pub fn probes(&self) -> usize {
        self.inner.probes.load(Ordering::SeqCst)
    }

    /// Current lease, bypassing faults
    pub fn lease(&self, namespace: &str, name: &str) -> Option<LeaseRecord> {
        self.inner
            .state
            .lock()
            .leases
            .get(&key(namespace, name))
            .cloned()
    }

    /// Store a lease as-is with a fresh resource version, bypassing CAS
    pub fn put_lease(&self, mut record: LeaseRecord) -> LeaseRecord {
        let mut state = self.inner.state.lock();
        record.resource_version = state.bump();
        state
            .leases
            .insert(key(&record.namespace, &record.name), record.clone());
        record
    }

    /// Current config map, bypassing faults
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMapRecord> {
        self.inner
            .state
            .lock()
            .config_maps
            .get(&key(namespace, name))
            .cloned()
    }

    /// Store a config map as-is with a fresh resource version, bypassing CAS
    pub fn put_config_map(&self, mut record: ConfigMapRecord) -> ConfigMapRecord {
        let mut state = self.inner.state.lock();
        record.resource_version = Some(state.bump());
        state
            .config_maps
            .insert(key(&record.namespace, &record.name), record.clone());
        record
    }

    fn check_read(&self, kind: &str, namespace: &str, name: &str) -> Result<()> {
        self.inner.read_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fault(&self.inner.read_faults, StoreOp::Read, kind, namespace, name)
    }

    fn check_write(&self, op: StoreOp, kind: &str, namespace: &str, name: &str) -> Result<()> {
        self.inner.write_calls.fetch_add(1, Ordering::SeqCst);
        self.check_fault(&self.inner.write_faults, op, kind, namespace, name)
    }

    fn check_fault(
        &self,
        faults: &Mutex<VecDeque<u16>>,
        op: StoreOp,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(Error::transient(namespace, name, "connection refused"));
        }
        match faults.lock().pop_front() {
            Some(code) => Err(classify_status(
                code,
                "injected failure",
                op,
                kind,
                namespace,
                name,
            )),
            None => Ok(()),
        }
    }

    fn read_lease_once(&self, namespace: &str, name: &str) -> Result<LeaseRecord> {
        self.check_read(LEASE_KIND, namespace, name)?;
        self.lease(namespace, name)
            .ok_or_else(|| Error::not_found(LEASE_KIND, namespace, name))
    }

    fn read_config_map_once(&self, namespace: &str, name: &str) -> Result<ConfigMapRecord> {
        self.check_read(CONFIG_MAP_KIND, namespace, name)?;
        self.config_map(namespace, name)
            .ok_or_else(|| Error::not_found(CONFIG_MAP_KIND, namespace, name))
    }

    fn replace_lease(&self, updated: LeaseRecord) -> Result<LeaseRecord> {
        let (namespace, name) = (updated.namespace.clone(), updated.name.clone());
        self.check_write(StoreOp::Replace, LEASE_KIND, &namespace, &name)?;

        let mut state = self.inner.state.lock();
        let current = state
            .leases
            .get(&key(&namespace, &name))
            .ok_or_else(|| Error::not_found(LEASE_KIND, &namespace, &name))?;
        if current.resource_version != updated.resource_version {
            return Err(Error::conflict(LEASE_KIND, &namespace, &name));
        }

        let mut stored = updated;
        stored.resource_version = state.bump();
        state.leases.insert(key(&namespace, &name), stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl LeaseStore for MemoryCluster {
    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder: &str,
        duration_seconds: i32,
    ) -> Result<LeaseRecord> {
        self.check_write(StoreOp::Create, LEASE_KIND, namespace, name)?;

        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        if state.leases.contains_key(&key(namespace, name)) {
            return Err(Error::already_exists(LEASE_KIND, namespace, name));
        }
        let record = LeaseRecord {
            namespace: namespace.to_string(),
            name: name.to_string(),
            holder_identity: holder.to_string(),
            lease_duration_seconds: duration_seconds,
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions: 0,
            resource_version: state.bump(),
        };
        state.leases.insert(key(namespace, name), record.clone());
        Ok(record)
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<LeaseRecord> {
        let policy = self.inner.read_retry.lock().clone();
        retry_transient(&policy, "read_lease", || async move {
            self.read_lease_once(namespace, name)
        })
        .await
    }

    async fn renew(&self, lease: &LeaseRecord) -> Result<LeaseRecord> {
        let mut updated = lease.clone();
        updated.renew_time = Some(self.inner.clock.now());
        self.replace_lease(updated)
    }

    async fn transfer(&self, lease: &LeaseRecord, new_holder: &str) -> Result<LeaseRecord> {
        let now = self.inner.clock.now();
        let mut updated = lease.clone();
        updated.holder_identity = new_holder.to_string();
        updated.acquire_time = Some(now);
        updated.renew_time = Some(now);
        updated.transitions = lease.transitions + 1;
        self.replace_lease(updated)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
    ) -> Result<()> {
        self.check_write(StoreOp::Delete, LEASE_KIND, namespace, name)?;

        let mut state = self.inner.state.lock();
        let current = state
            .leases
            .get(&key(namespace, name))
            .ok_or_else(|| Error::not_found(LEASE_KIND, namespace, name))?;
        if let Some(rv) = resource_version {
            if current.resource_version != rv {
                return Err(Error::conflict(LEASE_KIND, namespace, name));
            }
        }
        state.leases.remove(&key(namespace, name));
        Ok(())
    }
}

#[async_trait]
impl ConfigMapStore for MemoryCluster {
    async fn read(&self, namespace: &str, name: &str) -> Result<ConfigMapRecord> {
        let policy = self.inner.read_retry.lock().clone();
        retry_transient(&policy, "read_config_map", || async move {
            self.read_config_map_once(namespace, name)
        })
        .await
    }

    async fn create(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord> {
        let (namespace, name) = (&record.namespace, &record.name);
        self.check_write(StoreOp::Create, CONFIG_MAP_KIND, namespace, name)?;

        let mut state = self.inner.state.lock();
        if state.config_maps.contains_key(&key(namespace, name)) {
            return Err(Error::already_exists(CONFIG_MAP_KIND, namespace, name));
        }
        let mut stored = record.clone();
        stored.resource_version = Some(state.bump());
        state
            .config_maps
            .insert(key(namespace, name), stored.clone());
        Ok(stored)
    }

    async fn replace(&self, record: &ConfigMapRecord) -> Result<ConfigMapRecord> {
        let (namespace, name) = (&record.namespace, &record.name);
        self.check_write(StoreOp::Replace, CONFIG_MAP_KIND, namespace, name)?;

        let mut state = self.inner.state.lock();
        let current = state
            .config_maps
            .get(&key(namespace, name))
            .ok_or_else(|| Error::not_found(CONFIG_MAP_KIND, namespace, name))?;
        if record.resource_version.is_none() || current.resource_version != record.resource_version
        {
            return Err(Error::conflict(CONFIG_MAP_KIND, namespace, name));
        }
        let mut stored = record.clone();
        stored.resource_version = Some(state.bump());
        state
            .config_maps
            .insert(key(namespace, name), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.check_write(StoreOp::Delete, CONFIG_MAP_KIND, namespace, name)?;
        self.inner
            .state
            .lock()
            .config_maps
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(CONFIG_MAP_KIND, namespace, name))
    }
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    fn leases(&self) -> Arc<dyn LeaseStore> {
        Arc::new(self.clone())
    }

    fn config_maps(&self) -> Arc<dyn ConfigMapStore> {
        Arc::new(self.clone())
    }

    async fn probe(&self) -> Result<()> {
        self.inner.probes.fetch_add(1, Ordering::SeqCst);
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::transient("-", "apiserver", "connection refused"))
        }
    }
}

/// Connector over a fixed set of in-process clusters keyed by context name
#[derive(Default)]
pub struct MemoryConnector {
    clusters: RwLock<BTreeMap<String, MemoryCluster>>,
    default_context: RwLock<Option<String>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    /// An empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cluster under a context name
    pub fn insert(&self, context: impl Into<String>, cluster: MemoryCluster) {
        self.clusters.write().insert(context.into(), cluster);
    }

    /// Set the context reported as active
    pub fn set_default_context(&self, context: Option<String>) {
        *self.default_context.write() = context;
    }

    /// Number of successful `connect` calls
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, context: &str) -> Result<Arc<dyn ClusterApi>> {
        let cluster = self
            .clusters
            .read()
            .get(context)
            .cloned()
            .ok_or_else(|| Error::kubeconfig(context, "context not found in kubeconfig"))?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(cluster))
    }

    async fn default_context(&self) -> Result<Option<String>> {
        Ok(self.default_context.read().clone())
    }

    async fn available_contexts(&self) -> Result<Vec<String>> {
        Ok(self.clusters.read().keys().cloned().collect())
    }
}
