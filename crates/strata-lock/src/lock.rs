//! Lease lock protocol
//!
//! # Atomicity
//!
//! Every write that changes who holds the lease is a compare-and-swap on the
//! lease's resource version. Two waiters that both see an expired lease race
//! on `transfer`; exactly one wins and the other observes `Conflict` and goes
//! back to reading.
//!
//! # Liveness
//!
//! A held lock is renewed by a background heartbeat every `renew_interval`.
//! If the holder crashes the lease stops being renewed and any waiter takes
//! it over once `renewTime + leaseDurationSeconds` has passed. Waiters poll
//! at most once per renewal period, so a released lock is picked up within
//! one cycle.
//!
//! The holder never trusts the lease longer than the server does: the
//! heartbeat reports the lock lost once [`LockConfig::local_validity`] has
//! passed since the last successful write was sent, even if a renewal is
//! still outstanding.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_common::store::{LeaseRecord, LeaseStore};
use strata_common::{Clock, Error, Result, SystemClock};

use crate::identity::LeaseHolder;

/// Default validity window of a lease after each renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(20);

/// Default bound on how long `acquire` waits for a contended lock
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(120);

/// Lock timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockConfig {
    /// Validity window of the lease after each renewal
    pub lease_duration: Duration,
    /// Heartbeat period while the lock is held
    pub renew_interval: Duration,
    /// Bound on waiting for a contended lock
    pub max_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_DURATION, DEFAULT_MAX_WAIT)
    }
}

impl LockConfig {
    /// Timing for a lease duration, renewing every third of it
    pub fn new(lease_duration: Duration, max_wait: Duration) -> Self {
        Self {
            lease_duration,
            renew_interval: lease_duration / 3,
            max_wait,
        }
    }

    /// Pause between reads while another holder has a valid lease
    pub fn contention_backoff(&self) -> Duration {
        (self.lease_duration / 2).min(self.renew_interval)
    }

    /// How long after sending a successful write this process treats the
    /// lease as its own: the lease duration less a tenth for clock skew
    pub fn local_validity(&self) -> Duration {
        self.lease_duration - self.lease_duration / 10
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.lease_duration.as_secs())
            .unwrap_or(i32::MAX)
            .max(1)
    }
}

/// Where a lock is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// Not held and not wanted
    Idle,
    /// Waiting for the lease
    Acquiring,
    /// Held and being renewed
    Held,
    /// Heartbeat stopped, lease being deleted
    Releasing,
    /// Acquisition gave up
    Failed,
    /// The lease was taken over or could not be renewed in time
    Lost,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::Idle => "idle",
            LockState::Acquiring => "acquiring",
            LockState::Held => "held",
            LockState::Releasing => "releasing",
            LockState::Failed => "failed",
            LockState::Lost => "lost",
        };
        f.write_str(s)
    }
}

/// Snapshot of a lease for operators
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockStatus {
    /// Raw holder identity stored in the lease
    pub holder: String,
    /// Parsed holder, if written by Strata
    pub holder_info: Option<LeaseHolder>,
    /// When the current holder acquired the lease
    pub acquired_at: Option<DateTime<Utc>>,
    /// When the lease was last renewed
    pub renewed_at: Option<DateTime<Utc>>,
    /// When the lease stops being valid
    pub expires_at: Option<DateTime<Utc>>,
    /// Whether the lease had expired at the time of the read
    pub expired: bool,
    /// Number of holder changes
    pub transitions: i32,
}

impl LockStatus {
    fn from_lease(lease: &LeaseRecord, now: DateTime<Utc>) -> Self {
        Self {
            holder: lease.holder_identity.clone(),
            holder_info: LeaseHolder::parse(&lease.holder_identity),
            acquired_at: lease.acquire_time,
            renewed_at: lease.renew_time,
            expires_at: lease.expires_at(),
            expired: lease.is_expired(now),
            transitions: lease.transitions,
        }
    }
}

/// Acquires leases on one cluster's lease store
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockManager {
    /// Create a manager using the system clock for expiry checks
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Use `clock` for expiry checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lock timing in use
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Block until the lease is held by `identity`, then start the heartbeat
    ///
    /// Fails with `LockTimeout` naming the current holder once `max_wait`
    /// has passed while another identity holds a valid lease.
    ///
    /// Acquiring a lease this identity already holds renews it and returns a
    /// new handle. The renewal moves the resource version, so any earlier
    /// handle for the same lease fails its next renewal with `Conflict` and
    /// reports the lock lost. Only the newest handle stays live.
    pub async fn acquire(
        &self,
        namespace: &str,
        name: &str,
        identity: &str,
    ) -> Result<LockHandle> {
        debug!(
            namespace = %namespace,
            lease = %name,
            identity = %identity,
            state = %LockState::Acquiring,
            "Acquiring lock"
        );

        let (lease, sent) = match self.acquire_lease(namespace, name, identity).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    lease = %name,
                    identity = %identity,
                    state = %LockState::Failed,
                    error = %e,
                    "Failed to acquire lock"
                );
                return Err(e);
            }
        };

        info!(
            namespace = %namespace,
            lease = %name,
            identity = %identity,
            transitions = lease.transitions,
            "Lock acquired"
        );
        Ok(self.start_heartbeat(lease, sent, identity))
    }

    /// Returns the lease with the instant its winning write was sent
    async fn acquire_lease(
        &self,
        namespace: &str,
        name: &str,
        identity: &str,
    ) -> Result<(LeaseRecord, Instant)> {
        let started = Instant::now();
        let duration_seconds = self.config.lease_duration_seconds();

        loop {
            let sent = Instant::now();
            match self
                .store
                .create(namespace, name, identity, duration_seconds)
                .await
            {
                Ok(lease) => {
                    debug!(namespace = %namespace, lease = %name, "Created lease");
                    return Ok((lease, sent));
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }

            loop {
                let lease = match self.store.read(namespace, name).await {
                    Ok(lease) => lease,
                    Err(e) if e.is_not_found() => {
                        debug!(namespace = %namespace, lease = %name, "Lease released, retrying create");
                        break;
                    }
                    Err(e) => return Err(e),
                };

                let now = self.clock.now();
                if lease.is_expired(now) {
                    let sent = Instant::now();
                    match self.store.transfer(&lease, identity).await {
                        Ok(taken) => {
                            info!(
                                namespace = %namespace,
                                lease = %name,
                                previous_holder = %lease.holder_identity,
                                transitions = taken.transitions,
                                "Took over expired lease"
                            );
                            return Ok((taken, sent));
                        }
                        Err(e) if e.is_conflict() => {
                            debug!(namespace = %namespace, lease = %name, "Lease takeover conflict, will retry");
                            continue;
                        }
                        Err(e) if e.is_not_found() => break,
                        Err(e) => return Err(e),
                    }
                }

                if lease.is_held_by(identity) {
                    let sent = Instant::now();
                    match self.store.renew(&lease).await {
                        Ok(renewed) => return Ok((renewed, sent)),
                        Err(e) if e.is_conflict() => continue,
                        Err(e) if e.is_not_found() => break,
                        Err(e) => return Err(e),
                    }
                }

                let waited = started.elapsed();
                if waited >= self.config.max_wait {
                    return Err(Error::LockTimeout {
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                        holder: lease.holder_identity,
                        waited_secs: waited.as_secs(),
                    });
                }

                let backoff = self
                    .config
                    .contention_backoff()
                    .min(self.config.max_wait - waited);
                debug!(
                    namespace = %namespace,
                    lease = %name,
                    holder = %lease.holder_identity,
                    retry_ms = backoff.as_millis() as u64,
                    "Lease held by another, waiting..."
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }

    fn start_heartbeat(&self, lease: LeaseRecord, sent: Instant, identity: &str) -> LockHandle {
        let namespace = lease.namespace.clone();
        let name = lease.name.clone();
        let lease = Arc::new(Mutex::new(lease));
        let (state, _) = watch::channel(LockState::Held);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        let validity = self.config.local_validity();
        let heartbeat = Heartbeat {
            store: self.store.clone(),
            lease: lease.clone(),
            interval: self.config.renew_interval,
            validity,
            valid_until: sent + validity,
            state: state.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(heartbeat.run());

        LockHandle {
            namespace,
            name,
            identity: identity.to_string(),
            store: self.store.clone(),
            lease,
            state,
            cancel,
            heartbeat: Mutex::new(Some(task)),
            released: AtomicBool::new(false),
        }
    }

    /// Current holder of a lease, or `None` if nobody holds it
    pub async fn status(&self, namespace: &str, name: &str) -> Result<Option<LockStatus>> {
        match self.store.read(namespace, name).await {
            Ok(lease) => Ok(Some(LockStatus::from_lease(&lease, self.clock.now()))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a lease regardless of who holds it
    ///
    /// Returns false if there was no lease. The previous holder's heartbeat
    /// observes the deletion and reports the lock as lost.
    pub async fn force_release(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.store.delete(namespace, name, None).await {
            Ok(()) => {
                warn!(namespace = %namespace, lease = %name, "Lock forcibly released");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Renews the lease until cancelled or lost
///
/// `valid_until` is measured on the local monotonic clock from the moment
/// the last successful write was sent, so it never extends past the
/// server-side `renewTime + leaseDurationSeconds` that other holders see.
/// Once it passes the lock is reported lost, even while a renew call is
/// still in flight.
struct Heartbeat {
    store: Arc<dyn LeaseStore>,
    lease: Arc<Mutex<LeaseRecord>>,
    interval: Duration,
    validity: Duration,
    valid_until: Instant,
    state: Arc<watch::Sender<LockState>>,
    cancel: CancellationToken,
}

impl Heartbeat {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(self.valid_until) => {
                    return self.lose("lease expired before it could be renewed");
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            let lease = self.lease.lock().clone();
            let sent = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep_until(self.valid_until) => {
                    return self.lose("lease expired while a renewal was in flight");
                }
                result = self.store.renew(&lease) => result,
            };

            match result {
                Ok(renewed) => {
                    debug!(namespace = %lease.namespace, lease = %lease.name, "Lease renewed");
                    *self.lease.lock() = renewed;
                    self.valid_until = sent + self.validity;
                }
                // The last successful renewal is still valid; try again next tick
                Err(e) if e.is_retryable() => {
                    warn!(
                        namespace = %lease.namespace,
                        lease = %lease.name,
                        error = %e,
                        "Lease renewal failed, retrying"
                    );
                }
                Err(e) => return self.lose(&e.to_string()),
            }
        }
    }

    fn lose(&self, reason: &str) {
        let lease = self.lease.lock().clone();
        warn!(
            namespace = %lease.namespace,
            lease = %lease.name,
            identity = %lease.holder_identity,
            reason,
            "Lock lost"
        );
        self.state.send_replace(LockState::Lost);
    }
}

/// An acquired lock
///
/// The heartbeat runs until [`LockHandle::release`] is called or the handle
/// is dropped. Dropping without releasing stops the heartbeat and deletes
/// the lease in the background.
pub struct LockHandle {
    namespace: String,
    name: String,
    identity: String,
    store: Arc<dyn LeaseStore>,
    lease: Arc<Mutex<LeaseRecord>>,
    state: Arc<watch::Sender<LockState>>,
    cancel: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl LockHandle {
    /// Namespace of the lease
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Name of the lease
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity holding the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current lifecycle state
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// True while the heartbeat keeps the lease
    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Fail with `LockLost` unless the lock is still held
    pub fn ensure_held(&self) -> Result<()> {
        self.liveness().ensure_held()
    }

    /// Lease as of the last successful write
    pub fn lease(&self) -> LeaseRecord {
        self.lease.lock().clone()
    }

    /// A detached view of this lock's state
    pub fn liveness(&self) -> LockLiveness {
        LockLiveness {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Run `work` while the lock is held, aborting it with `LockLost` if the
    /// heartbeat loses the lease first
    pub async fn run_guarded<T, E, F>(&self, work: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let mut liveness = self.liveness();
        liveness.ensure_held()?;

        tokio::select! {
            biased;
            _ = liveness.lost() => Err(Error::LockLost {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            }
            .into()),
            result = work => result,
        }
    }

    /// Stop the heartbeat and delete the lease
    ///
    /// The delete is conditioned on the last resource version this handle
    /// wrote, so a lease that was taken over is left alone. Release is
    /// best-effort and idempotent; failures only mean the lease expires on
    /// its own.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!(namespace = %self.namespace, lease = %self.name, "Lock already released");
            return;
        }

        self.cancel.cancel();
        let heartbeat = self.heartbeat.lock().take();
        if let Some(task) = heartbeat {
            let _ = task.await;
        }

        let lost = self.state() == LockState::Lost;
        self.state.send_replace(LockState::Releasing);

        if lost {
            info!(
                namespace = %self.namespace,
                lease = %self.name,
                "Lock was lost, leaving lease to its current holder"
            );
        } else {
            let resource_version = self.lease.lock().resource_version.clone();
            match self
                .store
                .delete(&self.namespace, &self.name, Some(resource_version))
                .await
            {
                Ok(()) => info!(namespace = %self.namespace, lease = %self.name, "Lock released"),
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(namespace = %self.namespace, lease = %self.name, "Lease already gone or taken over");
                }
                Err(e) => warn!(
                    namespace = %self.namespace,
                    lease = %self.name,
                    error = %e,
                    "Failed to delete lease, it will expire"
                ),
            }
        }

        self.state.send_replace(LockState::Idle);
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        if let Some(task) = self.heartbeat.get_mut().take() {
            task.abort();
        }
        if self.state() == LockState::Lost {
            return;
        }
        self.state.send_replace(LockState::Releasing);

        let store = self.store.clone();
        let namespace = self.namespace.clone();
        let name = self.name.clone();
        let resource_version = self.lease.lock().resource_version.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(namespace = %namespace, lease = %name, "Lock dropped without release, deleting lease");
                runtime.spawn(async move {
                    if let Err(e) = store.delete(&namespace, &name, Some(resource_version)).await {
                        debug!(namespace = %namespace, lease = %name, error = %e, "Background lease delete failed");
                    }
                });
            }
            Err(_) => {
                warn!(namespace = %namespace, lease = %name, "Lock dropped outside a runtime, lease will expire");
            }
        }

        self.state.send_replace(LockState::Idle);
    }
}

/// Cloneable view of a lock's state
///
/// Foreground work carries this to check the lock at its own suspension
/// points without borrowing the [`LockHandle`].
#[derive(Clone)]
pub struct LockLiveness {
    namespace: String,
    name: String,
    state: watch::Receiver<LockState>,
}

impl LockLiveness {
    /// Current lifecycle state of the lock
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    /// True while the lock is held
    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Fail with `LockLost` unless the lock is still held
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_held() {
            Ok(())
        } else {
            Err(Error::LockLost {
                namespace: self.namespace.clone(),
                name: self.name.clone(),
            })
        }
    }

    /// Resolve once the lock is no longer held
    pub async fn lost(&mut self) {
        let _ = self.state.wait_for(|s| *s != LockState::Held).await;
    }
}

impl fmt::Debug for LockLiveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLiveness")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
