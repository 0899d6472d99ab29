//! Deployment lock built on server-side leases
//!
//! Every mutating command runs under an exclusive lock for its
//! (namespace, deployment). The lock is a Lease object on the deployment's
//! primary cluster: it is created on first request, renewed by a background
//! heartbeat while held, taken over by compare-and-swap once it expires, and
//! deleted on release.

#![deny(missing_docs)]

pub mod identity;
pub mod lock;

pub use identity::LeaseHolder;
pub use lock::{LockConfig, LockHandle, LockLiveness, LockManager, LockState, LockStatus};

/// Lease name guarding a deployment
pub fn lease_name(deployment: &str) -> String {
    format!("{deployment}-lock")
}
