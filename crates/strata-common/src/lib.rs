//! Common types for Strata: errors, stores, and cluster addressing

#![deny(missing_docs)]

pub mod address_book;
pub mod clock;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod store;

pub use address_book::{ClusterAddressBook, ClusterConnection};
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager and label prefix for objects written by Strata
pub const FIELD_MANAGER: &str = "strata";

/// Label key carrying the owning deployment name
pub const DEPLOYMENT_LABEL_KEY: &str = "strata.dev/deployment";

/// Label key marking objects managed by Strata
pub const MANAGED_BY_LABEL_KEY: &str = "app.kubernetes.io/managed-by";
