//! Lease holder identity
//!
//! The holder is recorded as `user@host/session`. The session suffix is
//! random per process, so two commands run by the same user on the same
//! machine still contend for the lock.

use std::fmt;

/// Who holds (or wants) a lease
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseHolder {
    /// Local user name
    pub username: String,
    /// Machine the command runs on
    pub hostname: String,
    /// Per-process session id
    pub session_id: String,
}

impl LeaseHolder {
    /// Build a holder from explicit parts
    pub fn new(
        username: impl Into<String>,
        hostname: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            hostname: hostname.into(),
            session_id: session_id.into(),
        }
    }

    /// The holder for this process: current user and host with a fresh session id
    pub fn current() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let hostname = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let session_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::new(username, hostname, session_id)
    }

    /// The identity string stored in the lease
    pub fn identity(&self) -> String {
        self.to_string()
    }

    /// Parse an identity written by [`LeaseHolder::identity`]
    ///
    /// Returns `None` for identities written by other tools.
    pub fn parse(identity: &str) -> Option<Self> {
        let (username, rest) = identity.split_once('@')?;
        let (hostname, session_id) = rest.rsplit_once('/')?;
        if username.is_empty() || hostname.is_empty() || session_id.is_empty() {
            return None;
        }
        Some(Self::new(username, hostname, session_id))
    }
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.username, self.hostname, self.session_id)
    }
}
