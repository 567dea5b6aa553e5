//! Peer node identity.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A server process participating in work dispatch.
///
/// Rows are keyed by `(hostname, pid)`. They are advisory: claiming never
/// consults them, so a stale row is harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub pid: u32,
    pub port: u16,
    pub last_seen: DateTime<Utc>,
}

impl NodeInfo {
    pub fn new(hostname: impl Into<String>, pid: u32, port: u16, last_seen: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            port,
            last_seen,
        }
    }

    /// Whether this node reported in within `threshold` of `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_seen <= threshold
    }

    pub fn same_process(&self, other: &NodeInfo) -> bool {
        self.hostname == other.hostname && self.pid == other.pid
    }
}

impl core::fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{} (pid {})", self.hostname, self.port, self.pid)
    }
}
