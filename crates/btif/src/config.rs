//! Capacity configuration for the socket layer.
//!
//! Tables are sized once from this config and never grown; exhaustion is reported as a
//! capacity error to the caller.

use serde::Deserialize;

/// Default number of poll threads a pool can run.
pub const DEFAULT_MAX_POLL_THREADS: usize = 32;
/// Default number of fds one poll thread monitors, including its command slot.
pub const DEFAULT_MAX_FDS_PER_THREAD: usize = 64;
/// Default number of L2CAP socket slots.
pub const DEFAULT_MAX_L2CAP_SOCKETS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SockConfig {
    pub max_poll_threads: usize,
    pub max_fds_per_thread: usize,
    pub max_l2cap_sockets: usize,
}

impl Default for SockConfig {
    fn default() -> Self {
        Self {
            max_poll_threads: DEFAULT_MAX_POLL_THREADS,
            max_fds_per_thread: DEFAULT_MAX_FDS_PER_THREAD,
            max_l2cap_sockets: DEFAULT_MAX_L2CAP_SOCKETS,
        }
    }
}

impl SockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_poll_threads(mut self, n: usize) -> Self {
        self.max_poll_threads = n;
        self
    }

    /// Clamped to 2: the command slot plus at least one data fd.
    pub fn with_max_fds_per_thread(mut self, n: usize) -> Self {
        self.max_fds_per_thread = n.max(2);
        self
    }

    pub fn with_max_l2cap_sockets(mut self, n: usize) -> Self {
        self.max_l2cap_sockets = n;
        self
    }

    /// Parse a JSON config document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut config: SockConfig = serde_json::from_str(json)?;
        config.max_fds_per_thread = config.max_fds_per_thread.max(2);
        Ok(config)
    }
}
