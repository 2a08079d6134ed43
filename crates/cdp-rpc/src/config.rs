//! Connection and session manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnConfig {
    /// Largest inbound websocket message accepted. Page snapshots get big.
    pub max_message_size: Option<usize>,

    /// Fail calls that get no reply within this window. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_message_size: Some(256 << 20),
            request_timeout: None,
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Ask the remote for flattened sessions; legacy relay otherwise.
    pub flatten: bool,

    /// Upper bound on the remote detach call made when a session closes.
    pub detach_timeout: Duration,

    /// Capacity of the asynchronous error channel.
    pub error_buffer: usize,

    /// Inbound frames queued per session before the router waits.
    pub relay_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            flatten: true,
            detach_timeout: Duration::from_secs(5),
            error_buffer: 16,
            relay_capacity: 256,
        }
    }
}
