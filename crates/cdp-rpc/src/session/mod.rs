//! Sessions - logical connections to one target over a shared transport
//!
//! Design: a session is just a [`Conn`] running over a relay transport.
//! Everything that works on a top-level connection (invoke, subscribe, sync,
//! close) works on a session the same way.

pub mod manager;
mod relay;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::rpc::protocol::{SessionId, TargetId};
use crate::rpc::Conn;

pub use manager::Manager;

/// How session traffic travels over the parent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionMode {
    /// Frames carry a `sessionId` the remote routes on natively.
    Flattened,
    /// Frames are tunneled through `Target.sendMessageToTarget` and
    /// `Target.receivedMessageFromTarget`.
    Legacy,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Flattened => f.write_str("flattened"),
            SessionMode::Legacy => f.write_str("legacy"),
        }
    }
}

/// Session bound to a specific target
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    target_id: TargetId,
    mode: SessionMode,
    conn: Arc<Conn>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The session's own connection
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    pub fn into_conn(self) -> Arc<Conn> {
        self.conn
    }

    /// Close the session and detach from its target. Detaching happens at
    /// most once; a second close returns [`crate::Error::Closing`].
    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target_id", &self.target_id)
            .field("mode", &self.mode)
            .field("closed", &self.conn.is_closed())
            .finish()
    }
}
