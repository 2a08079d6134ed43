//! Session transport - a transport made out of the parent connection
//!
//! A session's own `Conn` runs over this exactly like it would over a socket:
//!
//! - **Flattened**: outbound frames (already tagged with the session ID by the
//!   session's `Conn`) are written straight onto the parent's transport;
//!   inbound frames arrive through the parent's session route.
//! - **Legacy**: outbound frames ride as the `message` argument of
//!   `Target.sendMessageToTarget`; inbound frames are the `message` field of
//!   `Target.receivedMessageFromTarget`, pushed in by the manager.
//!
//! Closing the transport detaches the session from its target, once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::manager::Command;
use super::SessionMode;
use crate::error::{Error, Result};
use crate::rpc::protocol::target::{
    DetachFromTargetParams, SendMessageToTargetParams, DETACH_FROM_TARGET, SEND_MESSAGE_TO_TARGET,
};
use crate::rpc::protocol::SessionId;
use crate::rpc::Conn;
use crate::transport::{FrameSink, FrameSource, Transport};

/// Makes sure `Target.detachFromTarget` is sent at most once per session,
/// and never for a session the remote already dropped.
pub(crate) struct Detacher {
    session_id: SessionId,
    parent: Arc<Conn>,
    timeout: Duration,
    detached: AtomicBool,
    commands: mpsc::UnboundedSender<Command>,
}

impl Detacher {
    pub(crate) fn new(
        session_id: SessionId,
        parent: Arc<Conn>,
        timeout: Duration,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            parent,
            timeout,
            detached: AtomicBool::new(false),
            commands,
        })
    }

    /// The remote dropped the session on its own.
    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    pub(crate) async fn detach(&self) -> Result<()> {
        // The manager may already be gone; then there is nothing to forget.
        let _ = self.commands.send(Command::Forget(self.session_id.clone()));
        self.parent.remove_route(&self.session_id);

        if self.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let params = serde_json::to_value(DetachFromTargetParams {
            session_id: self.session_id.clone(),
        })?;
        tracing::debug!(session_id = %self.session_id, "detaching session");
        match tokio::time::timeout(
            self.timeout,
            self.parent.invoke(DETACH_FROM_TARGET, Some(params)),
        )
        .await
        {
            Ok(result) => result.map(drop),
            Err(_) => {
                tracing::warn!(session_id = %self.session_id, timeout = ?self.timeout, "detach timed out");
                Err(Error::Timeout)
            }
        }
    }
}

pub(crate) struct SessionTransport {
    pub(crate) mode: SessionMode,
    pub(crate) session_id: SessionId,
    pub(crate) parent: Arc<Conn>,
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) detacher: Arc<Detacher>,
}

impl Transport for SessionTransport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(SessionSink {
                mode: self.mode,
                session_id: self.session_id,
                parent: self.parent,
                detacher: self.detacher,
            }),
            Box::new(SessionSource {
                inbound: self.inbound,
            }),
        )
    }
}

struct SessionSink {
    mode: SessionMode,
    session_id: SessionId,
    parent: Arc<Conn>,
    detacher: Arc<Detacher>,
}

#[async_trait]
impl FrameSink for SessionSink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        match self.mode {
            SessionMode::Flattened => self.parent.write(frame).await,
            SessionMode::Legacy => {
                let message = String::from_utf8(frame)
                    .map_err(|e| Error::Transport(format!("session frame is not UTF-8: {e}")))?;
                let params = serde_json::to_value(SendMessageToTargetParams {
                    message,
                    session_id: self.session_id.clone(),
                })?;
                self.parent
                    .invoke(SEND_MESSAGE_TO_TARGET, Some(params))
                    .await
                    .map(drop)
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.detacher.detach().await
    }
}

struct SessionSource {
    inbound: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for SessionSource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.inbound.recv().await)
    }
}
