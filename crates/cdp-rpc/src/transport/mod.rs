//! Transport - framed duplex channels a connection runs over
//!
//! A transport is split once, when the connection starts: the write half is
//! shared behind the connection's write lock, the read half is owned by the
//! dispatch loop alone.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;

/// Write half
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, `Ok(None)` once the peer is gone.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

pub trait Transport: Send + 'static {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>);
}

pub use memory::MemoryTransport;
pub use websocket::WebSocketTransport;
