//! In-process transport
//!
//! Two ends wired back to back with bounded channels. Frames written on one
//! end are read on the other, in order.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource, Transport};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 64;

pub struct MemoryTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryTransport {
    /// Create a connected pair: frames sent on A arrive on B and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self { tx: tx_b, rx: rx_a },
            Self { tx: tx_a, rx: rx_b },
        )
    }
}

impl Transport for MemoryTransport {
    fn split(self) -> (Box<dyn FrameSink>, Box<dyn FrameSource>) {
        (
            Box::new(MemorySink { tx: Some(self.tx) }),
            Box::new(MemorySource { rx: self.rx }),
        )
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::Closing)?;
        tx.send(frame)
            .await
            .map_err(|_| Error::Transport("peer hung up".into()))
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender is what the peer observes as end of stream.
        self.tx.take();
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
