//! Frame codec
//!
//! Turns one outbound [`Request`] into bytes and one inbound frame back into
//! a [`Frame`]. The connection never looks at bytes itself, so a different
//! wire encoding only needs a different codec.

use super::protocol::{Frame, Request};
use crate::error::Result;

pub trait Codec: Send + Sync + 'static {
    fn encode(&self, request: &Request) -> Result<Vec<u8>>;
    fn decode(&self, frame: &[u8]) -> Result<Frame>;
}

/// Plain JSON, one object per frame
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, request: &Request) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode(&self, frame: &[u8]) -> Result<Frame> {
        Ok(serde_json::from_slice(frame)?)
    }
}
