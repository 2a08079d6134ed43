//! RPC Connection Engine
//!
//! Core principle: one transport, one dispatch loop, many callers.
//! Request IDs correlate replies; method names route notifications.

pub mod codec;
pub mod conn;
pub mod protocol;

pub use codec::{Codec, JsonCodec};
pub use conn::Conn;
pub use protocol::{Event, Request, Response, ResponseError};
