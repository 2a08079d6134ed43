//! Client-side JSON RPC runtime for DevTools-style protocols
//!
//! A [`Conn`] speaks request/response and notifications over any framed
//! [`Transport`] (a WebSocket in production, an in-memory pipe in tests).
//! Notifications are read through [`Stream`]s, which can be [`sync`]ed so a
//! group of them is consumed in wire order. A session [`Manager`] attaches to
//! targets and hands back a [`Session`], itself just another `Conn`.
//!
//! # Architecture
//!
//! 1. **One reader per connection**: a dispatch task owns the read half and
//!    never blocks on consumers.
//! 2. **Sessions are connections**: flattened or legacy, a session runs the
//!    same `Conn` over a transport built on its parent.
//! 3. **Explicit teardown**: close is idempotent-with-error, and everything
//!    hanging off a connection learns about it.

pub mod config;
pub mod error;
pub mod rpc;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::{ConnConfig, ManagerConfig};
pub use error::{Error, Result};
pub use rpc::{Codec, Conn, Event, JsonCodec, ResponseError};
pub use session::{Manager, Session, SessionMode};
pub use stream::{sync, Stream, StreamKey};
pub use transport::{MemoryTransport, Transport, WebSocketTransport};
