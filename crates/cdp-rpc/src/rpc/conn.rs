//! Connection - The Core Communication Layer
//!
//! Design decisions:
//! 1. One dispatch loop per connection, and it is the only transport reader
//! 2. Request/response matching via ID, notifications fanned out by method
//! 3. Writes go through one lock so frames never interleave
//! 4. Fail fast - no retries, no queuing. Let the caller decide.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};

use super::codec::{Codec, JsonCodec};
use super::protocol::*;
use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::stream::{Registry, Stream, StreamKey};
use crate::transport::{websocket, FrameSink, FrameSource, Transport};

type Reply = oneshot::Sender<Result<Value>>;

/// Connection - one transport, many concurrent callers
pub struct Conn {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    /// Calls waiting for their response
    pending: DashMap<RequestId, Reply>,

    /// Notification subscribers
    streams: Arc<Registry>,

    /// Flattened sessions multiplexed over this connection; frames tagged
    /// with a routed session ID are handed to that session untouched.
    routes: DashMap<SessionId, mpsc::Sender<Vec<u8>>>,

    /// Transport write half
    sink: Mutex<Box<dyn FrameSink>>,

    codec: Arc<dyn Codec>,

    /// Stamped on every outbound request when this is a flattened session.
    session_id: Option<SessionId>,

    config: ConnConfig,

    closed: AtomicBool,

    /// Wakes the dispatch loop on local close.
    shutdown: Notify,

    /// Flips to true once the dispatch loop is gone.
    done: watch::Sender<bool>,
}

impl Conn {
    /// Connect to a websocket debugging endpoint
    pub async fn dial(ws_url: &str, config: ConnConfig) -> Result<Arc<Self>> {
        let transport = websocket::connect(ws_url, &config).await?;
        Ok(Self::spawn(transport, Arc::new(JsonCodec), config, None))
    }

    /// Run a connection over an already established transport.
    pub fn new(transport: impl Transport) -> Arc<Self> {
        Self::spawn(transport, Arc::new(JsonCodec), ConnConfig::default(), None)
    }

    pub fn with_codec(
        transport: impl Transport,
        codec: Arc<dyn Codec>,
        config: ConnConfig,
    ) -> Arc<Self> {
        Self::spawn(transport, codec, config, None)
    }

    pub(crate) fn spawn(
        transport: impl Transport,
        codec: Arc<dyn Codec>,
        config: ConnConfig,
        session_id: Option<SessionId>,
    ) -> Arc<Self> {
        let (sink, source) = transport.split();
        let (done, _) = watch::channel(false);

        let conn = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            streams: Arc::new(Registry::default()),
            routes: DashMap::new(),
            sink: Mutex::new(sink),
            codec,
            session_id,
            config,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            done,
        });

        tokio::spawn(Arc::clone(&conn).dispatch(source));
        conn
    }

    /// Send a call and wait for its reply
    pub async fn invoke(&self, method: impl Into<String>, params: Option<Value>) -> Result<Value> {
        self.invoke_until(method, params, std::future::pending::<()>())
            .await
    }

    /// Send a call and decode its reply into `T`
    pub async fn invoke_as<T: DeserializeOwned>(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<T> {
        let result = self.invoke(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a call, giving up with [`Error::Cancelled`] once `cancel`
    /// resolves. Giving up never affects the connection; a reply that shows
    /// up later is dropped.
    pub async fn invoke_until<F: Future>(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        cancel: F,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::Closing);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        // Deregisters on every exit path, including the caller dropping us.
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };

        // close() may have drained the table just before we inserted.
        if self.is_closed() {
            return Err(Error::Closing);
        }

        let request = Request {
            id,
            method: method.into(),
            params,
            session_id: self.session_id.clone(),
        };
        tracing::trace!(id, method = %request.method, "invoke");
        let frame = self.codec.encode(&request)?;

        // A write can take a round trip of its own (legacy sessions), so the
        // caller may give up during it too.
        tokio::pin!(cancel);
        tokio::select! {
            biased;
            _ = &mut cancel => {
                tracing::debug!(id, method = %request.method, "invoke cancelled while writing");
                return Err(Error::Cancelled);
            }
            written = self.write(frame) => written?,
        }

        tokio::select! {
            biased;
            _ = cancel => {
                tracing::debug!(id, method = %request.method, "invoke cancelled");
                Err(Error::Cancelled)
            }
            reply = wait_reply(rx, self.config.request_timeout) => reply,
        }
    }

    /// Subscribe to a notification method
    pub fn subscribe(&self, method: impl Into<String>) -> Result<Stream> {
        self.streams.subscribe(StreamKey::new(method, None))
    }

    /// Subscribe to notifications tagged with a session this connection does
    /// not route anywhere else.
    pub fn subscribe_session(
        &self,
        method: impl Into<String>,
        session_id: impl Into<SessionId>,
    ) -> Result<Stream> {
        self.streams
            .subscribe(StreamKey::new(method, Some(session_id.into())))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the dispatch loop has stopped.
    pub async fn closed(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }

    /// The session this connection speaks for, if it is a flattened session.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Close the connection
    ///
    /// Fails every outstanding call, closes every stream (buffered messages
    /// stay readable) and closes the transport. A second call returns
    /// [`Error::Closing`]. A transport close error is returned, but state is
    /// torn down regardless.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::Closing);
        }
        self.teardown();
        self.shutdown.notify_one();

        let mut sink = self.sink.lock().await;
        sink.close().await
    }

    pub(crate) fn codec(&self) -> Arc<dyn Codec> {
        Arc::clone(&self.codec)
    }

    pub(crate) fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Write one already encoded frame, serialized with every other writer.
    pub(crate) async fn write(&self, frame: Vec<u8>) -> Result<()> {
        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(Error::Closing);
        }
        sink.send(frame).await
    }

    /// Route frames tagged with `session_id` to the returned receiver.
    pub(crate) fn add_route(
        &self,
        session_id: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.routes.insert(session_id.to_string(), tx);
        if self.is_closed() {
            self.routes.remove(session_id);
            return Err(Error::Closing);
        }
        Ok(rx)
    }

    /// Dropping the route ends the session's inbound stream.
    pub(crate) fn remove_route(&self, session_id: &str) {
        self.routes.remove(session_id);
    }

    async fn dispatch(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.notified() => break,
                frame = source.recv() => frame,
            };
            match frame {
                Ok(Some(frame)) => self.handle_frame(frame).await,
                Ok(None) => {
                    tracing::debug!(session_id = ?self.session_id, "transport closed by peer");
                    break;
                }
                Err(e) => {
                    tracing::error!(session_id = ?self.session_id, "transport read failed: {}", e);
                    break;
                }
            }
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            self.teardown();
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                tracing::warn!(session_id = ?self.session_id, "closing transport failed: {}", e);
            }
        }
        self.done.send_replace(true);
    }

    async fn handle_frame(&self, bytes: Vec<u8>) {
        let frame = match self.codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                // Best effort: one bad frame does not take the connection down.
                tracing::warn!("dropping undecodable frame: {}", e);
                return;
            }
        };

        // Our own session tag means the frame is ours; any other tag is
        // either routed to its session or kept as session-scoped.
        let session = frame
            .session_id()
            .filter(|id| Some(*id) != self.session_id.as_deref())
            .map(str::to_owned);

        if let Some(session_id) = &session {
            let route = self.routes.get(session_id).map(|r| r.value().clone());
            if let Some(route) = route {
                if route.send(bytes).await.is_err() {
                    tracing::debug!(%session_id, "session route gone, removing");
                    self.routes.remove(session_id);
                }
                return;
            }
        }

        match frame {
            // Session request IDs overlap ours; a reply for a session we
            // don't route must never complete one of our calls.
            Frame::Response(response) if session.is_some() => {
                tracing::warn!(
                    id = response.id,
                    session_id = ?session,
                    "Dropping response for unrouted session"
                );
            }
            Frame::Response(response) => match self.pending.remove(&response.id) {
                Some((id, reply)) => {
                    tracing::trace!(id, "reply");
                    // Receiver gone means the caller gave up; nothing to do.
                    let _ = reply.send(response.into_result().map_err(Error::from));
                }
                None => {
                    tracing::warn!(id = response.id, "Received response for unknown request");
                }
            },
            Frame::Event(event) => {
                let key = StreamKey::new(event.method.clone(), session);
                self.streams.deliver(&key, event);
            }
        }
    }

    /// Fail pending calls, close streams, cut session routes.
    fn teardown(&self) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(Error::Closing));
            }
        }
        self.streams.close_all();
        self.routes.clear();
        tracing::debug!(session_id = ?self.session_id, "connection closed");
    }
}

async fn wait_reply(
    rx: oneshot::Receiver<Result<Value>>,
    timeout: Option<Duration>,
) -> Result<Value> {
    let reply = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx)
            .await
            .map_err(|_| Error::Timeout)?,
        None => rx.await,
    };
    // Sender dropped without an answer: torn down mid-flight.
    reply.unwrap_or(Err(Error::Closing))
}

struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, Reply>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}
