//! Event Streams - fan-out of notifications to subscribers
//!
//! Design:
//! - Registry is an arena keyed by method (+ optional session), each entry a
//!   list of subscriber buffers. No callbacks, so teardown is explicit.
//! - Every subscriber gets its own copy of each matching notification.
//! - Only the connection's dispatch loop delivers; it never waits on readers.

mod buffer;
pub mod sync;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};
use crate::rpc::protocol::{Event, SessionId};
use buffer::Subscriber;

pub use sync::sync;

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub method: String,
    pub session_id: Option<SessionId>,
}

impl StreamKey {
    pub fn new(method: impl Into<String>, session_id: Option<SessionId>) -> Self {
        Self {
            method: method.into(),
            session_id,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(session) => write!(f, "{}@{}", self.method, session),
            None => f.write_str(&self.method),
        }
    }
}

/// Buffers and locks here never hold across an await, and no code path
/// panics while holding one, so a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscription registry of one connection
#[derive(Default)]
pub(crate) struct Registry {
    groups: DashMap<StreamKey, Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Registry {
    pub(crate) fn subscribe(self: &Arc<Self>, key: StreamKey) -> Result<Stream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closing);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Subscriber::new(id, key.clone());
        self.groups.entry(key).or_default().push(Arc::clone(&sub));

        // Lost a race with close_all: it may have collected the groups
        // before we inserted.
        if self.closed.load(Ordering::SeqCst) {
            self.remove(&sub);
            return Err(Error::Closing);
        }

        tracing::trace!(key = %sub.key, id, "subscribed");
        Ok(Stream {
            registry: Arc::clone(self),
            sub,
            closed: AtomicBool::new(false),
        })
    }

    fn remove(&self, sub: &Subscriber) {
        if let Entry::Occupied(mut group) = self.groups.entry(sub.key.clone()) {
            group.get_mut().retain(|s| s.id != sub.id);
            if group.get().is_empty() {
                group.remove();
            }
        }
    }

    /// Fan out one notification. Called from the dispatch loop only.
    pub(crate) fn deliver(&self, key: &StreamKey, event: Event) {
        let subs = match self.groups.get(key) {
            Some(group) => group.value().clone(),
            None => {
                tracing::trace!(key = %key, "no subscribers");
                return;
            }
        };
        for sub in &subs {
            sub.deliver(event.clone());
        }
    }

    /// Connection teardown: close every buffer, keep what is buffered.
    pub(crate) fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let subs: Vec<Arc<Subscriber>> = self
            .groups
            .iter()
            .flat_map(|group| group.value().clone())
            .collect();
        self.groups.clear();
        // Sync groups are left intact so their backlog stays drainable.
        for sub in subs {
            sub.shutdown();
        }
    }
}

/// A subscription to one notification method
///
/// Obtained from [`crate::Conn::subscribe`]. Receives every matching
/// notification in arrival order. Dropping the stream unsubscribes it.
pub struct Stream {
    registry: Arc<Registry>,
    sub: Arc<Subscriber>,
    closed: AtomicBool,
}

impl Stream {
    pub fn key(&self) -> &StreamKey {
        &self.sub.key
    }

    pub fn method(&self) -> &str {
        &self.sub.key.method
    }

    /// Resolves when a message can be received without waiting, or the
    /// stream is closed. Does not consume anything; safe in `select!`.
    pub async fn ready(&self) {
        self.sub.ready().await
    }

    /// Receive the next notification's params as `T`. Use
    /// `serde_json::Value` for the raw params.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<T> {
        self.recv_until(std::future::pending::<()>()).await
    }

    /// Like [`recv`](Self::recv), giving up with [`Error::Cancelled`] as soon
    /// as `cancel` resolves. Cancellation wins over a closing stream.
    pub async fn recv_until<T, F>(&self, cancel: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Future,
    {
        let event = tokio::select! {
            biased;
            _ = cancel => return Err(Error::Cancelled),
            event = self.sub.recv() => event?,
        };
        Ok(serde_json::from_value(event.params.unwrap_or(Value::Null))?)
    }

    /// Receive the whole notification, method and session included.
    pub async fn recv_event(&self) -> Result<Event> {
        self.sub.recv().await
    }

    /// Unsubscribe. Buffered messages can still be received; nothing new is
    /// admitted. Closing twice is an error.
    ///
    /// A synced stream stays in its group until dropped, so messages the
    /// group queued for it are still handed out in order.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::StreamClosed);
        }
        self.registry.remove(&self.sub);
        self.sub.shutdown();
        tracing::trace!(key = %self.sub.key, "stream closed");
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.close();
        }
        // Nobody is left to read what the group holds for us.
        if let Some(store) = self.sub.leave_sync() {
            store.leave(self.sub.id);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.sub.key)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
