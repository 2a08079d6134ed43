//! Per-subscription message buffer
//!
//! One head slot plus an unbounded backlog. The dispatch loop stores, the
//! owner of the stream loads. Storing never waits on the consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::sync::SyncStore;
use super::{lock, StreamKey};
use crate::error::{Error, Result};
use crate::rpc::protocol::Event;

pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) key: StreamKey,
    state: Mutex<BufferState>,
    /// Holds at most one permit, however many messages are queued.
    ready: Notify,
}

#[derive(Default)]
struct BufferState {
    head: Option<Event>,
    backlog: VecDeque<Event>,
    /// No new messages are admitted once set.
    closed: bool,
    /// Set when the subscriber belongs to a sync group; the group then owns
    /// ordering and this buffer only ever holds the head slot.
    sync: Option<Arc<SyncStore>>,
}

impl Subscriber {
    pub(crate) fn new(id: u64, key: StreamKey) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            state: Mutex::new(BufferState::default()),
            ready: Notify::new(),
        })
    }

    /// Admit a message from the dispatch loop.
    pub(crate) fn deliver(self: &Arc<Self>, event: Event) {
        let store = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            match &state.sync {
                Some(store) => Arc::clone(store),
                None => {
                    if state.head.is_none() && state.backlog.is_empty() {
                        state.head = Some(event);
                        drop(state);
                        self.ready.notify_one();
                    } else {
                        state.backlog.push_back(event);
                    }
                    return;
                }
            }
        };
        store.store(self, event);
    }

    /// Put a message straight into the (empty) head slot. Used by the sync
    /// group to hand over its single in-flight message.
    pub(crate) fn offer(&self, event: Event) {
        let mut state = lock(&self.state);
        debug_assert!(state.head.is_none(), "sync group released into a full head");
        state.head = Some(event);
        drop(state);
        self.ready.notify_one();
    }

    /// Take the head message, if any. `Err(StreamClosing)` once closed and
    /// drained.
    pub(crate) fn try_recv(&self) -> Result<Option<Event>> {
        let mut state = lock(&self.state);
        let Some(event) = state.head.take() else {
            if !state.closed {
                return Ok(None);
            }
            let store = state.sync.clone();
            drop(state);
            return match store {
                // Closed, but the group may still owe us queued messages.
                Some(store) if store.holds(self.id) => Ok(None),
                _ => Err(Error::StreamClosing),
            };
        };

        match state.sync.clone() {
            Some(store) => {
                drop(state);
                store.release(self.id);
            }
            None => {
                state.head = state.backlog.pop_front();
                let more = state.head.is_some();
                drop(state);
                if more {
                    self.ready.notify_one();
                }
            }
        }
        Ok(Some(event))
    }

    pub(crate) async fn recv(&self) -> Result<Event> {
        loop {
            let notified = self.ready.notified();
            if let Some(event) = self.try_recv()? {
                return Ok(event);
            }
            notified.await;
        }
    }

    /// Resolve once a message is deliverable or the buffer is closed and
    /// drained.
    pub(crate) async fn ready(&self) {
        loop {
            let notified = self.ready.notified();
            let (has_head, closed, store) = {
                let state = lock(&self.state);
                (state.head.is_some(), state.closed, state.sync.clone())
            };
            if has_head {
                // Pass the credit on: a receiver may be parked too.
                self.ready.notify_one();
                return;
            }
            if closed && !store.is_some_and(|store| store.holds(self.id)) {
                return;
            }
            notified.await;
        }
    }

    /// Stop admitting messages. Buffered ones stay readable.
    pub(crate) fn shutdown(&self) {
        lock(&self.state).closed = true;
        self.ready.notify_waiters();
    }

    /// Detach from the sync group, if any. The caller must then
    /// [`SyncStore::leave`] it.
    pub(crate) fn leave_sync(&self) -> Option<Arc<SyncStore>> {
        lock(&self.state).sync.take()
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub(crate) fn is_synced(&self) -> bool {
        lock(&self.state).sync.is_some()
    }

    /// Switch this subscriber behind `store`, handing back everything it had
    /// buffered so the group can requeue it. The caller holds the group lock.
    pub(crate) fn join(&self, store: Arc<SyncStore>) -> Vec<Event> {
        let mut state = lock(&self.state);
        state.sync = Some(store);
        let mut pending: Vec<Event> = state.head.take().into_iter().collect();
        pending.extend(state.backlog.drain(..));
        pending
    }
}
