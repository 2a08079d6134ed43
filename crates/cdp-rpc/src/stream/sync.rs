//! Stream Synchronizer
//!
//! Per-stream order is free: each subscriber buffer is FIFO. Order *across*
//! streams is not, because each stream is consumed independently. A sync
//! group fixes that by letting exactly one message out at a time for the
//! whole group:
//!
//! ```text
//! dispatch ──► store ──► in flight? ── no ──► owner's head slot
//!                             │
//!                            yes
//!                             ▼
//!                     global backlog (arrival order)
//!                             │
//!          owner receives ────┘ release(): next item to *its* owner
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use super::buffer::Subscriber;
use super::{lock, Stream};
use crate::error::{Error, Result};
use crate::rpc::protocol::Event;

pub(crate) struct SyncStore {
    state: Mutex<SyncState>,
}

#[derive(Default)]
struct SyncState {
    members: HashMap<u64, Weak<Subscriber>>,
    /// Subscriber currently holding the group's only deliverable message.
    in_flight: Option<u64>,
    backlog: VecDeque<(u64, Event)>,
}

impl SyncStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SyncState::default()),
        })
    }

    pub(crate) fn store(&self, member: &Arc<Subscriber>, event: Event) {
        let mut state = lock(&self.state);
        if member.is_closed() {
            return;
        }
        if state.in_flight.is_none() {
            state.in_flight = Some(member.id);
            member.offer(event);
        } else {
            state.backlog.push_back((member.id, event));
        }
    }

    /// The in-flight message was received by `member_id`; hand the next one
    /// out, whichever stream it belongs to.
    pub(crate) fn release(&self, member_id: u64) {
        let mut state = lock(&self.state);
        if state.in_flight != Some(member_id) {
            return;
        }
        state.release_next();
    }

    /// Whether `member_id` still has a message in flight or queued.
    pub(crate) fn holds(&self, member_id: u64) -> bool {
        let state = lock(&self.state);
        state.in_flight == Some(member_id) || state.backlog.iter().any(|(id, _)| *id == member_id)
    }

    /// A member was dropped. Its queued messages go with it.
    pub(crate) fn leave(&self, member_id: u64) {
        let mut state = lock(&self.state);
        state.members.remove(&member_id);
        state.backlog.retain(|(id, _)| *id != member_id);
        if state.in_flight == Some(member_id) {
            state.release_next();
        }
    }
}

impl SyncState {
    fn release_next(&mut self) {
        self.in_flight = None;
        while let Some((id, event)) = self.backlog.pop_front() {
            if let Some(member) = self.members.get(&id).and_then(Weak::upgrade) {
                self.in_flight = Some(id);
                member.offer(event);
                return;
            }
        }
    }
}

/// Merge `streams` into one globally ordered delivery sequence.
///
/// All streams must come from the same connection, listen to distinct
/// methods, and be neither closed nor already synced. After this returns,
/// waiting on [`Stream::ready`] across the group observes notifications in
/// the order the connection received them.
pub fn sync(streams: &[&Stream]) -> Result<()> {
    let Some(first) = streams.first() else {
        return Err(Error::Sync("no streams given".into()));
    };

    let mut keys = HashSet::new();
    for stream in streams {
        if !Arc::ptr_eq(&stream.registry, &first.registry) {
            return Err(Error::Sync(
                "streams belong to different connections".into(),
            ));
        }
        if !keys.insert(&stream.sub.key) {
            return Err(Error::Sync(format!(
                "duplicate stream for {}",
                stream.sub.key
            )));
        }
        if stream.sub.is_closed() {
            return Err(Error::Sync(format!("stream {} is closed", stream.sub.key)));
        }
        if stream.sub.is_synced() {
            return Err(Error::Sync(format!(
                "stream {} is already synced",
                stream.sub.key
            )));
        }
    }

    let store = SyncStore::new();
    // Hold the group lock while switching so nothing the dispatch loop stores
    // in the meantime can overtake a message that was already buffered.
    let mut state = lock(&store.state);
    for stream in streams {
        let sub = &stream.sub;
        state.members.insert(sub.id, Arc::downgrade(sub));
        for event in sub.join(Arc::clone(&store)) {
            if state.in_flight.is_none() {
                state.in_flight = Some(sub.id);
                sub.offer(event);
            } else {
                state.backlog.push_back((sub.id, event));
            }
        }
    }
    drop(state);

    tracing::debug!(streams = streams.len(), "streams synced");
    Ok(())
}
