//! Reactors: publish/subscribe channels within a world.
//!
//! A reactor is identified by an object id; listeners attach to a
//! `(reactor, channel)` pair. Dispatching invokes local listeners and
//! broadcasts a REACTOR frame so every other participant's dispatcher
//! does the same.

use fusion_protocol::ReactorMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

type Reaction = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionHandle {
    reactor_id: u32,
    channel: u32,
    serial: u64,
}

pub struct ReactorRegistry {
    next_reactor: AtomicU32,
    next_serial: AtomicU64,
    listeners: Mutex<HashMap<(u32, u32), Vec<(u64, Reaction)>>>,
}

impl ReactorRegistry {
    pub fn new() -> Self {
        ReactorRegistry {
            next_reactor: AtomicU32::new(1),
            next_serial: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh reactor id.
    pub fn create(&self) -> u32 {
        self.next_reactor.fetch_add(1, Ordering::Relaxed)
    }

    pub fn attach(
        &self,
        reactor_id: u32,
        channel: u32,
        f: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> ReactionHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry((reactor_id, channel))
            .or_default()
            .push((serial, Arc::new(f)));
        ReactionHandle {
            reactor_id,
            channel,
            serial,
        }
    }

    pub fn detach(&self, handle: ReactionHandle) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(&(handle.reactor_id, handle.channel)) {
            list.retain(|(serial, _)| *serial != handle.serial);
            if list.is_empty() {
                listeners.remove(&(handle.reactor_id, handle.channel));
            }
        }
    }

    /// Invoke local listeners for `(reactor, channel)`.
    pub fn process(&self, reactor_id: u32, channel: u32, payload: &[u8]) {
        // Snapshot first: reactions may attach/detach re-entrantly.
        let snapshot: Vec<Reaction> = self
            .listeners
            .lock()
            .get(&(reactor_id, channel))
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default();
        trace!(
            target: "fusion.reactor",
            reactor = reactor_id,
            channel,
            listeners = snapshot.len(),
            "processing reactor message"
        );
        for reaction in snapshot {
            reaction(payload);
        }
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl Default for ReactorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame carrying a reactor dispatch to other participants.
pub fn reactor_frame(reactor_id: u32, channel: u32, payload: &[u8]) -> Vec<u8> {
    ReactorMessage {
        reactor_id,
        channel,
    }
    .to_frame(payload)
}
