//! The deferred task.
//!
//! Destructor-class calls must not run inline on the dispatcher thread;
//! they are copied off the receive buffer and executed strictly FIFO on
//! this auxiliary task. The queue is a bounded channel; overflow surfaces
//! as `LimitExceeded` at enqueue time rather than unbounded growth.
//!
//! Cleanups registered by a deferred call run on the *dispatcher* thread
//! at its next cleanup point; this task never drains the cleanup list.

use crate::dispatcher;
use crate::world::World;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use fusion_protocol::{FusionError, MessageHeader, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Generous cap; the source never bounds this queue, so overflow here is
/// already a pathological world.
const DEFERRED_CAPACITY: usize = 1024;

enum Item {
    Frame(MessageHeader, Vec<u8>),
    Quit,
}

struct Inner {
    tx: Sender<Item>,
    rx: Option<Receiver<Item>>,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct DeferredQueue {
    inner: Mutex<Inner>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        let (tx, rx) = bounded(DEFERRED_CAPACITY);
        DeferredQueue {
            inner: Mutex::new(Inner {
                tx,
                rx: Some(rx),
                handle: None,
            }),
        }
    }

    pub fn spawn(&self, world: Arc<World>) -> Result<()> {
        let mut inner = self.inner.lock();
        let rx = inner
            .rx
            .take()
            .ok_or_else(|| FusionError::InitFailed("deferred task already running".into()))?;
        let handle = std::thread::Builder::new()
            .name(format!("fusion-deferred-{}", world.world_index()))
            .spawn(move || run(world, rx))
            .map_err(|e| FusionError::InitFailed(format!("spawn deferred task: {e}")))?;
        inner.handle = Some(handle);
        Ok(())
    }

    /// Copy a frame into the queue (dispatcher side).
    pub fn enqueue(&self, header: MessageHeader, payload: Vec<u8>) -> Result<()> {
        let tx = self.inner.lock().tx.clone();
        match tx.try_send(Item::Frame(header, payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FusionError::LimitExceeded(
                "deferred call queue overflow".into(),
            )),
            Err(TrySendError::Disconnected(_)) => Err(FusionError::Destroyed),
        }
    }

    /// Stop and join the task. Safe to call more than once.
    pub fn shutdown(&self) {
        let (tx, handle) = {
            let mut inner = self.inner.lock();
            (inner.tx.clone(), inner.handle.take())
        };
        if let Some(handle) = handle {
            let _ = tx.send(Item::Quit);
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Forget the (nonexistent) task and re-arm the channel in a forked
    /// child. Queued items belonged to the parent and are dropped.
    pub fn reset_after_fork(&self) {
        let mut inner = self.inner.lock();
        let (tx, rx) = bounded(DEFERRED_CAPACITY);
        inner.tx = tx;
        inner.rx = Some(rx);
        // Dropping the stale handle detaches; the thread only ever
        // existed in the parent.
        inner.handle = None;
    }
}

fn run(world: Arc<World>, rx: Receiver<Item>) {
    debug!(target: "fusion.dispatch", world = world.world_index(), "deferred task running");
    while let Ok(item) = rx.recv() {
        match item {
            Item::Frame(header, payload) => {
                dispatcher::process_frame(&world, &header, &payload, true);
            }
            Item::Quit => break,
        }
    }
    debug!(target: "fusion.dispatch", world = world.world_index(), "deferred task done");
}
