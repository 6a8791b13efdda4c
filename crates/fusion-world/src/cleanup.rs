//! Dispatch-cleanup list.
//!
//! User code registers `(fn, ctx)`-style closures that the dispatcher runs
//! at well-defined points: the start of each kernel-originated CALL frame
//! and the end of each receive buffer. Running between buffers (never
//! between frames of one buffer) is a deliberate batching guarantee.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupHandle(u64);

type CleanupFn = Box<dyn FnOnce() + Send>;

pub struct CleanupList {
    next: AtomicU64,
    entries: Mutex<Vec<(u64, CleanupFn)>>,
}

impl CleanupList {
    pub fn new() -> Self {
        CleanupList {
            next: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, f: impl FnOnce() + Send + 'static) -> CleanupHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, Box::new(f)));
        CleanupHandle(id)
    }

    /// Remove a specific entry before it runs. Returns whether it was
    /// still registered.
    pub fn remove(&self, handle: CleanupHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(id, _)| *id != handle.0);
        entries.len() != before
    }

    /// Invoke every registered function once and empty the list. Entries
    /// registered while running (from inside a cleanup) are picked up at
    /// the next point, not this one.
    pub fn run_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.entries.lock());
        if drained.is_empty() {
            return;
        }
        trace!(target: "fusion.dispatch", count = drained.len(), "running dispatch cleanups");
        for (_, f) in drained {
            f();
        }
    }
}

impl Default for CleanupList {
    fn default() -> Self {
        Self::new()
    }
}
