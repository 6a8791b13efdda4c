//! Reference federation.
//!
//! The master owns the authoritative count of every shared reference and
//! a per-participant ledger `(participant, ref) -> count` so that a
//! leaver's holdings can be reclaimed. Slaves keep only their own local
//! counts; every remote up/down travels through the world-refs call
//! registered at master init (the call argument names the ref, the
//! payload carries the signed delta).

use fusion_protocol::{FusionError, FusionId, RefId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct RefObject {
    count: i32,
}

pub struct RefsFederation {
    /// Master: authoritative table of every ref.
    table: Mutex<HashMap<RefId, RefObject>>,
    /// Master: counts held per (participant, ref).
    slave_entries: Mutex<HashMap<(FusionId, RefId), i32>>,
    /// Slave: our own holdings (used for fork duplication and teardown).
    local: Mutex<HashMap<RefId, i32>>,
    next_ref: AtomicU32,
}

impl RefsFederation {
    pub fn new() -> Self {
        RefsFederation {
            table: Mutex::new(HashMap::new()),
            slave_entries: Mutex::new(HashMap::new()),
            local: Mutex::new(HashMap::new()),
            next_ref: AtomicU32::new(1),
        }
    }

    /// Master: create a new shared reference with count zero.
    pub fn create(&self) -> RefId {
        let id = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.table.lock().insert(id, RefObject::default());
        id
    }

    /// Master: current count, if the ref exists.
    pub fn count(&self, ref_id: RefId) -> Option<i32> {
        self.table.lock().get(&ref_id).map(|r| r.count)
    }

    /// Master: destroy a reference outright.
    pub fn destroy(&self, ref_id: RefId) {
        self.table.lock().remove(&ref_id);
        self.slave_entries
            .lock()
            .retain(|(_, rid), _| *rid != ref_id);
    }

    /// Master-side adjustment on its own behalf (no slave ledger entry).
    pub fn adjust_own(&self, ref_id: RefId, delta: i32) -> Result<i32> {
        let mut table = self.table.lock();
        let object = table
            .get_mut(&ref_id)
            .ok_or(FusionError::Destroyed)?;
        object.count += delta;
        if object.count < 0 {
            warn!(target: "fusion.refs", ref_id, count = object.count, "ref count underflow");
            object.count = 0;
        }
        Ok(object.count)
    }

    /// Master: apply a delta on behalf of a remote participant (the
    /// world-refs call handler body).
    pub fn adjust_for(&self, caller: FusionId, ref_id: RefId, delta: i32) {
        if self.adjust_own(ref_id, delta).is_err() {
            warn!(target: "fusion.refs", caller = %caller, ref_id, "adjust for unknown ref");
            return;
        }
        let mut entries = self.slave_entries.lock();
        let entry = entries.entry((caller, ref_id)).or_insert(0);
        *entry += delta;
        debug!(target: "fusion.refs", caller = %caller, ref_id, held = *entry, "remote ref adjusted");
        if *entry <= 0 {
            entries.remove(&(caller, ref_id));
        }
    }

    /// Master: release everything a leaver still holds. Returns the number
    /// of individual references released.
    pub fn collect_leaver(&self, leaver: FusionId) -> i32 {
        let removed: Vec<(RefId, i32)> = {
            let mut entries = self.slave_entries.lock();
            let keys: Vec<_> = entries
                .keys()
                .filter(|(id, _)| *id == leaver)
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| entries.remove(&key).map(|count| (key.1, count)))
                .collect()
        };

        let mut released = 0;
        for (ref_id, count) in removed {
            let _ = self.adjust_own(ref_id, -count);
            released += count;
        }
        if released > 0 {
            debug!(target: "fusion.refs", leaver = %leaver, released, "collected leaver refs");
        }
        released
    }

    /// Slave: track our own holding alongside the remote adjustment.
    pub fn note_local(&self, ref_id: RefId, delta: i32) {
        let mut local = self.local.lock();
        let entry = local.entry(ref_id).or_insert(0);
        *entry += delta;
        if *entry <= 0 {
            local.remove(&ref_id);
        }
    }

    /// Slave: snapshot of our holdings (fork duplication).
    pub fn local_snapshot(&self) -> Vec<(RefId, i32)> {
        self.local.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn clear_local(&self) {
        self.local.lock().clear();
    }
}

impl Default for RefsFederation {
    fn default() -> Self {
        Self::new()
    }
}
