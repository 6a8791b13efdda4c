//! Surfaces, buffers and allocations.
//!
//! A central store owns every surface by id; back-references between
//! surfaces, buffers and allocations are ids, never pointers, so
//! lifetimes extend only across held ids. The store also provides the
//! canonical multi-surface locking primitive: callers supply the set,
//! `lock_many` sorts by stable id before locking and releases in reverse.

pub mod client;
pub mod frametime;
pub mod geometry;

pub use client::{FlipFlags, SurfaceClient};
pub use frametime::{Clock, FrameTimeConfig, FrameTimer, MonotonicClock};
pub use geometry::{Line, Point, Rectangle, Region, Triangle};

use fusion_protocol::{FusionError, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

pub type SurfaceId = u64;
pub type AllocationId = u64;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SurfaceCaps: u32 {
        /// The surface has swappable buffers.
        const FLIPPING = 0x0000_0001;
        /// Left/right eye allocations exist.
        const STEREO   = 0x0000_0002;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const READ  = 0x0000_0001;
        const WRITE = 0x0000_0002;
    }
}

/// Storage policy of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferPolicy {
    #[default]
    VideoOnly,
    SystemOnly,
}

/// Buffer role relative to the current flip count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BufferRole {
    Front = 0,
    Back = 1,
    Idle = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum Eye {
    #[default]
    Left = 0,
    Right = 1,
}

#[derive(Debug, Clone)]
pub struct SurfaceConfig {
    pub width: i32,
    pub height: i32,
    pub caps: SurfaceCaps,
    pub buffers: usize,
    pub policy: BufferPolicy,
}

impl SurfaceConfig {
    pub fn new(width: i32, height: i32, buffers: usize) -> Self {
        SurfaceConfig {
            width,
            height,
            caps: if buffers > 1 {
                SurfaceCaps::FLIPPING
            } else {
                SurfaceCaps::empty()
            },
            buffers,
            policy: BufferPolicy::default(),
        }
    }
}

/// One allocation of a buffer's pixels. The lock state is a lightweight
/// readers/writer count (`> 0` readers, `-1` writer); GPU and CPU
/// accessors contend here, not on the surface lock.
pub struct Allocation {
    pub id: AllocationId,
    pub eye: Eye,
    lock_state: AtomicI32,
    /// Serial of the last hardware operation touching this allocation.
    pub gfx_serial: AtomicU64,
}

impl Allocation {
    fn try_lock(&self, access: AccessFlags) -> bool {
        if access.contains(AccessFlags::WRITE) {
            self.lock_state
                .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        } else {
            let current = self.lock_state.load(Ordering::Relaxed);
            current >= 0
                && self
                    .lock_state
                    .compare_exchange(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
        }
    }

    fn unlock(&self, access: AccessFlags) {
        if access.contains(AccessFlags::WRITE) {
            self.lock_state.store(0, Ordering::Release);
        } else {
            self.lock_state.fetch_sub(1, Ordering::Release);
        }
    }
}

pub struct SurfaceBuffer {
    pub index: usize,
    pub policy: BufferPolicy,
    allocations: Mutex<HashMap<Eye, Arc<Allocation>>>,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NotificationFlags: u32 {
        /// A frame was released by the consumer.
        const FRAME = 0x0000_0001;
        /// The surface configuration changed.
        const SIZE  = 0x0000_0002;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SurfaceNotification {
    pub flags: NotificationFlags,
    pub flip_count: u32,
}

type Listener = Arc<dyn Fn(&SurfaceNotification) + Send + Sync>;

/// A recorded update: what the producer asked the consumer to present.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRecord {
    pub region: Region,
    pub eye: Eye,
    pub flip_count: u32,
    pub frame_time_us: i64,
    /// False for a blit-style update that did not advance the flip count.
    pub flip: bool,
}

pub struct Surface {
    pub id: SurfaceId,
    config: Mutex<SurfaceConfig>,
    /// Producer-side flip count.
    flips: AtomicU32,
    /// Highest flip count the consumer released.
    flips_acked: AtomicU32,
    lock: Mutex<()>,
    buffers: Vec<SurfaceBuffer>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    updates: Mutex<Vec<UpdateRecord>>,
    pub frametime: Mutex<FrameTimeConfig>,
    next_allocation: Arc<AtomicU64>,
}

impl Surface {
    pub fn config(&self) -> SurfaceConfig {
        self.config.lock().clone()
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn flips(&self) -> u32 {
        self.flips.load(Ordering::SeqCst)
    }

    pub fn flips_acked(&self) -> u32 {
        self.flips_acked.load(Ordering::SeqCst)
    }

    pub(crate) fn raw_lock(&self) -> &Mutex<()> {
        &self.lock
    }

    /// Buffer serving `role` at flip count `flips`.
    pub fn buffer_at(&self, role: BufferRole, flips: u32) -> &SurfaceBuffer {
        let index = (flips as usize + role as u32 as usize) % self.buffers.len();
        &self.buffers[index]
    }

    /// The allocation backing `(buffer, eye)`, created on first use.
    pub fn allocation(&self, role: BufferRole, flips: u32, eye: Eye) -> Arc<Allocation> {
        let buffer = self.buffer_at(role, flips);
        let mut allocations = buffer.allocations.lock();
        allocations
            .entry(eye)
            .or_insert_with(|| {
                Arc::new(Allocation {
                    id: self.next_allocation.fetch_add(1, Ordering::Relaxed),
                    eye,
                    lock_state: AtomicI32::new(0),
                    gfx_serial: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Lock an allocation for CPU/GPU access.
    pub fn lock_buffer(
        &self,
        role: BufferRole,
        flips: u32,
        eye: Eye,
        access: AccessFlags,
    ) -> Result<BufferLockGuard> {
        let allocation = self.allocation(role, flips, eye);
        if !allocation.try_lock(access) {
            return Err(FusionError::Unsupported(format!(
                "allocation {} busy",
                allocation.id
            )));
        }
        trace!(target: "fusion.surface", surface = self.id, allocation = allocation.id, "buffer locked");
        Ok(BufferLockGuard {
            surface_id: self.id,
            allocation,
            access,
        })
    }

    pub fn attach(&self, listener: impl Fn(&SurfaceNotification) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn detach(&self, listener_id: u64) {
        self.listeners.lock().retain(|(id, _)| *id != listener_id);
    }

    fn notify(&self, notification: SurfaceNotification) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for listener in snapshot {
            listener(&notification);
        }
    }

    /// Producer-side update dispatch: records the update and advances the
    /// surface flip count for real flips.
    pub fn dispatch_update(
        &self,
        region: Region,
        flip_count: u32,
        frame_time_us: i64,
        flip: bool,
    ) {
        if flip {
            self.flips.store(flip_count, Ordering::SeqCst);
        }
        self.updates.lock().push(UpdateRecord {
            region,
            eye: Eye::Left,
            flip_count,
            frame_time_us,
            flip,
        });
        debug!(
            target: "fusion.surface",
            surface = self.id,
            flip_count,
            flip,
            "update dispatched"
        );
    }

    /// Stereo update: one region per eye, a single flip-count advance.
    pub fn dispatch_update_stereo(
        &self,
        left: Region,
        right: Region,
        flip_count: u32,
        frame_time_us: i64,
        flip: bool,
    ) {
        if flip {
            self.flips.store(flip_count, Ordering::SeqCst);
        }
        let mut updates = self.updates.lock();
        for (eye, region) in [(Eye::Left, left), (Eye::Right, right)] {
            updates.push(UpdateRecord {
                region,
                eye,
                flip_count,
                frame_time_us,
                flip,
            });
        }
        debug!(
            target: "fusion.surface",
            surface = self.id,
            flip_count,
            flip,
            "stereo update dispatched"
        );
    }

    /// Consumer-side release of frame `flip_count`. The ack is monotonic;
    /// a stale ack never lowers it.
    pub fn frame_ack(&self, flip_count: u32) {
        self.flips_acked
            .fetch_max(flip_count, Ordering::SeqCst);
        self.notify(SurfaceNotification {
            flags: NotificationFlags::FRAME,
            flip_count,
        });
    }

    /// Drain recorded updates (consumer/test side).
    pub fn take_updates(&self) -> Vec<UpdateRecord> {
        std::mem::take(&mut *self.updates.lock())
    }
}

/// RAII allocation lock; released on drop.
pub struct BufferLockGuard {
    surface_id: SurfaceId,
    allocation: Arc<Allocation>,
    access: AccessFlags,
}

impl BufferLockGuard {
    pub fn allocation_id(&self) -> AllocationId {
        self.allocation.id
    }

    pub fn surface_id(&self) -> SurfaceId {
        self.surface_id
    }

    pub fn stamp_serial(&self, serial: u64) {
        self.allocation.gfx_serial.store(serial, Ordering::Relaxed);
    }
}

impl Drop for BufferLockGuard {
    fn drop(&mut self) {
        self.allocation.unlock(self.access);
    }
}

/// Holds several surface locks; releases them in reverse acquisition
/// order on drop.
pub struct MultiLock<'a> {
    guards: Vec<MutexGuard<'a, ()>>,
}

impl Drop for MultiLock<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Lock a set of surfaces in canonical order (ascending id). Duplicate
/// entries are locked once.
pub fn lock_many<'a>(surfaces: &mut Vec<&'a Surface>) -> MultiLock<'a> {
    surfaces.sort_by_key(|s| s.id);
    surfaces.dedup_by_key(|s| s.id);
    MultiLock {
        guards: surfaces.iter().map(|s| s.raw_lock().lock()).collect(),
    }
}

/// The central object store.
pub struct SurfaceStore {
    surfaces: RwLock<HashMap<SurfaceId, Arc<Surface>>>,
    next_surface: AtomicU64,
    next_allocation: Arc<AtomicU64>,
}

impl SurfaceStore {
    pub fn new() -> Self {
        SurfaceStore {
            surfaces: RwLock::new(HashMap::new()),
            next_surface: AtomicU64::new(1),
            next_allocation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn create(&self, config: SurfaceConfig) -> Result<Arc<Surface>> {
        if !(1..=3).contains(&config.buffers) {
            return Err(FusionError::InvalidArgument(format!(
                "surface must have 1..=3 buffers, got {}",
                config.buffers
            )));
        }
        let id = self.next_surface.fetch_add(1, Ordering::Relaxed);
        let buffers = (0..config.buffers)
            .map(|index| SurfaceBuffer {
                index,
                policy: config.policy,
                allocations: Mutex::new(HashMap::new()),
            })
            .collect();
        let surface = Arc::new(Surface {
            id,
            config: Mutex::new(config),
            flips: AtomicU32::new(0),
            flips_acked: AtomicU32::new(0),
            lock: Mutex::new(()),
            buffers,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            updates: Mutex::new(Vec::new()),
            frametime: Mutex::new(FrameTimeConfig::default()),
            next_allocation: self.next_allocation.clone(),
        });
        self.surfaces.write().insert(id, surface.clone());
        Ok(surface)
    }

    pub fn get(&self, id: SurfaceId) -> Option<Arc<Surface>> {
        self.surfaces.read().get(&id).cloned()
    }

    /// Drop the store's reference. Outstanding `Arc`s keep the surface
    /// alive until released; new lookups fail.
    pub fn destroy(&self, id: SurfaceId) -> Result<()> {
        self.surfaces
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(FusionError::Destroyed)
    }
}

impl Default for SurfaceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SurfaceStore {
        SurfaceStore::new()
    }

    #[test]
    fn buffer_rotation_follows_flip_count() {
        let surface = store().create(SurfaceConfig::new(64, 64, 2)).unwrap();
        assert_eq!(surface.buffer_at(BufferRole::Front, 0).index, 0);
        assert_eq!(surface.buffer_at(BufferRole::Back, 0).index, 1);
        assert_eq!(surface.buffer_at(BufferRole::Front, 1).index, 1);
        assert_eq!(surface.buffer_at(BufferRole::Back, 1).index, 0);
    }

    #[test]
    fn allocations_are_stable_per_buffer_and_eye() {
        let surface = store().create(SurfaceConfig::new(64, 64, 2)).unwrap();
        let a = surface.allocation(BufferRole::Back, 0, Eye::Left);
        let b = surface.allocation(BufferRole::Back, 0, Eye::Left);
        assert_eq!(a.id, b.id);
        let c = surface.allocation(BufferRole::Back, 1, Eye::Left);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn write_lock_excludes_writers_and_readers() {
        let surface = store().create(SurfaceConfig::new(64, 64, 1)).unwrap();
        let write = surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::WRITE)
            .unwrap();
        assert!(surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::READ)
            .is_err());
        drop(write);

        let read1 = surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::READ)
            .unwrap();
        let read2 = surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::READ)
            .unwrap();
        assert!(surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::WRITE)
            .is_err());
        drop(read1);
        drop(read2);
        assert!(surface
            .lock_buffer(BufferRole::Front, 0, Eye::Left, AccessFlags::WRITE)
            .is_ok());
    }

    #[test]
    fn frame_ack_is_monotonic() {
        let surface = store().create(SurfaceConfig::new(64, 64, 3)).unwrap();
        surface.frame_ack(5);
        surface.frame_ack(3);
        assert_eq!(surface.flips_acked(), 5);
    }

    #[test]
    fn lock_many_sorts_and_dedups() {
        let store = store();
        let a = store.create(SurfaceConfig::new(8, 8, 1)).unwrap();
        let b = store.create(SurfaceConfig::new(8, 8, 1)).unwrap();
        let mut set = vec![&*b, &*a, &*a];
        let guard = lock_many(&mut set);
        assert_eq!(set.len(), 2);
        assert!(set[0].id < set[1].id);
        drop(guard);
        // Everything released: an exclusive relock succeeds.
        let _relock = a.raw_lock().lock();
    }

    #[test]
    fn invalid_buffer_count_is_rejected() {
        assert!(store().create(SurfaceConfig::new(8, 8, 0)).is_err());
        assert!(store().create(SurfaceConfig::new(8, 8, 4)).is_err());
    }

    #[test]
    fn destroyed_surface_disappears_from_lookup() {
        let store = store();
        let surface = store.create(SurfaceConfig::new(8, 8, 1)).unwrap();
        let id = surface.id;
        store.destroy(id).unwrap();
        assert!(store.get(id).is_none());
        assert!(store.destroy(id).is_err());
    }
}
