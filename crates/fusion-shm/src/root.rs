//! The cross-process world root.
//!
//! One memory-mapped file per world (`${tmpfs}/fusion.<N>.core` in socket
//! mode) describes the world to every participant: refcount, ABI, world
//! clock origin, main pool descriptor and the per-world locks. Only the
//! master writes fields after initialization; the refcount is maintained
//! atomically by everyone.
//!
//! All-zero bytes form a valid (uninitialized) root, so the file can be
//! created by truncation; the `magic` word gates visibility: slaves spin
//! briefly until the master publishes `ROOT_READY`.

use crate::skirmish::SkirmishCore;
use fusion_config::FusionConfig;
use fusion_protocol::{FusionError, Result, WorldIndex, MAX_WORLDS};
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::{fchown, ftruncate, Gid};
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, info};

/// Root lifecycle states (stored in `SharedRoot::magic`).
pub const ROOT_INITIALIZING: u32 = 0;
pub const ROOT_READY: u32 = 0xcafe_f051;
pub const ROOT_TEARDOWN: u32 = 0xffff_ffff;

/// Historical base of the deterministic mapping; kept as an address hint.
pub const SHARED_BASE: usize = 0x2000_0000;

/// Reserved span per world for its main pool.
pub const POOL_SPAN: usize = 0x0800_0000;

/// Size of the main pool created by the master.
pub const MAIN_POOL_SIZE: usize = 0x0010_0000;

/// Graphics-serializer section of the root. Raw storage only; the card
/// crate owns the semantics of these fields.
#[repr(C)]
pub struct CardSection {
    pub lock: SkirmishCore,
    pub lock_flags: AtomicU32,
    /// Fusion id of the participant whose state was last propagated.
    pub holder: AtomicU32,
    /// Serial of the state object last propagated by the holder.
    pub holder_state: AtomicU64,
    /// Destination allocation the last emitted commands targeted.
    pub last_allocation_id: AtomicU64,
    /// Non-zero while commands sit in the driver buffer unemitted.
    pub pending_ops: AtomicU32,
    pub ts_busy: AtomicI64,
    pub ts_busy_sum: AtomicI64,
    pub ts_start: AtomicI64,
}

/// Descriptor of the world's main shared pool.
#[repr(C)]
pub struct PoolSection {
    pub pool_id: AtomicU32,
    pub size: AtomicU64,
    pub lock: SkirmishCore,
}

#[repr(C)]
pub struct SharedRoot {
    pub magic: AtomicU32,
    /// Participant refcount. Masters only decrement; reaching zero unlinks
    /// the backing file.
    pub refs: AtomicU32,
    pub world_abi: AtomicI32,
    pub world_index: AtomicU32,
    /// World clock origin in microseconds since the monotonic epoch.
    pub start_time_us: AtomicI64,
    /// Master-settable world root object id (0 = unset).
    pub world_root: AtomicU64,
    /// Call id of the world-refs call registered at master init.
    pub refs_call: AtomicU32,
    pub arenas_lock: SkirmishCore,
    pub reactor_globals: SkirmishCore,
    pub main_pool: PoolSection,
    pub card: CardSection,
}

impl SharedRoot {
    /// Master-side field initialization; ends by publishing `ROOT_READY`.
    pub fn init(&self, world_index: WorldIndex, abi_version: i32, secure: bool, now_us: i64) {
        self.refs.store(1, Ordering::Relaxed);
        self.world_abi.store(abi_version, Ordering::Relaxed);
        self.world_index.store(world_index as u32, Ordering::Relaxed);
        self.start_time_us.store(now_us, Ordering::Relaxed);
        self.arenas_lock.init(secure);
        self.reactor_globals.init(secure);
        self.main_pool.lock.init(secure);
        self.card.lock.init(secure);
        self.magic.store(ROOT_READY, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) == ROOT_READY
    }
}

fn pagesize() -> usize {
    // SAFETY: sysconf has no preconditions.
    (unsafe { libc::sysconf(libc::_SC_PAGESIZE) }) as usize
}

fn page_align(size: usize) -> usize {
    let page = pagesize();
    (size + page - 1) & !(page - 1)
}

/// Deterministic mapping hint for a world's root.
pub fn root_address_hint(world_index: WorldIndex) -> usize {
    SHARED_BASE + (page_align(std::mem::size_of::<SharedRoot>()) + pagesize()) * world_index
}

/// Deterministic mapping hint for a world's main pool.
pub fn pool_address_hint(world_index: WorldIndex) -> usize {
    SHARED_BASE
        + (page_align(std::mem::size_of::<SharedRoot>()) + pagesize()) * MAX_WORLDS
        + POOL_SPAN * world_index
}

/// Path of the root file for a world.
pub fn root_file_path(config: &FusionConfig, world_index: WorldIndex) -> PathBuf {
    config.tmpfs.join(format!("fusion.{world_index}.core"))
}

/// A mapped shared root. Unmaps on drop; unlinking the backing file is the
/// caller's decision (master-only, refcount zero).
#[derive(Debug)]
pub struct RootMapping {
    ptr: NonNull<SharedRoot>,
    len: usize,
    path: Option<PathBuf>,
}

// SAFETY: the mapping is shared memory by design; all mutation goes
// through atomics or skirmish-protected sections.
unsafe impl Send for RootMapping {}
unsafe impl Sync for RootMapping {}

impl RootMapping {
    /// Create and initialize the root file (master side).
    pub fn create(config: &FusionConfig, world_index: WorldIndex, abi_version: i32) -> Result<Self> {
        let path = root_file_path(config, world_index);
        let len = page_align(std::mem::size_of::<SharedRoot>());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| FusionError::InitFailed(format!("open {}: {e}", path.display())))?;

        apply_shared_file_modes(&file, config)?;
        ftruncate(file.as_fd(), len as i64)
            .map_err(|e| FusionError::InitFailed(format!("truncate {}: {e}", path.display())))?;

        let ptr = map_root(&file, len, world_index)?;
        info!(
            target: "fusion.shm",
            world = world_index,
            bytes = len,
            "created shared root at {}", path.display()
        );

        let mapping = RootMapping {
            ptr,
            len,
            path: Some(path),
        };
        mapping
            .root()
            .init(world_index, abi_version, config.secure, monotonic_micros());
        Ok(mapping)
    }

    /// Map an existing root file (slave side) and verify readiness + ABI.
    pub fn open(config: &FusionConfig, world_index: WorldIndex, abi_version: i32) -> Result<Self> {
        let path = root_file_path(config, world_index);
        let len = page_align(std::mem::size_of::<SharedRoot>());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FusionError::InitFailed(format!("open {}: {e}", path.display())))?;

        let ptr = map_root(&file, len, world_index)?;
        let mapping = RootMapping {
            ptr,
            len,
            path: Some(path.clone()),
        };
        let root = mapping.root();

        // The master publishes READY before answering the enter handshake,
        // so a brief spin only covers the raw-file race.
        let mut spins = 0;
        while !root.is_ready() {
            if spins > 1000 {
                return Err(FusionError::InitFailed(
                    "shared root never became ready".into(),
                ));
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            spins += 1;
        }

        let found = root.world_abi.load(Ordering::Relaxed);
        if found != abi_version {
            return Err(FusionError::VersionMismatch {
                found,
                expected: abi_version,
            });
        }

        debug!(target: "fusion.shm", world = world_index, "mapped shared root");
        Ok(mapping)
    }

    /// Process-private root for the in-process transport mode. Nothing is
    /// backed by a file; drop frees the allocation.
    pub fn private(world_index: WorldIndex, abi_version: i32) -> Result<Self> {
        let len = page_align(std::mem::size_of::<SharedRoot>());
        let ptr = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| FusionError::InitFailed(format!("anonymous root mapping: {e}")))?;

        let mapping = RootMapping {
            ptr: ptr.cast(),
            len,
            path: None,
        };
        unsafe { mapping.ptr.as_ref() }.init(world_index, abi_version, false, monotonic_micros());
        Ok(mapping)
    }

    pub fn root(&self) -> &SharedRoot {
        // SAFETY: mapping is valid for self's lifetime and the type is
        // all-atomics / skirmish-guarded.
        unsafe { self.ptr.as_ref() }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Remove the backing file. Only the last master calls this.
    pub fn unlink(&self) -> Result<()> {
        if let Some(ref path) = self.path {
            std::fs::remove_file(path)
                .map_err(|e| FusionError::InitFailed(format!("unlink {}: {e}", path.display())))?;
        }
        Ok(())
    }
}

impl Drop for RootMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from mmap and are unmapped exactly once.
        let _ = unsafe { munmap(self.ptr.cast(), self.len) };
    }
}

fn map_root(file: &File, len: usize, world_index: WorldIndex) -> Result<NonNull<SharedRoot>> {
    let hint = NonZeroUsize::new(root_address_hint(world_index));
    // The hint preserves the historical deterministic layout where the
    // kernel honors it; the mapping stays fully usable if it lands
    // elsewhere (relocatable fallback).
    let ptr = unsafe {
        mmap(
            hint,
            NonZeroUsize::new(len).unwrap(),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file.as_fd(),
            0,
        )
    }
    .map_err(|e| FusionError::InitFailed(format!("mmap shared root: {e}")))?;

    Ok(ptr.cast())
}

pub(crate) fn apply_shared_file_modes(file: &File, config: &FusionConfig) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(gid) = config.shmfile_gid {
        if fchown(file.as_raw_fd(), None, Some(Gid::from_raw(gid))).is_err() {
            tracing::warn!(target: "fusion.shm", gid, "changing shared file group failed");
        }
    }
    let mode = if config.secure { 0o640 } else { 0o660 };
    file.set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| FusionError::InitFailed(format!("chmod shared file: {e}")))?;
    Ok(())
}

/// Monotonic clock in microseconds; the world clock origin and the card
/// busy/idle accounting both use this timebase.
pub fn monotonic_micros() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000
}
