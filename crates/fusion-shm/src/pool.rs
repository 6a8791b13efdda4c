//! Shared memory pools.
//!
//! A pool is a file-backed mapping whose allocator metadata lives inside
//! the mapping itself, so every attached participant sees the same heap.
//! The master creates the world's main pool at enter; slaves attach on
//! demand, driven by SHMPOOL maintenance frames.
//!
//! Allocation is first-fit over an offset-linked free list with a bump
//! frontier for fresh space. Offsets (never pointers) identify blocks, so
//! participants with different mapping addresses agree on identity.

use crate::root::{apply_shared_file_modes, pool_address_hint};
use crate::skirmish::SkirmishCore;
use fusion_config::FusionConfig;
use fusion_protocol::{FusionError, Result, WorldIndex};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

const POOL_MAGIC: u32 = 0xcafe_9001;

/// Granularity of every allocation.
const ALIGN: u64 = 8;

/// Per-block bookkeeping preceding each allocation.
const BLOCK_HEADER: u64 = 16;

#[repr(C)]
struct PoolHeader {
    magic: AtomicU32,
    pool_id: AtomicU32,
    /// Total mapping size in bytes (header included).
    size: AtomicU64,
    /// Offset of the first free block; 0 terminates the list.
    free_head: AtomicU64,
    /// Bump frontier for never-allocated space.
    brk: AtomicU64,
    lock: SkirmishCore,
}

fn pool_file_path(config: &FusionConfig, world_index: WorldIndex, pool_id: u32) -> PathBuf {
    config
        .tmpfs
        .join(format!("fusion.{world_index}.pool{pool_id}"))
}

/// One attached shared pool.
pub struct SharedPool {
    ptr: NonNull<u8>,
    len: usize,
    pool_id: u32,
    path: PathBuf,
    owner: bool,
}

// SAFETY: shared-memory by design; mutation is skirmish-serialized.
unsafe impl Send for SharedPool {}
unsafe impl Sync for SharedPool {}

impl SharedPool {
    /// Create a pool file (master side).
    pub fn create(
        config: &FusionConfig,
        world_index: WorldIndex,
        pool_id: u32,
        size: usize,
    ) -> Result<SharedPool> {
        let path = pool_file_path(config, world_index, pool_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| FusionError::InitFailed(format!("open {}: {e}", path.display())))?;
        apply_shared_file_modes(&file, config)?;
        ftruncate(file.as_fd(), size as i64)
            .map_err(|e| FusionError::InitFailed(format!("truncate {}: {e}", path.display())))?;

        let ptr = map_pool(&file, size, world_index)?;
        let pool = SharedPool {
            ptr,
            len: size,
            pool_id,
            path,
            owner: true,
        };

        let header = pool.header();
        header.pool_id.store(pool_id, Ordering::Relaxed);
        header.size.store(size as u64, Ordering::Relaxed);
        header.free_head.store(0, Ordering::Relaxed);
        header
            .brk
            .store(align_up(std::mem::size_of::<PoolHeader>() as u64), Ordering::Relaxed);
        header.lock.init(config.secure);
        header.magic.store(POOL_MAGIC, Ordering::Release);

        debug!(target: "fusion.shm", world = world_index, pool = pool_id, bytes = size, "created pool");
        Ok(pool)
    }

    /// Attach to an existing pool file (slave side).
    pub fn attach(
        config: &FusionConfig,
        world_index: WorldIndex,
        pool_id: u32,
        size: usize,
    ) -> Result<SharedPool> {
        let path = pool_file_path(config, world_index, pool_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| FusionError::InitFailed(format!("open {}: {e}", path.display())))?;

        let ptr = map_pool(&file, size, world_index)?;
        let pool = SharedPool {
            ptr,
            len: size,
            pool_id,
            path,
            owner: false,
        };
        if pool.header().magic.load(Ordering::Acquire) != POOL_MAGIC {
            return Err(FusionError::InitFailed("pool not initialized".into()));
        }
        debug!(target: "fusion.shm", world = world_index, pool = pool_id, "attached pool");
        Ok(pool)
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: mapping starts with a PoolHeader and outlives self.
        unsafe { &*(self.ptr.as_ptr() as *const PoolHeader) }
    }

    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Allocate `size` bytes, returning the block's offset.
    pub fn alloc(&self, size: usize) -> Result<u64> {
        if size == 0 {
            return Err(FusionError::InvalidArgument("zero-size allocation".into()));
        }
        let need = align_up(size as u64);
        let header = self.header();

        header.lock.prevail()?;
        let result = self.alloc_locked(need);
        header.lock.dismiss()?;
        result
    }

    fn alloc_locked(&self, need: u64) -> Result<u64> {
        let header = self.header();

        // First fit over the free list.
        let mut prev: u64 = 0;
        let mut at = header.free_head.load(Ordering::Relaxed);
        while at != 0 {
            let (block_size, next) = self.read_block(at);
            if block_size >= need {
                let remainder = block_size - need;
                let follow = if remainder >= BLOCK_HEADER + ALIGN {
                    // Split: the tail becomes a new free block.
                    let tail = at + BLOCK_HEADER + need;
                    self.write_block(tail, remainder - BLOCK_HEADER, next);
                    self.write_block(at, need, 0);
                    tail
                } else {
                    self.write_block(at, block_size, 0);
                    next
                };
                if prev == 0 {
                    header.free_head.store(follow, Ordering::Relaxed);
                } else {
                    let (prev_size, _) = self.read_block(prev);
                    self.write_block(prev, prev_size, follow);
                }
                return Ok(at + BLOCK_HEADER);
            }
            prev = at;
            at = next;
        }

        // Fresh space from the bump frontier.
        let brk = header.brk.load(Ordering::Relaxed);
        let end = brk + BLOCK_HEADER + need;
        if end > header.size.load(Ordering::Relaxed) {
            return Err(FusionError::OutOfSharedMemory);
        }
        self.write_block(brk, need, 0);
        header.brk.store(end, Ordering::Relaxed);
        Ok(brk + BLOCK_HEADER)
    }

    /// Return a block to the pool.
    pub fn free(&self, offset: u64) -> Result<()> {
        let header = self.header();
        let block = offset
            .checked_sub(BLOCK_HEADER)
            .ok_or_else(|| FusionError::InvalidArgument("bad pool offset".into()))?;

        header.lock.prevail()?;
        let (size, _) = self.read_block(block);
        let head = header.free_head.load(Ordering::Relaxed);
        self.write_block(block, size, head);
        header.free_head.store(block, Ordering::Relaxed);
        header.lock.dismiss()?;
        Ok(())
    }

    /// View a previously allocated block.
    pub fn bytes(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        if offset as usize + len > self.len {
            return Err(FusionError::InvalidArgument("pool range out of bounds".into()));
        }
        // SAFETY: bounds just checked; concurrent access discipline is the
        // caller's (allocations are single-owner by convention).
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset as usize), len)
        })
    }

    fn read_block(&self, at: u64) -> (u64, u64) {
        let bytes = unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().add(at as usize), BLOCK_HEADER as usize)
        };
        (
            u64::from_ne_bytes(bytes[0..8].try_into().unwrap()),
            u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
        )
    }

    fn write_block(&self, at: u64, size: u64, next: u64) {
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(at as usize), BLOCK_HEADER as usize)
        };
        bytes[0..8].copy_from_slice(&size.to_ne_bytes());
        bytes[8..16].copy_from_slice(&next.to_ne_bytes());
    }

    /// Master-side destruction: unmap and unlink the backing file.
    pub fn destroy(self) -> Result<()> {
        if self.owner {
            std::fs::remove_file(&self.path).map_err(|e| {
                FusionError::InitFailed(format!("unlink {}: {e}", self.path.display()))
            })?;
        }
        Ok(())
    }
}

impl Drop for SharedPool {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from mmap and are unmapped exactly once.
        let _ = unsafe { munmap(self.ptr.cast(), self.len) };
    }
}

fn map_pool(file: &std::fs::File, len: usize, world_index: WorldIndex) -> Result<NonNull<u8>> {
    let hint = NonZeroUsize::new(pool_address_hint(world_index));
    let ptr = unsafe {
        mmap(
            hint,
            NonZeroUsize::new(len)
                .ok_or_else(|| FusionError::InvalidArgument("zero-size pool".into()))?,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file.as_fd(),
            0,
        )
    }
    .map_err(|e| FusionError::InitFailed(format!("mmap pool: {e}")))?;
    Ok(ptr.cast())
}

fn align_up(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Pools attached in this process, keyed by pool id. The dispatcher feeds
/// SHMPOOL maintenance frames here.
pub struct PoolRegistry {
    config: FusionConfig,
    world_index: WorldIndex,
    pools: HashMap<u32, SharedPool>,
}

impl PoolRegistry {
    pub fn new(config: FusionConfig, world_index: WorldIndex) -> Self {
        PoolRegistry {
            config,
            world_index,
            pools: HashMap::new(),
        }
    }

    pub fn insert(&mut self, pool: SharedPool) {
        self.pools.insert(pool.pool_id(), pool);
    }

    pub fn get(&self, pool_id: u32) -> Option<&SharedPool> {
        self.pools.get(&pool_id)
    }

    /// Handle a SHMPOOL maintenance frame.
    pub fn process_message(
        &mut self,
        pool_id: u32,
        msg: &fusion_protocol::ShmPoolMessage,
    ) -> Result<()> {
        match msg.op {
            fusion_protocol::ShmPoolOp::Attach => {
                if self.pools.contains_key(&pool_id) {
                    return Ok(());
                }
                let pool =
                    SharedPool::attach(&self.config, self.world_index, pool_id, msg.size as usize)?;
                self.pools.insert(pool_id, pool);
            }
            fusion_protocol::ShmPoolOp::Detach => {
                if self.pools.remove(&pool_id).is_none() {
                    warn!(target: "fusion.shm", pool = pool_id, "detach for unknown pool");
                }
            }
        }
        Ok(())
    }

    pub fn drain(&mut self) -> Vec<SharedPool> {
        self.pools.drain().map(|(_, pool)| pool).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> FusionConfig {
        let mut config = FusionConfig::default();
        config.tmpfs = dir.to_path_buf();
        config
    }

    #[test]
    fn alloc_free_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SharedPool::create(&test_config(dir.path()), 0, 1, 64 * 1024).unwrap();

        let a = pool.alloc(100).unwrap();
        let b = pool.alloc(200).unwrap();
        assert_ne!(a, b);

        pool.free(a).unwrap();
        let c = pool.alloc(64).unwrap();
        // First fit reuses the freed block.
        assert_eq!(c, a);
    }

    #[test]
    fn data_is_visible_across_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let master = SharedPool::create(&config, 0, 1, 64 * 1024).unwrap();
        let offset = master.alloc(16).unwrap();
        master.bytes(offset, 16).unwrap().copy_from_slice(b"hello, fusionee!");

        let slave = SharedPool::attach(&config, 0, 1, 64 * 1024).unwrap();
        assert_eq!(slave.bytes(offset, 16).unwrap(), b"hello, fusionee!");
    }

    #[test]
    fn exhaustion_reports_out_of_shared_memory() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SharedPool::create(&test_config(dir.path()), 0, 1, 4096).unwrap();
        let err = pool.alloc(1 << 20).unwrap_err();
        assert!(matches!(err, FusionError::OutOfSharedMemory));
    }

    #[test]
    fn registry_attach_detach_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let _master = SharedPool::create(&config, 0, 7, 8192).unwrap();

        let mut registry = PoolRegistry::new(config, 0);
        let attach = fusion_protocol::ShmPoolMessage {
            op: fusion_protocol::ShmPoolOp::Attach,
            size: 8192,
        };
        registry.process_message(7, &attach).unwrap();
        assert!(registry.get(7).is_some());

        let detach = fusion_protocol::ShmPoolMessage {
            op: fusion_protocol::ShmPoolOp::Detach,
            size: 0,
        };
        registry.process_message(7, &detach).unwrap();
        assert!(registry.get(7).is_none());
    }
}
