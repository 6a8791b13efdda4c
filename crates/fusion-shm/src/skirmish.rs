//! Skirmish: the cross-process mutex guarding shared state.
//!
//! The lock word lives inside shared memory, so any participant that maps
//! the same root (or pool) contends on the same futex. Within one process
//! the same type also works over plain heap memory, which is what the
//! in-process transport mode uses.
//!
//! The algorithm is the classic three-state futex mutex: 0 = free,
//! 1 = held, 2 = held with waiters. Recursion is allowed per thread; the
//! owner field records the locking thread's tid.

use fusion_protocol::{FusionError, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Permission granted to every participant (set on unsecured worlds).
pub const SKIRMISH_PERMIT_PREVAIL: u32 = 0x0000_0001;
pub const SKIRMISH_PERMIT_DISMISS: u32 = 0x0000_0002;

const FREE: u32 = 0;
const HELD: u32 = 1;
const CONTENDED: u32 = 2;

fn gettid() -> u32 {
    // SAFETY: gettid has no preconditions.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

fn futex_wait(word: &AtomicU32, expected: u32) {
    // SAFETY: the word outlives the call; a spurious return is handled by
    // the caller's retry loop. No FUTEX_PRIVATE_FLAG: waiters may live in
    // other processes.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

fn futex_wake(word: &AtomicU32, waiters: i32) {
    // SAFETY: see futex_wait.
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, waiters);
    }
}

/// The shared-memory resident part of a skirmish.
///
/// All-zero bytes are a valid, unlocked skirmish; freshly truncated shared
/// files therefore need no explicit construction.
#[repr(C)]
pub struct SkirmishCore {
    word: AtomicU32,
    owner: AtomicU32,
    count: AtomicU32,
    permissions: AtomicU32,
    /// Stable identity used to order multi-lock acquisition.
    id: AtomicU32,
}

static NEXT_SKIRMISH_ID: AtomicU32 = AtomicU32::new(1);

impl SkirmishCore {
    /// Stamp identity and initial permissions. Only the creator (master)
    /// calls this, once, before the root is published.
    pub fn init(&self, secure: bool) {
        self.id
            .store(NEXT_SKIRMISH_ID.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        let permissions = if secure {
            0
        } else {
            SKIRMISH_PERMIT_PREVAIL | SKIRMISH_PERMIT_DISMISS
        };
        self.permissions.store(permissions, Ordering::Relaxed);
    }

    pub fn add_permissions(&self, permissions: u32) {
        self.permissions.fetch_or(permissions, Ordering::Relaxed);
    }

    pub fn stable_id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    /// Acquire the lock, blocking until available.
    pub fn prevail(&self) -> Result<()> {
        let tid = gettid();
        if self.owner.load(Ordering::Relaxed) == tid {
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        if self
            .word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            loop {
                // Announce contention; only wait if the lock was actually
                // held when we looked.
                match self
                    .word
                    .compare_exchange(HELD, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) | Err(CONTENDED) => futex_wait(&self.word, CONTENDED),
                    Err(_) => {}
                }
                // Grab as contended so the eventual release wakes others.
                if self
                    .word
                    .compare_exchange(FREE, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    break;
                }
            }
        }

        self.owner.store(tid, Ordering::Relaxed);
        self.count.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Try to acquire without blocking.
    pub fn swoop(&self) -> Result<bool> {
        let tid = gettid();
        if self.owner.load(Ordering::Relaxed) == tid {
            self.count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        if self
            .word
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(tid, Ordering::Relaxed);
            self.count.store(1, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    /// Release the lock.
    pub fn dismiss(&self) -> Result<()> {
        let tid = gettid();
        if self.owner.load(Ordering::Relaxed) != tid {
            return Err(FusionError::InvalidArgument(
                "dismissing a skirmish we do not hold".into(),
            ));
        }
        if self.count.fetch_sub(1, Ordering::Relaxed) > 1 {
            return Ok(());
        }
        self.owner.store(0, Ordering::Relaxed);
        if self.word.swap(FREE, Ordering::Release) == CONTENDED {
            futex_wake(&self.word, 1);
        }
        Ok(())
    }

    /// Run `f` under the lock, releasing on every exit path.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.prevail()?;
        let result = f();
        self.dismiss()?;
        Ok(result)
    }
}

/// Acquire several skirmishes in canonical order (ascending stable id).
///
/// Callers supply the set in any order; sorting here is what makes the
/// ordering convention impossible to get wrong at call sites. Release with
/// [`dismiss_multi`], which walks the same set in reverse.
pub fn prevail_multi(locks: &mut [&SkirmishCore]) -> Result<()> {
    locks.sort_by_key(|lock| lock.stable_id());
    for (i, lock) in locks.iter().enumerate() {
        if let Err(e) = lock.prevail() {
            for held in locks[..i].iter().rev() {
                let _ = held.dismiss();
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Release locks previously taken by [`prevail_multi`].
pub fn dismiss_multi(locks: &[&SkirmishCore]) {
    for lock in locks.iter().rev() {
        let _ = lock.dismiss();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fresh() -> SkirmishCore {
        // SAFETY: all-zero bytes are a valid SkirmishCore.
        let core: SkirmishCore = unsafe { std::mem::zeroed() };
        core.init(false);
        core
    }

    #[test]
    fn lock_unlock_single_thread() {
        let lock = fresh();
        lock.prevail().unwrap();
        lock.dismiss().unwrap();
    }

    #[test]
    fn recursion_by_same_thread() {
        let lock = fresh();
        lock.prevail().unwrap();
        lock.prevail().unwrap();
        lock.dismiss().unwrap();
        lock.dismiss().unwrap();
        // Fully released: another acquisition proceeds.
        assert!(lock.swoop().unwrap());
        lock.dismiss().unwrap();
    }

    #[test]
    fn dismiss_without_prevail_is_an_error() {
        let lock = fresh();
        assert!(lock.dismiss().is_err());
    }

    #[test]
    fn contention_serializes_increments() {
        let lock = Arc::new(fresh());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.prevail().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    lock.dismiss().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn multi_lock_orders_by_id() {
        let a = fresh();
        let b = fresh();
        let c = fresh();
        // Supply out of order; prevail_multi must still succeed and leave
        // everything released afterwards.
        let mut locks = [&c, &a, &b];
        prevail_multi(&mut locks).unwrap();
        assert!(locks.windows(2).all(|w| w[0].stable_id() < w[1].stable_id()));
        dismiss_multi(&locks);
        assert!(a.swoop().unwrap());
        a.dismiss().unwrap();
    }
}
