//! Card lock/unlock/flush and busy/idle accounting.

use crate::GraphicsCore;
use fusion_protocol::Result;
use fusion_shm::monotonic_micros;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const WAIT       = 0x0000_0001;
        /// Emit pending commands and wait for the engine to drain.
        const SYNC       = 0x0000_0002;
        /// Next lock resets the engine before use.
        const RESET      = 0x0000_0004;
        /// Next lock invalidates all cached hardware state.
        const INVALIDATE = 0x0000_0008;
    }
}

impl GraphicsCore {
    /// Acquire the per-world GPU lock.
    ///
    /// With SYNC: emit batched commands first, then drain the engine and
    /// account the busy interval. A failing sync resets the engine and
    /// clears the last-state holder before propagating (the lock is
    /// released on that path).
    ///
    /// Flags recorded by the *previous* lock are honored now: RESET
    /// resets the engine, INVALIDATE invalidates cached state and the
    /// holder.
    pub fn lock(&self, flags: LockFlags) -> Result<()> {
        let section = self.section();
        section.lock.prevail()?;

        if flags.contains(LockFlags::SYNC) {
            if let Some(driver) = self.driver().cloned() {
                if !self.config().gfx_emit_early && section.pending_ops.load(Ordering::SeqCst) != 0
                {
                    self.switch_busy();
                    driver.emit_commands();
                    section.pending_ops.store(0, Ordering::SeqCst);
                }

                if let Err(e) = driver.engine_sync() {
                    driver.engine_reset();
                    section.holder.store(0, Ordering::SeqCst);
                    section.holder_state.store(0, Ordering::SeqCst);
                    let _ = section.lock.dismiss();
                    return Err(e);
                }

                self.switch_idle();
            }
        }

        let last = LockFlags::from_bits_truncate(section.lock_flags.load(Ordering::SeqCst));
        if let Some(driver) = self.driver() {
            if last.contains(LockFlags::RESET) {
                debug!(target: "fusion.card", "engine reset (deferred lock flag)");
                driver.engine_reset();
            }
            if last.contains(LockFlags::INVALIDATE) {
                debug!(target: "fusion.card", "state invalidate (deferred lock flag)");
                driver.invalidate_state();
                self.section().holder.store(0, Ordering::SeqCst);
                self.section().holder_state.store(0, Ordering::SeqCst);
            }
        }
        section.lock_flags.store(flags.bits(), Ordering::SeqCst);
        Ok(())
    }

    /// Allow others to use the hardware.
    pub fn unlock(&self) {
        let _ = self.section().lock.dismiss();
    }

    /// Emit batched commands now. With early emission configured there is
    /// never anything batched, so this is a no-op.
    pub fn flush(&self) -> Result<()> {
        if self.config().gfx_emit_early {
            return Ok(());
        }
        let section = self.section();
        section.lock.prevail()?;
        if section.pending_ops.load(Ordering::SeqCst) != 0 {
            if let Some(driver) = self.driver().cloned() {
                debug!(target: "fusion.card", "pending ops, emitting");
                self.switch_busy();
                driver.emit_commands();
                section.pending_ops.store(0, Ordering::SeqCst);
            }
        }
        let _ = section.lock.dismiss();
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Busy/idle accounting
    // ---------------------------------------------------------------------------------------------

    fn update_stats(&self, now: i64) {
        let interval_ms = self.config().gfx_stats_interval_ms;
        if interval_ms == 0 {
            return;
        }
        let section = self.section();
        let start = section.ts_start.load(Ordering::Relaxed);
        let total = now - start;
        if start != 0 && total > interval_ms as i64 * 1000 {
            let busy = section.ts_busy_sum.load(Ordering::Relaxed);
            let permille = if total > 0 { 1000 * busy / total } else { 0 };
            info!(
                target: "fusion.card",
                busy_us = busy,
                total_us = total,
                "engine busy {} / {} -> {}.{}%",
                busy,
                total,
                permille / 10,
                permille % 10
            );
            section.ts_start.store(now, Ordering::Relaxed);
            section.ts_busy_sum.store(0, Ordering::Relaxed);
        }
    }

    /// Record the start of a busy interval (called with the lock held).
    pub(crate) fn switch_busy(&self) {
        if self.config().gfx_stats_interval_ms == 0 {
            return;
        }
        let section = self.section();
        let now = monotonic_micros();
        let busy_since = section.ts_busy.load(Ordering::Relaxed);
        if busy_since != 0 {
            section
                .ts_busy_sum
                .fetch_add(now - busy_since, Ordering::Relaxed);
        }
        section.ts_busy.store(now, Ordering::Relaxed);
        if section.ts_start.load(Ordering::Relaxed) == 0 {
            section.ts_start.store(now, Ordering::Relaxed);
        }
        self.update_stats(now);
    }

    /// Close the current busy interval.
    pub(crate) fn switch_idle(&self) {
        if self.config().gfx_stats_interval_ms == 0 {
            return;
        }
        let section = self.section();
        let now = monotonic_micros();
        let busy_since = section.ts_busy.load(Ordering::Relaxed);
        if busy_since != 0 {
            section
                .ts_busy_sum
                .fetch_add(now - busy_since, Ordering::Relaxed);
            section.ts_busy.store(0, Ordering::Relaxed);
        }
        self.update_stats(now);
    }
}
