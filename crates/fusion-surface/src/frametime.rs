//! Frame-time pacing.
//!
//! Producers ask for the presentation timestamp of their next frame. The
//! returned times advance by a fixed interval, never run behind `now`,
//! and never run more than `max_advance` ahead of it; when they would,
//! the caller sleeps off the excess. This yields monotonically
//! non-decreasing timestamps with bounded lead.

use parking_lot::Mutex;
use std::time::Duration;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameTimeFlags: u32 {
        const INTERVAL    = 0x0000_0001;
        const MAX_ADVANCE = 0x0000_0002;
    }
}

/// Per-surface or per-client override of the pacing parameters. Fields
/// are meaningful only when the matching flag is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimeConfig {
    pub flags: FrameTimeFlags,
    pub interval_us: i64,
    pub max_advance_us: i64,
}

impl FrameTimeConfig {
    pub fn with_interval(interval_us: i64) -> Self {
        FrameTimeConfig {
            flags: FrameTimeFlags::INTERVAL,
            interval_us,
            max_advance_us: 0,
        }
    }
}

/// Clock seam; production uses the monotonic clock, tests inject a
/// deterministic one.
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
    fn sleep_micros(&self, micros: i64);
}

pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        use std::sync::OnceLock;
        use std::time::Instant;
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        EPOCH.get_or_init(Instant::now).elapsed().as_micros() as i64
    }

    fn sleep_micros(&self, micros: i64) {
        if micros > 0 {
            std::thread::sleep(Duration::from_micros(micros as u64));
        }
    }
}

/// Owns the producer's `current_frame_time` state.
pub struct FrameTimer<C: Clock = MonotonicClock> {
    current: Mutex<i64>,
    clock: C,
}

impl FrameTimer<MonotonicClock> {
    pub fn new() -> Self {
        FrameTimer {
            current: Mutex::new(0),
            clock: MonotonicClock,
        }
    }
}

impl Default for FrameTimer<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> FrameTimer<C> {
    pub fn with_clock(clock: C) -> Self {
        FrameTimer {
            current: Mutex::new(0),
            clock,
        }
    }

    /// Advance and return the next frame time.
    ///
    /// Resolution order for the parameters: the surface override, then
    /// the client override, then the global defaults. Zero values fall
    /// through to the next layer.
    pub fn next_frame_time(
        &self,
        surface: &FrameTimeConfig,
        client: &FrameTimeConfig,
        default_interval_us: i64,
        default_max_advance_us: i64,
    ) -> i64 {
        let mut interval = if surface.flags.contains(FrameTimeFlags::INTERVAL) {
            surface.interval_us
        } else {
            0
        };
        let mut max_advance = if surface.flags.contains(FrameTimeFlags::MAX_ADVANCE) {
            surface.max_advance_us
        } else {
            0
        };
        if client.flags.contains(FrameTimeFlags::INTERVAL) {
            interval = client.interval_us;
        }
        if client.flags.contains(FrameTimeFlags::MAX_ADVANCE) {
            max_advance = client.max_advance_us;
        }
        if interval == 0 {
            interval = default_interval_us;
        }
        if max_advance == 0 {
            max_advance = default_max_advance_us;
        }

        let mut current = self.current.lock();
        *current += interval;

        let mut now = self.clock.now_micros();
        if now > *current {
            *current = now;
        } else if max_advance > 0 {
            while *current - now > max_advance {
                self.clock.sleep_micros(*current - now - max_advance);
                now = self.clock.now_micros();
            }
        }
        *current
    }

    /// Forget pacing state (used when a flip supplies its own time).
    pub fn reset(&self) {
        *self.current.lock() = 0;
    }

    pub fn current(&self) -> i64 {
        *self.current.lock()
    }
}
