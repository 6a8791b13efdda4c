//! The surface client: flip-count / frame-ack handshake and back-buffer
//! back-pressure.
//!
//! Each producer wraps a surface in a client owning `local_flip_count`.
//! Without NOWAIT a flip first blocks while
//! `local_flip_count - frame_ack >= buffers - 1`, then advances the count
//! (unless it is a pure update) and dispatches the update downstream. The
//! FRAME notification from the consumer raises `frame_ack` and wakes the
//! producer.

use crate::frametime::{Clock, FrameTimeConfig, FrameTimer, MonotonicClock};
use crate::geometry::Region;
use crate::{NotificationFlags, Surface};
use fusion_protocol::{FusionError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, trace};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlipFlags: u32 {
        /// Never block waiting for a free back buffer.
        const NOWAIT = 0x0000_0001;
        /// Swap buffers even for a partial region.
        const SWAP   = 0x0000_0002;
        /// Copy the region instead of swapping.
        const BLIT   = 0x0000_0004;
        /// Present without advancing the flip count.
        const UPDATE = 0x0000_0008;
    }
}

struct FlipState {
    local_flip_count: u32,
    frame_ack: u32,
}

pub struct SurfaceClient<C: Clock = MonotonicClock> {
    surface: Arc<Surface>,
    local_buffer_count: usize,
    state: Mutex<FlipState>,
    back_buffer: Condvar,
    timer: FrameTimer<C>,
    pub frametime: Mutex<FrameTimeConfig>,
    default_interval_us: i64,
    default_max_advance_us: i64,
    listener: std::sync::atomic::AtomicU64,
}

impl SurfaceClient<MonotonicClock> {
    pub fn new(surface: Arc<Surface>, config: &fusion_config::FusionConfig) -> Arc<Self> {
        Self::with_clock(surface, config, MonotonicClock)
    }
}

impl<C: Clock + 'static> SurfaceClient<C> {
    pub fn with_clock(
        surface: Arc<Surface>,
        config: &fusion_config::FusionConfig,
        clock: C,
    ) -> Arc<Self> {
        let client = Arc::new(SurfaceClient {
            local_buffer_count: surface.num_buffers(),
            state: Mutex::new(FlipState {
                local_flip_count: surface.flips(),
                frame_ack: surface.flips(),
            }),
            back_buffer: Condvar::new(),
            timer: FrameTimer::with_clock(clock),
            frametime: Mutex::new(FrameTimeConfig::default()),
            default_interval_us: config.frame_interval_us,
            default_max_advance_us: config.max_frame_advance_us,
            listener: std::sync::atomic::AtomicU64::new(0),
            surface: surface.clone(),
        });

        // Frame reaction: the consumer's ack raises frame_ack and wakes
        // any producer parked in wait_for_back_buffer.
        let weak = Arc::downgrade(&client);
        let listener = surface.attach(move |notification| {
            if !notification.flags.contains(NotificationFlags::FRAME) {
                return;
            }
            if let Some(client) = weak.upgrade() {
                client.frame_react(notification.flip_count);
            }
        });
        client
            .listener
            .store(listener, std::sync::atomic::Ordering::Relaxed);
        client
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn local_flip_count(&self) -> u32 {
        self.state.lock().local_flip_count
    }

    pub fn frame_ack(&self) -> u32 {
        self.state.lock().frame_ack
    }

    /// Present the surface. With a region smaller than the surface the
    /// update is blit-style; SWAP or a full region swaps buffers and
    /// advances the flip count (unless UPDATE).
    ///
    /// Without NOWAIT the call first waits until a back buffer is free,
    /// so a producer blocks exactly when
    /// `local_flip_count - frame_ack >= buffers - 1` at call time.
    pub fn flip(&self, region: Option<Region>, flags: FlipFlags) -> Result<()> {
        let config = self.surface.config();
        if config.width <= 0 || config.height <= 0 {
            return Err(FusionError::InvalidArgument("degenerate surface".into()));
        }

        let mut reg = Region::whole(config.width, config.height);
        if let Some(region) = region {
            if region.x1 > region.x2 || region.y1 > region.y2 {
                return Err(FusionError::InvalidArgument("inverted flip region".into()));
            }
            let mut clipped = region;
            if !clipped.intersect(&reg) {
                return Err(FusionError::InvalidArgument(
                    "flip region outside surface".into(),
                ));
            }
            reg = clipped;
        }

        if !flags.contains(FlipFlags::NOWAIT) {
            self.wait_for_back_buffer();
        }

        // The pacing state is consumed by the flip; the next GetFrameTime
        // re-anchors at the clock.
        let frame_time = self.timer.current();

        let flipping = self
            .surface
            .config()
            .caps
            .contains(crate::SurfaceCaps::FLIPPING);
        let whole = reg.covers(config.width, config.height);
        let mut dispatched = false;

        if flipping && (flags.contains(FlipFlags::SWAP) || (!flags.contains(FlipFlags::BLIT) && whole))
        {
            let flip_count = {
                let mut state = self.state.lock();
                if !flags.contains(FlipFlags::UPDATE) {
                    state.local_flip_count = state.local_flip_count.wrapping_add(1);
                }
                state.local_flip_count
            };
            debug!(
                target: "fusion.surface",
                surface = self.surface.id,
                flip_count,
                "flip (swap)"
            );
            self.surface.dispatch_update(
                reg,
                flip_count,
                frame_time,
                !flags.contains(FlipFlags::UPDATE),
            );
            dispatched = true;
        }

        if !dispatched {
            trace!(target: "fusion.surface", surface = self.surface.id, "flip (blit region)");
            self.surface
                .dispatch_update(reg, self.state.lock().local_flip_count, frame_time, false);
        }

        self.timer.reset();
        Ok(())
    }

    /// Stereo present: one region per eye, one flip-count advance.
    pub fn flip_stereo(
        &self,
        left: Option<Region>,
        right: Option<Region>,
        flags: FlipFlags,
    ) -> Result<()> {
        let config = self.surface.config();
        if !config.caps.contains(crate::SurfaceCaps::STEREO)
            || !config.caps.contains(crate::SurfaceCaps::FLIPPING)
        {
            return Err(FusionError::Unsupported(
                "stereo flip needs a flipping stereo surface".into(),
            ));
        }

        let whole = Region::whole(config.width, config.height);
        let resolve = |region: Option<Region>| -> Result<Region> {
            match region {
                None => Ok(whole),
                Some(region) => {
                    if region.x1 > region.x2 || region.y1 > region.y2 {
                        return Err(FusionError::InvalidArgument("inverted flip region".into()));
                    }
                    let mut clipped = region;
                    if !clipped.intersect(&whole) {
                        return Err(FusionError::InvalidArgument(
                            "flip region outside surface".into(),
                        ));
                    }
                    Ok(clipped)
                }
            }
        };
        let left = resolve(left)?;
        let right = resolve(right)?;

        if !flags.contains(FlipFlags::NOWAIT) {
            self.wait_for_back_buffer();
        }

        let frame_time = self.timer.current();
        let flip_count = {
            let mut state = self.state.lock();
            if !flags.contains(FlipFlags::UPDATE) {
                state.local_flip_count = state.local_flip_count.wrapping_add(1);
            }
            state.local_flip_count
        };
        self.surface.dispatch_update_stereo(
            left,
            right,
            flip_count,
            frame_time,
            !flags.contains(FlipFlags::UPDATE),
        );
        self.timer.reset();
        Ok(())
    }

    /// Block until a back buffer is free. Single-buffered surfaces never
    /// wait.
    pub fn wait_for_back_buffer(&self) {
        let mut state = self.state.lock();

        // Catch up with acks that arrived before we subscribed.
        let acked = self.surface.flips_acked();
        if acked > state.frame_ack {
            state.frame_ack = acked;
        }

        while state.local_flip_count.wrapping_sub(state.frame_ack) as usize
            >= self.local_buffer_count.saturating_sub(1)
        {
            if self.local_buffer_count <= 1 {
                break;
            }
            trace!(
                target: "fusion.surface",
                surface = self.surface.id,
                flips = state.local_flip_count,
                acked = state.frame_ack,
                "waiting for back buffer"
            );
            self.back_buffer.wait(&mut state);
        }
    }

    /// Whether a non-NOWAIT flip would block right now.
    pub fn would_block(&self) -> bool {
        if self.local_buffer_count <= 1 {
            return false;
        }
        let state = self.state.lock();
        state.local_flip_count.wrapping_sub(state.frame_ack.max(self.surface.flips_acked()))
            as usize
            >= self.local_buffer_count - 1
    }

    fn frame_react(&self, flip_count: u32) {
        let mut state = self.state.lock();
        if flip_count > state.frame_ack {
            state.frame_ack = flip_count;
        }
        if state.local_flip_count < flip_count {
            // We missed flips done by somebody else; catch up.
            debug!(
                target: "fusion.surface",
                local = state.local_flip_count,
                ack = flip_count,
                "local flip count below frame ack, promoting"
            );
            state.local_flip_count = flip_count;
        }
        self.back_buffer.notify_all();
    }

    /// Next presentation timestamp (see [`FrameTimer`]).
    pub fn next_frame_time(&self) -> i64 {
        let surface_config = *self.surface.frametime.lock();
        let client_config = *self.frametime.lock();
        self.timer.next_frame_time(
            &surface_config,
            &client_config,
            self.default_interval_us,
            self.default_max_advance_us,
        )
    }
}

impl<C: Clock> Drop for SurfaceClient<C> {
    fn drop(&mut self) {
        self.surface
            .detach(self.listener.load(std::sync::atomic::Ordering::Relaxed));
    }
}
