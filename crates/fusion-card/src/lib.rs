//! Graphics-card serialization core.
//!
//! One cross-process lock per world guards the hardware command stream.
//! The serializer arbitrates state switches between participants, batches
//! command emission, and accounts busy/idle time. Drivers and the
//! software rasterizer are external collaborators behind traits.

pub mod draw;
mod lock;
mod acquire;
pub mod state;

pub use lock::LockFlags;
pub use state::{
    AccelMask, BlittingFlags, CardState, Color, DrawingFlags, RenderOptions, StateModified,
};

use fusion_config::FusionConfig;
use fusion_protocol::{FusionId, Result};
use fusion_shm::{CardSection, RootMapping};
use fusion_surface::{Line, Rectangle, Triangle};
use std::sync::Arc;

/// Hardware capability flags.
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CardCapsFlags: u32 {
        /// The accelerator applies the clip itself.
        const CLIPPING    = 0x0000_0001;
        /// The accelerator reads surfaces in system memory.
        const READSYSMEM  = 0x0000_0002;
        /// The accelerator writes surfaces in system memory.
        const WRITESYSMEM = 0x0000_0004;
        /// The accelerator evaluates render options (matrix).
        const RENDEROPTS  = 0x0000_0008;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CardCaps {
    pub flags: CardCapsFlags,
    /// Ops the hardware clips itself even without `CLIPPING`.
    pub clip: AccelMask,
}

#[derive(Debug, Clone, Copy)]
pub struct CardLimits {
    pub dst_min_w: i32,
    pub dst_min_h: i32,
    pub dst_max_w: i32,
    pub dst_max_h: i32,
}

impl Default for CardLimits {
    fn default() -> Self {
        CardLimits {
            dst_min_w: 0,
            dst_min_h: 0,
            dst_max_w: i32::MAX,
            dst_max_h: i32::MAX,
        }
    }
}

/// The accelerator seam. Implementations record commands into their own
/// buffer; `emit_commands` pushes the batch to the device.
///
/// Contract for `check_state`: set the `accel` bits of every primitive
/// the hardware supports under the given state (at least decide about the
/// queried one). Contract for `set_state`: consume `mod_hw` (the core
/// clears it afterwards) and program the hardware; the core then adds the
/// queried primitive to `set`.
pub trait GraphicsDriver: Send + Sync {
    fn caps(&self) -> CardCaps;

    fn limits(&self) -> CardLimits {
        CardLimits::default()
    }

    fn check_state(&self, state: &mut CardState, accel: AccelMask);

    fn set_state(&self, state: &mut CardState, accel: AccelMask);

    /// Returns false when the op must fall back to software.
    fn fill_rectangle(&self, rect: &Rectangle) -> bool;

    fn draw_rectangle(&self, _rect: &Rectangle) -> bool {
        false
    }

    fn draw_line(&self, _line: &Line) -> bool {
        false
    }

    fn fill_triangle(&self, _tri: &Triangle) -> bool {
        false
    }

    fn blit(&self, _rect: &Rectangle, _x: i32, _y: i32) -> bool {
        false
    }

    fn blit2(&self, _rect: &Rectangle, _dx: i32, _dy: i32, _sx2: i32, _sy2: i32) -> bool {
        false
    }

    fn stretch_blit(&self, _src: &Rectangle, _dst: &Rectangle) -> bool {
        false
    }

    fn emit_commands(&self);

    fn engine_sync(&self) -> Result<()> {
        Ok(())
    }

    fn engine_reset(&self) {}

    fn invalidate_state(&self) {}

    /// Serial stamped onto the destination allocation at release.
    fn get_serial(&self) -> u64 {
        0
    }
}

/// Software rasterization seam; the drawing engine falls back here when
/// acceleration is refused.
pub trait SoftwareRasterizer: Send + Sync {
    fn acquire(&self, state: &CardState, accel: AccelMask) -> bool;
    fn fill_rectangle(&self, state: &CardState, rect: &Rectangle);
    fn blit(&self, _state: &CardState, _rect: &Rectangle, _x: i32, _y: i32) {}
    fn stretch_blit(&self, _state: &CardState, _src: &Rectangle, _dst: &Rectangle) {}
    fn release(&self, state: &CardState);
}

/// Fallback of last resort: accepts everything, touches nothing. Hosts
/// without a CPU renderer still get correct bookkeeping.
pub struct NullRasterizer;

impl SoftwareRasterizer for NullRasterizer {
    fn acquire(&self, _state: &CardState, _accel: AccelMask) -> bool {
        true
    }
    fn fill_rectangle(&self, _state: &CardState, _rect: &Rectangle) {}
    fn release(&self, _state: &CardState) {}
}

/// Per-world graphics core. The shared section (lock, holder, pending
/// ops, busy accounting) lives in the world's root mapping so every
/// participant contends on the same state.
pub struct GraphicsCore {
    root: Arc<RootMapping>,
    config: FusionConfig,
    fusion_id: FusionId,
    driver: Option<Arc<dyn GraphicsDriver>>,
    software: Arc<dyn SoftwareRasterizer>,
}

impl GraphicsCore {
    pub fn new(
        root: Arc<RootMapping>,
        config: FusionConfig,
        fusion_id: FusionId,
        driver: Option<Arc<dyn GraphicsDriver>>,
        software: Arc<dyn SoftwareRasterizer>,
    ) -> GraphicsCore {
        let driver = if config.software_only { None } else { driver };
        GraphicsCore {
            root,
            config,
            fusion_id,
            driver,
            software,
        }
    }

    /// Standalone core over a private root; single-process use and tests.
    pub fn private(
        config: FusionConfig,
        driver: Option<Arc<dyn GraphicsDriver>>,
        software: Arc<dyn SoftwareRasterizer>,
    ) -> Result<GraphicsCore> {
        let root = Arc::new(RootMapping::private(0, 0)?);
        Ok(GraphicsCore::new(
            root,
            config,
            FusionId::MASTER,
            driver,
            software,
        ))
    }

    pub(crate) fn section(&self) -> &CardSection {
        &self.root.root().card
    }

    pub(crate) fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub(crate) fn fusion_id(&self) -> FusionId {
        self.fusion_id
    }

    pub fn driver(&self) -> Option<&Arc<dyn GraphicsDriver>> {
        self.driver.as_ref()
    }

    pub(crate) fn software(&self) -> &Arc<dyn SoftwareRasterizer> {
        &self.software
    }

    /// New draw context bound to this participant.
    pub fn new_state(&self) -> CardState {
        CardState::new(self.fusion_id)
    }

    /// Whether commands are batched in the driver buffer.
    pub fn pending_ops(&self) -> bool {
        self.section()
            .pending_ops
            .load(std::sync::atomic::Ordering::SeqCst)
            != 0
    }
}
