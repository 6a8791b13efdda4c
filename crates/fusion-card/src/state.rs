//! The card state: the mutable draw context propagated to the driver.
//!
//! Every mutation marks the matching `modified` bit; the acquisition path
//! folds `modified` into `mod_hw`, asks the driver to re-check what the
//! invalidation rules demand, and keeps the bookkeeping invariants:
//! `checked ⊇ accel` at all times, and `set` only names operations whose
//! full hardware state is current.

use fusion_protocol::FusionId;
use fusion_surface::{BufferLockGuard, BufferRole, Eye, Region, Surface};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Acceleration mask: one bit per primitive. Low half draws, high
    /// half blits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccelMask: u32 {
        const FILLRECTANGLE = 0x0000_0001;
        const DRAWRECTANGLE = 0x0000_0002;
        const DRAWLINE      = 0x0000_0004;
        const FILLTRIANGLE  = 0x0000_0008;
        const BLIT          = 0x0001_0000;
        const STRETCHBLIT   = 0x0002_0000;
        const BLIT2         = 0x0008_0000;
        const ALL_DRAW      = 0x0000_FFFF;
        const ALL_BLIT      = 0xFFFF_0000;
    }
}

impl AccelMask {
    pub fn is_blitting(self) -> bool {
        self.intersects(AccelMask::ALL_BLIT)
    }
}

bitflags::bitflags! {
    /// State-modified bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StateModified: u32 {
        const DRAWING_FLAGS    = 0x0000_0001;
        const BLITTING_FLAGS   = 0x0000_0002;
        const CLIP             = 0x0000_0004;
        const COLOR            = 0x0000_0008;
        const SRC_BLEND        = 0x0000_0010;
        const DST_BLEND        = 0x0000_0020;
        const SRC_COLORKEY     = 0x0000_0040;
        const DST_COLORKEY     = 0x0000_0080;
        const DESTINATION      = 0x0000_0100;
        const SOURCE           = 0x0000_0200;
        const SOURCE_MASK      = 0x0000_0400;
        const SOURCE_MASK_VALS = 0x0000_0800;
        const MATRIX           = 0x0000_1000;
        const RENDER_OPTIONS   = 0x0000_2000;
        const SOURCE2          = 0x0000_4000;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawingFlags: u32 {
        const BLEND        = 0x0000_0001;
        const DST_COLORKEY = 0x0000_0002;
        const XOR          = 0x0000_0004;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlittingFlags: u32 {
        const BLEND_ALPHACHANNEL = 0x0000_0001;
        const BLEND_COLORALPHA   = 0x0000_0002;
        const COLORIZE           = 0x0000_0004;
        const SRC_COLORKEY       = 0x0000_0008;
        const DST_COLORKEY       = 0x0000_0010;
        const SRC_MASK_ALPHA     = 0x0010_0000;
        const SRC_MASK_COLOR     = 0x0020_0000;
    }
}

impl BlittingFlags {
    pub fn uses_mask(self) -> bool {
        self.intersects(BlittingFlags::SRC_MASK_ALPHA | BlittingFlags::SRC_MASK_COLOR)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RenderOptions: u32 {
        const MATRIX = 0x0000_0001;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub a: u8,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// The draw context. One per client; the serializer tracks which state
/// (and which participant) last reached the hardware.
pub struct CardState {
    /// Stable identity for holder tracking across the shared card lock.
    pub state_id: u64,
    pub fusion_id: FusionId,

    pub destination: Option<Arc<Surface>>,
    /// Flip count pinning the destination buffer; `None` follows the
    /// surface's current flips.
    pub destination_flips: Option<u32>,
    /// Destination buffer role (back for drawing).
    pub to: BufferRole,
    pub to_eye: Eye,
    pub source: Option<Arc<Surface>>,
    pub source_flips: Option<u32>,
    /// Source buffer role (front for reading).
    pub from: BufferRole,
    pub from_eye: Eye,
    pub source_mask: Option<Arc<Surface>>,
    pub source2: Option<Arc<Surface>>,

    pub clip: Region,
    pub color: Color,
    pub drawing_flags: DrawingFlags,
    pub blitting_flags: BlittingFlags,
    pub render_options: RenderOptions,
    /// 3x3 fixed-point (16.16) transform, row-major.
    pub matrix: [i32; 9],
    pub affine_matrix: bool,

    pub modified: StateModified,
    pub mod_hw: StateModified,
    pub checked: AccelMask,
    pub accel: AccelMask,
    pub set: AccelMask,
    pub disabled: AccelMask,

    // Buffer locks held between acquire and release, canonical order.
    pub(crate) dst: Option<BufferLockGuard>,
    pub(crate) src: Option<BufferLockGuard>,
    pub(crate) src_mask: Option<BufferLockGuard>,
    pub(crate) src2: Option<BufferLockGuard>,
}

impl CardState {
    pub fn new(fusion_id: FusionId) -> CardState {
        CardState {
            state_id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            fusion_id,
            destination: None,
            destination_flips: None,
            to: BufferRole::Back,
            to_eye: Eye::Left,
            source: None,
            source_flips: None,
            from: BufferRole::Front,
            from_eye: Eye::Left,
            source_mask: None,
            source2: None,
            clip: Region::new(0, 0, 0, 0),
            color: Color::default(),
            drawing_flags: DrawingFlags::empty(),
            blitting_flags: BlittingFlags::empty(),
            render_options: RenderOptions::empty(),
            matrix: [0x10000, 0, 0, 0, 0x10000, 0, 0, 0, 0x10000],
            affine_matrix: true,
            modified: StateModified::all(),
            mod_hw: StateModified::empty(),
            checked: AccelMask::empty(),
            accel: AccelMask::empty(),
            set: AccelMask::empty(),
            disabled: AccelMask::empty(),
            dst: None,
            src: None,
            src_mask: None,
            src2: None,
        }
    }

    pub fn set_destination(&mut self, surface: Option<Arc<Surface>>) {
        let changed = match (&self.destination, &surface) {
            (Some(a), Some(b)) => a.id != b.id,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.destination = surface;
            self.modified |= StateModified::DESTINATION;
        }
    }

    /// Destination pinned at an explicit flip count (the flip path uses
    /// this to draw into the next back buffer).
    pub fn set_destination_at(&mut self, surface: Arc<Surface>, flips: u32) {
        self.destination = Some(surface);
        self.destination_flips = Some(flips);
        self.modified |= StateModified::DESTINATION;
    }

    pub fn set_source(&mut self, surface: Option<Arc<Surface>>) {
        let changed = match (&self.source, &surface) {
            (Some(a), Some(b)) => a.id != b.id,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.source = surface;
            self.modified |= StateModified::SOURCE;
        }
    }

    pub fn set_source_mask(&mut self, surface: Option<Arc<Surface>>) {
        self.source_mask = surface;
        self.modified |= StateModified::SOURCE_MASK;
    }

    pub fn set_source2(&mut self, surface: Option<Arc<Surface>>) {
        self.source2 = surface;
        self.modified |= StateModified::SOURCE2;
    }

    pub fn set_clip(&mut self, clip: Region) {
        if self.clip != clip {
            self.clip = clip;
            self.modified |= StateModified::CLIP;
        }
    }

    pub fn set_color(&mut self, color: Color) {
        if self.color != color {
            self.color = color;
            self.modified |= StateModified::COLOR;
        }
    }

    pub fn set_drawing_flags(&mut self, flags: DrawingFlags) {
        if self.drawing_flags != flags {
            self.drawing_flags = flags;
            self.modified |= StateModified::DRAWING_FLAGS;
        }
    }

    pub fn set_blitting_flags(&mut self, flags: BlittingFlags) {
        if self.blitting_flags != flags {
            self.blitting_flags = flags;
            self.modified |= StateModified::BLITTING_FLAGS;
        }
    }

    pub fn set_render_options(&mut self, options: RenderOptions) {
        if self.render_options != options {
            self.render_options = options;
            self.modified |= StateModified::RENDER_OPTIONS;
        }
    }

    pub fn set_matrix(&mut self, matrix: [i32; 9]) {
        self.matrix = matrix;
        self.affine_matrix = matrix[6] == 0 && matrix[7] == 0 && matrix[8] == 0x10000;
        self.modified |= StateModified::MATRIX;
    }

    /// Flip count the destination buffer selection uses.
    pub(crate) fn destination_flips(&self) -> u32 {
        match (self.destination_flips, &self.destination) {
            (Some(flips), _) => flips,
            (None, Some(surface)) => surface.flips(),
            (None, None) => 0,
        }
    }

    pub(crate) fn source_flips(&self) -> u32 {
        match (self.source_flips, &self.source) {
            (Some(flips), _) => flips,
            (None, Some(surface)) => surface.flips(),
            (None, None) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_fully_modified() {
        let state = CardState::new(FusionId::MASTER);
        assert_eq!(state.modified, StateModified::all());
        assert!(state.checked.is_empty());
        assert!(state.set.is_empty());
    }

    #[test]
    fn setters_mark_modified_bits() {
        let mut state = CardState::new(FusionId::MASTER);
        state.modified = StateModified::empty();

        state.set_color(Color {
            a: 255,
            r: 1,
            g: 2,
            b: 3,
        });
        assert!(state.modified.contains(StateModified::COLOR));

        state.set_clip(Region::new(0, 0, 9, 9));
        assert!(state.modified.contains(StateModified::CLIP));

        // Setting the identical color again is not a modification.
        state.modified = StateModified::empty();
        state.set_color(Color {
            a: 255,
            r: 1,
            g: 2,
            b: 3,
        });
        assert!(state.modified.is_empty());
    }

    #[test]
    fn state_ids_are_unique() {
        let a = CardState::new(FusionId::MASTER);
        let b = CardState::new(FusionId::MASTER);
        assert_ne!(a.state_id, b.state_id);
    }

    #[test]
    fn blit_bits_classify_as_blitting() {
        assert!(AccelMask::BLIT.is_blitting());
        assert!(AccelMask::BLIT2.is_blitting());
        assert!(!AccelMask::FILLRECTANGLE.is_blitting());
    }
}
