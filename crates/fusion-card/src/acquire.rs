//! State-check acquisition and release.
//!
//! `state_check_acquire` is executed for every accelerated primitive:
//! validate the state, clamp the clip, lock the involved surfaces in
//! canonical order, ask the driver whether the primitive is accelerated
//! under the current state, lock the buffers, take the GPU lock, switch
//! the shared state holder if needed, force an emit when the destination
//! allocation changed, and finally propagate state changes to the driver.
//! On success the primitive is ready for driver dispatch; every failure
//! path releases whatever it acquired.

use crate::lock::LockFlags;
use crate::state::{AccelMask, CardState, RenderOptions, StateModified};
use crate::{CardCapsFlags, GraphicsCore};
use fusion_surface::{lock_many, AccessFlags, BufferPolicy, Surface};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

impl GraphicsCore {
    /// Check acceleration and acquire everything needed to dispatch
    /// `accel`. Returns true when the driver may be called.
    pub fn state_check_acquire(&self, state: &mut CardState, accel: AccelMask) -> bool {
        debug_assert!(state.clip.x2 >= state.clip.x1 && state.clip.y2 >= state.clip.y1);

        // Destination may have been destroyed.
        let Some(destination) = state.destination.clone() else {
            warn!(target: "fusion.card", "no destination");
            return false;
        };
        // Destination buffers may be gone (suspended surface).
        if destination.num_buffers() == 0 {
            trace!(target: "fusion.card", "no buffers in destination surface");
            return false;
        }

        let blitting = accel.is_blitting();
        if blitting {
            if state.source.is_none() {
                warn!(target: "fusion.card", "no source");
                return false;
            }
            if state.blitting_flags.uses_mask() && state.source_mask.is_none() {
                warn!(target: "fusion.card", "no mask");
                return false;
            }
            if accel == AccelMask::BLIT2 && state.source2.is_none() {
                warn!(target: "fusion.card", "no source2");
                return false;
            }
        }

        if state.clip.x1 < 0 {
            state.clip.x1 = 0;
            state.modified |= StateModified::CLIP;
        }
        if state.clip.y1 < 0 {
            state.clip.y1 = 0;
            state.modified |= StateModified::CLIP;
        }

        // Canonical multi-surface lock around the checking phase.
        let source = state.source.clone();
        let source_mask = state.source_mask.clone();
        let source2 = state.source2.clone();
        let mut involved: Vec<&Surface> = vec![&destination];
        if blitting {
            if let Some(ref s) = source {
                involved.push(s);
            }
            if state.blitting_flags.uses_mask() {
                if let Some(ref s) = source_mask {
                    involved.push(s);
                }
            }
            if accel == AccelMask::BLIT2 {
                if let Some(ref s) = source2 {
                    involved.push(s);
                }
            }
        }
        let surface_locks = lock_many(&mut involved);

        // Clamp the clip to the destination bounds.
        let dest_config = destination.config();
        let cx2 = dest_config.width - 1;
        let cy2 = dest_config.height - 1;
        if state.clip.x2 > cx2 {
            state.clip.x2 = cx2;
            if state.clip.x1 > cx2 {
                state.clip.x1 = cx2;
            }
            state.modified |= StateModified::CLIP;
        }
        if state.clip.y2 > cy2 {
            state.clip.y2 = cy2;
            if state.clip.y1 > cy2 {
                state.clip.y1 = cy2;
            }
            state.modified |= StateModified::CLIP;
        }

        // Without a driver there is no acceleration at all.
        let Some(driver) = self.driver().cloned() else {
            return false;
        };
        if state.disabled.contains(accel) {
            trace!(target: "fusion.card", "acceleration disabled");
            return false;
        }

        let caps = driver.caps();
        let limits = driver.limits();

        // Invalidate checked bits according to what was modified.
        if state.modified.intersects(
            StateModified::DESTINATION
                | StateModified::SRC_BLEND
                | StateModified::DST_BLEND
                | StateModified::RENDER_OPTIONS,
        ) {
            state.checked = AccelMask::empty();

            if dest_config.width < limits.dst_min_w
                || dest_config.height < limits.dst_min_h
                || dest_config.width > limits.dst_max_w
                || dest_config.height > limits.dst_max_h
            {
                return false;
            }
        } else {
            if state.modified.intersects(
                StateModified::SOURCE
                    | StateModified::BLITTING_FLAGS
                    | StateModified::SOURCE_MASK
                    | StateModified::SOURCE_MASK_VALS,
            ) {
                state.checked &= !AccelMask::ALL_BLIT;
            } else if state.modified.contains(StateModified::SOURCE2) {
                state.checked &= !AccelMask::BLIT2;
            }
            if state.modified.contains(StateModified::DRAWING_FLAGS) {
                state.checked &= !AccelMask::ALL_DRAW;
            }

            if let Some(ref source) = source {
                let config = source.config();
                if config.width < limits.dst_min_w
                    || config.height < limits.dst_min_h
                    || config.width > limits.dst_max_w
                    || config.height > limits.dst_max_h
                {
                    return false;
                }
            }
        }

        // Ask the driver about this primitive if it has not been asked
        // under the current state.
        if !state.checked.contains(accel) {
            state.accel &= state.checked;
            driver.check_state(state, accel);
            state.checked |= accel;
            state.checked |= state.accel;
        }

        trace!(
            target: "fusion.card",
            checked = ?state.checked,
            accel = ?state.accel,
            modified = ?state.modified,
            "state checked"
        );

        // Move modification flags to the driver's set.
        state.mod_hw |= state.modified;
        state.modified = StateModified::empty();

        // System-memory-only destinations need full sysmem support.
        let dst_flips = state.destination_flips();
        let dst_buffer_policy = destination.buffer_at(state.to, dst_flips).policy;
        if (dst_buffer_policy == BufferPolicy::SystemOnly
            && !(caps.flags.contains(CardCapsFlags::READSYSMEM)
                && caps.flags.contains(CardCapsFlags::WRITESYSMEM)))
            || (!caps.flags.contains(CardCapsFlags::RENDEROPTS)
                && state.render_options.contains(RenderOptions::MATRIX))
        {
            state.accel = AccelMask::empty();
            state.checked = AccelMask::all();
            return false;
        }

        // A system-memory source rules out accelerated blitting.
        if blitting {
            if let Some(ref src) = source {
                let src_policy = src.buffer_at(state.from, state.source_flips()).policy;
                if src_policy == BufferPolicy::SystemOnly
                    && !caps.flags.contains(CardCapsFlags::READSYSMEM)
                {
                    trace!(target: "fusion.card", "cannot read source sysmem");
                    state.accel &= !AccelMask::ALL_BLIT;
                    state.checked |= AccelMask::ALL_BLIT;
                }
            }
        }

        if !state.accel.contains(accel) {
            trace!(target: "fusion.card", "not accelerated");
            return false;
        }

        // Lock buffers for hardware access, canonical order: destination,
        // source, source mask, source2.
        let mut dst_access = AccessFlags::WRITE;
        if blitting {
            if state.blitting_flags.intersects(
                crate::state::BlittingFlags::BLEND_ALPHACHANNEL
                    | crate::state::BlittingFlags::BLEND_COLORALPHA
                    | crate::state::BlittingFlags::DST_COLORKEY,
            ) {
                dst_access |= AccessFlags::READ;
            }
        } else if state.drawing_flags.intersects(
            crate::state::DrawingFlags::BLEND | crate::state::DrawingFlags::DST_COLORKEY,
        ) {
            dst_access |= AccessFlags::READ;
        }

        let dst = match destination.lock_buffer(state.to, dst_flips, state.to_eye, dst_access)
        {
            Ok(guard) => guard,
            Err(_) => {
                trace!(target: "fusion.card", "could not lock destination for GPU access");
                return false;
            }
        };

        if blitting {
            let source = source.as_ref().unwrap();
            let src = match source.lock_buffer(
                state.from,
                state.source_flips(),
                state.from_eye,
                AccessFlags::READ,
            ) {
                Ok(guard) => guard,
                Err(_) => {
                    trace!(target: "fusion.card", "could not lock source for GPU access");
                    return false;
                }
            };

            if state.blitting_flags.uses_mask() {
                let mask = source_mask.as_ref().unwrap();
                match mask.lock_buffer(
                    state.from,
                    mask.flips(),
                    state.from_eye,
                    AccessFlags::READ,
                ) {
                    Ok(guard) => state.src_mask = Some(guard),
                    Err(_) => {
                        trace!(target: "fusion.card", "could not lock source mask for GPU access");
                        return false;
                    }
                }
            }

            if accel == AccelMask::BLIT2 {
                let source2 = source2.as_ref().unwrap();
                match source2.lock_buffer(
                    state.from,
                    source2.flips(),
                    state.from_eye,
                    AccessFlags::READ,
                ) {
                    Ok(guard) => state.src2 = Some(guard),
                    Err(_) => {
                        trace!(target: "fusion.card", "could not lock source2 for GPU access");
                        state.src_mask = None;
                        return false;
                    }
                }
            }

            state.src = Some(src);
        }
        state.dst = Some(dst);

        drop(surface_locks);

        // Serialize state setting and command execution across processes.
        if self.lock(LockFlags::empty()).is_err() {
            warn!(target: "fusion.card", "could not lock GPU");
            state.dst = None;
            state.src = None;
            state.src_mask = None;
            state.src2 = None;
            return false;
        }

        let section = self.section();

        // Switching to another state (or another participant's state)
        // invalidates everything the hardware knows.
        if section.holder_state.load(Ordering::SeqCst) != state.state_id
            || section.holder.load(Ordering::SeqCst) != state.fusion_id.0
        {
            debug!(
                target: "fusion.card",
                from = section.holder_state.load(Ordering::SeqCst),
                to = state.state_id,
                "state holder switch"
            );
            state.mod_hw = StateModified::all();
            state.set = AccelMask::empty();
            section.holder_state.store(state.state_id, Ordering::SeqCst);
            section.holder.store(state.fusion_id.0, Ordering::SeqCst);
        }

        // A destination change emits pending commands of the previous
        // destination first, guaranteeing per-destination ordering.
        let allocation_id = state.dst.as_ref().unwrap().allocation_id();
        if section.last_allocation_id.load(Ordering::SeqCst) != allocation_id {
            section
                .last_allocation_id
                .store(allocation_id, Ordering::SeqCst);

            if !self.config().gfx_emit_early && section.pending_ops.load(Ordering::SeqCst) != 0 {
                self.switch_busy();
                driver.emit_commands();
                section.pending_ops.store(0, Ordering::SeqCst);
            }
        }

        // Propagate state changes to the driver.
        if !state.mod_hw.is_empty() || !state.set.contains(accel) {
            driver.set_state(state, accel);
            state.set |= accel;
            state.mod_hw = StateModified::empty();
        }

        state.modified = StateModified::empty();
        true
    }

    /// Release after acquisition: stamp the allocation serial, emit or
    /// mark pending, unlock the GPU, then release the buffers in reverse
    /// canonical order.
    pub fn state_release(&self, state: &mut CardState) {
        let section = self.section();

        if !self.config().software_only {
            if let Some(driver) = self.driver().cloned() {
                if let Some(ref dst) = state.dst {
                    dst.stamp_serial(driver.get_serial());
                }
                if self.config().gfx_emit_early {
                    self.switch_busy();
                    driver.emit_commands();
                    section.pending_ops.store(0, Ordering::SeqCst);
                } else {
                    section.pending_ops.store(1, Ordering::SeqCst);
                }
            }
        }

        self.unlock();

        // Reverse canonical order.
        state.src2 = None;
        state.src_mask = None;
        state.src = None;
        state.dst = None;
    }
}
