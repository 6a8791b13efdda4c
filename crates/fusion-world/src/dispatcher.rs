//! The per-world dispatcher task.
//!
//! One thread per world blocks in the transport's batched receive, walks
//! the frames of each buffer in arrival order, and routes every message
//! exactly once. Dispatch-cleanups run at the start of each
//! kernel-originated CALL frame and again after the whole buffer is
//! drained (never between frames of one buffer). Destructor-class calls
//! (`caller == 0`) are shipped to the deferred task when the
//! configuration says so.

use crate::world::World;
use fusion_protocol::{
    Call3Message, CallFlags, CallMessage, EnterMessage, FrameCursor, FusionId, LeaveMessage,
    MessageHeader, MessageType, Result, ShmPoolMessage,
};
use fusion_transport::RECV_BATCH;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

pub(crate) fn spawn(world: Arc<World>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("fusion-dispatch-{}", world.world_index()))
        .spawn(move || run(world))
        .map_err(|e| fusion_protocol::FusionError::InitFailed(format!("spawn dispatcher: {e}")))
}

fn run(world: Arc<World>) {
    let mut buf = vec![0u8; RECV_BATCH];
    debug!(target: "fusion.dispatch", world = world.world_index(), "dispatcher running");

    loop {
        let len = match world.transport().recv(&mut buf) {
            // Non-blocking drain finished: the dispatcher was stopped.
            Ok(0) => break,
            Ok(len) => len,
            Err(e) => {
                if world.local_refs() > 0 {
                    world.log_dispatch_error("reading from transport failed", &e);
                }
                break;
            }
        };

        let guard = world.dispatcher_lock.lock();
        if world.dispatch_stopped() {
            trace!(target: "fusion.dispatch", "discarding batch (dispatcher stopped)");
        } else {
            for frame in FrameCursor::new(&buf[..len]) {
                match frame {
                    Ok((header, payload)) => process_frame(&world, &header, payload, false),
                    Err(e) => {
                        world.log_dispatch_error("malformed frame in batch", &e);
                        break;
                    }
                }
            }
        }

        // Batching guarantee: cleanups registered during this buffer run
        // now, before the next read.
        world.cleanups.run_all();
        drop(guard);

        if world.local_refs() == 0 {
            debug!(target: "fusion.dispatch", world = world.world_index(), "good bye");
            break;
        }
    }
}

/// Route one frame. `on_deferred` marks execution on the deferred task,
/// where destructor-class calls must not be re-deferred.
pub(crate) fn process_frame(
    world: &Arc<World>,
    header: &MessageHeader,
    payload: &[u8],
    on_deferred: bool,
) {
    match header.message_type() {
        Some(MessageType::Send) => {
            trace!(target: "fusion.dispatch", "SEND (wake-up)");
        }
        Some(MessageType::Enter) => handle_enter(world, payload),
        Some(MessageType::Leave) => handle_leave(world, payload),
        Some(MessageType::Call) => handle_call(world, header, payload, on_deferred),
        Some(MessageType::Call3) => handle_call3(world, header, payload, on_deferred),
        Some(MessageType::Reactor) => {
            world
                .reactors
                .process(header.msg_id, header.msg_channel, payload);
        }
        Some(MessageType::ShmPool) => match ShmPoolMessage::decode(payload) {
            Ok(msg) => {
                if let Err(e) = world.pools.lock().process_message(header.msg_id, &msg) {
                    world.log_dispatch_error("pool maintenance failed", &e);
                }
            }
            Err(e) => world.log_dispatch_error("bad SHMPOOL payload", &e),
        },
        None => {
            debug!(
                target: "fusion.dispatch",
                msg_type = header.msg_type,
                "discarding message of unknown type"
            );
        }
    }
}

fn handle_enter(world: &Arc<World>, payload: &[u8]) {
    if !world.is_master() {
        warn!(target: "fusion.dispatch", "got ENTER request, but we are not master");
        return;
    }
    let enter = match EnterMessage::decode(payload) {
        Ok(enter) => enter,
        Err(e) => return world.log_dispatch_error("bad ENTER payload", &e),
    };
    if enter.fusion_id == world.fusion_id() {
        warn!(target: "fusion.dispatch", "ENTER request received from ourselves");
        return;
    }
    world.participants.add(enter.fusion_id, enter.pid);
    // Echo completes the handshake.
    if let Err(e) = world
        .transport()
        .send_to(enter.fusion_id, &enter.to_frame())
    {
        world.log_dispatch_error("answering ENTER failed", &e);
    }
}

fn handle_leave(world: &Arc<World>, payload: &[u8]) {
    let leave = match LeaveMessage::decode(payload) {
        Ok(leave) => leave,
        Err(e) => return world.log_dispatch_error("bad LEAVE payload", &e),
    };
    if leave.fusion_id == world.fusion_id() {
        warn!(target: "fusion.dispatch", "LEAVE request received from ourselves");
        return;
    }
    if world.is_master() {
        world.refs.collect_leaver(leave.fusion_id);
        world.participants.remove(leave.fusion_id);
    }
    world.invoke_leave_callback(leave.fusion_id);
}

fn handle_call(world: &Arc<World>, header: &MessageHeader, payload: &[u8], on_deferred: bool) {
    let (msg, extra) = match CallMessage::decode(payload) {
        Ok(decoded) => decoded,
        Err(e) => return world.log_dispatch_error("bad CALL payload", &e),
    };

    // A RETURN frame completes one of our own pending calls.
    if msg.flags.contains(CallFlags::RETURN) {
        world.calls.complete(msg.serial, msg.ret_val, extra.to_vec());
        return;
    }

    // Kernel-space callers mark destructor-class calls.
    if msg.caller == FusionId::NONE && !on_deferred {
        world.cleanups.run_all();
        if world.config().defer_destructors {
            if let Err(e) = world.deferred.enqueue(*header, payload.to_vec()) {
                world.log_dispatch_error("deferring destructor call failed", &e);
            }
            return;
        }
    }

    let result = world
        .calls
        .invoke(header.msg_id, msg.caller, msg.call_arg, extra);
    respond(world, header.msg_id, &msg, result.map(|(ret, _)| (ret, Vec::new())));
}

fn handle_call3(world: &Arc<World>, header: &MessageHeader, payload: &[u8], on_deferred: bool) {
    let (msg, extra) = match Call3Message::decode(payload) {
        Ok(decoded) => decoded,
        Err(e) => return world.log_dispatch_error("bad CALL3 payload", &e),
    };

    if msg.call.flags.contains(CallFlags::RETURN) {
        world
            .calls
            .complete(msg.call.serial, msg.call.ret_val, extra.to_vec());
        return;
    }

    if msg.call.caller == FusionId::NONE && !on_deferred {
        world.cleanups.run_all();
        if world.config().defer_destructors {
            if let Err(e) = world.deferred.enqueue(*header, payload.to_vec()) {
                world.log_dispatch_error("deferring destructor call failed", &e);
            }
            return;
        }
    }

    let result = world
        .calls
        .invoke(header.msg_id, msg.call.caller, msg.call.call_arg, extra)
        .map(|(ret, mut data)| {
            data.truncate(msg.ret_size as usize);
            (ret, data)
        });
    respond(world, header.msg_id, &msg.call, result);
}

fn respond(
    world: &Arc<World>,
    call_id: u32,
    msg: &CallMessage,
    result: Option<(i32, Vec<u8>)>,
) {
    if msg.flags.contains(CallFlags::ONEWAY) || msg.caller == FusionId::NONE {
        return;
    }
    // Answer even when the handler is unknown so the caller never parks
    // forever on a stale handle.
    let (ret_val, ret_data) = result.unwrap_or((0, Vec::new()));
    let frame = crate::call::return_frame(call_id, world.fusion_id(), msg.serial, ret_val, &ret_data);
    if let Err(e) = world.transport().send_to(msg.caller, &frame) {
        world.log_dispatch_error("answering call failed", &e);
    }
}
