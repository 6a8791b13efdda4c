//! Cross-process calls.
//!
//! A call handler is registered in the owning process and addressed by
//! `(call_id, owner)`. Executing a call we own runs the handler inline;
//! executing a remote call sends a CALL frame to the owner's endpoint and,
//! unless one-way, parks the calling thread until the RETURN frame comes
//! back through our dispatcher. CALL3 is the same shape with a return
//! buffer riding along.

use crossbeam_channel::{bounded, Sender};
use fusion_protocol::{
    Call3Message, CallFlags, CallId, CallMessage, FusionError, FusionId, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on waiting for a RETURN frame; a vanished owner otherwise
/// parks the caller forever.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler: `(caller, call_arg, payload) -> (ret_val, ret_data)`.
/// Plain CALL responses carry only `ret_val`; CALL3 responses also carry
/// `ret_data` truncated to the caller's buffer size.
pub type CallHandler = Box<dyn Fn(FusionId, i32, &[u8]) -> (i32, Vec<u8>) + Send + Sync>;

/// Address of a registered call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHandle {
    pub call_id: CallId,
    pub owner: FusionId,
}

struct PendingReturn {
    tx: Sender<(i32, Vec<u8>)>,
}

pub struct CallRegistry {
    next_id: AtomicU32,
    next_serial: AtomicU32,
    handlers: Mutex<HashMap<CallId, CallHandler>>,
    pending: Mutex<HashMap<u32, PendingReturn>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        CallRegistry {
            next_id: AtomicU32::new(1),
            next_serial: AtomicU32::new(1),
            handlers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a handler owned by `owner` (our own id).
    pub fn register(&self, owner: FusionId, handler: CallHandler) -> CallHandle {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(call_id, handler);
        CallHandle { call_id, owner }
    }

    pub fn unregister(&self, handle: CallHandle) {
        self.handlers.lock().remove(&handle.call_id);
    }

    pub fn next_serial(&self) -> u32 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a handler we own. Used for the direct execution path and by the
    /// dispatcher for incoming frames.
    pub fn invoke(&self, call_id: CallId, caller: FusionId, arg: i32, data: &[u8]) -> Option<(i32, Vec<u8>)> {
        // Snapshot outside: handlers may re-enter the registry.
        let result = {
            let handlers = self.handlers.lock();
            handlers.get(&call_id).map(|h| h(caller, arg, data))
        };
        if result.is_none() {
            warn!(target: "fusion.call", call_id, caller = %caller, "call for unknown handler");
        }
        result
    }

    /// Park the current thread until the RETURN frame for `serial` lands.
    pub fn wait_return(&self, serial: u32) -> Result<(i32, Vec<u8>)> {
        let rx = {
            let (tx, rx) = bounded(1);
            self.pending.lock().insert(serial, PendingReturn { tx });
            rx
        };
        match rx.recv_timeout(CALL_TIMEOUT) {
            Ok(result) => Ok(result),
            Err(_) => {
                self.pending.lock().remove(&serial);
                Err(FusionError::Timeout)
            }
        }
    }

    /// Complete a pending call; no-op if the caller already gave up.
    pub fn complete(&self, serial: u32, ret_val: i32, ret_data: Vec<u8>) {
        if let Some(slot) = self.pending.lock().remove(&serial) {
            let _ = slot.tx.send((ret_val, ret_data));
        } else {
            debug!(target: "fusion.call", serial, "return for abandoned call");
        }
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode an outgoing CALL frame.
pub fn call_frame(
    handle: CallHandle,
    caller: FusionId,
    arg: i32,
    data: &[u8],
    serial: u32,
    oneway: bool,
) -> Vec<u8> {
    let msg = CallMessage {
        caller,
        call_arg: arg,
        ret_val: 0,
        serial,
        flags: if oneway {
            CallFlags::ONEWAY
        } else {
            CallFlags::empty()
        },
    };
    msg.to_frame(handle.call_id, data)
}

/// Encode an outgoing CALL3 frame.
pub fn call3_frame(
    handle: CallHandle,
    caller: FusionId,
    arg: i32,
    data: &[u8],
    serial: u32,
    ret_size: u32,
) -> Vec<u8> {
    let msg = Call3Message {
        call: CallMessage {
            caller,
            call_arg: arg,
            ret_val: 0,
            serial,
            flags: CallFlags::empty(),
        },
        ret_size,
        ret_length: 0,
    };
    msg.to_frame(handle.call_id, data)
}

/// Encode the RETURN frame answering `msg`.
pub fn return_frame(
    call_id: CallId,
    responder: FusionId,
    serial: u32,
    ret_val: i32,
    ret_data: &[u8],
) -> Vec<u8> {
    let msg = CallMessage {
        caller: responder,
        call_arg: 0,
        ret_val,
        serial,
        flags: CallFlags::RETURN,
    };
    msg.to_frame(call_id, ret_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_runs_registered_handler() {
        let registry = CallRegistry::new();
        let handle = registry.register(
            FusionId::MASTER,
            Box::new(|caller, arg, _| (arg * 2 + caller.0 as i32, Vec::new())),
        );
        let (ret, data) = registry.invoke(handle.call_id, FusionId(2), 21, &[]).unwrap();
        assert_eq!(ret, 44);
        assert!(data.is_empty());
    }

    #[test]
    fn invoke_unknown_handler_is_none() {
        let registry = CallRegistry::new();
        assert!(registry.invoke(99, FusionId(2), 0, &[]).is_none());
    }

    #[test]
    fn complete_wakes_waiter() {
        let registry = std::sync::Arc::new(CallRegistry::new());
        let serial = registry.next_serial();
        let waiter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.wait_return(serial).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        registry.complete(serial, 84, b"ok".to_vec());
        let (ret, data) = waiter.join().unwrap();
        assert_eq!(ret, 84);
        assert_eq!(data, b"ok");
    }

    #[test]
    fn return_frame_round_trips() {
        let frame = return_frame(7, FusionId::MASTER, 12, 84, b"xyz");
        let (header, payload) = fusion_protocol::FrameCursor::new(&frame)
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(header.msg_id, 7);
        let (msg, extra) = CallMessage::decode(payload).unwrap();
        assert!(msg.flags.contains(CallFlags::RETURN));
        assert_eq!(msg.ret_val, 84);
        assert_eq!(msg.serial, 12);
        assert_eq!(extra, b"xyz");
    }
}
