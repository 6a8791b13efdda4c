//! In-process ring back-end.
//!
//! Single-process worlds keep every participant in one address space, so
//! the "transport" is a bounded ring of frames guarded by a mutex and a
//! condition variable. Producers append from any thread; the single
//! dispatcher task consumes batches. There is no cross-process state.

use crate::Transport;
use fusion_protocol::{FusionError, FusionId, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Frames queued before producers are refused.
const RING_CAPACITY: usize = 256;

struct RingInner {
    slots: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    nonblocking: AtomicBool,
}

#[derive(Clone)]
pub struct RingTransport {
    inner: Arc<RingInner>,
}

impl RingTransport {
    pub fn new() -> RingTransport {
        RingTransport {
            inner: Arc::new(RingInner {
                slots: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
                available: Condvar::new(),
                nonblocking: AtomicBool::new(false),
            }),
        }
    }

    fn push(&self, frame: &[u8]) -> Result<()> {
        let mut slots = self.inner.slots.lock();
        if slots.len() >= RING_CAPACITY {
            return Err(FusionError::LimitExceeded("transport ring full".into()));
        }
        slots.push_back(frame.to_vec());
        drop(slots);
        self.inner.available.notify_one();
        Ok(())
    }
}

impl Default for RingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RingTransport {
    fn fusion_id(&self) -> FusionId {
        // A single-process world has exactly one participant: the master.
        FusionId::MASTER
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut slots = self.inner.slots.lock();
        while slots.is_empty() {
            if self.inner.nonblocking.load(Ordering::Relaxed) {
                return Ok(0);
            }
            self.inner.available.wait(&mut slots);
        }

        // Drain as many whole frames as fit; like a datagram batch read,
        // a frame is never split.
        let mut used = 0;
        while let Some(front) = slots.front() {
            if used + front.len() > buf.len() {
                break;
            }
            let frame = slots.pop_front().unwrap();
            buf[used..used + frame.len()].copy_from_slice(&frame);
            used += frame.len();
        }
        Ok(used)
    }

    fn send_to(&self, _target: FusionId, frame: &[u8]) -> Result<()> {
        self.push(frame)
    }

    fn send_self(&self, frame: &[u8]) -> Result<()> {
        self.push(frame)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        self.push(frame)
    }

    fn set_nonblocking(&self) -> Result<()> {
        self.inner.nonblocking.store(true, Ordering::Relaxed);
        self.inner.available.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_protocol::{wakeup_frame, FrameCursor, MessageType};

    #[test]
    fn frames_arrive_in_order() {
        let ring = RingTransport::new();
        ring.send_self(&fusion_protocol::build_frame(
            MessageType::Reactor,
            1,
            0,
            &[],
        ))
        .unwrap();
        ring.send_self(&fusion_protocol::build_frame(
            MessageType::Reactor,
            2,
            0,
            &[],
        ))
        .unwrap();

        let mut buf = vec![0u8; 1024];
        let len = ring.recv(&mut buf).unwrap();
        let ids: Vec<u32> = FrameCursor::new(&buf[..len])
            .map(|f| f.unwrap().0.msg_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn recv_blocks_until_producer_appends() {
        let ring = RingTransport::new();
        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut buf = vec![0u8; 256];
                ring.recv(&mut buf).unwrap()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        ring.send_self(&wakeup_frame()).unwrap();
        assert!(consumer.join().unwrap() > 0);
    }

    #[test]
    fn nonblocking_empty_recv_returns_zero() {
        let ring = RingTransport::new();
        ring.set_nonblocking().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(ring.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn overflow_is_limit_exceeded() {
        let ring = RingTransport::new();
        let frame = wakeup_frame();
        for _ in 0..RING_CAPACITY {
            ring.send_self(&frame).unwrap();
        }
        assert!(matches!(
            ring.send_self(&frame),
            Err(FusionError::LimitExceeded(_))
        ));
    }
}
