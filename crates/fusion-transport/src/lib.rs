//! Message transports.
//!
//! Three interchangeable back-ends carry the same frame format between
//! participants: an AF_UNIX datagram socket per participant (the default
//! multi-process mode), an in-process ring for single-process worlds, and
//! a feature-gated character-device back-end for hosts running the
//! out-of-tree fusion kernel module.
//!
//! Failure semantics are uniform: `EINTR` is retried forever inside the
//! back-end, `ECONNREFUSED` surfaces as [`FusionError::Destroyed`], and
//! anything else propagates as I/O failure.

use fusion_protocol::{FusionId, Result};

#[cfg(feature = "kernel-device")]
pub mod kernel;
pub mod ring;
pub mod socket;

pub use ring::RingTransport;
pub use socket::SocketTransport;

/// Receive buffers hold up to four maximum-size frames per read, matching
/// the dispatcher's batching window.
pub const RECV_BATCH: usize = fusion_protocol::MAX_MESSAGE_SIZE * 4;

pub trait Transport: Send + Sync {
    /// Our participant id within the world.
    fn fusion_id(&self) -> FusionId;

    /// Blocking batched receive into `buf`; returns the number of bytes
    /// read. Returns `Ok(0)` without blocking once the receive side has
    /// been switched to non-blocking and nothing is queued.
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Deliver a frame to one participant.
    fn send_to(&self, target: FusionId, frame: &[u8]) -> Result<()>;

    /// Deliver a frame to ourselves (dispatcher wake-up).
    fn send_self(&self, frame: &[u8]) -> Result<()>;

    /// Deliver a frame to every other participant currently present.
    fn broadcast(&self, frame: &[u8]) -> Result<()>;

    /// Switch the receive side to non-blocking; used by stop-dispatcher so
    /// subsequent reads return immediately.
    fn set_nonblocking(&self) -> Result<()>;

    /// Round-trip that flushes transport-side pending messages.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Release any transport-side hold on dispatching (kernel mode only).
    fn unblock(&self) -> Result<()> {
        Ok(())
    }
}
