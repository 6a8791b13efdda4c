//! Error taxonomy surfaced uniformly by all Fusion crates.

use std::io;

pub type Result<T> = std::result::Result<T, FusionError>;

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    /// World index out of range, role/mode mismatch, negative counts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Role refused or operation not available in this mode/driver.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// World ABI recorded in the shared root differs from ours.
    #[error("world ABI mismatch: shared root has {found}, we have {expected}")]
    VersionMismatch { found: i32, expected: i32 },

    /// Transport open, shared-root map or handshake failed.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// Non-recoverable transport errno.
    #[error("transport I/O error")]
    Io(#[from] io::Error),

    /// Peer (surface, ref, world, master) no longer exists.
    #[error("peer destroyed")]
    Destroyed,

    /// A kill/wait deadline elapsed.
    #[error("timed out")]
    Timeout,

    #[error("out of memory")]
    OutOfMemory,

    #[error("out of shared memory")]
    OutOfSharedMemory,

    /// Too many worlds, queue overflow, path too long.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Catch-all for foreign kernel-device failures.
    #[error("fusion device error: {0}")]
    Fusion(String),
}

impl FusionError {
    /// Translate a transport-level I/O error following the propagation
    /// policy: `ECONNREFUSED` collapses to [`FusionError::Destroyed`],
    /// everything else stays an I/O error. `EINTR` never reaches this
    /// point; send/recv loops retry it locally.
    pub fn from_transport(err: io::Error) -> FusionError {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => FusionError::Destroyed,
            _ => FusionError::Io(err),
        }
    }

    /// Whether the error means the remote side is gone for good.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, FusionError::Destroyed)
    }
}
