//! Character-device back-end for the out-of-tree fusion kernel module.
//!
//! Only compiled with the `kernel-device` feature. The device carries
//! enter/fork/kill/sync/unblock as ioctls and delivers message frames
//! through plain reads; ioctl request numbers follow the linux-fusion
//! header's lounge block.

use crate::Transport;
use fusion_protocol::{FusionError, FusionId, Result, WorldIndex};
use nix::{ioctl_none, ioctl_readwrite, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;
use tracing::{debug, info};

const FUSION_MAGIC: u8 = b'F';

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FusionApi {
    pub major: i32,
    pub minor: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FusionEnter {
    pub api: FusionApi,
    pub fusion_id: u32,
    pub secure: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FusionFork {
    pub fusion_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FusionKillParam {
    pub fusion_id: u32,
    pub signal: i32,
    pub timeout_ms: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FusionSendMessage {
    pub fusion_id: u32,
    pub msg_id: u32,
    pub msg_size: u32,
    pub msg_data: *const u8,
}

ioctl_readwrite!(fusion_enter_ioctl, FUSION_MAGIC, 0x00, FusionEnter);
ioctl_none!(fusion_unblock_ioctl, FUSION_MAGIC, 0x01);
ioctl_write_ptr!(fusion_kill_ioctl, FUSION_MAGIC, 0x02, FusionKillParam);
ioctl_readwrite!(fusion_fork_ioctl, FUSION_MAGIC, 0x03, FusionFork);
ioctl_write_ptr!(fusion_send_ioctl, FUSION_MAGIC, 0x04, FusionSendMessage);
ioctl_readwrite!(fusion_shm_base_ioctl, FUSION_MAGIC, 0x05, libc::c_ulong);
ioctl_none!(fusion_sync_ioctl, FUSION_MAGIC, 0x06);

pub struct KernelTransport {
    device: Mutex<File>,
    id: FusionId,
    raw_fd: i32,
}

fn open_device(world_index: WorldIndex, excl: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true);
    let mut flags = libc::O_CLOEXEC;
    if excl {
        flags |= libc::O_EXCL;
    }
    options.custom_flags(flags);

    let flat = format!("/dev/fusion{world_index}");
    match options.open(&flat) {
        Ok(file) => return Ok(file),
        Err(e) if e.kind() != ErrorKind::NotFound => {
            return Err(FusionError::InitFailed(format!("open {flat}: {e}")))
        }
        Err(_) => {}
    }
    let nested = format!("/dev/fusion/{world_index}");
    options
        .open(&nested)
        .map_err(|e| FusionError::InitFailed(format!("open {nested}: {e}")))
}

impl KernelTransport {
    /// Open the device and enter the world. `master` requests exclusive
    /// ownership (O_EXCL on the device).
    pub fn open(world_index: WorldIndex, master: bool, secure: bool) -> Result<KernelTransport> {
        let device = open_device(world_index, master)?;
        let raw_fd = device.as_raw_fd();

        let mut enter = FusionEnter {
            api: FusionApi { major: 9, minor: 0 },
            fusion_id: 0,
            secure: secure as i32,
        };
        loop {
            // SAFETY: fd is open, struct layout matches the device ABI.
            match unsafe { fusion_enter_ioctl(raw_fd, &mut enter) } {
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_ENTER: {e}"))),
            }
        }
        if enter.fusion_id == 0 {
            return Err(FusionError::InitFailed("no id from FUSION_ENTER".into()));
        }

        info!(target: "fusion.transport", world = world_index, id = enter.fusion_id, "entered via kernel device");
        Ok(KernelTransport {
            device: Mutex::new(device),
            id: FusionId(enter.fusion_id),
            raw_fd,
        })
    }

    /// Acquire the kernel-side shared memory base address.
    pub fn shm_base(&self) -> Result<usize> {
        let mut base: libc::c_ulong = 0;
        // SAFETY: fd is open for the lifetime of self.
        unsafe { fusion_shm_base_ioctl(self.raw_fd, &mut base) }
            .map_err(|e| FusionError::Fusion(format!("FUSION_SHM_GET_BASE: {e}")))?;
        Ok(base as usize)
    }

    /// Fork bookkeeping: obtain a fresh id inheriting the parent's refs.
    pub fn fork_from(&self, parent: FusionId) -> Result<FusionId> {
        let mut fork = FusionFork {
            fusion_id: parent.0,
        };
        loop {
            // SAFETY: see above.
            match unsafe { fusion_fork_ioctl(self.raw_fd, &mut fork) } {
                Ok(_) => return Ok(FusionId(fork.fusion_id)),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_FORK: {e}"))),
            }
        }
    }

    /// Signal a participant through the kernel, with an optional deadline.
    pub fn kill(&self, target: FusionId, signal: i32, timeout_ms: i32) -> Result<()> {
        let param = FusionKillParam {
            fusion_id: target.0,
            signal,
            timeout_ms,
        };
        loop {
            // SAFETY: see above.
            match unsafe { fusion_kill_ioctl(self.raw_fd, &param) } {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ETIMEDOUT) => return Err(FusionError::Timeout),
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_KILL: {e}"))),
            }
        }
    }
}

impl Transport for KernelTransport {
    fn fusion_id(&self) -> FusionId {
        self.id
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let result = self.device.lock().unwrap().read(buf);
            match result {
                Ok(len) => return Ok(len),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(FusionError::from_transport(e)),
            }
        }
    }

    fn send_to(&self, target: FusionId, frame: &[u8]) -> Result<()> {
        let msg = FusionSendMessage {
            fusion_id: target.0,
            msg_id: 0,
            msg_size: frame.len() as u32,
            msg_data: frame.as_ptr(),
        };
        loop {
            // SAFETY: frame outlives the call.
            match unsafe { fusion_send_ioctl(self.raw_fd, &msg) } {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_SEND_MESSAGE: {e}"))),
            }
        }
    }

    fn send_self(&self, frame: &[u8]) -> Result<()> {
        self.send_to(self.id, frame)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        // Id 0 addresses every participant in the kernel ABI.
        self.send_to(FusionId::NONE, frame)
    }

    fn set_nonblocking(&self) -> Result<()> {
        // SAFETY: plain fcntl on our own fd.
        let flags = unsafe { libc::fcntl(self.raw_fd, libc::F_GETFL) };
        if flags < 0
            || unsafe { libc::fcntl(self.raw_fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
        {
            return Err(FusionError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        loop {
            // SAFETY: fd is open.
            match unsafe { fusion_sync_ioctl(self.raw_fd) } {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_SYNC: {e}"))),
            }
        }
    }

    fn unblock(&self) -> Result<()> {
        debug!(target: "fusion.transport", "unblocking world");
        loop {
            // SAFETY: fd is open.
            match unsafe { fusion_unblock_ioctl(self.raw_fd) } {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(FusionError::Fusion(format!("FUSION_UNBLOCK: {e}"))),
            }
        }
    }
}
