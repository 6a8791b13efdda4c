//! AF_UNIX datagram back-end.
//!
//! Addresses live under `<socket_dir>/.fusion-<N>/<hex-id>`. The master
//! owns endpoint `1`; slaves find a free id by probing binds upwards from
//! `2`. A stale world (master pid gone, directory left behind) reveals
//! itself as `ECONNREFUSED` on the first enter message; the slave then
//! sweeps the directory and retries exactly once.

use crate::Transport;
use fusion_config::FusionConfig;
use fusion_protocol::{
    EnterMessage, FrameCursor, FusionError, FusionId, MessageType, Result, WorldIndex,
};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Ids probed before giving up on finding a free slave endpoint.
const MAX_SLAVE_PROBES: u32 = 4096;

pub struct SocketTransport {
    socket: UnixDatagram,
    dir: PathBuf,
    own_path: PathBuf,
    id: FusionId,
}

fn socket_dir(config: &FusionConfig, world_index: WorldIndex) -> PathBuf {
    config.socket_dir.join(format!(".fusion-{world_index}"))
}

fn endpoint(dir: &Path, id: FusionId) -> PathBuf {
    dir.join(format!("{id}"))
}

fn ensure_dir(config: &FusionConfig, dir: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => {
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o775));
            if let Some(gid) = config.shmfile_gid {
                let _ = nix::unistd::chown(dir, None, Some(nix::unistd::Gid::from_raw(gid)));
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(FusionError::InitFailed(format!(
            "creating {}: {e}",
            dir.display()
        ))),
    }
}

fn bind_endpoint(dir: &Path, id: FusionId, config: &FusionConfig) -> Option<UnixDatagram> {
    let path = endpoint(dir, id);
    match UnixDatagram::bind(&path) {
        Ok(socket) => {
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o660));
            if let Some(gid) = config.shmfile_gid {
                let _ = nix::unistd::chown(&path, None, Some(nix::unistd::Gid::from_raw(gid)));
            }
            Some(socket)
        }
        Err(_) => None,
    }
}

impl SocketTransport {
    /// Bind the master endpoint. Fails if another master owns the world.
    pub fn open_master(config: &FusionConfig, world_index: WorldIndex) -> Result<SocketTransport> {
        let dir = socket_dir(config, world_index);
        ensure_dir(config, &dir)?;

        let socket = bind_endpoint(&dir, FusionId::MASTER, config).ok_or_else(|| {
            FusionError::InitFailed(format!(
                "could not bind master endpoint in {}",
                dir.display()
            ))
        })?;

        info!(target: "fusion.transport", world = world_index, "bound master endpoint");
        Ok(SocketTransport {
            socket,
            own_path: endpoint(&dir, FusionId::MASTER),
            dir,
            id: FusionId::MASTER,
        })
    }

    /// Probe whether the world already has a live master.
    pub fn master_is_bound(config: &FusionConfig, world_index: WorldIndex) -> bool {
        endpoint(&socket_dir(config, world_index), FusionId::MASTER).exists()
    }

    /// Allocate a slave endpoint and run the enter handshake against the
    /// master. A dead master (`ECONNREFUSED` on the enter message) sweeps
    /// the stale directory and surfaces as `Destroyed`; the caller decides
    /// whether to re-enter from the top (and possibly become master).
    pub fn open_slave(config: &FusionConfig, world_index: WorldIndex) -> Result<SocketTransport> {
        let transport = Self::bind_slave(config, world_index)?;
        match transport.enter_handshake() {
            Ok(()) => Ok(transport),
            Err(FusionError::Destroyed) => {
                info!(
                    target: "fusion.transport",
                    world = world_index,
                    "master seems dead, cleaning up stale world"
                );
                transport.sweep_stale_world()?;
                Err(FusionError::Destroyed)
            }
            Err(e) => Err(e),
        }
    }

    fn bind_slave(config: &FusionConfig, world_index: WorldIndex) -> Result<SocketTransport> {
        let dir = socket_dir(config, world_index);
        ensure_dir(config, &dir)?;

        for raw in FusionId::MASTER.0 + 1..FusionId::MASTER.0 + 1 + MAX_SLAVE_PROBES {
            let id = FusionId(raw);
            if let Some(socket) = bind_endpoint(&dir, id, config) {
                debug!(target: "fusion.transport", world = world_index, id = %id, "bound slave endpoint");
                return Ok(SocketTransport {
                    socket,
                    own_path: endpoint(&dir, id),
                    dir,
                    id,
                });
            }
        }
        Err(FusionError::LimitExceeded(
            "no free slave endpoint id".into(),
        ))
    }

    /// Send ENTER to the master and wait for the echo.
    fn enter_handshake(&self) -> Result<()> {
        let enter = EnterMessage {
            fusion_id: self.id,
            pid: std::process::id(),
        };
        self.send_to(FusionId::MASTER, &enter.to_frame())?;

        let mut buf = vec![0u8; fusion_protocol::MAX_MESSAGE_SIZE];
        let len = self.recv(&mut buf)?;
        let mut frames = FrameCursor::new(&buf[..len]);
        match frames.next() {
            Some(Ok((header, _))) if header.message_type() == Some(MessageType::Enter) => Ok(()),
            Some(Ok((header, _))) => Err(FusionError::Fusion(format!(
                "expected ENTER echo, got message type {}",
                header.msg_type
            ))),
            Some(Err(e)) => Err(e),
            None => Err(FusionError::InitFailed("empty enter reply".into())),
        }
    }

    /// Remove every endpoint of a dead world, our own included; the caller
    /// rebinds from scratch.
    fn sweep_stale_world(&self) -> Result<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| FusionError::InitFailed(format!("opening {}: {e}", self.dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            debug!(target: "fusion.transport", path = %path.display(), "removing stale endpoint");
            if let Err(e) = fs::remove_file(&path) {
                warn!(target: "fusion.transport", path = %path.display(), error = %e, "stale cleanup failed");
                return Err(FusionError::InitFailed(format!(
                    "removing {}: {e}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Enumerate participant ids currently bound in this world.
    pub fn present_ids(&self) -> Vec<FusionId> {
        let mut ids = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(raw) = u32::from_str_radix(name, 16) {
                        ids.push(FusionId(raw));
                    }
                }
            }
        }
        ids.sort();
        ids
    }

    /// Remove the whole socket directory; last master calls this at exit.
    pub fn remove_world_dir(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FusionError::InitFailed(format!(
                "removing {}: {e}",
                self.dir.display()
            ))),
        }
    }

    fn send_path(&self, path: &Path, frame: &[u8]) -> Result<()> {
        loop {
            match self.socket.send_to(frame, path) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(FusionError::from_transport(e)),
            }
        }
    }
}

impl Transport for SocketTransport {
    fn fusion_id(&self) -> FusionId {
        self.id
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.socket.recv(buf) {
                Ok(len) => return Ok(len),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(FusionError::from_transport(e)),
            }
        }
    }

    fn send_to(&self, target: FusionId, frame: &[u8]) -> Result<()> {
        self.send_path(&endpoint(&self.dir, target), frame)
    }

    fn send_self(&self, frame: &[u8]) -> Result<()> {
        self.send_path(&self.own_path, frame)
    }

    fn broadcast(&self, frame: &[u8]) -> Result<()> {
        for id in self.present_ids() {
            if id == self.id {
                continue;
            }
            // A peer that vanished between enumeration and send is not an
            // error for a broadcast.
            match self.send_to(id, frame) {
                Ok(()) | Err(FusionError::Destroyed) => {}
                Err(FusionError::Io(ref e)) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn set_nonblocking(&self) -> Result<()> {
        self.socket
            .set_nonblocking(true)
            .map_err(FusionError::Io)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.own_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> FusionConfig {
        let mut config = FusionConfig::default();
        config.socket_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn second_master_bind_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let _master = SocketTransport::open_master(&config, 0).unwrap();
        assert!(SocketTransport::open_master(&config, 0).is_err());
    }

    #[test]
    fn master_endpoint_probe() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        assert!(!SocketTransport::master_is_bound(&config, 0));
        let _master = SocketTransport::open_master(&config, 0).unwrap();
        assert!(SocketTransport::master_is_bound(&config, 0));
    }

    #[test]
    fn slave_enter_echo_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let master = SocketTransport::open_master(&config, 0).unwrap();

        // Echo ENTER frames the way the master dispatcher does.
        let echo = std::thread::spawn(move || {
            let mut buf = vec![0u8; fusion_protocol::MAX_MESSAGE_SIZE];
            let len = master.recv(&mut buf).unwrap();
            let (header, payload) = FrameCursor::new(&buf[..len]).next().unwrap().unwrap();
            assert_eq!(header.message_type(), Some(MessageType::Enter));
            let enter = EnterMessage::decode(payload).unwrap();
            master.send_to(enter.fusion_id, &enter.to_frame()).unwrap();
        });

        let slave = SocketTransport::open_slave(&config, 0).unwrap();
        assert_eq!(slave.fusion_id(), FusionId(2));
        echo.join().unwrap();
    }

    #[test]
    fn stale_world_is_swept_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        // Fabricate a dead world: bind the master endpoint and drop the
        // socket. The file stays behind (std never unlinks on drop) and
        // sending to it yields ECONNREFUSED.
        let world_dir = dir.path().join(".fusion-0");
        fs::create_dir(&world_dir).unwrap();
        let stale = {
            let path = world_dir.join("1");
            let _socket = UnixDatagram::bind(&path).unwrap();
            path
        };
        assert!(stale.exists());

        // The socket object above is gone; sending to it fails, which the
        // slave treats as a dead master: sweep the directory and report
        // Destroyed so the caller can re-enter from the top.
        let result = SocketTransport::open_slave(&config, 0);
        assert!(matches!(result, Err(FusionError::Destroyed)));
        // The stale master endpoint was removed during the sweep.
        assert!(!stale.exists());
    }

    #[test]
    fn nonblocking_recv_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let master = SocketTransport::open_master(&config, 0).unwrap();
        master.set_nonblocking().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(master.recv(&mut buf).unwrap(), 0);
    }
}
