//! Participant (fusionee) records.
//!
//! In socket mode the master keeps one record per participant: id, pid
//! and (through the reference federation) the counts it holds. Records
//! are created by the ENTER handshake and removed by LEAVE or by the
//! dead-pid sweep.

use fusion_protocol::FusionId;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub id: FusionId,
    pub pid: u32,
}

pub struct ParticipantTable {
    entries: Mutex<Vec<Participant>>,
}

impl ParticipantTable {
    pub fn new() -> Self {
        ParticipantTable {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, id: FusionId, pid: u32) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|p| p.id == id) {
            return;
        }
        debug!(target: "fusion.world", id = %id, pid, "participant entered");
        entries.push(Participant { id, pid });
    }

    pub fn remove(&self, id: FusionId) -> Option<Participant> {
        let mut entries = self.entries.lock();
        let at = entries.iter().position(|p| p.id == id)?;
        Some(entries.swap_remove(at))
    }

    pub fn pid_of(&self, id: FusionId) -> Option<u32> {
        self.entries.lock().iter().find(|p| p.id == id).map(|p| p.pid)
    }

    pub fn snapshot(&self) -> Vec<Participant> {
        self.entries.lock().clone()
    }

    /// Participants whose pid is no longer alive.
    pub fn dead(&self, own_id: FusionId) -> Vec<Participant> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.id != own_id && !pid_alive(p.pid))
            .collect()
    }
}

impl Default for ParticipantTable {
    fn default() -> Self {
        Self::new()
    }
}

/// `kill(pid, 0)` liveness probe.
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent_per_id() {
        let table = ParticipantTable::new();
        table.add(FusionId(2), 100);
        table.add(FusionId(2), 100);
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn remove_returns_the_record() {
        let table = ParticipantTable::new();
        table.add(FusionId(2), 100);
        let removed = table.remove(FusionId(2)).unwrap();
        assert_eq!(removed.pid, 100);
        assert!(table.remove(FusionId(2)).is_none());
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn dead_finds_exited_pids() {
        let table = ParticipantTable::new();
        // Spawn and reap a child so its pid is certainly dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        table.add(FusionId(1), std::process::id());
        table.add(FusionId(2), pid);
        let dead = table.dead(FusionId(1));
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, FusionId(2));
    }
}
