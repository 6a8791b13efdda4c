//! Fork coordinator.
//!
//! There is no process-wide atfork hook here; applications bracket their
//! own `fork()` with the three phases below. Forking without them leaves
//! every entered world in an undefined state in the child.
//!
//! ```no_run
//! use fusion_world::fork;
//!
//! fork::prepare();
//! match unsafe { libc::fork() } {
//!     0 => fork::child(),
//!     _ => fork::parent(),
//! }
//! ```

use crate::world::{registered_worlds, ForkAction, ForkPhase, World};
use tracing::{error, info};

/// Call in both processes immediately before `fork()`.
pub fn prepare() {
    for world in registered_worlds() {
        world.invoke_fork_callback(ForkPhase::Prepare);
    }
}

/// Call in the parent immediately after `fork()`.
pub fn parent() {
    for world in registered_worlds() {
        world.invoke_fork_callback(ForkPhase::Parent);
        world.fork_parent();
    }
}

/// Call in the child immediately after `fork()`. Worlds with
/// [`ForkAction::Close`] drop their cross-process state; worlds with
/// [`ForkAction::Fork`] acquire a fresh participant id, duplicate their
/// reference holdings and restart the dispatcher.
pub fn child() {
    for world in registered_worlds() {
        world.invoke_fork_callback(ForkPhase::Child);
        match world.fork_action() {
            ForkAction::Close => {
                info!(target: "fusion.world", index = world.world_index(), "closing world in child");
                world.fork_child_close();
            }
            ForkAction::Fork => {
                info!(target: "fusion.world", index = world.world_index(), "forking in world");
                if let Err(e) = World::fork_child_fork(&world) {
                    // Unrecoverable by design: the child cannot continue
                    // with half-forked worlds.
                    error!(target: "fusion.world", %e, "fork in world failed");
                    std::process::abort();
                }
            }
        }
    }
}
