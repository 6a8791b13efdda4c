//! Multi-process world runtime: enter/exit, message dispatch, calls,
//! reactors, reference federation and fork support.
//!
//! A *world* federates processes over one transport and one shared root.
//! The first participant is the master; it owns mutation of the shared
//! root and runs the world-refs call that keeps reference counts honest
//! across participant crashes.

mod call;
mod cleanup;
mod deferred;
mod dispatcher;
pub mod fork;
mod participant;
mod reactor;
mod refs;
mod world;

pub use call::{CallHandle, CallHandler};
pub use cleanup::CleanupHandle;
pub use participant::Participant;
pub use reactor::ReactionHandle;
pub use world::{ForkAction, ForkPhase, World, WorldMode, MAIN_POOL_ID};

pub use fusion_protocol::{EnterRole, FusionError, FusionId, RefId, Result};
