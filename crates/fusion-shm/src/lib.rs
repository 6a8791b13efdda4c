//! Shared memory layer: the world root mapping, the skirmish locks that
//! live inside it, and the shared pools.

pub mod pool;
pub mod root;
pub mod skirmish;

pub use pool::{PoolRegistry, SharedPool};
pub use root::{
    monotonic_micros, pool_address_hint, root_address_hint, root_file_path, CardSection,
    PoolSection, RootMapping, SharedRoot, MAIN_POOL_SIZE, ROOT_READY,
};
pub use skirmish::{dismiss_multi, prevail_multi, SkirmishCore};
