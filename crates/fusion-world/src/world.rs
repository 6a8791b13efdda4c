//! World lifecycle: enter, exit, and everything a process-local world
//! handle owns.
//!
//! A process enters a world at most once per index; later enters of the
//! same index share the handle by refcount. The handle registry owns
//! `Arc<World>` per index, replacing the original's raw global table; the
//! fork coordinator iterates it.

use crate::call::{self, CallHandle, CallHandler, CallRegistry};
use crate::cleanup::{CleanupHandle, CleanupList};
use crate::deferred::DeferredQueue;
use crate::dispatcher;
use crate::participant::{pid_alive, ParticipantTable};
use crate::reactor::{reactor_frame, ReactionHandle, ReactorRegistry};
use crate::refs::RefsFederation;
use fusion_config::FusionConfig;
use fusion_protocol::{
    wakeup_frame, CallId, EnterRole, FusionError, FusionId, LeaveMessage, RefId, Result,
    ShmPoolMessage, ShmPoolOp, WorldIndex, MAX_WORLDS,
};
use fusion_shm::{PoolRegistry, RootMapping, SharedPool, MAIN_POOL_SIZE};
use fusion_transport::{RingTransport, SocketTransport, Transport};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pool id of the world's main pool.
pub const MAIN_POOL_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldMode {
    /// AF_UNIX datagram endpoints, multiple processes.
    Socket,
    /// In-process ring, single participant.
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkAction {
    /// Drop all cross-process state in the child.
    #[default]
    Close,
    /// Acquire a fresh participant id in the child and keep going.
    Fork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPhase {
    Prepare,
    Parent,
    Child,
}

pub type ForkCallback = Box<dyn Fn(ForkAction, ForkPhase) + Send + Sync>;
pub type LeaveCallback = Box<dyn Fn(FusionId) + Send + Sync>;

fn registry() -> &'static Mutex<BTreeMap<WorldIndex, Arc<World>>> {
    static REGISTRY: Mutex<BTreeMap<WorldIndex, Arc<World>>> = Mutex::new(BTreeMap::new());
    &REGISTRY
}

/// Iterate entered worlds (fork coordinator).
pub(crate) fn registered_worlds() -> Vec<Arc<World>> {
    registry().lock().values().cloned().collect()
}

pub(crate) fn unregister_world(index: WorldIndex) {
    registry().lock().remove(&index);
}

pub struct World {
    index: WorldIndex,
    mode: WorldMode,
    config: FusionConfig,
    fusion_id: AtomicU32,
    transport: Mutex<Arc<dyn Transport>>,
    root: Arc<RootMapping>,
    local_refs: AtomicI32,
    dispatch_stop: AtomicBool,
    pub(crate) dispatcher_lock: ReentrantMutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    pub(crate) deferred: DeferredQueue,
    pub(crate) calls: CallRegistry,
    pub(crate) reactors: ReactorRegistry,
    pub(crate) refs: RefsFederation,
    pub(crate) participants: ParticipantTable,
    pub(crate) cleanups: CleanupList,
    pub(crate) pools: Mutex<PoolRegistry>,
    next_pool_id: AtomicU32,
    leave_callback: Mutex<Option<LeaveCallback>>,
    fork_action: Mutex<ForkAction>,
    fork_callback: Mutex<Option<ForkCallback>>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("index", &self.index)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl World {
    // ---------------------------------------------------------------------------------------------
    // Enter
    // ---------------------------------------------------------------------------------------------

    /// Enter a world in socket mode with configuration from the
    /// environment. `index = None` scans for the first free index
    /// (master-capable roles only).
    pub fn enter(index: Option<WorldIndex>, abi_version: i32, role: EnterRole) -> Result<Arc<World>> {
        Self::enter_with(FusionConfig::from_env(), index, abi_version, role)
    }

    /// Enter with explicit configuration (tests inject hermetic paths).
    pub fn enter_with(
        config: FusionConfig,
        index: Option<WorldIndex>,
        abi_version: i32,
        role: EnterRole,
    ) -> Result<Arc<World>> {
        let role = if config.force_slave {
            EnterRole::Slave
        } else {
            role
        };

        if let Some(index) = index {
            if index >= MAX_WORLDS {
                return Err(FusionError::InvalidArgument(format!(
                    "world index {index} exceeds maximum {}",
                    MAX_WORLDS - 1
                )));
            }
        } else if role == EnterRole::Slave {
            return Err(FusionError::InvalidArgument(
                "slave role with a new world requested".into(),
            ));
        }

        let mut registry = registry().lock();

        // Re-enter of a world this process already joined.
        let existing = match index {
            Some(index) => registry.get(&index).cloned(),
            None => registry.values().next().cloned(),
        };
        if let Some(world) = existing {
            world.check_reenter_role(role)?;
            let found = world.root.root().world_abi.load(Ordering::Relaxed);
            if found != abi_version {
                return Err(FusionError::VersionMismatch {
                    found,
                    expected: abi_version,
                });
            }
            world.local_refs.fetch_add(1, Ordering::SeqCst);
            debug!(target: "fusion.world", index = world.index, "using existing world");
            return Ok(world);
        }

        // Fresh enter; a stale world (dead master) is cleaned up by the
        // slave path and retried exactly once from the top, which may
        // promote us to master.
        let mut retried = false;
        loop {
            match Self::open_world(&config, index, abi_version, role, &mut registry) {
                Err(FusionError::Destroyed) if !retried => {
                    retried = true;
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Enter a single-process world over the in-process ring transport.
    pub fn enter_single(index: WorldIndex, abi_version: i32) -> Result<Arc<World>> {
        Self::enter_single_with(FusionConfig::from_env(), index, abi_version)
    }

    /// Single-process enter with explicit configuration.
    pub fn enter_single_with(
        config: FusionConfig,
        index: WorldIndex,
        abi_version: i32,
    ) -> Result<Arc<World>> {
        if index >= MAX_WORLDS {
            return Err(FusionError::InvalidArgument(format!(
                "world index {index} exceeds maximum {}",
                MAX_WORLDS - 1
            )));
        }
        let mut registry = registry().lock();
        if let Some(world) = registry.get(&index) {
            let found = world.root.root().world_abi.load(Ordering::Relaxed);
            if found != abi_version {
                return Err(FusionError::VersionMismatch {
                    found,
                    expected: abi_version,
                });
            }
            world.local_refs.fetch_add(1, Ordering::SeqCst);
            return Ok(world.clone());
        }

        let transport: Arc<dyn Transport> = Arc::new(RingTransport::new());
        let root = Arc::new(RootMapping::private(index, abi_version)?);
        let world = Self::construct(
            index,
            WorldMode::InProcess,
            config.clone(),
            transport,
            root,
            PoolRegistry::new(config, index),
        );
        Self::install_master_state(&world);
        Self::publish(world, &mut registry)
    }

    fn open_world(
        config: &FusionConfig,
        index: Option<WorldIndex>,
        abi_version: i32,
        role: EnterRole,
        registry: &mut BTreeMap<WorldIndex, Arc<World>>,
    ) -> Result<Arc<World>> {
        // Resolve the index and transport role.
        let (index, transport) = match index {
            Some(index) => (index, Self::open_transport(config, index, role)?),
            None => {
                let mut found = None;
                for candidate in 0..MAX_WORLDS {
                    if registry.contains_key(&candidate) {
                        continue;
                    }
                    if let Ok(t) = SocketTransport::open_master(config, candidate) {
                        found = Some((candidate, t));
                        break;
                    }
                }
                let (index, t) = found.ok_or_else(|| {
                    FusionError::LimitExceeded("no free world index".into())
                })?;
                (index, t)
            }
        };

        let is_master = transport.fusion_id().is_master();
        let root = if is_master {
            Arc::new(RootMapping::create(config, index, abi_version)?)
        } else {
            let root = RootMapping::open(config, index, abi_version)?;
            root.root().refs.fetch_add(1, Ordering::SeqCst);
            Arc::new(root)
        };

        let mut pools = PoolRegistry::new(config.clone(), index);
        if is_master {
            let pool = SharedPool::create(config, index, MAIN_POOL_ID, MAIN_POOL_SIZE)?;
            let section = &root.root().main_pool;
            section.pool_id.store(MAIN_POOL_ID, Ordering::Relaxed);
            section.size.store(MAIN_POOL_SIZE as u64, Ordering::Relaxed);
            pools.insert(pool);
        } else {
            let section = &root.root().main_pool;
            let pool_id = section.pool_id.load(Ordering::Relaxed);
            let size = section.size.load(Ordering::Relaxed) as usize;
            pools.insert(SharedPool::attach(config, index, pool_id, size)?);
        }

        let transport: Arc<dyn Transport> = Arc::new(transport);
        let world = Self::construct(
            index,
            WorldMode::Socket,
            config.clone(),
            transport,
            root,
            pools,
        );
        if is_master {
            Self::install_master_state(&world);
        }
        Self::publish(world, registry)
    }

    fn open_transport(
        config: &FusionConfig,
        index: WorldIndex,
        role: EnterRole,
    ) -> Result<SocketTransport> {
        let result = match role {
            EnterRole::Master => SocketTransport::open_master(config, index),
            EnterRole::Slave => SocketTransport::open_slave(config, index),
            EnterRole::Any => match SocketTransport::open_master(config, index) {
                Ok(t) => Ok(t),
                Err(_) => SocketTransport::open_slave(config, index),
            },
        };
        match result {
            // No master endpoint at all: entering as slave cannot work.
            Err(FusionError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                FusionError::InitFailed(format!("world {index} has no master")),
            ),
            other => other,
        }
    }

    fn construct(
        index: WorldIndex,
        mode: WorldMode,
        config: FusionConfig,
        transport: Arc<dyn Transport>,
        root: Arc<RootMapping>,
        pools: PoolRegistry,
    ) -> Arc<World> {
        let fusion_id = transport.fusion_id();
        Arc::new(World {
            index,
            mode,
            config,
            fusion_id: AtomicU32::new(fusion_id.0),
            transport: Mutex::new(transport),
            root,
            local_refs: AtomicI32::new(1),
            dispatch_stop: AtomicBool::new(false),
            dispatcher_lock: ReentrantMutex::new(()),
            dispatcher: Mutex::new(None),
            deferred: DeferredQueue::new(),
            calls: CallRegistry::new(),
            reactors: ReactorRegistry::new(),
            refs: RefsFederation::new(),
            participants: ParticipantTable::new(),
            cleanups: CleanupList::new(),
            pools: Mutex::new(pools),
            next_pool_id: AtomicU32::new(MAIN_POOL_ID + 1),
            leave_callback: Mutex::new(None),
            fork_action: Mutex::new(ForkAction::default()),
            fork_callback: Mutex::new(None),
        })
    }

    /// Master-only init: the world-refs call and our own participant
    /// record.
    fn install_master_state(world: &Arc<World>) {
        let weak = Arc::downgrade(world);
        let handle = world.calls.register(
            world.fusion_id(),
            Box::new(move |caller, ref_id, payload| {
                if let Some(world) = weak.upgrade() {
                    let delta = payload
                        .get(0..4)
                        .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(-1);
                    world.refs.adjust_for(caller, ref_id as RefId, delta);
                }
                (0, Vec::new())
            }),
        );
        world
            .root
            .root()
            .refs_call
            .store(handle.call_id, Ordering::Relaxed);
        world.participants.add(world.fusion_id(), std::process::id());
    }

    fn publish(
        world: Arc<World>,
        registry: &mut BTreeMap<WorldIndex, Arc<World>>,
    ) -> Result<Arc<World>> {
        registry.insert(world.index, world.clone());
        if let Err(e) = Self::start_tasks(&world) {
            // Clear the slot before dropping the half-built world.
            registry.remove(&world.index);
            return Err(e);
        }
        info!(
            target: "fusion.world",
            index = world.index,
            id = %world.fusion_id(),
            master = world.is_master(),
            "entered world"
        );
        Ok(world)
    }

    pub(crate) fn start_tasks(world: &Arc<World>) -> Result<()> {
        *world.dispatcher.lock() = Some(dispatcher::spawn(world.clone())?);
        world.deferred.spawn(world.clone())?;
        Ok(())
    }

    fn check_reenter_role(&self, role: EnterRole) -> Result<()> {
        match role {
            EnterRole::Master if !self.is_master() => Err(FusionError::Unsupported(
                "master role requested, but we entered as slave".into(),
            )),
            EnterRole::Slave if self.is_master() => Err(FusionError::Unsupported(
                "slave role requested, but we entered as master".into(),
            )),
            _ => Ok(()),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------------------------------

    pub fn world_index(&self) -> WorldIndex {
        self.index
    }

    pub fn fusion_id(&self) -> FusionId {
        FusionId(self.fusion_id.load(Ordering::Relaxed))
    }

    pub fn is_master(&self) -> bool {
        self.fusion_id().is_master()
    }

    /// Whether participants live in separate processes.
    pub fn is_multi(&self) -> bool {
        self.mode == WorldMode::Socket
    }

    pub fn mode(&self) -> WorldMode {
        self.mode
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn shared_root(&self) -> &fusion_shm::SharedRoot {
        self.root.root()
    }

    /// Shared-root mapping handle; the graphics core attaches here.
    pub fn root_mapping(&self) -> Arc<RootMapping> {
        self.root.clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.lock().clone()
    }

    pub(crate) fn local_refs(&self) -> i32 {
        self.local_refs.load(Ordering::SeqCst)
    }

    pub(crate) fn dispatch_stopped(&self) -> bool {
        self.dispatch_stop.load(Ordering::SeqCst)
    }

    /// World-clock origin recorded by the master at init.
    pub fn start_time_us(&self) -> i64 {
        self.root.root().start_time_us.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------------------------------
    // Lifecycle operations
    // ---------------------------------------------------------------------------------------------

    /// Unblock transport-side dispatching (kernel mode only; no-op here).
    pub fn activate(&self) -> Result<()> {
        self.transport().unblock()
    }

    /// Round-trip flushing transport-side pending messages.
    pub fn sync(&self) -> Result<()> {
        self.transport().sync()
    }

    /// Stop the dispatcher. Unless `emergency`, synchronize through the
    /// transport and take the dispatcher lock around flipping the flag.
    /// The transport is left non-blocking so later reads return instantly.
    pub fn stop_dispatcher(&self, emergency: bool) -> Result<()> {
        if !emergency {
            let _ = self.sync();
            let guard = self.dispatcher_lock.lock();
            self.dispatch_stop.store(true, Ordering::SeqCst);
            drop(guard);
            let _ = self.sync();
        } else {
            self.dispatch_stop.store(true, Ordering::SeqCst);
        }
        let transport = self.transport();
        transport.set_nonblocking()?;
        let _ = transport.send_self(&wakeup_frame());
        Ok(())
    }

    /// Leave the world. The local refcount drops by one; at zero the
    /// dispatcher and deferred tasks are joined, refs are torn down, and
    /// master-side shared state is destroyed when the shared refcount
    /// reaches zero (unlinking the backing file and socket directory).
    pub fn exit(&self, emergency: bool) -> Result<()> {
        let mut registry = registry().lock();
        if self.local_refs.fetch_sub(1, Ordering::SeqCst) > 1 {
            return Ok(());
        }
        debug!(target: "fusion.world", index = self.index, "exiting world");

        let transport = self.transport();

        // Wake and join the dispatcher, unless we are the dispatcher.
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                warn!(target: "fusion.world", "exit from dispatcher thread, skipping join");
            } else if emergency {
                let _ = self.stop_dispatcher(true);
                let _ = handle.join();
            } else {
                let _ = transport.send_self(&wakeup_frame());
                let _ = handle.join();
            }
        }

        self.deferred.shutdown();

        // Socket slaves announce departure so the master reclaims refs.
        if self.is_multi() && !self.is_master() {
            let leave = LeaveMessage {
                fusion_id: self.fusion_id(),
            };
            let _ = transport.send_to(FusionId::MASTER, &leave.to_frame());
        }

        self.refs.clear_local();
        self.reactors.clear();

        // Shared refcount bookkeeping and last-one-out cleanup.
        let remaining = self.root.root().refs.fetch_sub(1, Ordering::SeqCst) - 1;
        let last_out = remaining == 0;

        let pools = self.pools.lock().drain();
        for pool in pools {
            if last_out && self.is_master() {
                let _ = pool.destroy();
            }
        }

        if last_out && self.is_multi() {
            let _ = self.root.unlink();
        }

        registry.remove(&self.index);
        drop(registry);

        if last_out && self.is_multi() {
            let dir = self.config.socket_dir.join(format!(".fusion-{}", self.index));
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(target: "fusion.world", dir = %dir.display(), error = %e, "socket dir cleanup failed");
                }
            }
        }

        info!(target: "fusion.world", index = self.index, "left world");
        Ok(())
    }

    /// Signal participants. `target = FusionId::NONE` addresses everyone
    /// but ourselves. With `timeout_ms >= 0` the call polls for the pid's
    /// exit every millisecond; a positive timeout that elapses returns
    /// [`FusionError::Timeout`].
    pub fn kill(&self, target: FusionId, signal: i32, timeout_ms: i32) -> Result<()> {
        use nix::sys::signal::{kill as nix_kill, Signal};
        use nix::unistd::Pid;

        if self.is_multi() && !self.is_master() {
            return Err(FusionError::Unsupported(
                "kill requires the master in socket mode".into(),
            ));
        }

        let own = self.fusion_id();
        for participant in self.participants.snapshot() {
            if target == FusionId::NONE && participant.id == own {
                continue;
            }
            if target != FusionId::NONE && participant.id != target {
                continue;
            }

            let pid = Pid::from_raw(participant.pid as i32);
            let sig = if signal == 0 {
                None
            } else {
                Some(Signal::try_from(signal).map_err(|_| {
                    FusionError::InvalidArgument(format!("bad signal {signal}"))
                })?)
            };
            debug!(target: "fusion.world", id = %participant.id, pid = participant.pid, "killing participant");

            match nix_kill(pid, sig) {
                Ok(()) => {
                    if timeout_ms >= 0 {
                        let deadline = (timeout_ms > 0)
                            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
                        while pid_alive(participant.pid) {
                            std::thread::sleep(Duration::from_millis(1));
                            if let Some(deadline) = deadline {
                                if Instant::now() >= deadline {
                                    return Err(FusionError::Timeout);
                                }
                            }
                        }
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    // Exited without removing itself; reclaim now.
                    debug!(target: "fusion.world", id = %participant.id, "participant already dead");
                    if self.participants.remove(participant.id).is_some() {
                        self.root.root().refs.fetch_sub(1, Ordering::SeqCst);
                        let leave = LeaveMessage {
                            fusion_id: participant.id,
                        };
                        let _ = self.transport().send_self(&leave.to_frame());
                    }
                }
                Err(e) => {
                    return Err(FusionError::Io(std::io::Error::from_raw_os_error(e as i32)))
                }
            }
        }
        Ok(())
    }

    /// Master-side sweep for silently dead participants: each one found
    /// gets a synthetic LEAVE through our own dispatcher, which reclaims
    /// its references and fires the leave callback. The crashed slave's
    /// share of the root refcount is settled here, since it never ran its
    /// own exit. Returns how many were found.
    pub fn reap_dead_participants(&self) -> usize {
        if self.is_multi() && !self.is_master() {
            return 0;
        }
        let dead = self.participants.dead(self.fusion_id());
        for participant in &dead {
            info!(target: "fusion.world", id = %participant.id, pid = participant.pid, "reaping dead participant");
            // Remove the record first so a repeated sweep cannot reap the
            // same participant twice.
            if self.participants.remove(participant.id).is_none() {
                continue;
            }
            self.root.root().refs.fetch_sub(1, Ordering::SeqCst);
            let leave = LeaveMessage {
                fusion_id: participant.id,
            };
            let _ = self.transport().send_self(&leave.to_frame());
        }
        dead.len()
    }

    // ---------------------------------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------------------------------

    /// Register a call handler owned by this participant.
    pub fn register_call(&self, handler: CallHandler) -> CallHandle {
        self.calls.register(self.fusion_id(), handler)
    }

    pub fn unregister_call(&self, handle: CallHandle) {
        self.calls.unregister(handle);
    }

    /// Address of the world-refs call the master registered at init.
    pub fn refs_call_handle(&self) -> CallHandle {
        CallHandle {
            call_id: self.root.root().refs_call.load(Ordering::Relaxed) as CallId,
            owner: FusionId::MASTER,
        }
    }

    /// Synchronous call; blocks until the owner's handler returns.
    pub fn call_execute(&self, handle: CallHandle, arg: i32, data: &[u8]) -> Result<i32> {
        if handle.owner == self.fusion_id() {
            return self
                .calls
                .invoke(handle.call_id, self.fusion_id(), arg, data)
                .map(|(ret, _)| ret)
                .ok_or(FusionError::Destroyed);
        }
        let serial = self.calls.next_serial();
        let frame = call::call_frame(handle, self.fusion_id(), arg, data, serial, false);
        self.transport().send_to(handle.owner, &frame)?;
        self.calls.wait_return(serial).map(|(ret, _)| ret)
    }

    /// Extended call carrying a return buffer of `ret_size` bytes.
    pub fn call_execute3(
        &self,
        handle: CallHandle,
        arg: i32,
        data: &[u8],
        ret_size: u32,
    ) -> Result<(i32, Vec<u8>)> {
        if handle.owner == self.fusion_id() {
            return self
                .calls
                .invoke(handle.call_id, self.fusion_id(), arg, data)
                .map(|(ret, mut ret_data)| {
                    ret_data.truncate(ret_size as usize);
                    (ret, ret_data)
                })
                .ok_or(FusionError::Destroyed);
        }
        let serial = self.calls.next_serial();
        let frame = call::call3_frame(handle, self.fusion_id(), arg, data, serial, ret_size);
        self.transport().send_to(handle.owner, &frame)?;
        self.calls.wait_return(serial)
    }

    /// One-way call; never blocks on the handler.
    pub fn call_oneway(&self, handle: CallHandle, arg: i32, data: &[u8]) -> Result<()> {
        if handle.owner == self.fusion_id() {
            self.calls
                .invoke(handle.call_id, self.fusion_id(), arg, data);
            return Ok(());
        }
        let serial = self.calls.next_serial();
        let frame = call::call_frame(handle, self.fusion_id(), arg, data, serial, true);
        self.transport().send_to(handle.owner, &frame)
    }

    // ---------------------------------------------------------------------------------------------
    // References
    // ---------------------------------------------------------------------------------------------

    /// Master: create a shared reference.
    pub fn create_ref(&self) -> Result<RefId> {
        if !self.is_master() {
            return Err(FusionError::Unsupported(
                "refs are created by the master".into(),
            ));
        }
        Ok(self.refs.create())
    }

    pub fn ref_up(&self, ref_id: RefId) -> Result<()> {
        self.ref_change(ref_id, 1)
    }

    pub fn ref_down(&self, ref_id: RefId) -> Result<()> {
        self.ref_change(ref_id, -1)
    }

    fn ref_change(&self, ref_id: RefId, delta: i32) -> Result<()> {
        if self.is_master() {
            self.refs.adjust_own(ref_id, delta).map(|_| ())
        } else {
            self.refs.note_local(ref_id, delta);
            let handle = self.refs_call_handle();
            self.call_oneway(handle, ref_id as i32, &delta.to_ne_bytes())
        }
    }

    /// Master: observable count of a reference.
    pub fn ref_count(&self, ref_id: RefId) -> Option<i32> {
        self.refs.count(ref_id)
    }

    // ---------------------------------------------------------------------------------------------
    // Reactors
    // ---------------------------------------------------------------------------------------------

    pub fn reactor_create(&self) -> u32 {
        self.reactors.create()
    }

    pub fn reactor_attach(
        &self,
        reactor_id: u32,
        channel: u32,
        f: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> ReactionHandle {
        self.reactors.attach(reactor_id, channel, f)
    }

    pub fn reactor_detach(&self, handle: ReactionHandle) {
        self.reactors.detach(handle);
    }

    /// Publish to `(reactor, channel)`. In socket mode `self_too` runs
    /// local listeners inline; the in-process ring always routes through
    /// the dispatcher queue so delivery order matches arrival order.
    pub fn reactor_dispatch(
        &self,
        reactor_id: u32,
        channel: u32,
        payload: &[u8],
        self_too: bool,
    ) -> Result<()> {
        match self.mode {
            WorldMode::InProcess => self
                .transport()
                .broadcast(&reactor_frame(reactor_id, channel, payload)),
            WorldMode::Socket => {
                if self_too {
                    self.reactors.process(reactor_id, channel, payload);
                }
                self.transport()
                    .broadcast(&reactor_frame(reactor_id, channel, payload))
            }
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Pools
    // ---------------------------------------------------------------------------------------------

    /// Master: create an additional shared pool and tell everyone to
    /// attach.
    pub fn create_pool(&self, size: usize) -> Result<u32> {
        if !self.is_master() {
            return Err(FusionError::Unsupported(
                "pools are created by the master".into(),
            ));
        }
        let pool_id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let pool = SharedPool::create(&self.config, self.index, pool_id, size)?;
        self.pools.lock().insert(pool);
        let msg = ShmPoolMessage {
            op: ShmPoolOp::Attach,
            size: size as u64,
        };
        self.transport().broadcast(&msg.to_frame(pool_id))?;
        Ok(pool_id)
    }

    /// Allocate from the main pool.
    pub fn shm_alloc(&self, size: usize) -> Result<u64> {
        let pools = self.pools.lock();
        let pool = pools
            .get(MAIN_POOL_ID)
            .ok_or(FusionError::OutOfSharedMemory)?;
        pool.alloc(size)
    }

    pub fn shm_free(&self, offset: u64) -> Result<()> {
        let pools = self.pools.lock();
        let pool = pools
            .get(MAIN_POOL_ID)
            .ok_or(FusionError::OutOfSharedMemory)?;
        pool.free(offset)
    }

    // ---------------------------------------------------------------------------------------------
    // Cleanups, callbacks, world root
    // ---------------------------------------------------------------------------------------------

    /// Defer work to the dispatcher's next cleanup point.
    pub fn dispatch_cleanup_add(&self, f: impl FnOnce() + Send + 'static) -> CleanupHandle {
        self.cleanups.add(f)
    }

    pub fn dispatch_cleanup_remove(&self, handle: CleanupHandle) -> bool {
        self.cleanups.remove(handle)
    }

    pub fn set_leave_callback(&self, f: impl Fn(FusionId) + Send + Sync + 'static) {
        *self.leave_callback.lock() = Some(Box::new(f));
    }

    pub(crate) fn invoke_leave_callback(&self, leaver: FusionId) {
        let callback = self.leave_callback.lock();
        if let Some(ref f) = *callback {
            f(leaver);
        }
    }

    pub fn set_fork_action(&self, action: ForkAction) {
        *self.fork_action.lock() = action;
    }

    pub fn fork_action(&self) -> ForkAction {
        *self.fork_action.lock()
    }

    pub fn set_fork_callback(&self, f: impl Fn(ForkAction, ForkPhase) + Send + Sync + 'static) {
        *self.fork_callback.lock() = Some(Box::new(f));
    }

    pub(crate) fn invoke_fork_callback(&self, phase: ForkPhase) {
        let action = self.fork_action();
        let callback = self.fork_callback.lock();
        if let Some(ref f) = *callback {
            f(action, phase);
        }
    }

    /// Master-settable world root object id.
    pub fn set_world_root(&self, object_id: u64) -> Result<()> {
        if !self.is_master() {
            return Err(FusionError::Unsupported(
                "only the master sets the world root".into(),
            ));
        }
        self.root
            .root()
            .world_root
            .store(object_id, Ordering::Relaxed);
        Ok(())
    }

    pub fn world_root(&self) -> u64 {
        self.root.root().world_root.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------------------------------
    // Fork support (called by the fork coordinator)
    // ---------------------------------------------------------------------------------------------

    pub(crate) fn fork_parent(&self) {
        if self.fork_action() != ForkAction::Fork {
            return;
        }
        if self.is_master() {
            self.root.root().refs.fetch_add(1, Ordering::SeqCst);
        }
        // The child inherits our endpoint until it re-enters; stop the
        // dispatcher so both processes cannot consume the same socket.
        // The child re-arms the flag and restarts its own dispatcher as
        // part of the FORK action.
        if self.is_multi() {
            let _ = self.stop_dispatcher(false);
        }
    }

    /// Child-side FORK action: fresh participant id, duplicated ref
    /// counts, restarted tasks.
    pub(crate) fn fork_child_fork(world: &Arc<World>) -> Result<()> {
        if !world.is_multi() {
            return Ok(());
        }
        let transport = SocketTransport::open_slave(&world.config, world.index)?;
        let new_id = transport.fusion_id();
        info!(target: "fusion.world", index = world.index, id = %new_id, "re-entered world after fork");

        world.fusion_id.store(new_id.0, Ordering::SeqCst);
        *world.transport.lock() = Arc::new(transport);
        world.dispatch_stop.store(false, Ordering::SeqCst);
        // Neither task exists in the child; drop the stale handles and
        // re-arm the deferred channel before restarting both.
        *world.dispatcher.lock() = None;
        world.deferred.reset_after_fork();

        // Duplicate our reference holdings under the new identity.
        let handle = world.refs_call_handle();
        for (ref_id, count) in world.refs.local_snapshot() {
            world.call_oneway(handle, ref_id as i32, &count.to_ne_bytes())?;
        }

        Self::start_tasks(world)
    }

    /// Child-side CLOSE action: drop all cross-process state.
    pub(crate) fn fork_child_close(&self) {
        unregister_world(self.index);
    }

    /// Send a zero-payload SEND frame to ourselves (dispatcher wake-up).
    pub fn wake_dispatcher(&self) -> Result<()> {
        self.transport().send_self(&wakeup_frame())
    }

    /// Post a raw frame to our own dispatcher, the local equivalent of the
    /// kernel device's SEND_MESSAGE operation.
    pub fn post_message(&self, frame: &[u8]) -> Result<()> {
        self.transport().send_self(frame)
    }

    /// Error-log helper shared by dispatcher paths.
    pub(crate) fn log_dispatch_error(&self, context: &str, err: &FusionError) {
        error!(target: "fusion.dispatch", world = self.index, %err, "{context}");
    }
}
