//! Multi-process scenarios driven through the fusiond binary.

use fusion_config::FusionConfig;
use fusion_protocol::EnterRole;
use fusion_shm::root_file_path;
use fusion_world::World;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const WORLD_ABI: i32 = 46;

fn hermetic_config(dir: &Path) -> FusionConfig {
    let mut config = FusionConfig::default();
    config.tmpfs = dir.join("shm");
    config.socket_dir = dir.join("sock");
    std::fs::create_dir_all(&config.tmpfs).unwrap();
    std::fs::create_dir_all(&config.socket_dir).unwrap();
    config
}

fn fusiond(config: &FusionConfig) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_fusiond"));
    command
        .env("FUSION_TMPFS", &config.tmpfs)
        .env("FUSION_SOCKET_DIR", &config.socket_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    command
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let stop = Instant::now() + deadline;
    while Instant::now() < stop {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn master_slave_ping() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let master = World::enter_with(config.clone(), Some(0), WORLD_ABI, EnterRole::Master).unwrap();
    assert!(master.is_master());

    // The echo call answers arg * 2; slaves find it through the world
    // root.
    let echo = master.register_call(Box::new(|_, arg, _| (arg * 2, Vec::new())));
    master.set_world_root(echo.call_id as u64).unwrap();

    let output = fusiond(&config)
        .args(["ping", "--world", "0", "--value", "42"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "ping failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ret=84"), "unexpected output: {stdout}");

    // The slave's LEAVE is processed before the master leaves; exiting
    // last removes the shared root file and the socket directory.
    master.exit(false).unwrap();
    assert!(!root_file_path(&config, 0).exists());
    assert!(!config.socket_dir.join(".fusion-0").exists());
}

#[test]
fn slave_death_reclaims_refs() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let master = World::enter_with(config.clone(), Some(1), WORLD_ABI, EnterRole::Master).unwrap();
    let ref_id = master.create_ref().unwrap();

    let mut child = fusiond(&config)
        .args([
            "ref-hold",
            "--world",
            "1",
            "--ref",
            &ref_id.to_string(),
            "--count",
            "3",
            "--hold-ms",
            "60000",
        ])
        .spawn()
        .unwrap();

    // The three one-way ups arrive through the dispatcher.
    assert!(
        wait_until(Duration::from_secs(10), || master.ref_count(ref_id)
            == Some(3)),
        "ref never reached count 3 (got {:?})",
        master.ref_count(ref_id)
    );

    // Crash the holder without any goodbye.
    child.kill().unwrap();
    child.wait().unwrap();

    // The sweep notices the dead pid and routes a synthetic LEAVE through
    // the dispatcher, which releases exactly the holder's three counts.
    assert!(wait_until(Duration::from_secs(10), || {
        master.reap_dead_participants();
        master.ref_count(ref_id) == Some(0)
    }));

    master.exit(false).unwrap();
}

#[test]
fn leave_callback_fires_for_departing_slave() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let master = World::enter_with(config.clone(), Some(2), WORLD_ABI, EnterRole::Master).unwrap();
    let echo = master.register_call(Box::new(|_, arg, _| (arg * 2, Vec::new())));
    master.set_world_root(echo.call_id as u64).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    master.set_leave_callback(move |leaver| {
        let _ = tx.send(leaver);
    });

    let output = fusiond(&config)
        .args(["ping", "--world", "2", "--value", "1"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let leaver = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(!leaver.is_master());

    master.exit(false).unwrap();
}

#[test]
fn stale_master_cleanup_promotes_reentry() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    // Fabricate a dead world: the master endpoint file exists, but
    // nothing listens behind it.
    let world_dir = config.socket_dir.join(".fusion-3");
    std::fs::create_dir_all(&world_dir).unwrap();
    {
        let _stale = std::os::unix::net::UnixDatagram::bind(world_dir.join("1")).unwrap();
    }
    assert!(world_dir.join("1").exists());

    // Entering with ANY role sweeps the stale directory on the failed
    // slave handshake, retries from the top and becomes master.
    let world = World::enter_with(config.clone(), Some(3), WORLD_ABI, EnterRole::Any).unwrap();
    assert!(world.is_master());
    world.exit(false).unwrap();
}

#[test]
fn fork_parent_phase_bumps_refs_and_stops_the_dispatcher() {
    use fusion_protocol::{FusionId, LeaveMessage};
    use fusion_world::{fork, ForkAction};
    use std::sync::atomic::Ordering;

    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let master = World::enter_with(config.clone(), Some(5), WORLD_ABI, EnterRole::Master).unwrap();
    master.set_fork_action(ForkAction::Fork);

    let refs_before = master.shared_root().refs.load(Ordering::SeqCst);

    // The phases an application brackets around its own fork(); no child
    // exists here, which leaves the parent exactly as the PARENT phase
    // does: shared refcount bumped for the child, dispatcher stopped so
    // the inherited endpoint cannot be consumed twice.
    fork::prepare();
    fork::parent();

    assert_eq!(
        master.shared_root().refs.load(Ordering::SeqCst),
        refs_before + 1
    );

    // The stopped dispatcher consumes nothing: a LEAVE posted to our own
    // endpoint never reaches the leave callback.
    let (tx, rx) = std::sync::mpsc::channel();
    master.set_leave_callback(move |leaver| {
        let _ = tx.send(leaver);
    });
    master
        .post_message(&LeaveMessage {
            fusion_id: FusionId(9),
        }
        .to_frame())
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    master.exit(false).unwrap();
}

#[test]
fn draw_demo_smoke() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let output = fusiond(&config)
        .args(["draw-demo", "--frames", "8"])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "draw-demo failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("frames=8"), "unexpected output: {stdout}");
}

#[test]
fn second_master_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = hermetic_config(dir.path());

    let master = World::enter_with(config.clone(), Some(4), WORLD_ABI, EnterRole::Master).unwrap();

    let output = fusiond(&config)
        .args(["--log-file", "/dev/null", "serve", "--world", "4", "--for-ms", "10"])
        .output()
        .unwrap();
    assert!(!output.status.success());

    master.exit(false).unwrap();
}
