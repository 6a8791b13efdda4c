//! Fusion host process.
//!
//! `fusiond serve` enters a world as master and answers a doubling echo
//! call; the slave subcommands exercise the cross-process paths (calls,
//! reference holding, crash recovery) and double as the driver for the
//! multi-process integration tests.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fusion_config::FusionConfig;
use fusion_protocol::{EnterRole, RefId, WorldIndex};
use fusion_world::World;
use std::path::PathBuf;
use std::sync::Once;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "fusiond", version, about = "Fusion world host")]
struct Args {
    /// Optional configuration file path (overrides discovery of `fusion.toml`).
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Write logs to this file instead of stderr.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enter as master and serve calls until the deadline (0 = forever).
    Serve {
        #[arg(long, default_value_t = 0)]
        world: WorldIndex,
        #[arg(long = "for-ms", default_value_t = 0)]
        for_ms: u64,
    },
    /// Enter as slave, execute the master's echo call, print the result.
    Ping {
        #[arg(long, default_value_t = 0)]
        world: WorldIndex,
        #[arg(long, default_value_t = 42)]
        value: i32,
    },
    /// Enter as slave, hold a reference up `count` times, then wait.
    RefHold {
        #[arg(long, default_value_t = 0)]
        world: WorldIndex,
        #[arg(long = "ref")]
        ref_id: RefId,
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// How long to stay alive afterwards (0 = forever).
        #[arg(long = "hold-ms", default_value_t = 0)]
        hold_ms: u64,
    },
    /// Single-process smoke run of the drawing pipeline.
    DrawDemo {
        #[arg(long, default_value_t = 64)]
        frames: u32,
    },
}

/// World ABI of this build.
const WORLD_ABI: i32 = 46;

fn configure_logging(log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let guard = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .context("log file has no file name")?
                .to_string_lossy()
                .to_string();
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };
    Ok(guard)
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            error!(target: "runtime.panic", ?info, "panic");
            default_panic(info);
        }));
    });
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = configure_logging(args.log_file.as_ref())?;
    install_panic_hook();

    let config = FusionConfig::load(args.config.as_deref())?;

    match args.command {
        Command::Serve { world, for_ms } => serve(config, world, for_ms),
        Command::Ping { world, value } => ping(config, world, value),
        Command::RefHold {
            world,
            ref_id,
            count,
            hold_ms,
        } => ref_hold(config, world, ref_id, count, hold_ms),
        Command::DrawDemo { frames } => draw_demo(config, frames),
    }
}

fn serve(config: FusionConfig, index: WorldIndex, for_ms: u64) -> Result<()> {
    let world = World::enter_with(config, Some(index), WORLD_ABI, EnterRole::Master)?;
    info!(target: "fusiond", index, "serving world");

    // The echo call doubles its argument; its id is published through the
    // world root so slaves can find it without a side channel.
    let echo = world.register_call(Box::new(|caller, arg, _| {
        info!(target: "fusiond", caller = %caller, arg, "echo call");
        (arg * 2, Vec::new())
    }));
    world.set_world_root(echo.call_id as u64)?;
    world.activate()?;

    println!("serving");

    let deadline = (for_ms > 0).then(|| Instant::now() + Duration::from_millis(for_ms));
    loop {
        std::thread::sleep(Duration::from_millis(20));
        world.reap_dead_participants();
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    world.exit(false)?;
    Ok(())
}

fn ping(config: FusionConfig, index: WorldIndex, value: i32) -> Result<()> {
    let world = World::enter_with(config, Some(index), WORLD_ABI, EnterRole::Slave)?;

    let call_id = world.world_root() as u32;
    if call_id == 0 {
        world.exit(false)?;
        bail!("master has not published its echo call");
    }
    let handle = fusion_world::CallHandle {
        call_id,
        owner: fusion_protocol::FusionId::MASTER,
    };

    let ret = world.call_execute(handle, value, &[])?;
    println!("ret={ret}");

    world.exit(false)?;
    Ok(())
}

fn ref_hold(
    config: FusionConfig,
    index: WorldIndex,
    ref_id: RefId,
    count: u32,
    hold_ms: u64,
) -> Result<()> {
    let world = World::enter_with(config, Some(index), WORLD_ABI, EnterRole::Slave)?;

    for _ in 0..count {
        world.ref_up(ref_id)?;
    }
    println!("holding {count}");

    let deadline = (hold_ms > 0).then(|| Instant::now() + Duration::from_millis(hold_ms));
    loop {
        std::thread::sleep(Duration::from_millis(10));
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                break;
            }
        }
    }

    world.exit(false)?;
    Ok(())
}

/// Drive the full producer path in one process: world, surface store,
/// serializer (software-only), flip/ack against a self-acking consumer.
fn draw_demo(config: FusionConfig, frames: u32) -> Result<()> {
    use fusion_card::{GraphicsCore, NullRasterizer};
    use fusion_surface::{
        FlipFlags, Rectangle, Region, SurfaceClient, SurfaceConfig, SurfaceStore,
    };

    let world = World::enter_single_with(config.clone(), 0, WORLD_ABI)?;
    let store = SurfaceStore::new();
    let surface = store.create(SurfaceConfig::new(640, 480, 2))?;

    let core = GraphicsCore::new(
        world.root_mapping(),
        config.clone(),
        world.fusion_id(),
        None,
        std::sync::Arc::new(NullRasterizer),
    );
    let mut state = core.new_state();
    state.set_destination(Some(surface.clone()));
    state.set_clip(Region::whole(640, 480));

    // The consumer: a reactor listener acking every presented frame.
    let reactor = world.reactor_create();
    {
        let surface = surface.clone();
        world.reactor_attach(reactor, 0, move |payload| {
            if let Ok(bytes) = <[u8; 4]>::try_from(payload) {
                surface.frame_ack(u32::from_ne_bytes(bytes));
            }
        });
    }

    let client = SurfaceClient::new(surface.clone(), &config);
    for frame in 0..frames {
        core.fill_rectangles(
            &mut state,
            &[Rectangle::new((frame % 600) as i32, 40, 40, 40)],
        );
        core.flush()?;

        client.flip(None, FlipFlags::NOWAIT)?;
        world.reactor_dispatch(reactor, 0, &client.local_flip_count().to_ne_bytes(), false)?;
    }

    // Let the dispatcher drain the last acks before reporting.
    world.sync()?;
    std::thread::sleep(Duration::from_millis(50));
    println!(
        "frames={} flips={} acked={}",
        frames,
        client.local_flip_count(),
        surface.flips_acked()
    );

    world.exit(false)?;
    Ok(())
}
