//! Runtime configuration for the Fusion stack.
//!
//! Sources, in increasing precedence: built-in defaults, an optional
//! `fusion.toml` (unknown fields are ignored so the file can evolve
//! ahead of the code), then `FUSION_*` environment variables. The parsed
//! result is immutable for the lifetime of a world; callers snapshot it
//! once at enter time.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default presentation interval when neither surface nor client override
/// it: 60 Hz in microseconds.
pub const DEFAULT_FRAME_INTERVAL_US: i64 = 16_667;

/// Default bound on how far ahead of `now` frame times may run.
pub const DEFAULT_MAX_FRAME_ADVANCE_US: i64 = 100_000;

#[derive(Debug, Deserialize, Default, Clone)]
pub struct WorldFileConfig {
    /// tmpfs mount carrying the shared root file (default: /dev/shm).
    #[serde(default)]
    pub tmpfs: Option<PathBuf>,
    /// Base directory for socket endpoints (default: /tmp).
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    /// Group id applied to shared files and socket directories.
    #[serde(default)]
    pub shmfile_gid: Option<u32>,
    /// Restrict shared-root write mapping to the master.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub debug_shm: bool,
    /// Run destructor-class calls on the deferred thread.
    #[serde(default)]
    pub defer_destructors: bool,
    /// Force every enter into the slave role.
    #[serde(default)]
    pub force_slave: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct GraphicsFileConfig {
    /// Emit driver commands at state release instead of batching.
    #[serde(default)]
    pub emit_early: bool,
    /// Busy/idle stats interval in milliseconds; 0 disables accounting.
    #[serde(default)]
    pub stats_interval_ms: u64,
    /// Never use hardware acceleration.
    #[serde(default)]
    pub software_only: bool,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct SurfaceFileConfig {
    #[serde(default)]
    pub frame_interval_us: Option<i64>,
    #[serde(default)]
    pub max_frame_advance_us: Option<i64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct ConfigFile {
    #[serde(default)]
    pub world: WorldFileConfig,
    #[serde(default)]
    pub graphics: GraphicsFileConfig,
    #[serde(default)]
    pub surface: SurfaceFileConfig,
}

/// Effective configuration after file parsing and env overrides.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub tmpfs: PathBuf,
    pub socket_dir: PathBuf,
    pub shmfile_gid: Option<u32>,
    pub secure: bool,
    pub debug_shm: bool,
    pub defer_destructors: bool,
    pub force_slave: bool,
    pub gfx_emit_early: bool,
    pub gfx_stats_interval_ms: u64,
    pub software_only: bool,
    pub frame_interval_us: i64,
    pub max_frame_advance_us: i64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            tmpfs: PathBuf::from("/dev/shm"),
            socket_dir: PathBuf::from("/tmp"),
            shmfile_gid: None,
            secure: false,
            debug_shm: false,
            defer_destructors: false,
            force_slave: false,
            gfx_emit_early: false,
            gfx_stats_interval_ms: 0,
            software_only: false,
            frame_interval_us: DEFAULT_FRAME_INTERVAL_US,
            max_frame_advance_us: DEFAULT_MAX_FRAME_ADVANCE_US,
        }
    }
}

impl FusionConfig {
    /// Load `fusion.toml` from the given path (if it exists) and apply
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<FusionConfig> {
        let mut config = FusionConfig::default();

        if let Some(path) = path {
            if path.exists() {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let file: ConfigFile = toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                config.apply_file(&file);
                info!(target: "fusion.config", path = %path.display(), "loaded config file");
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, no file. This is what worlds
    /// use when the host application does not pass a config path.
    pub fn from_env() -> FusionConfig {
        let mut config = FusionConfig::default();
        config.apply_env();
        config
    }

    fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(ref tmpfs) = file.world.tmpfs {
            self.tmpfs = tmpfs.clone();
        }
        if let Some(ref dir) = file.world.socket_dir {
            self.socket_dir = dir.clone();
        }
        if file.world.shmfile_gid.is_some() {
            self.shmfile_gid = file.world.shmfile_gid;
        }
        self.secure |= file.world.secure;
        self.debug_shm |= file.world.debug_shm;
        self.defer_destructors |= file.world.defer_destructors;
        self.force_slave |= file.world.force_slave;
        self.gfx_emit_early |= file.graphics.emit_early;
        if file.graphics.stats_interval_ms != 0 {
            self.gfx_stats_interval_ms = file.graphics.stats_interval_ms;
        }
        self.software_only |= file.graphics.software_only;
        if let Some(us) = file.surface.frame_interval_us {
            self.frame_interval_us = us;
        }
        if let Some(us) = file.surface.max_frame_advance_us {
            self.max_frame_advance_us = us;
        }
    }

    fn apply_env(&mut self) {
        if let Some(path) = env_path("FUSION_TMPFS") {
            self.tmpfs = path;
        }
        if let Some(path) = env_path("FUSION_SOCKET_DIR") {
            self.socket_dir = path;
        }
        if let Ok(gid) = env::var("FUSION_SHMFILE_GID") {
            if let Ok(gid) = gid.parse() {
                self.shmfile_gid = Some(gid);
            }
        }
        self.secure |= env_flag("FUSION_SECURE");
        self.debug_shm |= env_flag("FUSION_DEBUG_SHM");
        self.defer_destructors |= env_flag("FUSION_DEFER_DESTRUCTORS");
        self.force_slave |= env_flag("FUSION_FORCE_SLAVE");
        self.gfx_emit_early |= env_flag("FUSION_GFX_EMIT_EARLY");
        if let Some(ms) = env_number("FUSION_GFX_STATS_MS") {
            self.gfx_stats_interval_ms = ms as u64;
        }
        self.software_only |= env_flag("FUSION_SOFTWARE_ONLY");
        if let Some(us) = env_number("FUSION_FRAME_INTERVAL_US") {
            self.frame_interval_us = us;
        }
        if let Some(us) = env_number("FUSION_MAX_FRAME_ADVANCE_US") {
            self.max_frame_advance_us = us;
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name).map(PathBuf::from)
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

fn env_number(name: &str) -> Option<i64> {
    env::var(name).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = FusionConfig::default();
        assert_eq!(config.tmpfs, PathBuf::from("/dev/shm"));
        assert_eq!(config.frame_interval_us, DEFAULT_FRAME_INTERVAL_US);
        assert!(!config.defer_destructors);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[world]\ntmpfs = \"/run/shm\"\ndefer_destructors = true\n\n\
             [graphics]\nstats_interval_ms = 500\n\n\
             [surface]\nframe_interval_us = 20000\n"
        )
        .unwrap();

        let config = FusionConfig::load(Some(&path)).unwrap();
        assert_eq!(config.tmpfs, PathBuf::from("/run/shm"));
        assert!(config.defer_destructors);
        assert_eq!(config.gfx_stats_interval_ms, 500);
        assert_eq!(config.frame_interval_us, 20_000);
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.toml");
        fs::write(&path, "[world]\nfuture_knob = 3\n").unwrap();
        assert!(FusionConfig::load(Some(&path)).is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = FusionConfig::load(Some(Path::new("/nonexistent/fusion.toml"))).unwrap();
        assert_eq!(config.socket_dir, PathBuf::from("/tmp"));
    }
}
