//! Configuration loading and validation.
//!
//! Values are layered with `figment`: built-in defaults first, then an
//! optional TOML, YAML or JSON file, then `MEDIACACHE_*` environment
//! variables. Durations are whole seconds; the cache engine itself only ever
//! sees the resulting [`Settings`].

pub mod error;

use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use mediacache_cache::{EncodeParams, Settings, default_max_workers};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{ErrorKind, Result};

/// Prefix of environment variables overriding configuration keys.
pub const ENV_PREFIX: &str = "MEDIACACHE_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the index and all cached output.
    pub cache_dir: PathBuf,
    /// Seconds an unused entry is kept. `0` keeps entries forever.
    pub expiry_time: u64,
    /// Seconds without readers after which a worker pauses.
    pub max_inactive_suspend: u64,
    /// Seconds without readers after which a worker gives up.
    pub max_inactive_abort: u64,
    /// Bytes to produce before the first open returns.
    pub prebuffer_size: usize,
    /// Upper bound on the total encoded size in bytes. `0` is unlimited.
    pub max_cache_size: u64,
    /// Free disk space to keep, in bytes.
    pub min_diskspace: u64,
    /// Seconds between maintenance runs. `0` disables scheduled maintenance.
    pub cache_maintenance: u64,
    /// Concurrent workers. `0` picks a value from the number of CPUs.
    pub max_workers: usize,
    pub disable_cache: bool,
    /// Empty the cache on startup.
    pub clear_cache: bool,

    pub audio_bitrate: u64,
    pub audio_samplerate: u32,
    pub video_bitrate: u64,
    pub video_width: u32,
    pub video_height: u32,
    pub deinterlace: bool,
}

impl Default for Config {
    fn default() -> Self {
        let params = EncodeParams::default();
        Self {
            cache_dir: default_cache_dir(),
            expiry_time: Settings::DEFAULT_EXPIRY.as_secs(),
            max_inactive_suspend: Settings::DEFAULT_SUSPEND.as_secs(),
            max_inactive_abort: Settings::DEFAULT_ABORT.as_secs(),
            prebuffer_size: Settings::DEFAULT_PREBUFFER,
            max_cache_size: 0,
            min_diskspace: 0,
            cache_maintenance: Settings::DEFAULT_MAINTENANCE_INTERVAL.as_secs(),
            max_workers: 0,
            disable_cache: false,
            clear_cache: false,
            audio_bitrate: params.audio_bitrate,
            audio_samplerate: params.audio_samplerate,
            video_bitrate: params.video_bitrate,
            video_width: params.video_width,
            video_height: params.video_height,
            deinterlace: params.deinterlace,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "mediacache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("mediacache"))
}

impl Config {
    /// Layer defaults, the optional `file` and the environment, then
    /// validate the result.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = match path.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file_exact(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
                Some("json") => figment.merge(Json::file_exact(path)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(path.to_path_buf())),
            };
        }
        let config: Config = figment.merge(Env::prefixed(ENV_PREFIX)).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cache_dir.is_absolute() {
            exn::bail!(ErrorKind::Invalid { key: "cache_dir", reason: "must be an absolute path" });
        }
        if self.max_inactive_abort < self.max_inactive_suspend {
            exn::bail!(ErrorKind::Invalid {
                key: "max_inactive_abort",
                reason: "must not be shorter than max_inactive_suspend",
            });
        }
        Ok(())
    }

    pub fn params(&self) -> EncodeParams {
        EncodeParams {
            audio_bitrate: self.audio_bitrate,
            audio_samplerate: self.audio_samplerate,
            video_bitrate: self.video_bitrate,
            video_width: self.video_width,
            video_height: self.video_height,
            deinterlace: self.deinterlace,
        }
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            params: config.params(),
            expiry: Duration::from_secs(config.expiry_time),
            max_inactive_suspend: Duration::from_secs(config.max_inactive_suspend),
            max_inactive_abort: Duration::from_secs(config.max_inactive_abort),
            prebuffer_size: config.prebuffer_size,
            max_cache_size: config.max_cache_size,
            min_diskspace: config.min_diskspace,
            max_workers: match config.max_workers {
                0 => default_max_workers(),
                n => n,
            },
            maintenance_interval: Duration::from_secs(config.cache_maintenance),
            disable_cache: config.disable_cache,
            clear_on_start: config.clear_cache,
        }
    }
}
