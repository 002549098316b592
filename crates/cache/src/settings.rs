use mediacache_index::EncodeParams;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs of the cache engine.
///
/// Durations are plain [`Duration`]s; a zero `expiry` or
/// `maintenance_interval` disables that mechanism, a zero `max_cache_size`
/// means the cache may grow without limit.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the index and every cache file.
    pub cache_dir: PathBuf,
    /// Encoder settings new output is produced with.
    pub params: EncodeParams,
    /// Entries not accessed for this long are pruned.
    pub expiry: Duration,
    /// Idle time after which a worker with no readers pauses.
    pub max_inactive_suspend: Duration,
    /// Idle time after which a worker with no readers gives up.
    pub max_inactive_abort: Duration,
    /// Bytes a worker must produce before the opener is released.
    pub prebuffer_size: usize,
    /// Upper bound on the sum of encoded sizes, in bytes.
    pub max_cache_size: u64,
    /// Free disk space to keep available, in bytes.
    pub min_diskspace: u64,
    /// Maximum number of concurrently running workers.
    pub max_workers: usize,
    /// Period of the maintenance timer [`Cache::new`](crate::Cache::new)
    /// schedules.
    pub maintenance_interval: Duration,
    /// Never reuse previous output; every open starts a fresh decode.
    pub disable_cache: bool,
    /// Delete every cache entry when the cache is created.
    pub clear_on_start: bool,
}

impl Settings {
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24 * 7);
    pub const DEFAULT_SUSPEND: Duration = Duration::from_secs(15);
    pub const DEFAULT_ABORT: Duration = Duration::from_secs(30);
    pub const DEFAULT_PREBUFFER: usize = 100 * 1024;
    pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

    /// Default settings rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            params: EncodeParams::default(),
            expiry: Self::DEFAULT_EXPIRY,
            max_inactive_suspend: Self::DEFAULT_SUSPEND,
            max_inactive_abort: Self::DEFAULT_ABORT,
            prebuffer_size: Self::DEFAULT_PREBUFFER,
            max_cache_size: 0,
            min_diskspace: 0,
            max_workers: default_max_workers(),
            maintenance_interval: Self::DEFAULT_MAINTENANCE_INTERVAL,
            disable_cache: false,
            clear_on_start: false,
        }
    }
}

/// Sixteen workers per available CPU.
pub fn default_max_workers() -> usize {
    16 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
