//! Eviction policy: expiry, size cap and free disk space.
//!
//! Every pass reads the index, picks victims oldest-access-first and removes
//! them through [`Cache::delete_entry`], which also tears down live entries.
//! A victim that cannot be removed is logged and skipped; the pass carries on.

use exn::ResultExt;
use fs2::FileExt;
use mediacache_index::Key;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::UtcDateTime;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::cache::Cache;
use crate::error::{ErrorKind, Result};

/// File inside the cache directory whose lock elects the maintenance instance.
pub const ELECTION_FILE: &str = "maintenance.lock";

/// Free-space probe for the filesystem holding the cache.
pub trait DiskSpace: Send + Sync {
    /// Bytes available to unprivileged users below `path`.
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

impl Cache {
    /// Run all three pruning passes, making room for `predicted_size` more
    /// bytes. Every pass runs even if an earlier one failed; the first error
    /// is returned.
    pub async fn maintenance(&self, predicted_size: u64) -> Result<()> {
        self.maintenance_excluding(predicted_size, None).await
    }

    /// [`maintenance`](Self::maintenance), never choosing `exclude` as a
    /// victim. A worker uses this to keep its own entry alive.
    #[instrument(level = "debug", skip(self, exclude))]
    pub(crate) async fn maintenance_excluding(&self, predicted_size: u64, exclude: Option<&Key>) -> Result<()> {
        let expired = self.prune_expired_excluding(exclude).await;
        let size = self.prune_cache_size_excluding(exclude).await;
        let space = self.prune_disk_space_excluding(predicted_size, exclude).await;
        expired?;
        size?;
        space?;
        Ok(())
    }

    /// Delete entries not accessed within the configured expiry.
    pub async fn prune_expired(&self) -> Result<usize> {
        self.prune_expired_excluding(None).await
    }

    /// Delete least recently used entries until the total encoded size fits
    /// under the configured cap.
    pub async fn prune_cache_size(&self) -> Result<usize> {
        self.prune_cache_size_excluding(None).await
    }

    /// Delete least recently used entries until `min_diskspace +
    /// predicted_size` bytes are free.
    pub async fn prune_disk_space(&self, predicted_size: u64) -> Result<usize> {
        self.prune_disk_space_excluding(predicted_size, None).await
    }

    async fn prune_expired_excluding(&self, exclude: Option<&Key>) -> Result<usize> {
        let expiry = self.settings().expiry;
        if expiry.is_zero() {
            return Ok(0);
        }
        let Some(cutoff) = time::Duration::try_from(expiry).ok().and_then(|expiry| UtcDateTime::now().checked_sub(expiry))
        else {
            return Ok(0);
        };
        let candidates = self.index().list_expired(cutoff).await.or_raise(|| ErrorKind::Index)?;
        let mut pruned = 0;
        for key in candidates {
            if exclude == Some(&key) {
                continue;
            }
            // The index lags behind live entries; trust the in-memory access.
            if let Some(entry) = self.resident(&key)
                && entry.metadata().accessed_at >= cutoff
            {
                trace!(%key, "expired in index but recently used");
                continue;
            }
            if self.prune(&key, "expired").await {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned expired cache entries");
        }
        Ok(pruned)
    }

    async fn prune_cache_size_excluding(&self, exclude: Option<&Key>) -> Result<usize> {
        let limit = self.settings().max_cache_size;
        if limit == 0 {
            return Ok(0);
        }
        let mut total = self.index().total_encoded_size().await.or_raise(|| ErrorKind::Index)?;
        if total <= limit {
            return Ok(0);
        }
        debug!(total, limit, "cache exceeds size limit");
        let candidates = self.index().list_by_access().await.or_raise(|| ErrorKind::Index)?;
        let mut pruned = 0;
        for (key, size) in candidates {
            if total <= limit {
                break;
            }
            if size == 0 || exclude == Some(&key) {
                continue;
            }
            if self.prune(&key, "over size limit").await {
                total = total.saturating_sub(size);
                pruned += 1;
            }
        }
        info!(pruned, total, limit, "pruned cache down to size limit");
        Ok(pruned)
    }

    async fn prune_disk_space_excluding(&self, predicted_size: u64, exclude: Option<&Key>) -> Result<usize> {
        let dir = &self.settings().cache_dir;
        let needed = self.settings().min_diskspace.saturating_add(predicted_size);
        let mut available = match self.disk().available(dir) {
            Ok(available) => available,
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(libc::EIO);
                return Err(err).or_raise(|| ErrorKind::Source(dir.clone(), errno));
            },
        };
        if available >= needed {
            return Ok(0);
        }
        debug!(available, needed, "free disk space below limit");
        let candidates = self.index().list_by_access().await.or_raise(|| ErrorKind::Index)?;
        let mut pruned = 0;
        for (key, size) in candidates {
            if available >= needed {
                break;
            }
            if exclude == Some(&key) {
                continue;
            }
            if self.prune(&key, "low disk space").await {
                available = available.saturating_add(size);
                pruned += 1;
            }
        }
        if available < needed {
            warn!(available, needed, "cannot free enough disk space");
            exn::bail!(ErrorKind::OutOfSpace { needed, available });
        }
        info!(pruned, available, "freed disk space");
        Ok(pruned)
    }

    async fn prune(&self, key: &Key, reason: &'static str) -> bool {
        match self.delete_entry(key).await {
            Ok(()) => {
                debug!(%key, reason, "pruned cache entry");
                true
            },
            Err(err) => {
                warn!(%key, reason, error = ?err, "could not prune cache entry");
                false
            },
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Run [`maintenance`](Self::maintenance) every `interval` in the
    /// background, but only while this process holds the election lock in the
    /// cache directory. Returns `None` if `interval` is zero.
    ///
    /// The task ends when the returned handle is stopped or dropped, when the
    /// cache shuts down, or once nothing else holds the cache. [`Cache::new`]
    /// already schedules one at `settings.maintenance_interval`.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> Option<MaintenanceTask> {
        if interval.is_zero() {
            return None;
        }
        let token = self.shutdown_token().child_token();
        let handle = tokio::spawn(maintenance_loop(Arc::downgrade(self), interval, token.clone()));
        info!(?interval, "maintenance scheduled");
        Some(MaintenanceTask { token, handle: Some(handle) })
    }

    /// Try to become the maintenance instance for this cache directory. The
    /// lock lives as long as the returned file.
    fn elect(&self) -> Option<File> {
        let path = self.settings().cache_dir.join(ELECTION_FILE);
        let file = match OpenOptions::new().create(true).truncate(false).write(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot open maintenance lock");
                return None;
            },
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("elected to run maintenance");
                Some(file)
            },
            Err(_) => None,
        }
    }
}

async fn maintenance_loop(cache: Weak<Cache>, interval: Duration, token: CancellationToken) {
    let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut election: Option<File> = None;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticks.tick() => {},
        }
        let Some(cache) = cache.upgrade() else {
            break;
        };
        if election.is_none() {
            election = cache.elect();
            if election.is_none() {
                trace!("another instance runs maintenance");
                continue;
            }
        }
        if let Err(err) = cache.maintenance(0).await {
            warn!(error = ?err, "scheduled maintenance failed");
        }
    }
    debug!("maintenance stopped");
}

/// Handle to the background maintenance task.
#[derive(Debug)]
pub struct MaintenanceTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceTask {
    /// Stop the task and wait for a run in progress to finish.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            _ = handle.await;
        }
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
