//! The registry of cache entries.

use exn::ResultExt;
use mediacache_buffer::cache_file;
use mediacache_index::{CacheIndex, CacheMetadata, Database, INDEX_FILE, Key, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, trace, warn};

use crate::entry::{CacheEntry, Close, SourceSnapshot};
use crate::error::{ErrorKind, Result};
use crate::gate::AdmissionGate;
use crate::maintenance::{DiskSpace, MaintenanceTask, SystemDiskSpace};
use crate::settings::Settings;
use crate::transcoder::TranscoderFactory;
use crate::worker::{Ready, Worker};

/// The transcoding cache.
///
/// Maps every [`Key`] to at most one [`CacheEntry`], owns the durable index,
/// and starts (at most) one worker per entry. Construct it once and share it
/// behind an `Arc` with everything that reads from it.
pub struct Cache {
    settings: Settings,
    db: Database,
    index: CacheIndex,
    entries: Mutex<HashMap<Key, Arc<CacheEntry>>>,
    gate: AdmissionGate,
    factory: Arc<dyn TranscoderFactory>,
    disk: Arc<dyn DiskSpace>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    /// Scheduled maintenance, stopped on shutdown.
    maintenance: Mutex<Option<MaintenanceTask>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("cache_dir", &self.settings.cache_dir)
            .field("entries", &self.entries.lock().len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Open the cache rooted at `settings.cache_dir`.
    ///
    /// Creates the directory and index as needed, and schedules maintenance
    /// every `settings.maintenance_interval` (never, if that is zero). An
    /// index that cannot be opened or migrated is fatal.
    pub async fn new(settings: Settings, factory: Arc<dyn TranscoderFactory>) -> Result<Arc<Self>> {
        Self::with_disk(settings, factory, Arc::new(SystemDiskSpace)).await
    }

    /// Like [`new`](Self::new), with a custom free-space probe.
    #[instrument(skip_all, fields(cache_dir = %settings.cache_dir.display()))]
    pub async fn with_disk(
        settings: Settings,
        factory: Arc<dyn TranscoderFactory>,
        disk: Arc<dyn DiskSpace>,
    ) -> Result<Arc<Self>> {
        if let Err(err) = tokio::fs::create_dir_all(&settings.cache_dir).await {
            let errno = err.raw_os_error().unwrap_or(libc::EIO);
            return Err(err).or_raise(|| ErrorKind::Source(settings.cache_dir.clone(), errno));
        }
        let db = Database::connect(settings.cache_dir.join(INDEX_FILE)).await.or_raise(|| ErrorKind::Index)?;
        let cache = Arc::new(Self {
            index: CacheIndex::from(&db),
            db,
            entries: Mutex::new(HashMap::new()),
            gate: AdmissionGate::new(settings.max_workers),
            factory,
            disk,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            maintenance: Mutex::new(None),
            settings,
        });
        if cache.settings.clear_on_start {
            let cleared = cache.clear().await?;
            info!(cleared, "cache cleared on startup");
        }
        *cache.maintenance.lock() = cache.spawn_maintenance(cache.settings.maintenance_interval);
        info!(max_workers = cache.gate.capacity(), "cache ready");
        Ok(cache)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn index(&self) -> &CacheIndex {
        &self.index
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub(crate) fn factory(&self) -> &dyn TranscoderFactory {
        self.factory.as_ref()
    }

    pub(crate) fn disk(&self) -> &dyn DiskSpace {
        self.disk.as_ref()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// The resident entry for `key`, if any.
    pub fn resident(&self, key: &Key) -> Option<Arc<CacheEntry>> {
        self.entries.lock().get(key).cloned()
    }

    /// Number of entries currently held in memory.
    pub fn resident_count(&self) -> usize {
        self.entries.lock().len()
    }

    // =========================================================================
    // Open / close
    // =========================================================================

    /// Open the entry for `key`, creating it if necessary.
    ///
    /// With `begin_transcode`, a worker is started unless the output is
    /// already complete or being produced, and this call returns once the
    /// worker has started or pre-buffered enough output. Without it only the
    /// metadata is loaded (and the output size predicted if unknown).
    ///
    /// Every successful open must be paired with a [`close`](Self::close).
    /// Dropping the future before it completes gives back the reference it
    /// took; a worker it started keeps running and later opens join it.
    #[instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub async fn open(self: &Arc<Self>, key: &Key, begin_transcode: bool) -> Result<Arc<CacheEntry>> {
        let mut opening = Opening::new(self);
        loop {
            if self.shutdown.is_cancelled() {
                exn::bail!(ErrorKind::Busy);
            }
            let entry = self.entry(key)?;
            let failure = match self.attach(&entry, begin_transcode, &mut opening).await {
                Ok(None) => {
                    opening.disarm();
                    return Ok(entry);
                },
                Ok(Some(ready)) => match Self::await_worker(ready).await {
                    Ok(()) => {
                        opening.disarm();
                        return Ok(entry);
                    },
                    Err(err) => err,
                },
                Err(err) if matches!(&*err, ErrorKind::Closed) => {
                    // Evicted between lookup and lock; the registry no longer
                    // holds it, so the next round creates a fresh entry.
                    opening.disarm();
                    trace!("entry evicted during open, retrying");
                    continue;
                },
                Err(err) => err,
            };
            opening.disarm();
            if let Err(close) = self.close(&entry, Close::Delete).await {
                warn!(error = ?close, "could not discard entry after failed open");
            }
            return Err(failure);
        }
    }

    /// Open without starting a worker and report the size to advertise.
    pub async fn stat(self: &Arc<Self>, key: &Key) -> Result<u64> {
        let entry = self.open(key, false).await?;
        let size = entry.size();
        self.close(&entry, Close::Keep).await?;
        Ok(size)
    }

    /// Give back one reference obtained from [`open`](Self::open).
    ///
    /// Only when the last reference goes away do `Free` and `Delete` take
    /// effect; otherwise the output is flushed and the entry stays resident.
    /// Returns `true` if the handle is no longer usable.
    pub async fn close(&self, entry: &Arc<CacheEntry>, flags: Close) -> Result<bool> {
        let _guard = entry.lock().await;
        self.close_locked(entry, flags).await
    }

    /// [`close`](Self::close) for callers already holding the entry's lock.
    pub(crate) async fn close_locked(&self, entry: &Arc<CacheEntry>, flags: Close) -> Result<bool> {
        if entry.is_evicted() {
            return Ok(true);
        }
        let remaining = entry.release();
        if remaining > 0 {
            if entry.buffer().is_open() {
                entry.buffer().flush().map_err(ErrorKind::buffer)?;
            }
            self.write_info(entry).await?;
            trace!(key = %entry.key(), refs = remaining, "keeping cache entry");
            return Ok(false);
        }

        let delete = flags == Close::Delete;
        if delete {
            self.delete_info(entry.key()).await?;
        } else {
            self.write_info(entry).await?;
        }
        entry.buffer().release(delete).map_err(ErrorKind::buffer)?;
        if flags == Close::Keep {
            return Ok(false);
        }
        entry.evict();
        self.forget(entry);
        trace!(key = %entry.key(), deleted = delete, "freed cache entry");
        Ok(true)
    }

    fn entry(&self, key: &Key) -> Result<Arc<CacheEntry>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            trace!(%key, "reusing cache entry");
            return Ok(Arc::clone(entry));
        }
        let file = cache_file(&self.settings.cache_dir, &key.path, &key.desttype).or_raise(|| ErrorKind::InvalidKey)?;
        let entry = Arc::new(CacheEntry::new(key.clone(), file, CacheMetadata::new(self.settings.params)));
        entries.insert(key.clone(), Arc::clone(&entry));
        trace!(%key, "created cache entry");
        Ok(entry)
    }

    /// Remove `entry` from the registry, unless it was already replaced.
    fn forget(&self, entry: &Arc<CacheEntry>) {
        let mut entries = self.entries.lock();
        if entries.get(entry.key()).is_some_and(|resident| Arc::ptr_eq(resident, entry)) {
            entries.remove(entry.key());
        }
    }

    /// Take a reference and bring the entry into a usable state. Returns the
    /// ready signal of a freshly started worker, if one is needed.
    async fn attach(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry>,
        begin_transcode: bool,
        opening: &mut Opening,
    ) -> Result<Option<oneshot::Receiver<Ready>>> {
        let _guard = entry.lock().await;
        if entry.is_evicted() {
            exn::bail!(ErrorKind::Closed);
        }
        let first = entry.retain() == 1;
        opening.hold(entry);
        self.load(entry, first, begin_transcode).await?;
        entry.update_access();
        entry.update_meta(|meta| meta.access_count += 1);
        if let Err(err) = self.index.touch(entry.key(), UtcDateTime::now()).await {
            warn!(key = %entry.key(), error = ?err, "could not record access");
        }

        if entry.is_decoding() {
            trace!(key = %entry.key(), "joining running worker");
            return Ok(None);
        }
        let params = self.settings.params;
        let source = source_snapshot(&entry.key().path).await?;
        if self.settings.disable_cache {
            entry.clear(params, source)?;
        } else if entry.outdated(&params, source) {
            debug!(key = %entry.key(), "cached output is outdated");
            entry.clear(params, source)?;
        }

        if entry.status() == Status::Success {
            trace!(key = %entry.key(), "reading from cache");
            return Ok(None);
        }
        if !begin_transcode {
            if entry.metadata().predicted_size == 0 {
                self.predict(entry).await?;
            }
            return Ok(None);
        }

        // Whatever an earlier attempt left behind is discarded, and the new
        // output is tied to the source as it is now. The worker owns the
        // decoding flag from here on, including while it waits for a slot.
        entry.clear(params, source)?;
        entry.start_decoding();
        let (sender, receiver) = oneshot::channel();
        let token = self.shutdown.child_token();
        entry.retain();
        entry.attach_worker(token.clone());
        let worker = Worker::new(Arc::clone(self), Arc::clone(entry), token, sender);
        self.workers.spawn(worker.run());
        debug!(key = %entry.key(), "worker started");
        Ok(Some(receiver))
    }

    async fn await_worker(ready: oneshot::Receiver<Ready>) -> Result<()> {
        match ready.await {
            Ok(Ready::Failed { errno: libc::EBUSY, .. }) => exn::bail!(ErrorKind::Busy),
            Ok(Ready::Failed { errno, code }) => exn::bail!(ErrorKind::Transcode { errno, code }),
            Ok(_) => Ok(()),
            Err(_) => exn::bail!(ErrorKind::Aborted),
        }
    }

    /// Pull metadata from the index and, when output is wanted or already
    /// complete, open the buffer.
    async fn load(&self, entry: &CacheEntry, first: bool, begin_transcode: bool) -> Result<()> {
        if first && let Some(meta) = self.read_info(entry.key()).await? {
            entry.load(meta);
        }
        let readable = begin_transcode || entry.status() == Status::Success;
        if readable && !entry.buffer().is_open() {
            // Output without a matching row, or from an attempt that never
            // concluded, cannot be trusted.
            let erase = entry.status() == Status::Empty;
            entry.buffer().init(erase).map_err(ErrorKind::buffer)?;
            entry.publish();
        }
        Ok(())
    }

    /// Learn the output size without transcoding.
    async fn predict(&self, entry: &CacheEntry) -> Result<()> {
        let mut transcoder = self.factory.create(entry.key(), &self.settings.params);
        if let Err(err) = transcoder.open_input(&entry.key().path).await {
            exn::bail!(ErrorKind::Transcode { errno: err.errno, code: err.code });
        }
        let predicted = transcoder.predicted_size();
        let format = transcoder.format_info();
        entry.update_meta(|meta| {
            meta.predicted_size = predicted;
            meta.frame_count = format.frame_count;
            meta.segment_count = format.segment_count;
            meta.duration = format.duration;
        });
        trace!(key = %entry.key(), predicted, "predicted output size");
        Ok(())
    }

    // =========================================================================
    // Index mirror
    // =========================================================================

    /// Stored metadata for `key`. `None` means nothing reusable exists.
    pub async fn read_info(&self, key: &Key) -> Result<Option<CacheMetadata>> {
        self.index.get(key).await.or_raise(|| ErrorKind::Index)
    }

    /// Persist the entry's current metadata.
    pub async fn write_info(&self, entry: &CacheEntry) -> Result<()> {
        self.index.upsert(entry.key(), &entry.metadata()).await.or_raise(|| ErrorKind::Index)
    }

    pub async fn delete_info(&self, key: &Key) -> Result<bool> {
        self.index.delete(key).await.or_raise(|| ErrorKind::Index)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove `key` from the cache entirely: tear down a live entry (stopping
    /// its worker), delete the index row and unlink the cache file.
    #[instrument(level = "debug", skip(self, key), fields(key = %key))]
    pub async fn delete_entry(&self, key: &Key) -> Result<()> {
        if let Some(entry) = self.resident(key) {
            let _guard = entry.lock().await;
            if !entry.is_evicted() {
                entry.evict();
                if let Err(err) = entry.buffer().release(true) {
                    warn!(error = ?err, "could not release evicted buffer");
                }
                self.forget(&entry);
            }
        }
        self.delete_info(key).await?;
        self.remove_cachefile(key).await
    }

    /// Unlink the cache file for `key`. A missing file is not an error.
    pub async fn remove_cachefile(&self, key: &Key) -> Result<()> {
        let file = cache_file(&self.settings.cache_dir, &key.path, &key.desttype).or_raise(|| ErrorKind::InvalidKey)?;
        match tokio::fs::remove_file(&file).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                let errno = err.raw_os_error().unwrap_or(libc::EIO);
                Err(err).or_raise(|| ErrorKind::Buffer(errno))
            },
        }
    }

    /// Delete every indexed entry. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<usize> {
        let keys = self.index.list_keys().await.or_raise(|| ErrorKind::Index)?;
        let mut removed = 0;
        for key in keys {
            match self.delete_entry(&key).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(%key, error = ?err, "could not clear cache entry"),
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop every worker at its next step boundary, refuse new ones, wait for
    /// them to record their state and close the index.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let maintenance = self.maintenance.lock().take();
        if let Some(task) = maintenance {
            task.stop().await;
        }
        self.gate.close();
        self.workers.close();
        self.workers.wait().await;
        self.db.close().await;
        info!("cache shut down");
    }
}

/// Modification time and size of the source behind `path`.
pub(crate) async fn source_snapshot(path: &Path) -> Result<SourceSnapshot> {
    let failed = |err: &std::io::Error| ErrorKind::Source(path.to_path_buf(), err.raw_os_error().unwrap_or(libc::EIO));
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) => exn::bail!(failed(&err)),
    };
    let modified = match metadata.modified() {
        Ok(modified) => modified,
        Err(err) => exn::bail!(failed(&err)),
    };
    Ok(SourceSnapshot { modified: UtcDateTime::from(modified), size: metadata.len() })
}

/// The reference an [`open`](Cache::open) in progress has taken.
///
/// If the open future is dropped before it settles, the reference is closed
/// with [`Close::Keep`] in the background so the entry stays usable.
struct Opening {
    cache: Arc<Cache>,
    entry: Option<Arc<CacheEntry>>,
}

impl Opening {
    fn new(cache: &Arc<Cache>) -> Self {
        Self { cache: Arc::clone(cache), entry: None }
    }

    fn hold(&mut self, entry: &Arc<CacheEntry>) {
        self.entry = Some(Arc::clone(entry));
    }

    /// The reference now belongs to the caller, or has already been given back.
    fn disarm(&mut self) {
        self.entry = None;
    }
}

impl Drop for Opening {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else {
            return;
        };
        debug!(key = %entry.key(), "open abandoned, releasing its reference");
        if tokio::runtime::Handle::try_current().is_err() {
            entry.release();
            return;
        }
        let cache = Arc::clone(&self.cache);
        let workers = cache.workers.clone();
        workers.spawn(async move {
            if let Err(err) = cache.close(&entry, Close::Keep).await {
                warn!(key = %entry.key(), error = ?err, "could not release abandoned open");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MOCK_CODEC_ERROR, MockFactory, MockScript, expected_bytes};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        factory: Arc<MockFactory>,
        cache: Arc<Cache>,
    }

    impl Fixture {
        async fn new(script: MockScript, configure: impl FnOnce(&mut Settings)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("media")).unwrap();
            let factory = Arc::new(MockFactory::new(script));
            let cache = Cache::new(settings(&dir, configure), factory.clone()).await.unwrap();
            Self { dir, factory, cache }
        }

        /// Create (or overwrite) a source file and return its key.
        fn source(&self, name: &str, contents: &[u8]) -> Key {
            let path = self.dir.path().join("media").join(name);
            std::fs::write(&path, contents).unwrap();
            Key::new(path, "mp4")
        }

        fn cache_file(&self, key: &Key) -> PathBuf {
            cache_file(&self.cache.settings().cache_dir, &key.path, &key.desttype).unwrap()
        }
    }

    fn settings(dir: &TempDir, configure: impl FnOnce(&mut Settings)) -> Settings {
        let mut settings = Settings::new(dir.path().join("cache"));
        settings.prebuffer_size = 0;
        settings.max_workers = 4;
        configure(&mut settings);
        settings
    }

    async fn settle(entry: &CacheEntry) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while entry.is_decoding() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn read_all(entry: &CacheEntry, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let n = entry.read(0, &mut out).await.unwrap();
        out.truncate(n);
        out
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_share_one_worker() {
        let fixture = Fixture::new(MockScript::new(8, 1000).with_delay(Duration::from_millis(5)), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&fixture.cache);
                let key = key.clone();
                tokio::spawn(async move {
                    let entry = cache.open(&key, true).await.unwrap();
                    let data = read_all(&entry, 8000).await;
                    cache.close(&entry, Close::Keep).await.unwrap();
                    data
                })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected_bytes(0, 8000));
        }
        assert_eq!(fixture.factory.created(), 1);
        assert_eq!(fixture.cache.resident_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_entry_is_reused() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");

        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(entry.metadata().encoded_size, 4000);
        assert_eq!(entry.buffer().watermark(), 4000);
        assert_eq!(entry.size(), 4000);
        assert_eq!(entry.metadata().frame_count, 4);
        assert!(!fixture.cache.close(&entry, Close::Keep).await.unwrap());
        assert_eq!(std::fs::metadata(fixture.cache_file(&key)).unwrap().len(), 4000);

        let again = fixture.cache.open(&key, true).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(read_all(&again, 5000).await, expected_bytes(0, 4000));
        fixture.cache.close(&again, Close::Keep).await.unwrap();
        assert_eq!(fixture.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_restart_rediscovers_finished_output() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;
        assert!(fixture.cache.close(&entry, Close::Free).await.unwrap());
        fixture.cache.shutdown().await;

        let factory = Arc::new(MockFactory::new(MockScript::new(4, 1000)));
        let cache = Cache::new(settings(&fixture.dir, |_| {}), factory.clone()).await.unwrap();
        let entry = cache.open(&key, true).await.unwrap();
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(read_all(&entry, 4000).await, expected_bytes(0, 4000));
        cache.close(&entry, Close::Keep).await.unwrap();
        assert_eq!(factory.created(), 0);
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_source_invalidates_output() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;
        fixture.cache.close(&entry, Close::Keep).await.unwrap();

        fixture.source("clip.mkv", b"a longer, different source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;
        assert_eq!(fixture.factory.created(), 2);
        assert_eq!(entry.metadata().source_size, 26);
        fixture.cache.close(&entry, Close::Keep).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_cache_always_transcodes() {
        let fixture = Fixture::new(MockScript::new(2, 100), |s| s.disable_cache = true).await;
        let key = fixture.source("clip.mkv", b"source");
        for round in 1..=2 {
            let entry = fixture.cache.open(&key, true).await.unwrap();
            settle(&entry).await;
            assert_eq!(read_all(&entry, 200).await, expected_bytes(0, 200));
            fixture.cache.close(&entry, Close::Keep).await.unwrap();
            assert_eq!(fixture.factory.created(), round);
        }
    }

    #[tokio::test]
    async fn test_missing_source_fails_open() {
        let fixture = Fixture::new(MockScript::new(2, 100), |_| {}).await;
        let key = Key::new(fixture.dir.path().join("media/missing.mkv"), "mp4");
        let err = fixture.cache.open(&key, true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Source(_, code) if *code == libc::ENOENT));
        assert_eq!(fixture.cache.resident_count(), 0);
        assert_eq!(fixture.factory.created(), 0);
    }

    #[tokio::test]
    async fn test_idle_worker_aborts_and_next_open_restarts() {
        let fixture = Fixture::new(MockScript::new(1000, 100).with_delay(Duration::from_millis(10)), |s| {
            s.max_inactive_suspend = Duration::from_millis(50);
            s.max_inactive_abort = Duration::from_millis(150);
        })
        .await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        fixture.cache.close(&entry, Close::Keep).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while fixture.cache.resident(&key).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(entry.status(), Status::Incomplete);
        assert!(fixture.cache.read_info(&key).await.unwrap().is_none());
        assert!(!fixture.cache_file(&key).exists());

        let restarted = fixture.cache.open(&key, true).await.unwrap();
        assert!(!Arc::ptr_eq(&entry, &restarted));
        assert_eq!(fixture.factory.created(), 2);
        assert_eq!(read_all(&restarted, 300).await, expected_bytes(0, 300));
        fixture.cache.close(&restarted, Close::Keep).await.unwrap();
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_is_reported_then_retried() {
        let fixture = Fixture::new(MockScript::new(4, 1000).failing_at(2), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        let err = entry.read(0, &mut [0u8; 4000]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Transcode { code: MOCK_CODEC_ERROR, .. }));
        assert_eq!(err.errno(), libc::EIO);
        settle(&entry).await;
        assert_eq!(entry.status(), Status::Error);
        assert!(entry.read(0, &mut [0u8; 10]).await.is_err());
        fixture.cache.close(&entry, Close::Keep).await.unwrap();
        let stored = fixture.cache.read_info(&key).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.codec_error), (Status::Error, MOCK_CODEC_ERROR));

        fixture.factory.set_script(MockScript::new(4, 1000));
        let entry = fixture.cache.open(&key, true).await.unwrap();
        assert_eq!(read_all(&entry, 4000).await, expected_bytes(0, 4000));
        settle(&entry).await;
        assert_eq!(entry.status(), Status::Success);
        assert_eq!(fixture.factory.created(), 2);
        fixture.cache.close(&entry, Close::Keep).await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_before_prebuffer_fails_open() {
        let fixture = Fixture::new(MockScript::new(4, 1000).failing_at(0), |s| s.prebuffer_size = 2000).await;
        let key = fixture.source("clip.mkv", b"source");
        let err = fixture.cache.open(&key, true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Transcode { code: MOCK_CODEC_ERROR, .. }));
        assert!(fixture.cache.resident(&key).is_none());
        assert!(fixture.cache.read_info(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreadable_input_fails_open() {
        let fixture = Fixture::new(MockScript::new(4, 1000).failing_input(), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let err = fixture.cache.open(&key, true).await.unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
    }

    #[tokio::test]
    async fn test_prebuffered_open_returns_before_completion() {
        let fixture = Fixture::new(MockScript::new(50, 100).with_delay(Duration::from_millis(5)), |s| {
            s.prebuffer_size = 1000;
        })
        .await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        assert!(entry.progress().watermark > 1000);
        assert!(entry.is_decoding());
        assert_eq!(entry.size(), 5000);
        settle(&entry).await;
        fixture.cache.close(&entry, Close::Keep).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_with_other_references_keeps_output() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let first = fixture.cache.open(&key, true).await.unwrap();
        settle(&first).await;
        let second = fixture.cache.open(&key, true).await.unwrap();
        assert_eq!(first.refs(), 2);

        assert!(!fixture.cache.close(&first, Close::Delete).await.unwrap());
        assert!(fixture.cache_file(&key).exists());
        assert!(fixture.cache.read_info(&key).await.unwrap().is_some());
        assert_eq!(read_all(&second, 4000).await, expected_bytes(0, 4000));

        assert!(fixture.cache.close(&second, Close::Delete).await.unwrap());
        assert!(!fixture.cache_file(&key).exists());
        assert!(fixture.cache.read_info(&key).await.unwrap().is_none());
        assert!(fixture.cache.resident(&key).is_none());
    }

    #[tokio::test]
    async fn test_stat_predicts_without_transcoding() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        assert_eq!(fixture.cache.stat(&key).await.unwrap(), 4000);
        assert_eq!(fixture.factory.steps(), 0);
        assert!(!fixture.cache_file(&key).exists());
        let stored = fixture.cache.read_info(&key).await.unwrap().unwrap();
        assert_eq!((stored.status, stored.predicted_size), (Status::Empty, 4000));
    }

    #[tokio::test]
    async fn test_admission_waits_for_free_worker_slot() {
        let fixture = Fixture::new(MockScript::new(10, 100).with_delay(Duration::from_millis(20)), |s| {
            s.max_workers = 1;
        })
        .await;
        let a = fixture.source("a.mkv", b"a");
        let b = fixture.source("b.mkv", b"b");
        let first = fixture.cache.open(&a, true).await.unwrap();
        assert_eq!(fixture.cache.gate().active(), 1);
        let second = tokio::spawn({
            let cache = Arc::clone(&fixture.cache);
            async move { cache.open(&b, true).await.map(|entry| entry.key().clone()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());
        settle(&first).await;
        assert_eq!(second.await.unwrap().unwrap().path, fixture.dir.path().join("media/b.mkv"));
        fixture.cache.close(&first, Close::Keep).await.unwrap();
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers_and_refuses_opens() {
        let fixture = Fixture::new(MockScript::new(1000, 100).with_delay(Duration::from_millis(10)), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        fixture.cache.shutdown().await;
        assert!(!entry.is_decoding());
        assert_eq!(entry.status(), Status::Incomplete);
        assert!(fixture.factory.steps() < 1000);

        let err = fixture.cache.open(&key, true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Busy));
        assert_eq!(err.errno(), libc::EBUSY);
    }

    #[tokio::test]
    async fn test_delete_entry_evicts_running_worker() {
        let fixture = Fixture::new(MockScript::new(1000, 100).with_delay(Duration::from_millis(10)), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        fixture.cache.delete_entry(&key).await.unwrap();
        assert!(fixture.cache.resident(&key).is_none());
        assert!(!fixture.cache_file(&key).exists());
        let err = entry.read(0, &mut [0u8; 1_000_000]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        // Deleting what is not there is fine.
        fixture.cache.delete_entry(&key).await.unwrap();
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_on_start_empties_cache() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;
        fixture.cache.close(&entry, Close::Free).await.unwrap();
        fixture.cache.shutdown().await;
        assert!(fixture.cache_file(&key).exists());

        let factory = Arc::new(MockFactory::new(MockScript::new(4, 1000)));
        let cache = Cache::new(settings(&fixture.dir, |s| s.clear_on_start = true), factory).await.unwrap();
        assert!(cache.index().list_keys().await.unwrap().is_empty());
        assert!(!fixture.cache_file(&key).exists());
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_key_escaping_cache_dir_is_rejected() {
        let fixture = Fixture::new(MockScript::new(1, 1), |_| {}).await;
        let err = fixture.cache.open(&Key::new("/../../etc/passwd", "mp4"), true).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey));
    }

    #[tokio::test]
    async fn test_abandoned_open_waiting_for_a_slot_does_not_strand_entry() {
        let fixture = Fixture::new(MockScript::new(10, 100).with_delay(Duration::from_millis(20)), |s| {
            s.max_workers = 1;
        })
        .await;
        let a = fixture.source("a.mkv", b"a");
        let b = fixture.source("b.mkv", b"b");
        let first = fixture.cache.open(&a, true).await.unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(30), fixture.cache.open(&b, true)).await;
        assert!(timed_out.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = fixture.cache.resident(&b).unwrap();
        assert_eq!(queued.refs(), 1);
        assert!(queued.is_decoding());

        settle(&first).await;
        fixture.cache.close(&first, Close::Keep).await.unwrap();
        let second = fixture.cache.open(&b, true).await.unwrap();
        assert!(Arc::ptr_eq(&queued, &second));
        let data = tokio::time::timeout(Duration::from_secs(5), read_all(&second, 1000)).await.unwrap();
        assert_eq!(data, expected_bytes(0, 1000));
        assert_eq!(fixture.factory.created(), 2);
        fixture.cache.close(&second, Close::Keep).await.unwrap();
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_prebuffer_wait_releases_reference() {
        let fixture = Fixture::new(MockScript::new(100, 100).with_delay(Duration::from_millis(10)), |s| {
            s.prebuffer_size = 5000;
        })
        .await;
        let key = fixture.source("clip.mkv", b"source");
        let timed_out = tokio::time::timeout(Duration::from_millis(30), fixture.cache.open(&key, true)).await;
        assert!(timed_out.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = fixture.cache.resident(&key).unwrap();
        assert_eq!(entry.refs(), 1);

        let joined = fixture.cache.open(&key, true).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &joined));
        assert_eq!(joined.refs(), 2);
        assert_eq!(read_all(&joined, 200).await, expected_bytes(0, 200));
        fixture.cache.close(&joined, Close::Keep).await.unwrap();
        assert_eq!(fixture.factory.created(), 1);
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_open_waiting_for_a_slot() {
        let fixture = Fixture::new(MockScript::new(1000, 100).with_delay(Duration::from_millis(10)), |s| {
            s.max_workers = 1;
        })
        .await;
        let a = fixture.source("a.mkv", b"a");
        let b = fixture.source("b.mkv", b"b");
        let _first = fixture.cache.open(&a, true).await.unwrap();
        let waiting = tokio::spawn({
            let cache = Arc::clone(&fixture.cache);
            async move { cache.open(&b, true).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        fixture.cache.shutdown().await;
        let err = waiting.await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Busy));
        assert_eq!(fixture.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_finished_output_is_readable_without_transcoding() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        settle(&entry).await;

        for flags in [Close::Keep, Close::Free] {
            fixture.cache.close(&entry, flags).await.unwrap();
            let reopened = fixture.cache.open(&key, false).await.unwrap();
            assert_eq!(reopened.size(), 4000);
            assert_eq!(read_all(&reopened, 5000).await, expected_bytes(0, 4000));
        }
        assert_eq!(fixture.factory.created(), 1);
        let reopened = fixture.cache.resident(&key).unwrap();
        fixture.cache.close(&reopened, Close::Keep).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_without_output_is_refused() {
        let fixture = Fixture::new(MockScript::new(4, 1000), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, false).await.unwrap();
        assert_eq!(entry.size(), 4000);
        let err = entry.read(0, &mut [0u8; 100]).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        fixture.cache.close(&entry, Close::Keep).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_worker_suspends_and_resumes_where_it_stopped() {
        let fixture = Fixture::new(MockScript::new(1000, 100).with_delay(Duration::from_millis(5)), |s| {
            s.max_inactive_suspend = Duration::from_millis(50);
            s.max_inactive_abort = Duration::from_secs(10);
        })
        .await;
        let key = fixture.source("clip.mkv", b"source");
        let entry = fixture.cache.open(&key, true).await.unwrap();
        assert_eq!(read_all(&entry, 500).await, expected_bytes(0, 500));
        fixture.cache.close(&entry, Close::Keep).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let paused = fixture.factory.steps();
        let watermark = entry.progress().watermark;
        assert!(entry.is_decoding());
        assert!(paused < 1000);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fixture.factory.steps(), paused);
        assert_eq!(entry.progress().watermark, watermark);

        let resumed = fixture.cache.open(&key, true).await.unwrap();
        assert!(Arc::ptr_eq(&entry, &resumed));
        let mut out = vec![0u8; 1000];
        let n = tokio::time::timeout(Duration::from_secs(5), resumed.read(watermark, &mut out)).await.unwrap().unwrap();
        assert_eq!(n, 1000);
        assert_eq!(out, expected_bytes(watermark, 1000));
        assert!(fixture.factory.steps() > paused);
        assert_eq!(fixture.factory.created(), 1);
        fixture.cache.close(&resumed, Close::Keep).await.unwrap();
        fixture.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_cachefile_ignores_missing_file() {
        let fixture = Fixture::new(MockScript::new(1, 1), |_| {}).await;
        let key = fixture.source("clip.mkv", b"source");
        let file = fixture.cache_file(&key);
        fixture.cache.remove_cachefile(&key).await.unwrap();
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"output").unwrap();
        fixture.cache.remove_cachefile(&key).await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_source_snapshot_matches_file_metadata() {
        let fixture = Fixture::new(MockScript::new(1, 1), |_| {}).await;
        let key = fixture.source("clip.mkv", b"twelve bytes");
        let snapshot = source_snapshot(&key.path).await.unwrap();
        let metadata = std::fs::metadata(&key.path).unwrap();
        assert_eq!(snapshot.size, 12);
        assert_eq!(snapshot.modified, UtcDateTime::from(metadata.modified().unwrap()));
    }
}
