//! One cached transcode target.
//!
//! Locking: the async `lifecycle` lock serialises open/close/clear/eviction
//! of an entry; the `state` lock guards metadata and is only ever held for a
//! few instructions; the buffer has its own lock. They are always taken in
//! that order, never the reverse.

use exn::ResultExt;
use mediacache_buffer::GrowableBuffer;
use mediacache_index::{CacheMetadata, EncodeParams, Key, Status};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::UtcDateTime;
use tokio::sync::{MutexGuard, Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{ErrorKind, Result};

/// What happens to an entry once the last reference is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    /// Stay resident; output and index row are kept.
    Keep,
    /// Drop from memory; output and index row are kept for later reuse.
    Free,
    /// Drop from memory and delete the output and its index row.
    Delete,
}

/// Snapshot of decode progress, broadcast to blocked readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub watermark: usize,
    pub status: Status,
    pub decoding: bool,
    pub errno: i32,
    pub codec_error: i32,
}

impl Progress {
    /// Whether a reader waiting for bytes up to `end` can stop waiting.
    fn covers(&self, end: usize) -> bool {
        self.watermark >= end || self.status.is_terminal() || !self.decoding
    }
}

/// Modification time and size of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SourceSnapshot {
    pub modified: UtcDateTime,
    pub size: u64,
}

#[derive(Debug)]
struct EntryState {
    meta: CacheMetadata,
    decoding: bool,
    evicted: bool,
    worker: Option<CancellationToken>,
    last_access: Instant,
    reads: u64,
}

/// The unit of work for one [`Key`].
///
/// Handles are shared (`Arc<CacheEntry>`); the explicit reference count
/// tracks open/close pairs, including the one held by a running worker.
#[derive(Debug)]
pub struct CacheEntry {
    key: Key,
    buffer: GrowableBuffer,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<EntryState>,
    refs: AtomicUsize,
    progress: watch::Sender<Progress>,
    accessed: Notify,
}

impl CacheEntry {
    pub(crate) fn new(key: Key, cache_file: PathBuf, meta: CacheMetadata) -> Self {
        let progress = Progress { watermark: 0, status: meta.status, decoding: false, errno: 0, codec_error: 0 };
        Self {
            key,
            buffer: GrowableBuffer::new(cache_file),
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(EntryState {
                meta,
                decoding: false,
                evicted: false,
                worker: None,
                last_access: Instant::now(),
                reads: 0,
            }),
            refs: AtomicUsize::new(0),
            progress: watch::Sender::new(progress),
            accessed: Notify::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn buffer(&self) -> &GrowableBuffer {
        &self.buffer
    }

    pub fn cache_file(&self) -> &Path {
        self.buffer.path()
    }

    /// Number of open handles, the running worker's included.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Status {
        self.state.lock().meta.status
    }

    pub fn metadata(&self) -> CacheMetadata {
        self.state.lock().meta.clone()
    }

    pub fn is_decoding(&self) -> bool {
        self.state.lock().decoding
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Number of reads served through this entry since it was created.
    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }

    /// Time since the last access.
    pub fn idle(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }

    /// Size to advertise for the output.
    ///
    /// Once encoding is done this is the exact encoded size. Before that it is
    /// the live watermark, but never less than the predicted size, so the
    /// reported value never shrinks and never hides readable bytes.
    pub fn size(&self) -> u64 {
        let state = self.state.lock();
        if state.meta.encoded_size != 0 {
            return state.meta.encoded_size;
        }
        let watermark = if self.buffer.is_open() { self.buffer.watermark() as u64 } else { 0 };
        watermark.max(state.meta.predicted_size)
    }

    /// Read up to `out.len()` bytes of output starting at `offset`.
    ///
    /// Waits until the worker has produced the whole range or the entry
    /// reaches a terminal state. Returns the number of bytes copied, which is
    /// short only at the end of the output.
    pub async fn read(&self, offset: usize, out: &mut [u8]) -> Result<usize> {
        {
            let mut state = self.state.lock();
            state.reads += 1;
        }
        self.update_access();
        let end = offset.saturating_add(out.len());
        let mut receiver = self.progress.subscribe();
        let progress = *receiver.wait_for(|p| p.covers(end)).await.or_raise(|| ErrorKind::Closed)?;
        if self.state.lock().evicted {
            exn::bail!(ErrorKind::Closed);
        }
        match progress.status {
            Status::Error => exn::bail!(ErrorKind::Transcode { errno: progress.errno, code: progress.codec_error }),
            Status::Incomplete if end > progress.watermark => exn::bail!(ErrorKind::Aborted),
            _ => {},
        }
        // Opened for its metadata only, or released by the last close.
        if !self.buffer.is_open() {
            exn::bail!(ErrorKind::Closed);
        }
        let len = out.len().min(progress.watermark.saturating_sub(offset));
        if len == 0 {
            return Ok(0);
        }
        trace!(key = %self.key, offset, len, "serving read");
        self.buffer.copy(offset, &mut out[..len]).map_err(ErrorKind::buffer)
    }

    // =========================================================================
    // Crate internals
    // =========================================================================

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Add a reference; returns the new count.
    pub(crate) fn retain(&self) -> usize {
        self.refs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drop a reference; returns the remaining count.
    pub(crate) fn release(&self) -> usize {
        let previous = self.refs.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        previous.unwrap_or(0).saturating_sub(1)
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }

    /// Replace the in-memory metadata with what the index has.
    pub(crate) fn load(&self, meta: CacheMetadata) {
        self.state.lock().meta = meta;
        self.publish();
    }

    pub(crate) fn update_meta(&self, update: impl FnOnce(&mut CacheMetadata)) {
        update(&mut self.state.lock().meta);
    }

    /// Record an access and wake a suspended worker.
    pub(crate) fn update_access(&self) {
        {
            let mut state = self.state.lock();
            state.last_access = Instant::now();
            state.meta.accessed_at = UtcDateTime::now();
        }
        self.accessed.notify_one();
    }

    pub(crate) fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    pub(crate) async fn accessed(&self) {
        self.accessed.notified().await
    }

    /// No reader has touched the entry for `limit` and only the worker holds it.
    pub(crate) fn inactive_for(&self, limit: Duration) -> bool {
        self.refs() <= 1 && self.idle() >= limit
    }

    /// Whether the stored output no longer matches the source or settings.
    pub(crate) fn outdated(&self, params: &EncodeParams, source: SourceSnapshot) -> bool {
        let state = self.state.lock();
        let meta = &state.meta;
        if meta.params != *params {
            trace!(key = %self.key, "encoder settings changed");
            return true;
        }
        if meta.source_modified.unix_timestamp() != source.modified.unix_timestamp() || meta.source_size != source.size
        {
            trace!(key = %self.key, "source file changed");
            return true;
        }
        // Output that went missing (or was cut short) behind our back.
        meta.status == Status::Success && self.buffer.is_open() && self.buffer.watermark() as u64 != meta.encoded_size
    }

    /// Throw away all output and decode state; back to [`Status::Empty`].
    pub(crate) fn clear(&self, params: EncodeParams, source: SourceSnapshot) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.meta.reset(params);
            state.meta.source_modified = source.modified;
            state.meta.source_size = source.size;
            state.decoding = false;
        }
        if self.buffer.is_open() {
            self.buffer.clear().map_err(ErrorKind::buffer)?;
        }
        self.publish();
        Ok(())
    }

    pub(crate) fn start_decoding(&self) {
        self.state.lock().decoding = true;
        self.publish();
    }

    pub(crate) fn attach_worker(&self, token: CancellationToken) {
        self.state.lock().worker = Some(token);
    }

    /// Freeze the outcome of a decode attempt.
    ///
    /// Finished and failed attempts record the final watermark as the encoded
    /// size; an attempt that was cut short keeps reporting the prediction.
    pub(crate) fn conclude(&self, status: Status, errno: i32, codec_error: i32) {
        {
            let mut state = self.state.lock();
            state.decoding = false;
            state.worker = None;
            state.meta.status = status;
            state.meta.errno = errno;
            state.meta.codec_error = codec_error;
            if matches!(status, Status::Success | Status::Error) {
                state.meta.encoded_size = self.buffer.watermark() as u64;
            }
            let segments = self.buffer.segment_count();
            if segments > 0 {
                state.meta.segment_count = segments;
            }
        }
        self.publish();
    }

    /// Tear the entry down regardless of outstanding references.
    ///
    /// An attached worker is told to stop at its next step boundary; readers
    /// still waiting observe an aborted decode.
    pub(crate) fn evict(&self) {
        {
            let mut state = self.state.lock();
            state.evicted = true;
            if let Some(worker) = state.worker.take() {
                worker.cancel();
            }
            if !state.meta.status.is_terminal() {
                state.meta.status = Status::Incomplete;
                state.meta.errno = libc::EIO;
            }
            state.decoding = false;
        }
        self.refs.store(0, Ordering::SeqCst);
        self.publish();
    }

    /// Make the current watermark and status visible to blocked readers.
    pub(crate) fn publish(&self) {
        let state = self.state.lock();
        let watermark = if self.buffer.is_open() { self.buffer.watermark() } else { 0 };
        self.progress.send_replace(Progress {
            watermark,
            status: state.meta.status,
            decoding: state.decoding,
            errno: state.meta.errno,
            codec_error: state.meta.codec_error,
        });
    }
}
