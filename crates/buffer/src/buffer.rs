use exn::{OptionExt, ResultExt};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, trace, warn};

use crate::error::{ErrorKind, Result};
use crate::path::segment_file;

/// Smallest backing file size; fresh or cleared buffers start at one page.
pub const PAGE_SIZE: usize = 4096;

/// Size of one frame table slot: offset (`u64`), length (`u32`) and tag
/// (`u32`), all little endian.
pub const FRAME_SLOT: usize = 16;

const FRAME_TAG: u32 = u32::from_le_bytes(*b"FRM1");

/// Disk-backed, growable byte store for one cached output.
///
/// The backing file is mapped into memory and grown on demand. Two positions
/// are tracked: the write cursor (where the next [`write`](Self::write) goes)
/// and the watermark, the number of valid bytes written so far. Capacity is
/// always at least the watermark, and the watermark only ever moves down
/// through [`clear`](Self::clear).
///
/// Segmented output keeps one such store per HLS segment, each in its own
/// file. The plain accessors work on the segment selected with
/// [`set_segment`](Self::set_segment), or on the main file before any is.
///
/// All reads and writes go through the same lock, so a reader can never
/// observe a half-finished write.
#[derive(Debug)]
pub struct GrowableBuffer {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by segment number; `0` is the main file.
    stores: BTreeMap<u32, Store>,
    current: u32,
    frames: u32,
}

impl Inner {
    fn resolve(&self, segment: u32) -> u32 {
        if segment == 0 { self.current } else { segment }
    }

    fn is_open(&self, segment: u32) -> bool {
        self.stores.get(&segment).is_some_and(|store| store.map.is_some())
    }
}

/// One mapped backing file.
#[derive(Debug, Default)]
struct Store {
    file: Option<File>,
    map: Option<MmapMut>,
    capacity: usize,
    cursor: usize,
    watermark: usize,
    finished: bool,
}

impl Store {
    /// Open (creating if necessary) and map `path`, placing cursor and
    /// watermark at the end of whatever it already holds.
    fn open(path: &Path, erase: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::InvalidPath(parent.to_path_buf()))?;
        }
        if erase {
            remove(path)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(ErrorKind::from)?;
        let metadata = file.metadata().map_err(ErrorKind::from)?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        }
        let existing = usize::try_from(metadata.len()).or_raise(|| ErrorKind::Allocation(usize::MAX))?;
        let mut store = Store { file: Some(file), ..Store::default() };
        store.resize(path, existing)?;
        store.cursor = existing;
        store.watermark = existing;
        Ok(store)
    }

    fn file(&self, path: &Path) -> Result<&File> {
        self.file.as_ref().ok_or_raise(|| ErrorKind::NotOpen(path.to_path_buf()))
    }

    fn map(&self, path: &Path) -> Result<&MmapMut> {
        self.map.as_ref().ok_or_raise(|| ErrorKind::NotOpen(path.to_path_buf()))
    }

    fn map_mut(&mut self, path: &Path) -> Result<&mut MmapMut> {
        self.map.as_mut().ok_or_raise(|| ErrorKind::NotOpen(path.to_path_buf()))
    }

    /// Grow (or shrink) the backing file to exactly `size` bytes and remap it.
    ///
    /// On failure the previous mapping is left untouched and the file length
    /// is restored as best we can.
    fn resize(&mut self, path: &Path, size: usize) -> Result<()> {
        let size = size.max(PAGE_SIZE);
        let previous = self.capacity;
        let file = self.file(path)?;
        file.set_len(size as u64).or_raise(|| ErrorKind::Allocation(size))?;
        // SAFETY: the file is exclusively owned by this buffer and only ever
        // resized while the lock is held and the old map is still alive.
        let mapped = unsafe { MmapOptions::new().len(size).map_mut(file) };
        match mapped {
            Ok(map) => {
                self.map = Some(map);
                self.capacity = size;
                Ok(())
            },
            Err(err) => {
                if let Err(restore) = file.set_len(previous as u64) {
                    warn!(path = %path.display(), error = %restore, "could not restore buffer length");
                }
                Err(err).or_raise(|| ErrorKind::Allocation(size))
            },
        }
    }

    fn reserve(&mut self, path: &Path, size: usize) -> Result<()> {
        self.map_mut(path)?;
        if size <= self.capacity {
            return Ok(());
        }
        let previous = self.capacity;
        self.resize(path, size)?;
        trace!(path = %path.display(), from = previous, to = size, "buffer reserved");
        Ok(())
    }

    /// Write `data` at `pos` without touching the cursor. Returns the end
    /// position of the write.
    fn write_at(&mut self, path: &Path, pos: usize, data: &[u8]) -> Result<usize> {
        self.map_mut(path)?;
        let end = pos.checked_add(data.len()).ok_or_raise(|| ErrorKind::Allocation(usize::MAX))?;
        if end > self.capacity {
            let grown = end.max(self.capacity.saturating_mul(2));
            let previous = self.capacity;
            self.resize(path, grown)?;
            trace!(path = %path.display(), from = previous, to = grown, "buffer grown");
        }
        self.map_mut(path)?[pos..end].copy_from_slice(data);
        self.watermark = self.watermark.max(end);
        Ok(end)
    }

    fn copy(&self, path: &Path, offset: usize, out: &mut [u8]) -> Result<usize> {
        let map = self.map(path)?;
        if offset > self.capacity {
            exn::bail!(ErrorKind::OutOfRange(offset, self.capacity));
        }
        let len = out.len().min(self.capacity - offset);
        out[..len].copy_from_slice(&map[offset..offset + len]);
        Ok(len)
    }

    /// Flush, unmap and truncate down to the watermark. What is left behind
    /// only remembers the watermark and whether the segment was finished.
    fn close(self, path: &Path) -> (Store, Result<()>) {
        let remains = Store { watermark: self.watermark, finished: self.finished, ..Store::default() };
        let mut result = Ok(());
        if let (Some(file), Some(map)) = (self.file, self.map) {
            if let Err(err) = map.flush() {
                warn!(path = %path.display(), error = %err, "could not sync buffer before release");
            }
            drop(map);
            if let Err(err) = file.set_len(self.watermark as u64) {
                result = Err(ErrorKind::from(err).into());
            }
        }
        (remains, result)
    }
}

/// Remove `path`. A file that is already gone is not an error.
fn remove(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => exn::bail!(ErrorKind::from(err)),
    }
}

impl GrowableBuffer {
    /// Create a handle for the buffer stored at `path`.
    ///
    /// Nothing touches the filesystem until [`init`](Self::init).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), inner: Mutex::new(Inner::default()) }
    }

    /// Location of the main backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the backing file for `segment`; `0` is the main file.
    pub fn segment_path(&self, segment: u32) -> PathBuf {
        segment_file(&self.path, segment)
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_open(0)
    }

    /// Run `f` against the store for `segment` (`0` for the current one).
    fn with_store<T>(&self, segment: u32, f: impl FnOnce(&mut Store, &Path) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let segment = inner.resolve(segment);
        let path = self.segment_path(segment);
        let store = inner.stores.get_mut(&segment).ok_or_raise(|| ErrorKind::NotOpen(path.clone()))?;
        f(store, &path)
    }

    /// Open (creating if necessary) and map the main backing file.
    ///
    /// An existing non-empty file is treated as previously written output:
    /// both cursor and watermark are placed at its end. With `erase` the old
    /// file and any segment files are discarded first. Calling this on an
    /// open buffer is a no-op.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn init(&self, erase: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_open(0) {
            return Ok(());
        }
        if erase {
            self.remove_segment_files(&inner)?;
            inner.stores.clear();
        }
        let store = Store::open(&self.path, erase)?;
        debug!(watermark = store.watermark, capacity = store.capacity, "buffer opened");
        inner.stores.insert(0, store);
        inner.current = 0;
        Ok(())
    }

    /// Ensure the capacity of the current segment is at least `size` bytes.
    ///
    /// Requests at or below the current capacity (including `0`) succeed
    /// without doing anything. A failed grow leaves the buffer as it was.
    pub fn reserve(&self, size: usize) -> Result<()> {
        self.with_store(0, |store, path| store.reserve(path, size))
    }

    /// Write `data` at the cursor, growing the backing file as needed.
    ///
    /// Returns the number of bytes written; the watermark is raised if the
    /// cursor moves past it.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.with_store(0, |store, path| {
            store.cursor = store.write_at(path, store.cursor, data)?;
            Ok(data.len())
        })
    }

    /// Move the write cursor.
    ///
    /// Positions are relative to capacity, not the watermark, so seeking ahead
    /// of data that has not been produced yet is allowed. Targets past the end
    /// are clamped to the capacity; targets before the start are rejected.
    pub fn seek(&self, pos: SeekFrom) -> Result<usize> {
        self.with_store(0, |store, path| {
            store.map_mut(path)?;
            let target = match pos {
                SeekFrom::Start(offset) => i128::from(offset),
                SeekFrom::Current(offset) => store.cursor as i128 + i128::from(offset),
                SeekFrom::End(offset) => store.capacity as i128 + i128::from(offset),
            };
            if target < 0 {
                exn::bail!(ErrorKind::InvalidSeek);
            }
            store.cursor = usize::try_from(target).unwrap_or(usize::MAX).min(store.capacity);
            Ok(store.cursor)
        })
    }

    /// Current write cursor.
    pub fn tell(&self) -> usize {
        let inner = self.inner.lock();
        inner.stores.get(&inner.current).map_or(0, |store| store.cursor)
    }

    /// Current capacity of the backing store.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock();
        inner.stores.get(&inner.current).map_or(0, |store| store.capacity)
    }

    /// Number of valid bytes written so far.
    pub fn watermark(&self) -> usize {
        self.segment_watermark(0)
    }

    /// Number of valid bytes in `segment` (`0` for the current one).
    pub fn segment_watermark(&self, segment: u32) -> usize {
        let inner = self.inner.lock();
        inner.stores.get(&inner.resolve(segment)).map_or(0, |store| store.watermark)
    }

    /// Copy bytes starting at `offset` into `out`, clipped to the capacity.
    ///
    /// Returns the number of bytes copied.
    pub fn copy(&self, offset: usize, out: &mut [u8]) -> Result<usize> {
        self.copy_segment(0, offset, out)
    }

    /// Like [`copy`](Self::copy), reading from `segment` (`0` for the
    /// current one).
    pub fn copy_segment(&self, segment: u32, offset: usize, out: &mut [u8]) -> Result<usize> {
        self.with_store(segment, |store, path| store.copy(path, offset, out))
    }

    /// Select (opening or creating as needed) the segment further writes go
    /// to, reserving `size` bytes for it.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn set_segment(&self, segment: u32, size: usize) -> Result<()> {
        if segment == 0 {
            exn::bail!(ErrorKind::InvalidSegment(segment));
        }
        let mut inner = self.inner.lock();
        if !inner.is_open(0) {
            exn::bail!(ErrorKind::NotOpen(self.path.clone()));
        }
        let path = self.segment_path(segment);
        if !inner.is_open(segment) {
            let store = Store::open(&path, false)?;
            debug!(segment, watermark = store.watermark, "segment opened");
            inner.stores.insert(segment, store);
        }
        let store = inner.stores.get_mut(&segment).ok_or_raise(|| ErrorKind::NotOpen(path.clone()))?;
        store.reserve(&path, size)?;
        inner.current = segment;
        Ok(())
    }

    /// The segment currently written to, `0` when none was selected.
    pub fn current_segment(&self) -> u32 {
        self.inner.lock().current
    }

    /// Highest segment number seen so far.
    pub fn segment_count(&self) -> u32 {
        self.inner.lock().stores.keys().next_back().copied().unwrap_or(0)
    }

    /// Whether `segment` has output, either in memory or left on disk by an
    /// earlier run.
    pub fn segment_exists(&self, segment: u32) -> bool {
        if segment == 0 {
            return false;
        }
        if let Some(store) = self.inner.lock().stores.get(&segment) {
            return store.watermark > 0;
        }
        std::fs::metadata(self.segment_path(segment)).is_ok_and(|meta| meta.len() > 0)
    }

    /// Mark the current segment as completely written.
    pub fn finish_segment(&self) {
        let mut inner = self.inner.lock();
        let current = inner.current;
        if let Some(store) = inner.stores.get_mut(&current) {
            store.finished = true;
        }
    }

    pub fn is_segment_finished(&self, segment: u32) -> bool {
        let inner = self.inner.lock();
        inner.stores.get(&inner.resolve(segment)).is_some_and(|store| store.finished)
    }

    /// Turn the main file into a frame set of `count` frames.
    ///
    /// A fresh buffer gets an empty slot table; output rediscovered by
    /// [`init`](Self::init) must already be large enough to hold one.
    pub fn set_frame_count(&self, count: u32) -> Result<()> {
        let table = count as usize * FRAME_SLOT;
        let mut inner = self.inner.lock();
        let store = inner.stores.get_mut(&0).ok_or_raise(|| ErrorKind::NotOpen(self.path.clone()))?;
        if store.watermark == 0 {
            store.write_at(&self.path, 0, &vec![0; table])?;
            store.cursor = table;
        } else if store.watermark < table {
            exn::bail!(ErrorKind::InvalidFrame(count));
        }
        inner.frames = count;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.inner.lock().frames
    }

    /// Append the image for `frame` (`1..=frame_count`) and record it in the
    /// slot table. Writing a frame twice replaces the earlier image.
    pub fn write_frame(&self, frame: u32, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let slot = frame_slot(frame, inner.frames)?;
        let store = inner.stores.get_mut(&0).ok_or_raise(|| ErrorKind::NotOpen(self.path.clone()))?;
        let offset = store.watermark;
        let len = u32::try_from(data.len()).or_raise(|| ErrorKind::Allocation(data.len()))?;
        store.cursor = store.write_at(&self.path, offset, data)?;
        let mut record = [0u8; FRAME_SLOT];
        record[..8].copy_from_slice(&(offset as u64).to_le_bytes());
        record[8..12].copy_from_slice(&len.to_le_bytes());
        record[12..].copy_from_slice(&FRAME_TAG.to_le_bytes());
        store.write_at(&self.path, slot, &record)?;
        Ok(data.len())
    }

    /// Image data of `frame`, or `None` if it has not been written yet.
    pub fn read_frame(&self, frame: u32) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        let slot = frame_slot(frame, inner.frames)?;
        let store = inner.stores.get(&0).ok_or_raise(|| ErrorKind::NotOpen(self.path.clone()))?;
        let mut record = [0u8; FRAME_SLOT];
        store.copy(&self.path, slot, &mut record)?;
        let [o0, o1, o2, o3, o4, o5, o6, o7, l0, l1, l2, l3, t0, t1, t2, t3] = record;
        if u32::from_le_bytes([t0, t1, t2, t3]) != FRAME_TAG {
            return Ok(None);
        }
        let offset = usize::try_from(u64::from_le_bytes([o0, o1, o2, o3, o4, o5, o6, o7]))
            .or_raise(|| ErrorKind::OutOfRange(usize::MAX, store.watermark))?;
        let len = u32::from_le_bytes([l0, l1, l2, l3]) as usize;
        if offset.saturating_add(len) > store.watermark {
            exn::bail!(ErrorKind::OutOfRange(offset, store.watermark));
        }
        let mut data = vec![0u8; len];
        store.copy(&self.path, offset, &mut data)?;
        Ok(Some(data))
    }

    pub fn have_frame(&self, frame: u32) -> bool {
        matches!(self.read_frame(frame), Ok(Some(_)))
    }

    /// Sync mapped memory of every open segment to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.is_open(0) {
            exn::bail!(ErrorKind::NotOpen(self.path.clone()));
        }
        for store in inner.stores.values_mut() {
            if let Some(map) = store.map.as_mut() {
                map.flush().map_err(ErrorKind::from)?;
            }
        }
        Ok(())
    }

    /// Reset cursor and watermark, shrink the main file to one page and drop
    /// all segments and frame slots.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.is_open(0) {
            exn::bail!(ErrorKind::NotOpen(self.path.clone()));
        }
        let segments: Vec<u32> = inner.stores.keys().copied().filter(|segment| *segment != 0).collect();
        for segment in segments {
            // Dropping the store unmaps it before the file goes away.
            inner.stores.remove(&segment);
            remove(&self.segment_path(segment))?;
        }
        inner.current = 0;
        inner.frames = 0;
        let store = inner.stores.get_mut(&0).ok_or_raise(|| ErrorKind::NotOpen(self.path.clone()))?;
        store.cursor = 0;
        store.watermark = 0;
        store.finished = false;
        // Unmap before shrinking; touching pages past the new end would fault.
        store.map = None;
        store.capacity = 0;
        if let Err(err) = store.resize(&self.path, PAGE_SIZE) {
            inner.stores.remove(&0);
            return Err(err);
        }
        Ok(())
    }

    /// Flush, unmap and truncate every backing file down to its watermark.
    ///
    /// With `delete` the backing files are removed afterwards. Releasing a
    /// buffer that is not open only honours `delete`.
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    pub fn release(&self, delete: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let stores = std::mem::take(&mut inner.stores);
        let mut result = Ok(());
        for (segment, store) in stores {
            // Keep reporting how much valid output there was.
            let (remains, closed) = store.close(&self.segment_path(segment));
            inner.stores.insert(segment, remains);
            if result.is_ok() {
                result = closed;
            }
        }
        if delete {
            self.remove_segment_files(&inner)?;
            remove(&self.path)?;
        }
        result
    }

    /// Remove the main backing file. A file that is already gone is not an
    /// error.
    pub fn remove_file(&self) -> Result<()> {
        remove(&self.path)
    }

    /// Remove every known segment file, plus those an earlier run left behind
    /// in an unbroken run from segment 1.
    fn remove_segment_files(&self, inner: &Inner) -> Result<()> {
        for segment in inner.stores.keys().filter(|segment| **segment != 0) {
            remove(&self.segment_path(*segment))?;
        }
        for segment in 1.. {
            let path = self.segment_path(segment);
            if !path.exists() {
                break;
            }
            remove(&path)?;
        }
        Ok(())
    }
}

/// Byte offset of the slot for `frame` in a table of `frames` slots.
fn frame_slot(frame: u32, frames: u32) -> Result<usize> {
    if frame == 0 || frame > frames {
        exn::bail!(ErrorKind::InvalidFrame(frame));
    }
    Ok((frame as usize - 1) * FRAME_SLOT)
}

impl Drop for GrowableBuffer {
    fn drop(&mut self) {
        for store in self.inner.get_mut().stores.values_mut() {
            if store.map.take().is_some()
                && let Some(file) = store.file.take()
            {
                _ = file.set_len(store.watermark as u64);
            }
        }
    }
}
