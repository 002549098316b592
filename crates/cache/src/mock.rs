//! Scripted transcoder for tests.
//!
//! Output is deterministic: the byte at position `p` is `p % 251`, so readers
//! can verify exactly what they got back with [`expected_bytes`].

use async_trait::async_trait;
use mediacache_buffer::GrowableBuffer;
use mediacache_index::{EncodeParams, Key};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::transcoder::{FormatInfo, Step, TranscodeError, TranscodeResult, Transcoder, TranscoderFactory};

/// Error code reported by failing mock transcoders.
pub const MOCK_CODEC_ERROR: i32 = -1094995529;

/// The byte found at `position` in any mock output.
pub fn pattern_byte(position: usize) -> u8 {
    (position % 251) as u8
}

/// `len` bytes of mock output starting at `offset`.
pub fn expected_bytes(offset: usize, len: usize) -> Vec<u8> {
    (offset..offset + len).map(pattern_byte).collect()
}

/// What a mock transcoder does.
#[derive(Debug, Clone)]
pub struct MockScript {
    pub chunks: usize,
    pub chunk_size: usize,
    /// Sleep before producing each chunk.
    pub delay: Duration,
    /// Fail the step with this (zero-based) index instead of producing output.
    pub fail_at: Option<usize>,
    /// Fail to open the source.
    pub fail_input: bool,
}

impl MockScript {
    pub fn new(chunks: usize, chunk_size: usize) -> Self {
        Self { chunks, chunk_size, delay: Duration::ZERO, fail_at: None, fail_input: false }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_at(mut self, step: usize) -> Self {
        self.fail_at = Some(step);
        self
    }

    pub fn failing_input(mut self) -> Self {
        self.fail_input = true;
        self
    }

    pub fn total_size(&self) -> usize {
        self.chunks * self.chunk_size
    }
}

#[derive(Debug)]
pub struct MockTranscoder {
    script: MockScript,
    produced: usize,
    steps: Arc<AtomicUsize>,
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn open_input(&mut self, source: &Path) -> TranscodeResult<()> {
        if self.script.fail_input {
            return Err(TranscodeError::new(libc::ENOENT, 0, format!("cannot open {}", source.display())));
        }
        Ok(())
    }

    async fn open_output(&mut self, _sink: &GrowableBuffer) -> TranscodeResult<()> {
        Ok(())
    }

    fn predicted_size(&self) -> u64 {
        self.script.total_size() as u64
    }

    async fn step(&mut self, sink: &GrowableBuffer) -> TranscodeResult<Step> {
        if self.produced == self.script.chunks {
            return Ok(Step::Finished);
        }
        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }
        if self.script.fail_at == Some(self.produced) {
            return Err(TranscodeError::new(0, MOCK_CODEC_ERROR, "invalid data found when processing input"));
        }
        let offset = self.produced * self.script.chunk_size;
        sink.write(&expected_bytes(offset, self.script.chunk_size))
            .map_err(|err| TranscodeError::new(err.errno(), 0, err.to_string()))?;
        self.produced += 1;
        self.steps.fetch_add(1, Ordering::SeqCst);
        Ok(Step::Continue)
    }

    async fn finish(&mut self, sink: &GrowableBuffer) -> TranscodeResult<()> {
        sink.flush().map_err(|err| TranscodeError::new(err.errno(), 0, err.to_string()))
    }

    fn format_info(&self) -> FormatInfo {
        FormatInfo {
            frame_count: self.script.chunks as u64,
            segment_count: 1,
            duration: Duration::from_millis(40 * self.script.chunks as u64),
        }
    }
}

/// Factory handing out [`MockTranscoder`]s following a shared, replaceable script.
#[derive(Debug)]
pub struct MockFactory {
    script: Mutex<MockScript>,
    created: AtomicUsize,
    steps: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new(script: MockScript) -> Self {
        Self { script: Mutex::new(script), created: AtomicUsize::new(0), steps: Arc::new(AtomicUsize::new(0)) }
    }

    /// Script used by transcoders created from now on.
    pub fn set_script(&self, script: MockScript) {
        *self.script.lock() = script;
    }

    /// Number of transcoders created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of chunks produced so far, across all transcoders.
    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl TranscoderFactory for MockFactory {
    fn create(&self, _key: &Key, _params: &EncodeParams) -> Box<dyn Transcoder> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockTranscoder { script: self.script.lock().clone(), produced: 0, steps: Arc::clone(&self.steps) })
    }
}
