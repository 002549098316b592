//! The seam between the cache and whatever actually encodes media.
//!
//! The cache never looks inside a transcoder. It opens the source, hands over
//! the output buffer, and then calls [`Transcoder::step`] until the output is
//! complete. All waiting, suspension and cancellation happens between steps.

use async_trait::async_trait;
use derive_more::{Display, Error};
use mediacache_buffer::GrowableBuffer;
use mediacache_index::{EncodeParams, Key};
use std::path::Path;
use std::time::Duration;

/// Failure reported by a transcoder.
///
/// `errno` is a POSIX code for the failure (0 when there is none), `code` is
/// the transcoder's own error code. Both are persisted with the entry.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
#[display("{message} (errno {errno}, code {code})")]
pub struct TranscodeError {
    pub errno: i32,
    pub code: i32,
    pub message: String,
}

impl TranscodeError {
    pub fn new(errno: i32, code: i32, message: impl Into<String>) -> Self {
        Self { errno, code, message: message.into() }
    }
}

pub type TranscodeResult<T> = std::result::Result<T, TranscodeError>;

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More output will follow.
    Continue,
    /// The source is exhausted; [`Transcoder::finish`] is called next.
    Finished,
}

/// Container-specific facts learnt while opening the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatInfo {
    pub frame_count: u64,
    pub segment_count: u32,
    pub duration: Duration,
}

/// Produces encoded bytes for one key into a [`GrowableBuffer`].
#[async_trait]
pub trait Transcoder: Send {
    /// Open and probe the source file.
    async fn open_input(&mut self, source: &Path) -> TranscodeResult<()>;
    /// Prepare to write output into `sink`.
    async fn open_output(&mut self, sink: &GrowableBuffer) -> TranscodeResult<()>;
    /// Expected size of the finished output. Only meaningful after
    /// [`open_input`](Self::open_input).
    fn predicted_size(&self) -> u64;
    /// Produce the next chunk of output into `sink`.
    async fn step(&mut self, sink: &GrowableBuffer) -> TranscodeResult<Step>;
    /// Flush trailers and anything still buffered into `sink`.
    async fn finish(&mut self, sink: &GrowableBuffer) -> TranscodeResult<()>;
    /// Optional snapshot copied into the entry's metadata after the source
    /// has been opened.
    fn format_info(&self) -> FormatInfo {
        FormatInfo::default()
    }
}

/// Creates a fresh [`Transcoder`] for every decode attempt.
pub trait TranscoderFactory: Send + Sync {
    fn create(&self, key: &Key, params: &EncodeParams) -> Box<dyn Transcoder>;
}
