use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::UtcDateTime;

/// Snapshot of the encoder settings an entry was produced with.
///
/// When any of these differ from the current settings the cached output is
/// stale and gets thrown away on the next open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncodeParams {
    pub audio_bitrate: u64,
    pub audio_samplerate: u32,
    pub video_bitrate: u64,
    pub video_width: u32,
    pub video_height: u32,
    pub deinterlace: bool,
}

/// Outcome of the most recent transcode attempt.
///
/// The discriminants are what the index stores in its `finished` column.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Status {
    /// Nothing has been decoded yet, or a decode is still running.
    #[default]
    #[display("empty")]
    Empty = 0,
    /// Decoding stopped early (timeout, shutdown). Partial output only.
    #[display("incomplete")]
    Incomplete = 1,
    #[display("finished")]
    Success = 2,
    #[display("failed")]
    Error = 3,
}

impl Status {
    /// Whether the status ends a decode attempt.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Empty)
    }

    /// Only a successful decode can be served as-is after a restart.
    pub fn is_reusable(self) -> bool {
        matches!(self, Self::Success)
    }

    pub(crate) fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Empty),
            1 => Some(Self::Incomplete),
            2 => Some(Self::Success),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Durable description of one cache entry.
///
/// `predicted_size` is known from the moment the source is opened;
/// `encoded_size` only becomes authoritative once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMetadata {
    pub params: EncodeParams,
    pub status: Status,
    pub predicted_size: u64,
    pub encoded_size: u64,
    pub frame_count: u64,
    pub segment_count: u32,
    pub duration: Duration,
    /// POSIX error code of the failure, if any.
    pub errno: i32,
    /// Error code reported by the transcoder itself, if any.
    pub codec_error: i32,
    pub created_at: UtcDateTime,
    pub accessed_at: UtcDateTime,
    /// Modification time of the source file when the entry was produced.
    pub source_modified: UtcDateTime,
    pub source_size: u64,
    pub access_count: u64,
}

impl CacheMetadata {
    /// Fresh metadata for an entry that has never been decoded.
    pub fn new(params: EncodeParams) -> Self {
        let now = UtcDateTime::now();
        Self {
            params,
            status: Status::Empty,
            predicted_size: 0,
            encoded_size: 0,
            frame_count: 0,
            segment_count: 0,
            duration: Duration::ZERO,
            errno: 0,
            codec_error: 0,
            created_at: now,
            accessed_at: now,
            source_modified: UtcDateTime::UNIX_EPOCH,
            source_size: 0,
            access_count: 0,
        }
    }

    /// Drop everything learnt from a previous decode attempt, keeping the
    /// creation and access history.
    pub fn reset(&mut self, params: EncodeParams) {
        *self = Self {
            created_at: self.created_at,
            accessed_at: self.accessed_at,
            access_count: self.access_count,
            ..Self::new(params)
        };
    }
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self::new(EncodeParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Status::Empty, false, false)]
    #[case(Status::Incomplete, true, false)]
    #[case(Status::Success, true, true)]
    #[case(Status::Error, true, false)]
    fn test_status_flags(#[case] status: Status, #[case] terminal: bool, #[case] reusable: bool) {
        assert_eq!(status.is_terminal(), terminal);
        assert_eq!(status.is_reusable(), reusable);
        assert_eq!(Status::from_code(status as i64), Some(status));
    }

    #[test]
    fn test_unknown_status_code() {
        assert_eq!(Status::from_code(4), None);
        assert_eq!(Status::from_code(-1), None);
    }

    #[test]
    fn test_reset_keeps_history() {
        let mut meta = CacheMetadata::new(EncodeParams::default());
        meta.status = Status::Error;
        meta.errno = 5;
        meta.encoded_size = 100;
        meta.access_count = 7;
        let created = meta.created_at;
        let params = EncodeParams { audio_bitrate: 192_000, ..EncodeParams::default() };
        meta.reset(params);
        assert_eq!(meta.status, Status::Empty);
        assert_eq!(meta.errno, 0);
        assert_eq!(meta.encoded_size, 0);
        assert_eq!(meta.access_count, 7);
        assert_eq!(meta.created_at, created);
        assert_eq!(meta.params, params);
    }
}
