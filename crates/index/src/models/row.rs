use crate::error::{Error, ErrorKind, Result};
use crate::models::{CacheMetadata, EncodeParams, Key, Status};
use exn::{OptionExt, ResultExt};
use std::path::PathBuf;
use std::time::Duration;
use time::UtcDateTime;

fn to_i64(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

fn to_u64(value: i64, what: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

fn to_u32(value: i64, what: &'static str) -> Result<u32> {
    u32::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

fn to_time(value: i64, what: &'static str) -> Result<UtcDateTime> {
    UtcDateTime::from_unix_timestamp(value).or_raise(|| ErrorKind::InvalidData(what))
}

pub(crate) fn path_to_string(key: &Key) -> Result<String> {
    Ok(key.path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
}

/// One `cache_entry` row, column for column.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub filename: String,
    pub desttype: String,
    pub audio_bitrate: i64,
    pub audio_samplerate: i64,
    pub video_bitrate: i64,
    pub video_width: i64,
    pub video_height: i64,
    pub deinterlace: bool,
    pub predicted_filesize: i64,
    pub encoded_filesize: i64,
    pub video_frame_count: i64,
    pub segment_count: i64,
    pub duration_ms: i64,
    pub finished: i64,
    pub error: bool,
    pub errno: i32,
    pub averror: i32,
    pub creation_time: i64,
    pub access_time: i64,
    pub file_time: i64,
    pub file_size: i64,
    pub access_count: i64,
}

impl TryFrom<(&Key, &CacheMetadata)> for EntryRow {
    type Error = Error;
    fn try_from((key, meta): (&Key, &CacheMetadata)) -> Result<Self> {
        let duration_ms = u64::try_from(meta.duration.as_millis()).or_raise(|| ErrorKind::InvalidData("duration"))?;
        Ok(Self {
            filename: path_to_string(key)?,
            desttype: key.desttype.clone(),
            audio_bitrate: to_i64(meta.params.audio_bitrate, "audio bitrate")?,
            audio_samplerate: i64::from(meta.params.audio_samplerate),
            video_bitrate: to_i64(meta.params.video_bitrate, "video bitrate")?,
            video_width: i64::from(meta.params.video_width),
            video_height: i64::from(meta.params.video_height),
            deinterlace: meta.params.deinterlace,
            predicted_filesize: to_i64(meta.predicted_size, "predicted size")?,
            encoded_filesize: to_i64(meta.encoded_size, "encoded size")?,
            video_frame_count: to_i64(meta.frame_count, "frame count")?,
            segment_count: i64::from(meta.segment_count),
            duration_ms: to_i64(duration_ms, "duration")?,
            finished: meta.status as i64,
            error: meta.status == Status::Error,
            errno: meta.errno,
            averror: meta.codec_error,
            creation_time: meta.created_at.unix_timestamp(),
            access_time: meta.accessed_at.unix_timestamp(),
            file_time: meta.source_modified.unix_timestamp(),
            file_size: to_i64(meta.source_size, "source size")?,
            access_count: to_i64(meta.access_count, "access count")?,
        })
    }
}

impl TryFrom<EntryRow> for (Key, CacheMetadata) {
    type Error = Error;
    fn try_from(row: EntryRow) -> Result<Self> {
        let params = EncodeParams {
            audio_bitrate: to_u64(row.audio_bitrate, "audio bitrate")?,
            audio_samplerate: to_u32(row.audio_samplerate, "audio sample rate")?,
            video_bitrate: to_u64(row.video_bitrate, "video bitrate")?,
            video_width: to_u32(row.video_width, "video width")?,
            video_height: to_u32(row.video_height, "video height")?,
            deinterlace: row.deinterlace,
        };
        let meta = CacheMetadata {
            params,
            status: Status::from_code(row.finished).ok_or_raise(|| ErrorKind::InvalidData("status"))?,
            predicted_size: to_u64(row.predicted_filesize, "predicted size")?,
            encoded_size: to_u64(row.encoded_filesize, "encoded size")?,
            frame_count: to_u64(row.video_frame_count, "frame count")?,
            segment_count: to_u32(row.segment_count, "segment count")?,
            duration: Duration::from_millis(to_u64(row.duration_ms, "duration")?),
            errno: row.errno,
            codec_error: row.averror,
            created_at: to_time(row.creation_time, "creation time")?,
            accessed_at: to_time(row.access_time, "access time")?,
            source_modified: to_time(row.file_time, "source modification time")?,
            source_size: to_u64(row.file_size, "source size")?,
            access_count: to_u64(row.access_count, "access count")?,
        };
        Ok((Key::new(PathBuf::from(row.filename), row.desttype), meta))
    }
}

/// Key plus encoded size; all that the pruning passes need.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SizeRow {
    filename: String,
    desttype: String,
    encoded_filesize: i64,
}

impl TryFrom<SizeRow> for (Key, u64) {
    type Error = Error;
    fn try_from(row: SizeRow) -> Result<Self> {
        let size = to_u64(row.encoded_filesize, "encoded size")?;
        Ok((Key::new(PathBuf::from(row.filename), row.desttype), size))
    }
}
