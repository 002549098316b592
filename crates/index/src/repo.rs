//! Repository over the `cache_entry` table.
//!
//! The index is the durable twin of every cache entry's in-memory metadata.
//! An absent row is not an error: it only means there is nothing reusable on
//! disk for that key and the output has to be produced from scratch.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{CacheMetadata, EntryRow, Key, SizeRow, path_to_string};
use exn::ResultExt;
use sqlx::SqlitePool;
use time::UtcDateTime;
use tracing::{instrument, trace};

/// Durable metadata store keyed by `(source path, destination type)`.
#[derive(Debug, Clone)]
pub struct CacheIndex {
    pool: SqlitePool,
}
impl From<&Database> for CacheIndex {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl CacheIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Fetch the stored metadata for `key`, if any.
    pub async fn get(&self, key: &Key) -> Result<Option<CacheMetadata>> {
        let row: Option<EntryRow> = sqlx::query_as(include_str!("../queries/select_entry.sql"))
            .bind(path_to_string(key)?)
            .bind(&key.desttype)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let found = row.map(<(Key, CacheMetadata)>::try_from).transpose()?.map(|(_, meta)| meta);
        trace!(%key, hit = found.is_some(), "index lookup");
        Ok(found)
    }

    /// Every indexed key with its encoded size, least recently accessed first.
    pub async fn list_by_access(&self) -> Result<Vec<(Key, u64)>> {
        let rows: Vec<SizeRow> = sqlx::query_as(include_str!("../queries/list_by_access.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(<(Key, u64)>::try_from).collect()
    }

    /// Keys last accessed strictly before `cutoff`, least recently accessed first.
    pub async fn list_expired(&self, cutoff: UtcDateTime) -> Result<Vec<Key>> {
        let rows: Vec<SizeRow> = sqlx::query_as(include_str!("../queries/list_expired.sql"))
            .bind(cutoff.unix_timestamp())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| <(Key, u64)>::try_from(row).map(|(key, _)| key)).collect()
    }

    pub async fn list_keys(&self) -> Result<Vec<Key>> {
        Ok(self.list_by_access().await?.into_iter().map(|(key, _)| key).collect())
    }

    /// Sum of encoded sizes over all indexed entries.
    pub async fn total_encoded_size(&self) -> Result<u64> {
        let (total,): (i64,) = sqlx::query_as(include_str!("../queries/total_encoded_size.sql"))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(total).or_raise(|| ErrorKind::InvalidData("total encoded size"))
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Insert or replace the row for `key`.
    #[instrument(level = "debug", skip(self, key, meta), fields(key = %key, status = %meta.status))]
    pub async fn upsert(&self, key: &Key, meta: &CacheMetadata) -> Result<()> {
        let row = EntryRow::try_from((key, meta))?;
        sqlx::query(include_str!("../queries/upsert_entry.sql"))
            .bind(row.filename)
            .bind(row.desttype)
            .bind(row.audio_bitrate)
            .bind(row.audio_samplerate)
            .bind(row.video_bitrate)
            .bind(row.video_width)
            .bind(row.video_height)
            .bind(row.deinterlace)
            .bind(row.predicted_filesize)
            .bind(row.encoded_filesize)
            .bind(row.video_frame_count)
            .bind(row.segment_count)
            .bind(row.duration_ms)
            .bind(row.finished)
            .bind(row.error)
            .bind(row.errno)
            .bind(row.averror)
            .bind(row.creation_time)
            .bind(row.access_time)
            .bind(row.file_time)
            .bind(row.file_size)
            .bind(row.access_count)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Record an access at `when`. Returns `false` if `key` is not indexed.
    pub async fn touch(&self, key: &Key, when: UtcDateTime) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/touch_entry.sql"))
            .bind(when.unix_timestamp())
            .bind(path_to_string(key)?)
            .bind(&key.desttype)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete the row for `key`. Returns `false` if there was none.
    pub async fn delete(&self, key: &Key) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
            .bind(path_to_string(key)?)
            .bind(&key.desttype)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
