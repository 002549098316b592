//! Durable metadata index for the transcoding cache.
//!
//! Every cache entry has a row in a small SQLite database that lives next to
//! the cached output. The row records how the output was produced (encoder
//! settings, source file snapshot), how far production got (status, sizes,
//! error codes) and when it was last used. A restarted process reads these
//! rows to decide whether existing output can be served as-is or must be
//! thrown away and re-encoded.
//!
//! The schema is versioned through embedded migrations; an index that cannot
//! be brought up to date refuses to open.

mod db;
pub mod error;
mod models;
mod repo;

pub use crate::db::{Database, INDEX_FILE};
pub use crate::models::{CacheMetadata, EncodeParams, Key, Status};
pub use crate::repo::CacheIndex;
