//! On-demand transcoding cache engine.
//!
//! A [`Cache`] maps every `(source file, destination type)` [`Key`] to a
//! single [`CacheEntry`]. The first open of a key starts a background worker
//! that drives a [`Transcoder`] step by step into the entry's disk-backed
//! buffer; readers block until the bytes they asked for have been produced.
//! Finished output is kept on disk, described in a durable index, and served
//! directly on later opens (also after a restart) until the source changes or
//! maintenance evicts it.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mediacache_cache::{Cache, Close, Key, Settings, TranscoderFactory};
//! # async fn run(factory: Arc<dyn TranscoderFactory>) -> mediacache_cache::error::Result<()> {
//! let cache = Cache::new(Settings::new("/var/cache/media"), factory).await?;
//! let key = Key::new("/srv/music/track.flac", "mp3");
//! let entry = cache.open(&key, true).await?;
//! let mut head = vec![0; 4096];
//! let read = entry.read(0, &mut head).await?;
//! cache.close(&entry, Close::Keep).await?;
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod entry;
pub mod error;
mod gate;
mod maintenance;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod settings;
mod transcoder;
mod worker;

pub use crate::cache::Cache;
pub use crate::entry::{CacheEntry, Close, Progress};
pub use crate::gate::{Admission, AdmissionGate};
pub use crate::maintenance::{DiskSpace, ELECTION_FILE, MaintenanceTask, SystemDiskSpace};
pub use crate::settings::{Settings, default_max_workers};
pub use crate::transcoder::{FormatInfo, Step, TranscodeError, TranscodeResult, Transcoder, TranscoderFactory};
pub use mediacache_index::{CacheMetadata, EncodeParams, Key, Status};
