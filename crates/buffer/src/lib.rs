//! Disk-backed output buffers for the transcoding cache.
//!
//! Every cached transcode target owns exactly one [`GrowableBuffer`]: a
//! memory-mapped file that grows as the encoder produces output and is
//! truncated back down to the valid bytes when released. The file name is
//! derived from the cache key (see [`cache_file`]) so that a restarted
//! process can find and reuse what an earlier one produced.
//!
//! Two layouts sit on top of the plain byte stream. HLS output is split into
//! numbered segments, each in its own backing file next to the main one
//! (see [`segment_file`]). Frame sets store one image per video frame behind
//! a fixed slot table at the start of the main file, so single frames can be
//! written and read back in any order.

mod buffer;
pub mod error;
mod path;

pub use crate::buffer::{FRAME_SLOT, GrowableBuffer, PAGE_SIZE};
pub use crate::path::{cache_file, segment_file, validate as validate_path};
