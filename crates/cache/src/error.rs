//! Cache Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.
//!
//! Every kind maps onto a POSIX error code through [`ErrorKind::errno`], which
//! is what a filesystem front-end ultimately hands back to its callers.

use derive_more::{Display, Error};
use mediacache_buffer::error::Error as BufferError;
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The durable index could not be read or written.
    #[display("cache index error")]
    Index,
    /// Growing, mapping or reading an output buffer failed.
    #[display("cache buffer error (errno {_0})")]
    Buffer(#[error(not(source))] i32),
    /// The source file could not be inspected.
    #[display("cannot access source {} (errno {_1})", _0.display())]
    Source(#[error(not(source))] PathBuf, #[error(not(source))] i32),
    /// The transcoder gave up. Both codes are kept for diagnosis.
    #[display("transcoding failed (errno {errno}, codec error {code})")]
    Transcode { errno: i32, code: i32 },
    /// Decoding stopped (inactivity, shutdown, eviction) before the requested
    /// range was produced. The next open starts over.
    #[display("transcoding aborted")]
    Aborted,
    /// Even an empty cache would not leave enough free disk space.
    #[display("not enough disk space: need {needed} bytes, {available} available")]
    OutOfSpace { needed: u64, available: u64 },
    /// No worker slot could be obtained because the cache is shutting down.
    #[display("cache is busy or shutting down")]
    Busy,
    /// The key cannot be mapped onto a cache file.
    #[display("invalid cache key")]
    InvalidKey,
    /// The entry handle was freed or evicted.
    #[display("cache entry closed")]
    Closed,
}

impl ErrorKind {
    /// Wrap a buffer error, keeping its error code and its `Exn` frame as a
    /// child in this error tree.
    #[track_caller]
    pub fn buffer(err: BufferError) -> Error {
        let errno = err.errno();
        err.raise(ErrorKind::Buffer(errno))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Aborted | Self::Busy)
    }

    /// POSIX error code to report back through the filesystem layer.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Index | Self::Aborted => libc::EIO,
            Self::Buffer(errno) | Self::Source(_, errno) => *errno,
            Self::Transcode { errno, .. } => match *errno {
                0 => libc::EIO,
                errno => errno,
            },
            Self::OutOfSpace { .. } => libc::ENOSPC,
            Self::Busy => libc::EBUSY,
            Self::InvalidKey => libc::EINVAL,
            Self::Closed => libc::EBADF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::Index, libc::EIO)]
    #[case(ErrorKind::Buffer(libc::ENOMEM), libc::ENOMEM)]
    #[case(ErrorKind::Transcode { errno: 0, code: -22 }, libc::EIO)]
    #[case(ErrorKind::Transcode { errno: libc::ENOENT, code: 0 }, libc::ENOENT)]
    #[case(ErrorKind::OutOfSpace { needed: 10, available: 1 }, libc::ENOSPC)]
    #[case(ErrorKind::Busy, libc::EBUSY)]
    #[case(ErrorKind::Closed, libc::EBADF)]
    fn test_errno_mapping(#[case] kind: ErrorKind, #[case] expected: i32) {
        assert_eq!(kind.errno(), expected);
    }

    #[test]
    fn test_buffer_errors_keep_their_code() {
        let buffer = mediacache_buffer::GrowableBuffer::new("/nonexistent/never-opened");
        let err = ErrorKind::buffer(buffer.flush().unwrap_err());
        assert!(matches!(&*err, ErrorKind::Buffer(code) if *code == libc::EBADF));
    }
}
