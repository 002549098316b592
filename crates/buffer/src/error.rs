//! Buffer Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A buffer error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for buffer operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The buffer has not been initialised (or was already released).
    #[display("buffer not open: {}", _0.display())]
    NotOpen(#[error(not(source))] PathBuf),
    /// Growing or mapping the backing file failed.
    #[display("cannot allocate {_0} bytes for buffer")]
    Allocation(#[error(not(source))] usize),
    /// Requested read offset lies beyond the current capacity.
    #[display("offset {_0} is beyond buffer capacity {_1}")]
    OutOfRange(#[error(not(source))] usize, #[error(not(source))] usize),
    /// Seek target resolves to before the start of the buffer.
    #[display("invalid seek position")]
    InvalidSeek,
    /// Segment numbers start at 1.
    #[display("invalid segment number {_0}")]
    InvalidSegment(#[error(not(source))] u32),
    /// Frame number outside `1..=frame_count`, or a frame table that does not
    /// fit the existing output.
    #[display("invalid frame number {_0}")]
    InvalidFrame(#[error(not(source))] u32),
    /// Origin path or destination type cannot be turned into a cache file name.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Allocation(_))
    }

    /// POSIX error code to report back through the filesystem layer.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotOpen(_) => libc::EBADF,
            Self::Allocation(_) | Self::OutOfRange(..) => libc::ENOMEM,
            Self::InvalidSeek | Self::InvalidPath(_) | Self::InvalidSegment(_) | Self::InvalidFrame(_) => {
                libc::EINVAL
            },
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::NotOpen(PathBuf::from("a")), libc::EBADF)]
    #[case(ErrorKind::Allocation(4096), libc::ENOMEM)]
    #[case(ErrorKind::OutOfRange(10, 5), libc::ENOMEM)]
    #[case(ErrorKind::InvalidSeek, libc::EINVAL)]
    #[case(ErrorKind::InvalidSegment(0), libc::EINVAL)]
    #[case(ErrorKind::Io(IoError::from_raw_os_error(libc::ENOSPC)), libc::ENOSPC)]
    #[case(ErrorKind::Io(IoError::other("boom")), libc::EIO)]
    fn test_errno_mapping(#[case] kind: ErrorKind, #[case] expected: i32) {
        assert_eq!(kind.errno(), expected);
    }
}
