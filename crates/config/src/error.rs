//! Configuration Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A provider could not be read, or a value has the wrong type.
    #[display("could not load configuration")]
    Load,
    /// Only TOML, YAML and JSON files are understood.
    #[display("unsupported configuration file format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// The values parse, but do not make sense together.
    #[display("invalid configuration value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}
