//! Deterministic cache file naming.
//!
//! A cache file lives at `<cache root>/<origin path>.cache.<desttype>`, the
//! origin path being re-rooted underneath the cache directory. Restarted
//! processes rebuild the same name from the same key, which is how existing
//! output is rediscovered.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

const CACHE_INFIX: &str = ".cache.";

/// Re-roots an origin path so that it can be appended to the cache root.
///
/// Root and current-directory components are dropped, parent references are
/// resolved lexically, and anything that would climb above the root (or
/// contains a null byte) is rejected with [`ErrorKind::InvalidPath`].
///
/// ```
/// use std::path::Path;
/// use mediacache_buffer::validate_path;
/// assert_eq!(validate_path("/music/album/01.flac").unwrap(), Path::new("music/album/01.flac"));
/// assert_eq!(validate_path("/music/../video/a.mkv").unwrap(), Path::new("video/a.mkv"));
/// assert!(validate_path("/../etc/passwd").is_err());
/// assert!(validate_path("/").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let invalid = || ErrorKind::InvalidPath(path.to_path_buf());
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) if part.as_encoded_bytes().contains(&0) => exn::bail!(invalid()),
            Component::Normal(part) => parts.push(part),
            Component::RootDir | Component::CurDir => {},
            Component::ParentDir => {
                if parts.pop().is_none() {
                    exn::bail!(invalid());
                }
            },
            Component::Prefix(_) => exn::bail!(invalid()),
        }
    }
    if parts.is_empty() {
        exn::bail!(invalid());
    }
    Ok(parts.into_iter().collect())
}

/// Builds the backing file path for the key `(origin, desttype)`.
pub fn cache_file(root: impl AsRef<Path>, origin: impl AsRef<Path>, desttype: &str) -> Result<PathBuf> {
    if desttype.is_empty() || desttype.contains(['/', '\\', '\0']) {
        exn::bail!(ErrorKind::InvalidPath(PathBuf::from(desttype)));
    }
    let relative = validate(origin)?;
    let mut name = OsString::from(root.as_ref().join(relative));
    name.push(CACHE_INFIX);
    name.push(desttype);
    Ok(PathBuf::from(name))
}

/// Backing file of HLS segment `segment` of the output stored at `base`.
///
/// The zero-padded segment number goes in front of the final extension, so
/// `a.flac.cache.hls` becomes `a.flac.cache.000001.hls` for the first segment.
/// Segment `0` is the base file itself.
pub fn segment_file(base: impl AsRef<Path>, segment: u32) -> PathBuf {
    let base = base.as_ref();
    if segment == 0 {
        return base.to_path_buf();
    }
    match base.extension() {
        Some(ext) => {
            let mut extension = OsString::from(format!("{segment:06}."));
            extension.push(ext);
            base.with_extension(extension)
        },
        None => base.with_extension(format!("{segment:06}")),
    }
}
