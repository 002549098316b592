use derive_more::Display;
use std::path::PathBuf;

/// Identity of one transcode target: the source file plus the destination
/// type it is being converted to.
#[derive(Debug, Display, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{} -> {desttype}", path.display())]
pub struct Key {
    pub path: PathBuf,
    pub desttype: String,
}

impl Key {
    pub fn new(path: impl Into<PathBuf>, desttype: impl Into<String>) -> Self {
        Self { path: path.into(), desttype: desttype.into() }
    }
}
