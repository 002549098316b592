mod key;
mod metadata;
mod row;

pub use self::key::Key;
pub use self::metadata::{CacheMetadata, EncodeParams, Status};
pub(crate) use self::row::{EntryRow, SizeRow, path_to_string};
