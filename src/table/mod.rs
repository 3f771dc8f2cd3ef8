//! Dictionary tables: the entry list, its file locks and bucket maintenance.

pub mod bucket;
pub mod dictionary;
pub mod entry;
pub mod filter;
pub mod lock;

pub use bucket::{BucketManager, PackLevel, BUCKETIZE_LOCK};
pub use dictionary::DictionaryTable;
pub use entry::DictionaryEntry;
pub use filter::TableFilter;
pub use lock::{LockKind, LockMarker, TableLock, TableLocks};
