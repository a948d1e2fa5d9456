//! Storage layer: DuckDB reference cache guarded by a cross-process file lock.

mod cache;
mod error;
mod lock;

pub use cache::{FORK_RECORD, ROOT_ID, ROOT_RECORD, ReferenceCache, content_id};
pub use error::StoreError;
pub use lock::{ExclusiveRegion, FileLock, FileLockGuard};
