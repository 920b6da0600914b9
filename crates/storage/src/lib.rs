//! Persistence layer for every versioned resource.
//!
//! Each mutation of an entity appends a new `(id, version)` record; nothing
//! is ever overwritten. The latest record is the "current" one. Writers
//! must present the version they last read (compare-and-swap) and a
//! soft-deleted entity refuses further mutation.

pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use record::{NewRecord, Page, Pagination, RecordFilter, RecordUpdate, VersionedRecord};
pub use traits::EntityStore;

/// Current UNIX time in whole seconds.
pub fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
