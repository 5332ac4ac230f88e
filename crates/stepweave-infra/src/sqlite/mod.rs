//! SQLite storage layer.
//!
//! Snapshot persistence backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod pool;
pub mod snapshot;

pub use pool::DatabasePool;
pub use snapshot::SqliteSnapshotStore;
