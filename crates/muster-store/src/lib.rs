//! Named-blob persistence for engine snapshots.
//!
//! The coordinator only needs get/put/exists semantics, so any durable
//! backend (file, object store, database row) can sit behind
//! [`SnapshotStore`].

/// Store trait and backends.
pub mod store;

pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
