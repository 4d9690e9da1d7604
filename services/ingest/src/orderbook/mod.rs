//! Order-book engine: local book, venue checksum, per-symbol manager.

pub mod book;
pub mod checksum;
pub mod manager;

pub use book::LocalBook;
pub use checksum::okx_checksum;
pub use manager::{
    BookManager, BookState, DegradedSymbols, ManagerCounters, RecordEmit, SnapshotSource, SyncMode,
};
