//! rapidstore - blob storage with a relational metadata store
//!
//! Files are split into a metadata record (SQLite through sqlx) and a blob
//! on the local filesystem under a three-level sharded directory tree.

pub mod clock;
pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod file;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::Database;
pub use error::{Result, StorageError};
pub use file::{
    BlobKey, BlobStore, CreateOptions, FileRecord, GarbageCollector, LocalBlobStore, Status,
    StatusFilter, StorageService, SweepReport,
};
