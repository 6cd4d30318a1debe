//! File storage module for rapidstore.
//!
//! This module splits a stored file into two cooperating stores:
//! - Metadata records (id, name, mime, size, visibility, lifecycle status)
//! - Blobs placed under a sharded directory tree derived from the id
//!
//! [`StorageService`] is the entry point and the only part that talks to both.

mod gc;
mod metadata;
mod mime;
mod saga;
mod service;
mod shard;
mod sniff;
mod status;
mod storage;

pub use gc::{GarbageCollector, SweepReport};
pub use metadata::{
    generated_name, FileRecord, FileRecordUpdate, MetadataStore, NewFileRecord, StatusFilter,
};
pub use mime::{MimeEntry, MimeRepository, MAX_MIME_ATTEMPTS};
pub use saga::{Compensation, Saga, SagaStep};
pub use service::{CreateOptions, StorageService};
pub use shard::{to_base36, KeySharding, ShardPath, DEFAULT_SHARD_FANOUT};
pub use sniff::{
    extension_for_mime, MimeDetector, SignatureMimeDetector, BINARY_MIME, EMPTY_MIME, TEXT_MIME,
};
pub use status::Status;
pub use storage::{ActualInfo, BlobKey, BlobStore, LocalBlobStore};
