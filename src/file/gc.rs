//! Garbage collection sweeps.
//!
//! Neither sweep schedules itself; run them from cron or a maintenance task.
//! Metadata rows of deleted files are kept as tombstones after their blobs are
//! erased.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::Serialize;
use tracing::{debug, error, info};

use super::metadata::MetadataStore;
use super::status::Status;
use super::storage::{BlobKey, BlobStore};
use crate::db::Database;
use crate::Result;

/// Outcome of a blob sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Deleted records looked at.
    pub examined: u64,
    /// Blobs erased.
    pub erased: u64,
    /// Records whose blob was already gone.
    pub missing: u64,
    /// Blobs that could not be erased.
    pub failed: u64,
}

/// Sweeps over the metadata and blob stores.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    db: Database,
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
}

impl GarbageCollector {
    pub fn new(db: Database, metadata: MetadataStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, metadata, blobs }
    }

    /// Mark every active file whose TTL has passed as deleted.
    pub async fn process_set_to_delete_files(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.db.acquire().await?;
        let swept = self.metadata.sweep_expired(&mut conn, now).await?;

        info!(swept, "Expired files marked deleted");
        Ok(swept)
    }

    /// Erase the blob of every deleted file.
    ///
    /// A failure on one blob is logged and counted; the sweep goes on.
    pub async fn remove_deleted_files(&self) -> Result<SweepReport> {
        let mut conn = self.db.acquire().await?;
        let mut records = self.metadata.list_by_status(&mut conn, Status::Deleted);
        let mut report = SweepReport::default();

        while let Some(record) = records.try_next().await? {
            report.examined += 1;
            let key = BlobKey::from(&record);

            match self.blobs.erase(&key) {
                Ok(true) => {
                    debug!(%key, "Erased deleted blob");
                    report.erased += 1;
                }
                Ok(false) => report.missing += 1,
                Err(e) => {
                    error!(%key, error = %e, "Failed to erase deleted blob");
                    report.failed += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            erased = report.erased,
            missing = report.missing,
            failed = report.failed,
            "Deleted blob sweep finished"
        );
        Ok(report)
    }
}
