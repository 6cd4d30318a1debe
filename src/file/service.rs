//! Storage service: the public entry point.
//!
//! Coordinates the metadata store and the blob store. Every mutating operation
//! runs as a [`Saga`]: metadata first (to learn the id), then the blob, then a
//! reconciling metadata update from what actually landed on disk, then commit.
//!
//! Operations come in two flavours: `op(...)` checks out its own pooled
//! connection, `op_in(conn, ...)` runs on a connection the caller holds. A
//! connection already inside a transaction makes the saga a savepoint.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use super::gc::{GarbageCollector, SweepReport};
use super::metadata::{FileRecord, FileRecordUpdate, MetadataStore, NewFileRecord, StatusFilter};
use super::mime::MimeRepository;
use super::saga::{Compensation, Saga, SagaStep};
use super::shard::KeySharding;
use super::sniff::{MimeDetector, SignatureMimeDetector};
use super::status::Status;
use super::storage::{BlobKey, BlobStore, LocalBlobStore};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::{Result, StorageError};

/// Options for creating a file.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Store under the private root.
    pub is_private: bool,
    /// TTL: the file is soft-deleted by the sweep once this passes.
    pub delete_at: Option<DateTime<Utc>>,
    /// Remove the source once the file is committed (paths only).
    pub remove_source: bool,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the visibility.
    pub fn private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }

    /// Set the TTL expiry.
    pub fn delete_at(mut self, delete_at: DateTime<Utc>) -> Self {
        self.delete_at = Some(delete_at);
        self
    }

    /// Consume the source file.
    pub fn remove_source(mut self, remove_source: bool) -> Self {
        self.remove_source = remove_source;
        self
    }
}

/// Storage service coordinating metadata and blobs.
#[derive(Debug, Clone)]
pub struct StorageService {
    db: Database,
    metadata: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    detector: Arc<dyn MimeDetector>,
    clock: Arc<dyn Clock>,
    base_public_url: String,
}

impl StorageService {
    /// Create a new StorageService using the system clock.
    pub fn new(db: Database, blobs: Arc<dyn BlobStore>, detector: Arc<dyn MimeDetector>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            db,
            metadata: MetadataStore::new(clock.clone()),
            blobs,
            detector,
            clock,
            base_public_url: String::new(),
        }
    }

    /// Wire a service from configuration: opens the database and the local
    /// blob store.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        let db = Database::open(&config.database.path).await?;
        let detector: Arc<dyn MimeDetector> = Arc::new(SignatureMimeDetector);
        let sharding = KeySharding::new(config.storage.shard_fanout)?;
        let blobs = LocalBlobStore::new(
            &config.storage.public_root,
            &config.storage.private_root,
            &config.storage.public_url,
            sharding,
            detector.clone(),
        )?;

        info!(
            public_root = %config.storage.public_root,
            private_root = %config.storage.private_root,
            fanout = sharding.fanout(),
            "Storage service ready"
        );

        Ok(Self::new(db, Arc::new(blobs), detector)
            .with_base_public_url(config.storage.base_public_url.clone()))
    }

    /// Replace the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.metadata = MetadataStore::new(clock.clone());
        self.clock = clock;
        self
    }

    /// Set the URL prefix used for absolute URLs.
    pub fn with_base_public_url(mut self, url: impl Into<String>) -> Self {
        self.set_base_public_url(url);
        self
    }

    /// Set the URL prefix used for absolute URLs.
    pub fn set_base_public_url(&mut self, url: impl Into<String>) {
        self.base_public_url = url.into().trim_end_matches('/').to_string();
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// The garbage collector over this service's stores.
    pub fn gc(&self) -> GarbageCollector {
        GarbageCollector::new(self.db.clone(), self.metadata.clone(), self.blobs.clone())
    }

    // --- Create ---

    /// Store a copy of `source`. Returns the new id.
    ///
    /// The blob keeps the source's file name. With `remove_source` the source
    /// is removed once the change is committed, never before.
    pub async fn create_from_path(&self, source: &Path, options: &CreateOptions) -> Result<i64> {
        let mut conn = self.db.acquire().await?;
        self.create_from_path_in(&mut conn, source, options).await
    }

    pub async fn create_from_path_in(
        &self,
        conn: &mut SqliteConnection,
        source: &Path,
        options: &CreateOptions,
    ) -> Result<i64> {
        let size = check_source(source, options.remove_source)?;
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                StorageError::Validation(format!(
                    "source {} has no usable file name",
                    source.display()
                ))
            })?;
        let mime = self.detector.detect_path(source)?;

        let draft = NewFileRecord::new(name, mime, size)
            .with_private(options.is_private)
            .with_delete_at(options.delete_at);

        let mut saga = Saga::begin(conn, self.blobs.clone(), "create_from_path").await?;
        let result = self.create_from_path_steps(&mut saga, &draft, source).await;
        let id = saga.finish(result).await?;

        if options.remove_source {
            remove_consumed_source(id, source);
        }

        info!(id, source = %source.display(), "Created file from path");
        Ok(id)
    }

    async fn create_from_path_steps(
        &self,
        saga: &mut Saga<'_>,
        draft: &NewFileRecord,
        source: &Path,
    ) -> Result<i64> {
        let record = self.metadata.create(saga.conn()?, draft).await?;
        saga.advance(SagaStep::MetadataReserved)?;

        let key = BlobKey::from(&record);
        saga.set_compensation(Compensation::EraseBlob(key.clone()));
        self.blobs.copy_in(&key, source, false)?;
        saga.advance(SagaStep::BlobWritten)?;

        self.reconcile(saga, &key).await?;
        Ok(record.id)
    }

    /// Store `content` under a generated name. Returns the new id.
    pub async fn create_from_content(
        &self,
        content: &[u8],
        options: &CreateOptions,
    ) -> Result<i64> {
        let mut conn = self.db.acquire().await?;
        self.create_from_content_in(&mut conn, content, options).await
    }

    pub async fn create_from_content_in(
        &self,
        conn: &mut SqliteConnection,
        content: &[u8],
        options: &CreateOptions,
    ) -> Result<i64> {
        let size = i64::try_from(content.len())
            .map_err(|_| StorageError::Validation("content too large".to_string()))?;
        let draft = NewFileRecord::new("", self.detector.detect_bytes(content), size)
            .with_private(options.is_private)
            .with_delete_at(options.delete_at);

        let mut saga = Saga::begin(conn, self.blobs.clone(), "create_from_content").await?;
        let result = self.create_from_content_steps(&mut saga, &draft, content).await;
        let id = saga.finish(result).await?;

        info!(id, bytes = content.len(), "Created file from content");
        Ok(id)
    }

    async fn create_from_content_steps(
        &self,
        saga: &mut Saga<'_>,
        draft: &NewFileRecord,
        content: &[u8],
    ) -> Result<i64> {
        let record = self.metadata.create(saga.conn()?, draft).await?;
        saga.advance(SagaStep::MetadataReserved)?;

        let key = BlobKey::from(&record);
        saga.set_compensation(Compensation::EraseBlob(key.clone()));
        self.blobs.write(&key, content, false)?;
        saga.advance(SagaStep::BlobWritten)?;

        self.reconcile(saga, &key).await?;
        Ok(record.id)
    }

    // --- Put ---

    /// Replace (or append to) an active file's content from `source`.
    ///
    /// Returns `false` if there is no active file `id`. With `remove_source`
    /// the source is removed once the change is committed. A failed put that
    /// leaves the file without a blob marks it [`Status::Lost`].
    pub async fn put_from_path(
        &self,
        id: i64,
        source: &Path,
        append: bool,
        remove_source: bool,
    ) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.put_from_path_in(&mut conn, id, source, append, remove_source)
            .await
    }

    pub async fn put_from_path_in(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        source: &Path,
        append: bool,
        remove_source: bool,
    ) -> Result<bool> {
        check_source(source, remove_source)?;

        let mut saga = Saga::begin(&mut *conn, self.blobs.clone(), "put_from_path").await?;
        let key = match self.active_key(&mut saga, id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                saga.cancel().await?;
                return Ok(false);
            }
            Err(e) => return saga.finish(Err(e)).await,
        };
        let result = self
            .put_steps(&mut saga, &key, |blobs, key| blobs.copy_in(key, source, append))
            .await;
        if let Err(e) = saga.finish(result).await {
            self.mark_lost_if_blob_missing(conn, &key).await;
            return Err(e);
        }

        if remove_source {
            remove_consumed_source(id, source);
        }

        debug!(id, append, "Put file content from path");
        Ok(true)
    }

    /// Replace (or append to) an active file's content.
    ///
    /// Fails with `NotFound` if there is no active file `id`. A failed put
    /// that leaves the file without a blob marks it [`Status::Lost`].
    pub async fn put_content(&self, id: i64, content: &[u8], append: bool) -> Result<i64> {
        let mut conn = self.db.acquire().await?;
        self.put_content_in(&mut conn, id, content, append).await
    }

    pub async fn put_content_in(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        content: &[u8],
        append: bool,
    ) -> Result<i64> {
        let mut saga = Saga::begin(&mut *conn, self.blobs.clone(), "put_content").await?;
        let key = match self.active_key(&mut saga, id).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                saga.cancel().await?;
                return Err(StorageError::NotFound(format!("file {id}")));
            }
            Err(e) => return saga.finish(Err(e)).await,
        };
        let result = self
            .put_steps(&mut saga, &key, |blobs, key| blobs.write(key, content, append))
            .await;
        if let Err(e) = saga.finish(result).await {
            self.mark_lost_if_blob_missing(conn, &key).await;
            return Err(e);
        }

        debug!(id, bytes = content.len(), append, "Put file content");
        Ok(id)
    }

    async fn put_steps<F>(&self, saga: &mut Saga<'_>, key: &BlobKey, write: F) -> Result<()>
    where
        F: FnOnce(&dyn BlobStore, &BlobKey) -> Result<()>,
    {
        saga.advance(SagaStep::MetadataReserved)?;

        saga.set_compensation(Compensation::EraseBlob(key.clone()));
        write(self.blobs.as_ref(), key)?;
        saga.advance(SagaStep::BlobWritten)?;

        self.reconcile(saga, key).await
    }

    /// Blob key of active file `id`, read under the saga's write lock so a
    /// concurrent visibility change cannot leave it stale.
    async fn active_key(&self, saga: &mut Saga<'_>, id: i64) -> Result<Option<BlobKey>> {
        let record = self
            .metadata
            .get(saga.conn()?, id, StatusFilter::default())
            .await?;
        Ok(record.as_ref().map(BlobKey::from))
    }

    /// Compensating a put erases the blob, committed bytes included. Flag the
    /// record so it no longer reads as active.
    async fn mark_lost_if_blob_missing(&self, conn: &mut SqliteConnection, key: &BlobKey) {
        if self.blobs.exists(key) {
            return;
        }

        match self.metadata.set_status(conn, key.id, Status::Lost).await {
            Ok(true) => warn!(id = key.id, "Failed put erased the blob, file marked lost"),
            Ok(false) => {}
            Err(e) => error!(id = key.id, error = %e, "Failed to mark file lost"),
        }
    }

    /// Write what is actually on disk back into the record.
    async fn reconcile(&self, saga: &mut Saga<'_>, key: &BlobKey) -> Result<()> {
        let actual = self.blobs.inspect_actual(key).map_err(|e| {
            StorageError::Inconsistency(format!("cannot inspect blob {key} after write: {e}"))
        })?;

        let size = i64::try_from(actual.size).map_err(|_| {
            StorageError::Inconsistency(format!("blob {key} size {} out of range", actual.size))
        })?;
        let update = FileRecordUpdate::new()
            .size(size)
            .mime_type(actual.mime_type);

        let updated = self
            .metadata
            .update(saga.conn()?, key.id, &update)
            .await
            .map_err(|e| {
                StorageError::Inconsistency(format!("cannot reconcile file record {}: {e}", key.id))
            })?;
        if !updated {
            return Err(StorageError::Inconsistency(format!(
                "file record {} vanished before reconcile",
                key.id
            )));
        }

        saga.advance(SagaStep::Reconciled)
    }

    // --- Read ---

    /// Content of an active file, or `None` if there is none.
    ///
    /// A blob that is missing on the first attempt is looked up once more,
    /// since a concurrent visibility change may have just moved it.
    pub async fn get_content(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let mut conn = self.db.acquire().await?;
        self.get_content_in(&mut conn, id).await
    }

    pub async fn get_content_in(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<Option<Vec<u8>>> {
        let mut retried = false;
        loop {
            let active = self.metadata.get(&mut *conn, id, StatusFilter::default()).await?;
            let Some(record) = active else {
                return Ok(None);
            };

            match self.blobs.read(&BlobKey::from(&record)) {
                Ok(content) => return Ok(Some(content)),
                Err(e) if e.is_not_found() && !retried => {
                    debug!(id, "Blob not found, retrying once");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Copy an active file's content to `destination`.
    ///
    /// Returns `false` if there is no active file `id`.
    pub async fn get_content_to_file(&self, id: i64, destination: &Path) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        let Some(record) = self.metadata.get(&mut conn, id, StatusFilter::default()).await? else {
            return Ok(false);
        };

        self.blobs.read_to_path(&BlobKey::from(&record), destination)?;
        Ok(true)
    }

    /// Whether an active file `id` exists.
    pub async fn exists(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.metadata.exists(&mut conn, id, StatusFilter::default()).await
    }

    /// Record of file `id` under the given filter.
    pub async fn get_record(&self, id: i64, filter: StatusFilter) -> Result<Option<FileRecord>> {
        let mut conn = self.db.acquire().await?;
        self.metadata.get(&mut conn, id, filter).await
    }

    async fn active_record(&self, id: i64) -> Result<Option<FileRecord>> {
        self.get_record(id, StatusFilter::default()).await
    }

    /// Size in bytes of an active file.
    pub async fn get_size(&self, id: i64) -> Result<Option<u64>> {
        Ok(self
            .active_record(id)
            .await?
            .map(|r| r.size.max(0) as u64))
    }

    /// Last modification time of an active file (creation time if never
    /// updated).
    pub async fn get_mtime(&self, id: i64) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .active_record(id)
            .await?
            .map(|r| r.updated_at.unwrap_or(r.created_at)))
    }

    /// Mime type of an active file.
    pub async fn get_mime(&self, id: i64) -> Result<Option<String>> {
        Ok(self.active_record(id).await?.and_then(|r| r.mime_type))
    }

    /// URL of an active public file; `None` if private or not active.
    ///
    /// `absolute` prefixes the base public URL.
    pub async fn get_url(&self, id: i64, absolute: bool) -> Result<Option<String>> {
        let Some(record) = self.active_record(id).await? else {
            return Ok(None);
        };
        if record.is_private {
            return Ok(None);
        }

        let Some(url) = self.blobs.public_url(&BlobKey::from(&record)) else {
            return Ok(None);
        };

        if absolute {
            Ok(Some(format!(
                "{}/{}",
                self.base_public_url,
                url.trim_start_matches('/')
            )))
        } else {
            Ok(Some(url))
        }
    }

    // --- Lifecycle ---

    /// Soft delete. The blob stays until the next GC sweep.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.metadata.soft_delete(&mut conn, id).await
    }

    /// Undo a soft delete.
    pub async fn restore(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.metadata.restore(&mut conn, id).await
    }

    /// Move file `id` to `status` if the lifecycle allows it.
    pub async fn set_status(&self, id: i64, status: Status) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.metadata.set_status(&mut conn, id, status).await
    }

    // --- Visibility ---

    /// Move an active public file under the private root.
    ///
    /// Returns `false` if the file does not exist or is already private.
    pub async fn set_private(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.set_visibility_in(&mut conn, id, true).await
    }

    /// Move an active private file under the public root.
    ///
    /// Returns `false` if the file does not exist or is already public.
    pub async fn set_public(&self, id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        self.set_visibility_in(&mut conn, id, false).await
    }

    pub async fn set_visibility_in(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        to_private: bool,
    ) -> Result<bool> {
        let operation = if to_private { "set_private" } else { "set_public" };
        let mut saga = Saga::begin(conn, self.blobs.clone(), operation).await?;
        let key = match self.active_key(&mut saga, id).await {
            Ok(Some(key)) if key.is_private != to_private => key,
            Ok(_) => {
                saga.cancel().await?;
                return Ok(false);
            }
            Err(e) => return saga.finish(Err(e)).await,
        };
        let result = self.visibility_steps(&mut saga, &key, to_private).await;
        saga.finish(result).await?;

        debug!(id, to_private, "Changed file visibility");
        Ok(true)
    }

    async fn visibility_steps(
        &self,
        saga: &mut Saga<'_>,
        key: &BlobKey,
        to_private: bool,
    ) -> Result<()> {
        if !self
            .metadata
            .set_visibility_flag(saga.conn()?, key.id, to_private)
            .await?
        {
            return Err(StorageError::Inconsistency(format!(
                "file record {} vanished before visibility change",
                key.id
            )));
        }
        saga.advance(SagaStep::MetadataReserved)?;

        let moved = key.with_private(to_private);
        saga.set_compensation(Compensation::RestoreVisibility {
            key: moved.clone(),
            to_private: key.is_private,
        });
        self.blobs.change_visibility(key, to_private)?;
        saga.advance(SagaStep::BlobWritten)?;

        self.reconcile(saga, &moved).await
    }

    // --- Administration ---

    /// Erase a mime entry. Records using it keep existing with no mime type.
    pub async fn erase_mime(&self, mime_id: i64) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        let erased = MimeRepository::erase(&mut conn, mime_id).await?;
        if erased {
            info!(mime_id, "Erased mime entry");
        }
        Ok(erased)
    }

    /// Soft-delete every active file whose TTL has passed.
    pub async fn process_set_to_delete_files(&self) -> Result<u64> {
        self.gc().process_set_to_delete_files(self.clock.now()).await
    }

    /// Erase the blobs of every deleted file.
    pub async fn remove_deleted_files(&self) -> Result<SweepReport> {
        self.gc().remove_deleted_files().await
    }
}

/// Remove a source file whose content is now committed.
fn remove_consumed_source(id: i64, source: &Path) {
    if let Err(e) = fs::remove_file(source) {
        warn!(id, source = %source.display(), error = %e, "Failed to remove source");
    }
}

/// Validate a source file and return its size.
fn check_source(source: &Path, remove_source: bool) -> Result<i64> {
    let metadata = fs::metadata(source).map_err(|e| {
        StorageError::Validation(format!("source {} is not readable: {e}", source.display()))
    })?;

    if !metadata.is_file() {
        return Err(StorageError::Validation(format!(
            "source {} is not a file",
            source.display()
        )));
    }

    fs::File::open(source).map_err(|e| {
        StorageError::Validation(format!("source {} is not readable: {e}", source.display()))
    })?;

    if remove_source && metadata.permissions().readonly() {
        return Err(StorageError::Validation(format!(
            "source {} cannot be removed",
            source.display()
        )));
    }

    i64::try_from(metadata.len())
        .map_err(|_| StorageError::Validation(format!("source {} is too large", source.display())))
}
