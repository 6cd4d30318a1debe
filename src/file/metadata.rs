//! File records and the metadata store.
//!
//! The metadata store owns the relational side of a file: identity,
//! attributes, lifecycle status and timestamps. Every operation runs on a
//! connection supplied by the caller so it joins whatever transaction the
//! caller holds.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Row, Sqlite, SqliteConnection};
use std::sync::Arc;
use tracing::debug;

use super::mime::MimeRepository;
use super::shard::to_base36;
use super::sniff::extension_for_mime;
use super::status::Status;
use crate::clock::Clock;
use crate::datetime::{from_unix, from_unix_opt, to_unix};
use crate::{Result, StorageError};

/// Placeholder stored until a generated name replaces it.
const UNNAMED: &str = "__unnamed__";

/// Metadata for a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    /// Unique file id, assigned on insert and never changed.
    pub id: i64,
    /// Final path segment of the blob.
    pub name: String,
    /// Mime type; `None` once its mime entry has been erased.
    pub mime_type: Option<String>,
    /// Size in bytes.
    pub size: i64,
    /// Whether the blob lives under the private root.
    pub is_private: bool,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status_time: Option<DateTime<Utc>>,
    /// When the record becomes eligible for soft deletion.
    pub delete_at_time: Option<DateTime<Utc>>,
}

fn decode_time(column: &str, secs: i64) -> sqlx::Result<DateTime<Utc>> {
    from_unix(secs).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(StorageError::Validation(format!(
            "timestamp {secs} out of range"
        ))),
    })
}

impl<'r> FromRow<'r, SqliteRow> for FileRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let status: i64 = row.try_get("status")?;
        let status = Status::try_from(status).map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            mime_type: row.try_get("mime")?,
            size: row.try_get("size")?,
            is_private: row.try_get("is_private")?,
            status,
            created_at: decode_time("created_at", row.try_get("created_at")?)?,
            updated_at: from_unix_opt(row.try_get("updated_at")?),
            status_time: from_unix_opt(row.try_get("status_time")?),
            delete_at_time: from_unix_opt(row.try_get("delete_at_time")?),
        })
    }
}

/// Data for creating a new file record.
#[derive(Debug, Clone, Serialize)]
pub struct NewFileRecord {
    /// Blob name; empty means "generate one from the id".
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub is_private: bool,
    pub status: Status,
    pub delete_at_time: Option<DateTime<Utc>>,
}

impl NewFileRecord {
    /// Create a new draft with Active status and public visibility.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            is_private: false,
            status: Status::Active,
            delete_at_time: None,
        }
    }

    /// Set the visibility.
    pub fn with_private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }

    /// Set the TTL expiry.
    pub fn with_delete_at(mut self, delete_at: Option<DateTime<Utc>>) -> Self {
        self.delete_at_time = delete_at;
        self
    }

    /// Set the initial status.
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

/// Sparse update of a file record.
///
/// Status and visibility have dedicated operations and are not part of it.
#[derive(Debug, Clone, Default)]
pub struct FileRecordUpdate {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub delete_at_time: Option<Option<DateTime<Utc>>>,
}

impl FileRecordUpdate {
    /// Create a new, empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the mime type.
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Set the size.
    pub fn size(mut self, size: i64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set or clear the TTL expiry.
    pub fn delete_at_time(mut self, delete_at: Option<DateTime<Utc>>) -> Self {
        self.delete_at_time = Some(delete_at);
        self
    }

    /// Check if any fields are set.
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.mime_type.is_none()
            && self.size.is_none()
            && self.delete_at_time.is_none()
    }
}

/// Which statuses a lookup accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// Only records in this status.
    Only(Status),
    /// Any status.
    Any,
}

impl Default for StatusFilter {
    fn default() -> Self {
        StatusFilter::Only(Status::Active)
    }
}

/// Name given to a record created without one: base-36 id plus an extension
/// derived from the mime type.
pub fn generated_name(id: i64, mime_type: &str) -> String {
    let base = to_base36(id.max(0) as u64);
    match extension_for_mime(mime_type) {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

/// Record columns joined with their mime string, as a literal so streaming
/// queries can extend it into a `'static` statement.
macro_rules! select_records_sql {
    () => {
        "SELECT fr.id AS id, fr.name AS name, m.mime AS mime, fr.size AS size,
                fr.is_private AS is_private, fr.status AS status, fr.created_at AS created_at,
                fr.updated_at AS updated_at, fr.status_time AS status_time,
                fr.delete_at_time AS delete_at_time
         FROM file_record AS fr LEFT JOIN mime AS m ON fr.mime_id = m.id"
    };
}

fn select_records() -> QueryBuilder<'static, Sqlite> {
    QueryBuilder::new(select_records_sql!())
}

/// Relational store of file records.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    clock: Arc<dyn Clock>,
}

impl MetadataStore {
    /// Create a metadata store stamping times from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert a new record and return it fully populated.
    ///
    /// Resolves (or creates) the mime entry, assigns the id, stamps
    /// `created_at` and `status_time`, and replaces an empty name with a
    /// generated one.
    pub async fn create(
        &self,
        conn: &mut SqliteConnection,
        draft: &NewFileRecord,
    ) -> Result<FileRecord> {
        if draft.size < 0 {
            return Err(StorageError::Validation(format!(
                "file size must be non-negative, got {}",
                draft.size
            )));
        }

        let now = to_unix(&self.clock.now());
        let mime_id = MimeRepository::get_or_create(conn, &draft.mime_type).await?;
        let needs_name = draft.name.is_empty();
        let name = if needs_name { UNNAMED } else { draft.name.as_str() };

        let result = sqlx::query(
            "INSERT INTO file_record
                (name, mime_id, size, is_private, created_at, updated_at, delete_at_time,
                 status, status_time)
             VALUES (?, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(name)
        .bind(mime_id)
        .bind(draft.size)
        .bind(draft.is_private)
        .bind(now)
        .bind(draft.delete_at_time.as_ref().map(to_unix))
        .bind(draft.status.as_i64())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            StorageError::Persistence(format!(
                "cannot create file record {}: {e}",
                serde_json::to_string(draft).unwrap_or_default()
            ))
        })?;

        let id = result.last_insert_rowid();

        if needs_name {
            sqlx::query("UPDATE file_record SET name = ? WHERE id = ?")
                .bind(generated_name(id, &draft.mime_type))
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }

        debug!(id, "Created file record");

        self.get(conn, id, StatusFilter::Any)
            .await?
            .ok_or_else(|| {
                StorageError::Persistence(format!("file record {id} vanished after insert"))
            })
    }

    /// Get a record by id.
    pub async fn get(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        filter: StatusFilter,
    ) -> Result<Option<FileRecord>> {
        let mut query = select_records();
        query.push(" WHERE fr.id = ").push_bind(id);
        if let StatusFilter::Only(status) = filter {
            query.push(" AND fr.status = ").push_bind(status.as_i64());
        }

        let record = query
            .build_query_as::<FileRecord>()
            .fetch_optional(&mut *conn)
            .await?;

        Ok(record)
    }

    /// Write the fields present in `update` and refresh `updated_at`.
    ///
    /// An empty update touches nothing and reports success. Returns `false`
    /// if the record does not exist.
    pub async fn update(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        update: &FileRecordUpdate,
    ) -> Result<bool> {
        if update.is_empty() {
            return Ok(true);
        }

        if let Some(size) = update.size {
            if size < 0 {
                return Err(StorageError::Validation(format!(
                    "file size must be non-negative, got {size}"
                )));
            }
        }

        let mime_id = match update.mime_type {
            Some(ref mime) => Some(MimeRepository::get_or_create(conn, mime).await?),
            None => None,
        };

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE file_record SET updated_at = ");
        query.push_bind(to_unix(&self.clock.now()));

        if let Some(ref name) = update.name {
            query.push(", name = ");
            query.push_bind(name.clone());
        }
        if let Some(mime_id) = mime_id {
            query.push(", mime_id = ");
            query.push_bind(mime_id);
        }
        if let Some(size) = update.size {
            query.push(", size = ");
            query.push_bind(size);
        }
        if let Some(delete_at) = update.delete_at_time {
            query.push(", delete_at_time = ");
            query.push_bind(delete_at.as_ref().map(to_unix));
        }

        query.push(" WHERE id = ");
        query.push_bind(id);

        let result = query.build().execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a record to `status`, stamping `status_time` with the clock.
    pub async fn set_status(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        status: Status,
    ) -> Result<bool> {
        let now = self.clock.now();
        self.set_status_at(conn, id, status, now).await
    }

    /// Move a record to `status` with an explicit status time.
    ///
    /// The lifecycle check and the write are one conditional UPDATE. Returns
    /// `false` if the record is missing or the transition is not allowed from
    /// its current status.
    pub async fn set_status_at(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        status: Status,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE file_record SET status = ");
        query.push_bind(status.as_i64());
        query.push(", status_time = ");
        query.push_bind(to_unix(&at));
        query.push(" WHERE id = ");
        query.push_bind(id);
        query.push(" AND status IN (");
        let mut sources = query.separated(", ");
        for source in Status::sources_for(status) {
            sources.push_bind(source.as_i64());
        }
        sources.push_unseparated(")");

        let result = query.build().execute(&mut *conn).await?;
        let changed = result.rows_affected() > 0;
        debug!(id, %status, changed, "Set file status");
        Ok(changed)
    }

    /// Soft delete: mark the record Deleted.
    pub async fn soft_delete(&self, conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        self.set_status(conn, id, Status::Deleted).await
    }

    /// Restore: mark the record Active.
    pub async fn restore(&self, conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        self.set_status(conn, id, Status::Active).await
    }

    /// Flip the private flag. Does not move any bytes.
    pub async fn set_visibility_flag(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        is_private: bool,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE file_record SET is_private = ? WHERE id = ?")
            .bind(is_private)
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Check whether a record exists under the given filter.
    pub async fn exists(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        filter: StatusFilter,
    ) -> Result<bool> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT EXISTS(SELECT 1 FROM file_record WHERE id = ");
        query.push_bind(id);
        if let StatusFilter::Only(status) = filter {
            query.push(" AND status = ").push_bind(status.as_i64());
        }
        query.push(")");

        let exists: bool = query
            .build_query_scalar()
            .fetch_one(&mut *conn)
            .await?;
        Ok(exists)
    }

    /// Mark every Active record whose `delete_at_time` has passed as Deleted.
    ///
    /// One bulk UPDATE, so concurrent writers never see a half-applied sweep.
    /// Returns the number of records affected.
    pub async fn sweep_expired(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let now = to_unix(&now);
        let result = sqlx::query(
            "UPDATE file_record SET status = ?, status_time = ?
             WHERE status = ? AND delete_at_time IS NOT NULL AND delete_at_time <= ?",
        )
        .bind(Status::Deleted.as_i64())
        .bind(now)
        .bind(Status::Active.as_i64())
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stream every record in `status`, ordered by id.
    ///
    /// The stream borrows the connection; call again to restart.
    pub fn list_by_status<'c>(
        &self,
        conn: &'c mut SqliteConnection,
        status: Status,
    ) -> BoxStream<'c, Result<FileRecord>> {
        sqlx::query_as::<_, FileRecord>(concat!(
            select_records_sql!(),
            " WHERE fr.status = ? ORDER BY fr.id"
        ))
        .bind(status.as_i64())
        .fetch(conn)
        .map_err(StorageError::from)
        .boxed()
    }
}
