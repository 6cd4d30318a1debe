//! Deduplicated mime type table.

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::{Result, StorageError};

/// Attempts made by [`MimeRepository::get_or_create`] before giving up.
pub const MAX_MIME_ATTEMPTS: usize = 3;

/// A row of the mime table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MimeEntry {
    pub id: i64,
    pub mime: String,
}

/// Repository for the mime table.
///
/// Entries are created lazily on first use and never updated.
pub struct MimeRepository;

impl MimeRepository {
    /// Look up the id of a mime string.
    pub async fn get_id(conn: &mut SqliteConnection, mime: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM mime WHERE mime = ?")
            .bind(mime)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(id)
    }

    /// Look up a mime entry by id.
    pub async fn get_by_id(conn: &mut SqliteConnection, id: i64) -> Result<Option<MimeEntry>> {
        let entry = sqlx::query_as::<_, MimeEntry>("SELECT id, mime FROM mime WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(entry)
    }

    /// Return the id for `mime`, creating the entry if needed.
    ///
    /// Creation relies on the unique constraint: concurrent creators of the
    /// same string both issue an insert that ignores conflicts and then read
    /// the surviving row back. The read can still miss if the entry is erased
    /// in between, so the cycle is retried up to [`MAX_MIME_ATTEMPTS`] times.
    pub async fn get_or_create(conn: &mut SqliteConnection, mime: &str) -> Result<i64> {
        if mime.trim().is_empty() {
            return Err(StorageError::Validation("mime type is empty".to_string()));
        }

        for attempt in 1..=MAX_MIME_ATTEMPTS {
            if let Some(id) = Self::get_id(conn, mime).await? {
                return Ok(id);
            }

            let result =
                sqlx::query("INSERT INTO mime (mime) VALUES (?) ON CONFLICT(mime) DO NOTHING")
                    .bind(mime)
                    .execute(&mut *conn)
                    .await?;

            if result.rows_affected() > 0 {
                debug!(mime, "Created mime entry");
                return Ok(result.last_insert_rowid());
            }

            warn!(mime, attempt, "Mime entry vanished between insert and lookup");
        }

        Err(StorageError::Persistence(format!(
            "could not resolve mime {mime:?} after {MAX_MIME_ATTEMPTS} attempts"
        )))
    }

    /// Physically erase a mime entry.
    ///
    /// File records referencing it keep existing with a null mime.
    pub async fn erase(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mime WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List all mime entries.
    pub async fn list(conn: &mut SqliteConnection) -> Result<Vec<MimeEntry>> {
        let entries = sqlx::query_as::<_, MimeEntry>("SELECT id, mime FROM mime ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;
        Ok(entries)
    }
}
