//! Two-store saga used by every mutating storage operation.
//!
//! A saga owns the metadata transaction for the duration of one operation and
//! the compensating blob action that undoes the blob side if the operation
//! does not reach commit. Steps only move forward:
//!
//! ```text
//! Started -> MetadataReserved -> BlobWritten -> Reconciled -> Committed
//!    \              \                  \              \
//!     +--------------+------------------+--------------+--> Compensated
//! ```

use std::sync::Arc;

use sqlx::{Connection, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, error, warn};

use super::storage::{BlobKey, BlobStore};
use crate::db::BEGIN_IMMEDIATE;
use crate::{Result, StorageError};

/// Named position of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStep {
    /// Transaction open, nothing written.
    Started,
    /// Metadata forward action done inside the transaction; the id is known.
    MetadataReserved,
    /// Blob forward action done.
    BlobWritten,
    /// Metadata updated from what is actually on disk.
    Reconciled,
    /// Transaction committed.
    Committed,
    /// Blob compensated and transaction rolled back.
    Compensated,
}

impl SagaStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStep::Committed | SagaStep::Compensated)
    }

    /// Whether a saga at this step may move to `next`.
    pub fn can_advance_to(&self, next: SagaStep) -> bool {
        use SagaStep::*;

        match (self, next) {
            (Started, MetadataReserved)
            | (MetadataReserved, BlobWritten)
            | (BlobWritten, Reconciled)
            | (Reconciled, Committed) => true,
            (current, Compensated) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Undo action for the blob side of a saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    /// Erase the blob at this key.
    EraseBlob(BlobKey),
    /// Move the blob at `key` back to the given visibility.
    RestoreVisibility { key: BlobKey, to_private: bool },
}

/// One in-flight storage operation spanning metadata and blob stores.
///
/// The transaction is begun on the caller's connection; if that connection is
/// already inside a transaction the saga runs in a savepoint. A saga that is
/// dropped before [`finish`](Self::finish) compensates its blob action and
/// rolls the metadata back.
pub struct Saga<'c> {
    operation: &'static str,
    step: SagaStep,
    tx: Option<Transaction<'c, Sqlite>>,
    blobs: Arc<dyn BlobStore>,
    compensation: Option<Compensation>,
}

impl<'c> Saga<'c> {
    /// Open the metadata transaction.
    ///
    /// A top-level saga takes the write lock up front (`BEGIN IMMEDIATE`) so
    /// concurrent sagas queue on the busy timeout instead of failing when a
    /// read lock is upgraded. Inside an open transaction it is a savepoint.
    pub async fn begin(
        conn: &'c mut SqliteConnection,
        blobs: Arc<dyn BlobStore>,
        operation: &'static str,
    ) -> Result<Saga<'c>> {
        let nested = conn.is_in_transaction();
        let tx = if nested {
            conn.begin().await?
        } else {
            conn.begin_with(BEGIN_IMMEDIATE).await?
        };
        debug!(operation, nested, "Saga started");

        Ok(Self {
            operation,
            step: SagaStep::Started,
            tx: Some(tx),
            blobs,
            compensation: None,
        })
    }

    pub fn step(&self) -> SagaStep {
        self.step
    }

    /// The connection of the open transaction.
    pub fn conn(&mut self) -> Result<&mut SqliteConnection> {
        let operation = self.operation;
        self.tx.as_deref_mut().ok_or_else(|| {
            StorageError::Inconsistency(format!("saga {operation} has no open transaction"))
        })
    }

    /// Move to the next step.
    pub fn advance(&mut self, next: SagaStep) -> Result<()> {
        if !self.step.can_advance_to(next) {
            return Err(StorageError::Inconsistency(format!(
                "saga {} cannot move from {:?} to {:?}",
                self.operation, self.step, next
            )));
        }

        debug!(operation = self.operation, from = ?self.step, to = ?next, "Saga step");
        self.step = next;
        Ok(())
    }

    /// Register the action that undoes the blob forward step.
    ///
    /// Set it before attempting the blob write so a partial write is cleaned
    /// up too.
    pub fn set_compensation(&mut self, compensation: Compensation) {
        self.compensation = Some(compensation);
    }

    /// Commit if `result` is `Ok` and the saga reached `Reconciled`;
    /// otherwise compensate, roll back and return the error.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        let value = match result {
            Ok(value) => value,
            Err(e) => return self.abort(e).await,
        };

        if let Err(e) = self.advance(SagaStep::Committed) {
            return self.abort(e).await;
        }

        let Some(tx) = self.tx.take() else {
            let e = StorageError::Inconsistency(format!(
                "saga {} lost its transaction",
                self.operation
            ));
            return self.abort(e).await;
        };

        if let Err(e) = tx.commit().await {
            error!(operation = self.operation, error = %e, "Saga commit failed");
            self.run_compensation();
            self.step = SagaStep::Compensated;
            return Err(e.into());
        }

        self.compensation = None;
        debug!(operation = self.operation, "Saga committed");
        Ok(value)
    }

    /// Roll back a saga that never touched the blob store.
    ///
    /// Fails if a compensation is pending; use [`finish`](Self::finish) then.
    pub async fn cancel(mut self) -> Result<()> {
        if self.compensation.is_some() {
            let e = StorageError::Inconsistency(format!(
                "saga {} cannot be cancelled after a blob action",
                self.operation
            ));
            return self.abort(e).await;
        }

        self.step = SagaStep::Compensated;
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        debug!(operation = self.operation, "Saga cancelled");
        Ok(())
    }

    async fn abort<T>(mut self, cause: StorageError) -> Result<T> {
        warn!(
            operation = self.operation,
            step = ?self.step,
            error = %cause,
            "Saga failed, compensating"
        );

        self.run_compensation();

        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                error!(operation = self.operation, error = %e, "Saga rollback failed");
            }
        }

        self.step = SagaStep::Compensated;
        Err(cause)
    }

    fn run_compensation(&mut self) {
        let Some(compensation) = self.compensation.take() else {
            return;
        };

        let outcome = match &compensation {
            Compensation::EraseBlob(key) => self.blobs.erase(key).map(|_| ()),
            Compensation::RestoreVisibility { key, to_private } => {
                if self.blobs.exists(key) {
                    self.blobs.change_visibility(key, *to_private)
                } else {
                    Ok(())
                }
            }
        };

        match outcome {
            Ok(()) => debug!(operation = self.operation, ?compensation, "Compensated blob"),
            Err(e) => error!(
                operation = self.operation,
                ?compensation,
                error = %e,
                "Blob compensation failed"
            ),
        }
    }
}

impl Drop for Saga<'_> {
    fn drop(&mut self) {
        if self.step.is_terminal() {
            return;
        }

        warn!(operation = self.operation, step = ?self.step, "Saga dropped before finishing");
        self.run_compensation();
        // Dropping the transaction rolls it back.
        drop(self.tx.take());
        self.step = SagaStep::Compensated;
    }
}
