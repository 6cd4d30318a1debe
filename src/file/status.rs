//! File lifecycle status and its legal transitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StorageError;

/// Lifecycle status of a file record.
///
/// The discriminants are the persisted values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Soft-deleted; the blob is erased by the next GC sweep.
    Deleted = 0,
    /// Withheld from readers by an operator.
    Blocked = 1,
    /// Visible and readable.
    #[default]
    Active = 2,
    /// The blob is known to be missing.
    Lost = 3,
}

impl Status {
    /// Every status, in persisted-value order.
    pub const ALL: [Status; 4] = [
        Status::Deleted,
        Status::Blocked,
        Status::Active,
        Status::Lost,
    ];

    /// Persisted integer value.
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Deleted => "deleted",
            Status::Blocked => "blocked",
            Status::Active => "active",
            Status::Lost => "lost",
        }
    }

    /// Whether `value` is a persistable status.
    pub fn is_valid(value: i64) -> bool {
        Self::ALL.iter().any(|s| s.as_i64() == value)
    }

    pub fn is_active(&self) -> bool {
        *self == Status::Active
    }

    pub fn is_deleted(&self) -> bool {
        *self == Status::Deleted
    }

    /// Whether a record in this status may move to `next`.
    ///
    /// Re-entering the current status is always allowed and only refreshes
    /// the status time. A deleted record can only be restored.
    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Active, Deleted)
                | (Active, Blocked)
                | (Active, Lost)
                | (Deleted, Active)
                | (Blocked, Active)
                | (Blocked, Deleted)
                | (Lost, Active)
                | (Lost, Deleted)
        )
    }

    /// Statuses from which a record may move to `target`.
    pub fn sources_for(target: Status) -> Vec<Status> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

impl TryFrom<i64> for Status {
    type Error = StorageError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Deleted),
            1 => Ok(Status::Blocked),
            2 => Ok(Status::Active),
            3 => Ok(Status::Lost),
            other => Err(StorageError::Validation(format!(
                "invalid status value {other}"
            ))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deleted" => Ok(Status::Deleted),
            "blocked" => Ok(Status::Blocked),
            "active" => Ok(Status::Active),
            "lost" => Ok(Status::Lost),
            _ => Err(StorageError::Validation(format!("unknown status: {s}"))),
        }
    }
}
