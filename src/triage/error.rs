//! Scheduler error types.
//!
//! Stage failures are not here: they are values ([`super::StageFailure`])
//! persisted on the record, never raised.

use thiserror::Error;

use super::types::RecordStatus;
use crate::db::DatabaseError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record {0} not found")]
    NotFound(i64),

    #[error("Record {id} is {actual}, expected {expected} under this claim")]
    StatusConflict {
        id: i64,
        expected: RecordStatus,
        actual: RecordStatus,
    },

    #[error("Record {id} is {status}, which no stage has claimed")]
    NotClaimed { id: i64, status: RecordStatus },

    #[error("Cannot reset record {id} from {from} to {to}")]
    InvalidReset {
        id: i64,
        from: RecordStatus,
        to: RecordStatus,
    },

    #[error("Stage output for {output} does not match claim for {claimed}")]
    OutputMismatch { claimed: String, output: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(DatabaseError::Sqlite(e))
    }
}
