//! Trait definitions for the triage pipeline.
//!
//! Three seams:
//! - RecordStore: persisted status + claims (SQLite, or in-memory for tests)
//! - StageExecutor: the opaque OCR / summarization worker
//! - FailurePolicy: retryable vs. terminal classification

use std::collections::BTreeMap;
use std::path::Path;

use chrono::NaiveDateTime;

use super::error::SchedulerError;
use super::types::*;

/// Persisted per-record pipeline state.
///
/// Implementations must make claiming atomic: two callers of
/// `claim_batch` never receive the same record while it is in flight.
pub trait RecordStore: Send + Sync {
    fn table(&self) -> RecordTable;

    /// Select up to `limit` records in `stage.input()` status, ordered by
    /// priority ascending then age ascending, and move them to
    /// `stage.in_flight()` under a fresh claim token.
    fn claim_batch(
        &self,
        stage: Stage,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, SchedulerError>;

    /// Persist derived fields and advance to `stage.output()` atomically.
    fn complete(
        &self,
        record: &ProcessingRecord,
        stage: Stage,
        output: &StageOutput,
    ) -> Result<(), SchedulerError>;

    /// Record a failure: audit row, marker, attempt count, and either release
    /// to the input status or move to `error`. Returns the new status.
    fn fail(
        &self,
        record: &ProcessingRecord,
        stage: Stage,
        failure: &StageFailure,
        class: FailureClass,
    ) -> Result<RecordStatus, SchedulerError>;

    /// Give a claimed record back without counting an attempt.
    fn release(&self, record: &ProcessingRecord, stage: Stage) -> Result<(), SchedulerError>;

    /// Release in-flight claims stamped before `cutoff`.
    fn release_stale_claims(
        &self,
        stage: Stage,
        cutoff: NaiveDateTime,
    ) -> Result<usize, SchedulerError>;

    /// Operator action: the only way a status moves backwards.
    fn reset_record(&self, id: i64, to: RecordStatus) -> Result<(), SchedulerError>;

    /// Operator action: reset every `error` record. Returns how many.
    fn reset_errors(&self, to: RecordStatus) -> Result<usize, SchedulerError>;

    fn get(&self, id: i64) -> Result<Option<ProcessingRecord>, SchedulerError>;

    fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>, SchedulerError>;

    /// Newest audit entries first.
    fn recent_errors(&self, limit: usize) -> Result<Vec<IngestionErrorEntry>, SchedulerError>;
}

/// The downstream worker that does the actual OCR or summarization.
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> Stage;

    /// `artifact` is the resolved file for stages that need one.
    fn run(&self, record: &ProcessingRecord, artifact: Option<&Path>) -> StageResult;
}

pub trait FailurePolicy: Send + Sync {
    /// `attempt` counts the failure being classified (first failure = 1).
    fn classify(&self, failure: &StageFailure, attempt: u32) -> FailureClass;
}

/// Shared validation for operator resets.
pub(crate) fn check_reset(
    id: i64,
    from: RecordStatus,
    to: RecordStatus,
) -> Result<(), SchedulerError> {
    let allowed = to.is_reset_target()
        && from.in_flight_stage().is_none()
        && (from == RecordStatus::Error || to.rank() <= from.rank());
    if allowed {
        Ok(())
    } else {
        Err(SchedulerError::InvalidReset { id, from, to })
    }
}
