//! SQLite-backed record store.
//!
//! Claims are a compare-and-swap on the row: every transition is an
//! `UPDATE ... WHERE status = <expected>` inside a `BEGIN IMMEDIATE`
//! transaction, so concurrent workers (threads or processes sharing the
//! database file) never hold the same record at once.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::error::SchedulerError;
use super::traits::{check_reset, RecordStore};
use super::types::*;
use crate::db::open_database;

const RECORD_COLUMNS: &str = "id, title, local_path, status, processing_priority, created_at,
     attempts, claim_token, ocr_text, last_error";

pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
    table: RecordTable,
}

impl SqliteRecordStore {
    pub fn new(conn: Connection, table: RecordTable) -> Self {
        Self {
            conn: Mutex::new(conn),
            table,
        }
    }

    /// Open a dedicated connection for this store.
    pub fn open(path: &Path, table: RecordTable) -> Result<Self, SchedulerError> {
        Ok(Self::new(open_database(path)?, table))
    }

    /// Insert a record (ingestion-side helper). Returns the new id.
    pub fn insert(&self, record: &NewRecord) -> Result<i64, SchedulerError> {
        let conn = self.lock()?;
        let created_at = record.created_at.unwrap_or_else(now);
        conn.execute(
            &format!(
                "INSERT INTO {} (title, local_path, status, processing_priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table
            ),
            params![
                record.title,
                record.local_path,
                record.status.as_str(),
                record.priority,
                created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SchedulerError> {
        self.conn.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    fn fetch(&self, conn: &Connection, id: i64) -> Result<Option<ProcessingRecord>, SchedulerError> {
        let row = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM {} WHERE id = ?1", self.table),
                params![id],
                record_row,
            )
            .optional()?;
        row.map(|r| record_from_row(r, self.table)).transpose()
    }

    fn current_status(&self, conn: &Connection, id: i64) -> Result<RecordStatus, SchedulerError> {
        let status: Option<String> = conn
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?1", self.table),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match status {
            Some(s) => Ok(RecordStatus::from_str(&s)?),
            None => Err(SchedulerError::NotFound(id)),
        }
    }

    /// Build the error for a conditional update that matched no row.
    fn conflict(&self, conn: &Connection, id: i64, expected: RecordStatus) -> SchedulerError {
        match self.current_status(conn, id) {
            Ok(actual) => SchedulerError::StatusConflict {
                id,
                expected,
                actual,
            },
            Err(e) => e,
        }
    }

    fn apply_reset(&self, conn: &Connection, id: i64, to: RecordStatus) -> Result<(), SchedulerError> {
        let clear = if to.rank() <= RecordStatus::Downloaded.rank() {
            "ocr_text = NULL, page_count = NULL, ai_summary = NULL, significance_score = NULL, entities = NULL,"
        } else {
            "ai_summary = NULL, significance_score = NULL, entities = NULL,"
        };
        conn.execute(
            &format!(
                "UPDATE {} SET {clear} status = ?1, attempts = 0, last_error = NULL,
                 claimed_at = NULL, claim_token = NULL, updated_at = ?2
                 WHERE id = ?3",
                self.table
            ),
            params![to.as_str(), now(), id],
        )?;
        conn.execute(
            "DELETE FROM ingestion_errors WHERE table_name = ?1 AND record_id = ?2",
            params![self.table.as_str(), id],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteRecordStore {
    fn table(&self) -> RecordTable {
        self.table
    }

    fn claim_batch(
        &self,
        stage: Stage,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, SchedulerError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed_at = now();
        let token = new_claim_token();

        let candidates: Vec<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM {} WHERE status = ?1
                 ORDER BY processing_priority ASC, created_at ASC, id ASC
                 LIMIT ?2",
                self.table
            ))?;
            let rows = stmt.query_map(params![stage.input().as_str(), limit as i64], |row| {
                row.get::<_, i64>(0)
            })?;
            rows.collect::<Result<_, _>>()?
        };

        let mut records = Vec::with_capacity(candidates.len());
        for id in candidates {
            let changed = tx.execute(
                &format!(
                    "UPDATE {} SET status = ?1, claimed_at = ?2, claim_token = ?3, updated_at = ?2
                     WHERE id = ?4 AND status = ?5",
                    self.table
                ),
                params![
                    stage.in_flight().as_str(),
                    claimed_at,
                    token,
                    id,
                    stage.input().as_str(),
                ],
            )?;
            if changed == 1 {
                if let Some(record) = self.fetch(&tx, id)? {
                    records.push(record);
                }
            }
        }
        tx.commit()?;

        if !records.is_empty() {
            tracing::debug!(
                table = %self.table,
                stage = %stage,
                claimed = records.len(),
                claim = %token,
                "Claimed batch"
            );
        }
        Ok(records)
    }

    fn complete(
        &self,
        record: &ProcessingRecord,
        stage: Stage,
        output: &StageOutput,
    ) -> Result<(), SchedulerError> {
        if output.stage() != stage {
            return Err(SchedulerError::OutputMismatch {
                claimed: stage.to_string(),
                output: output.stage().to_string(),
            });
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let token = record.claim_token.as_deref();

        let changed = match output {
            StageOutput::Ocr { text, page_count } => tx.execute(
                &format!(
                    "UPDATE {} SET ocr_text = ?1, page_count = ?2, status = ?3,
                     claimed_at = NULL, claim_token = NULL, last_error = NULL, updated_at = ?4
                     WHERE id = ?5 AND status = ?6 AND claim_token = ?7",
                    self.table
                ),
                params![
                    text,
                    page_count,
                    stage.output().as_str(),
                    now(),
                    record.id,
                    stage.in_flight().as_str(),
                    token,
                ],
            )?,
            StageOutput::Summary {
                summary,
                significance,
                entities,
            } => {
                let entities_json = serde_json::to_string(entities)?;
                tx.execute(
                    &format!(
                        "UPDATE {} SET ai_summary = ?1, significance_score = ?2, entities = ?3,
                         status = ?4, claimed_at = NULL, claim_token = NULL, last_error = NULL,
                         updated_at = ?5
                         WHERE id = ?6 AND status = ?7 AND claim_token = ?8",
                        self.table
                    ),
                    params![
                        summary,
                        significance,
                        entities_json,
                        stage.output().as_str(),
                        now(),
                        record.id,
                        stage.in_flight().as_str(),
                        token,
                    ],
                )?
            }
        };

        if changed == 0 {
            return Err(self.conflict(&tx, record.id, stage.in_flight()));
        }
        tx.commit()?;
        Ok(())
    }

    fn fail(
        &self,
        record: &ProcessingRecord,
        stage: Stage,
        failure: &StageFailure,
        class: FailureClass,
    ) -> Result<RecordStatus, SchedulerError> {
        let next = match class {
            FailureClass::Retryable => stage.input(),
            FailureClass::Terminal => RecordStatus::Error,
        };
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let at = now();

        let changed = tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, attempts = attempts + 1, last_error = ?2, {} = ?3,
                 claimed_at = NULL, claim_token = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = ?6 AND claim_token = ?7",
                self.table,
                stage.output_column()
            ),
            params![
                next.as_str(),
                failure.reason,
                failure_marker(&failure.reason),
                at,
                record.id,
                stage.in_flight().as_str(),
                record.claim_token.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(self.conflict(&tx, record.id, stage.in_flight()));
        }

        tx.execute(
            "INSERT INTO ingestion_errors (table_name, record_id, step, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![self.table.as_str(), record.id, stage.as_str(), failure.reason, at],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn release(&self, record: &ProcessingRecord, stage: Stage) -> Result<(), SchedulerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, claimed_at = NULL, claim_token = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = ?4 AND claim_token = ?5",
                self.table
            ),
            params![
                stage.input().as_str(),
                now(),
                record.id,
                stage.in_flight().as_str(),
                record.claim_token.as_deref(),
            ],
        )?;
        if changed == 0 {
            return Err(self.conflict(&tx, record.id, stage.in_flight()));
        }
        tx.commit()?;
        Ok(())
    }

    fn release_stale_claims(
        &self,
        stage: Stage,
        cutoff: NaiveDateTime,
    ) -> Result<usize, SchedulerError> {
        let conn = self.lock()?;
        let released = conn.execute(
            &format!(
                "UPDATE {} SET status = ?1, claimed_at = NULL, claim_token = NULL, updated_at = ?2
                 WHERE status = ?3 AND (claimed_at IS NULL OR claimed_at < ?4)",
                self.table
            ),
            params![
                stage.input().as_str(),
                now(),
                stage.in_flight().as_str(),
                cutoff,
            ],
        )?;
        if released > 0 {
            tracing::info!(table = %self.table, stage = %stage, released, "Released stale claims");
        }
        Ok(released)
    }

    fn reset_record(&self, id: i64, to: RecordStatus) -> Result<(), SchedulerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let from = self.current_status(&tx, id)?;
        check_reset(id, from, to)?;
        self.apply_reset(&tx, id, to)?;
        tx.commit()?;
        tracing::info!(table = %self.table, record_id = id, %from, %to, "Record reset by operator");
        Ok(())
    }

    fn reset_errors(&self, to: RecordStatus) -> Result<usize, SchedulerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id FROM {} WHERE status = ?1 ORDER BY id",
                self.table
            ))?;
            let rows = stmt.query_map(params![RecordStatus::Error.as_str()], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        for id in &ids {
            check_reset(*id, RecordStatus::Error, to)?;
            self.apply_reset(&tx, *id, to)?;
        }
        tx.commit()?;
        tracing::info!(table = %self.table, count = ids.len(), %to, "Error records reset");
        Ok(ids.len())
    }

    fn get(&self, id: i64) -> Result<Option<ProcessingRecord>, SchedulerError> {
        let conn = self.lock()?;
        self.fetch(&conn, id)
    }

    fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>, SchedulerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            self.table
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            match RecordStatus::from_str(&status) {
                Ok(status) => {
                    counts.insert(status, count as u64);
                }
                Err(_) => {
                    tracing::warn!(table = %self.table, status = %status, "Unknown status value in store");
                }
            }
        }
        Ok(counts)
    }

    fn recent_errors(&self, limit: usize) -> Result<Vec<IngestionErrorEntry>, SchedulerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, step, message, created_at FROM ingestion_errors
             WHERE table_name = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![self.table.as_str(), limit as i64], |row| {
            Ok(IngestionErrorEntry {
                record_id: row.get(0)?,
                step: row.get(1)?,
                message: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

struct RecordRow {
    id: i64,
    title: Option<String>,
    local_path: Option<String>,
    status: String,
    priority: i64,
    created_at: NaiveDateTime,
    attempts: u32,
    claim_token: Option<String>,
    ocr_text: Option<String>,
    last_error: Option<String>,
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        id: row.get(0)?,
        title: row.get(1)?,
        local_path: row.get(2)?,
        status: row.get(3)?,
        priority: row.get(4)?,
        created_at: row.get(5)?,
        attempts: row.get(6)?,
        claim_token: row.get(7)?,
        ocr_text: row.get(8)?,
        last_error: row.get(9)?,
    })
}

fn record_from_row(row: RecordRow, table: RecordTable) -> Result<ProcessingRecord, SchedulerError> {
    Ok(ProcessingRecord {
        id: row.id,
        table,
        title: row.title,
        local_path: row.local_path,
        status: RecordStatus::from_str(&row.status)?,
        priority: row.priority,
        created_at: row.created_at,
        attempts: row.attempts,
        claim_token: row.claim_token,
        ocr_text: row.ocr_text,
        last_error: row.last_error,
    })
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Generate a new claim token.
pub fn new_claim_token() -> String {
    Uuid::new_v4().to_string()
}
