//! In-memory record store.
//!
//! Status lives in an `AtomicU8` per record so claiming is a single
//! compare-and-swap. Every other field sits behind the record's own mutex,
//! which is also held for any transition out of an in-flight status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{NaiveDateTime, Utc};

use super::error::SchedulerError;
use super::sqlite_store::new_claim_token;
use super::traits::{check_reset, RecordStore};
use super::types::*;

struct Slot {
    status: AtomicU8,
    data: Mutex<SlotData>,
}

struct SlotData {
    record: ProcessingRecord,
    claimed_at: Option<NaiveDateTime>,
    summary: Option<String>,
    significance: Option<f64>,
    entities: Vec<String>,
}

impl Slot {
    fn status(&self) -> RecordStatus {
        RecordStatus::from_code(self.status.load(Ordering::Acquire)).unwrap_or(RecordStatus::Error)
    }

    fn transition(&self, from: RecordStatus, to: RecordStatus) -> bool {
        self.status
            .compare_exchange(from.code(), to.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock(&self) -> Result<MutexGuard<'_, SlotData>, SchedulerError> {
        self.data.lock().map_err(|_| SchedulerError::LockPoisoned)
    }

    fn snapshot(&self, data: &SlotData) -> ProcessingRecord {
        ProcessingRecord {
            status: self.status(),
            ..data.record.clone()
        }
    }
}

pub struct MemoryRecordStore {
    table: RecordTable,
    slots: RwLock<BTreeMap<i64, Arc<Slot>>>,
    next_id: AtomicI64,
    errors: Mutex<Vec<IngestionErrorEntry>>,
}

impl MemoryRecordStore {
    pub fn new(table: RecordTable) -> Self {
        Self {
            table,
            slots: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, record: &NewRecord) -> Result<i64, SchedulerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            status: AtomicU8::new(record.status.code()),
            data: Mutex::new(SlotData {
                record: ProcessingRecord {
                    id,
                    table: self.table,
                    title: record.title.clone(),
                    local_path: record.local_path.clone(),
                    status: record.status,
                    priority: record.priority,
                    created_at: record.created_at.unwrap_or_else(now),
                    attempts: 0,
                    claim_token: None,
                    ocr_text: None,
                    last_error: None,
                },
                claimed_at: None,
                summary: None,
                significance: None,
                entities: Vec::new(),
            }),
        };
        self.slots
            .write()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .insert(id, Arc::new(slot));
        Ok(id)
    }

    /// Summary text written by the summarize stage, or its failure marker.
    pub fn summary(&self, id: i64) -> Result<Option<String>, SchedulerError> {
        let slot = self.slot(id)?;
        let data = slot.lock()?;
        Ok(data.summary.clone())
    }

    fn slot(&self, id: i64) -> Result<Arc<Slot>, SchedulerError> {
        self.slots
            .read()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound(id))
    }

    fn all_slots(&self) -> Result<Vec<Arc<Slot>>, SchedulerError> {
        Ok(self
            .slots
            .read()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .values()
            .cloned()
            .collect())
    }

    /// The caller must hold the slot lock and still own the claim.
    fn verify_claim(
        &self,
        slot: &Slot,
        data: &SlotData,
        record: &ProcessingRecord,
        stage: Stage,
    ) -> Result<(), SchedulerError> {
        let actual = slot.status();
        let owned = record.claim_token.is_some() && data.record.claim_token == record.claim_token;
        if actual == stage.in_flight() && owned {
            Ok(())
        } else {
            Err(SchedulerError::StatusConflict {
                id: record.id,
                expected: stage.in_flight(),
                actual,
            })
        }
    }

    fn reset_slot(&self, slot: &Slot, id: i64, to: RecordStatus) -> Result<bool, SchedulerError> {
        let mut data = slot.lock()?;
        let from = slot.status();
        check_reset(id, from, to)?;
        if !slot.transition(from, to) {
            return Ok(false);
        }
        if to.rank() <= RecordStatus::Downloaded.rank() {
            data.record.ocr_text = None;
        }
        data.summary = None;
        data.significance = None;
        data.entities.clear();
        data.record.attempts = 0;
        data.record.last_error = None;
        data.record.claim_token = None;
        data.claimed_at = None;
        drop(data);

        self.errors
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .retain(|e| e.record_id != id);
        Ok(true)
    }
}

impl RecordStore for MemoryRecordStore {
    fn table(&self) -> RecordTable {
        self.table
    }

    fn claim_batch(
        &self,
        stage: Stage,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, SchedulerError> {
        let mut candidates = Vec::new();
        for slot in self.all_slots()? {
            if slot.status() != stage.input() {
                continue;
            }
            let key = {
                let data = slot.lock()?;
                (data.record.priority, data.record.created_at, data.record.id)
            };
            candidates.push((key, slot));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let token = new_claim_token();
        let claimed_at = now();
        let mut claimed = Vec::new();
        for (_, slot) in candidates {
            if claimed.len() >= limit {
                break;
            }
            // The claim stamp is written under the same lock as the swap,
            // so stale-claim release never sees an unstamped claim.
            let mut data = slot.lock()?;
            // Losing the swap means another worker got there first.
            if !slot.transition(stage.input(), stage.in_flight()) {
                continue;
            }
            data.record.claim_token = Some(token.clone());
            data.claimed_at = Some(claimed_at);
            claimed.push(slot.snapshot(&data));
        }
        Ok(claimed)
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
        let slot = self.slot(record.id)?;
        let mut data = slot.lock()?;
        self.verify_claim(&slot, &data, record, stage)?;

        match output {
            StageOutput::Ocr { text, .. } => data.record.ocr_text = Some(text.clone()),
            StageOutput::Summary {
                summary,
                significance,
                entities,
            } => {
                data.summary = Some(summary.clone());
                data.significance = *significance;
                data.entities = entities.clone();
            }
        }
        data.record.claim_token = None;
        data.record.last_error = None;
        data.claimed_at = None;
        slot.transition(stage.in_flight(), stage.output());
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
        let slot = self.slot(record.id)?;
        let mut data = slot.lock()?;
        self.verify_claim(&slot, &data, record, stage)?;

        let marker = Some(failure_marker(&failure.reason));
        match stage {
            Stage::Ocr => data.record.ocr_text = marker,
            Stage::Summarize => data.summary = marker,
        }
        data.record.attempts += 1;
        data.record.last_error = Some(failure.reason.clone());
        data.record.claim_token = None;
        data.claimed_at = None;
        slot.transition(stage.in_flight(), next);
        drop(data);

        self.errors
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .push(IngestionErrorEntry {
                record_id: record.id,
                step: stage.as_str().to_string(),
                message: failure.reason.clone(),
                created_at: now(),
            });
        Ok(next)
    }

    fn release(&self, record: &ProcessingRecord, stage: Stage) -> Result<(), SchedulerError> {
        let slot = self.slot(record.id)?;
        let mut data = slot.lock()?;
        self.verify_claim(&slot, &data, record, stage)?;
        data.record.claim_token = None;
        data.claimed_at = None;
        slot.transition(stage.in_flight(), stage.input());
        Ok(())
    }

    fn release_stale_claims(
        &self,
        stage: Stage,
        cutoff: NaiveDateTime,
    ) -> Result<usize, SchedulerError> {
        let mut released = 0;
        for slot in self.all_slots()? {
            if slot.status() != stage.in_flight() {
                continue;
            }
            let mut data = slot.lock()?;
            if data.claimed_at.is_some_and(|at| at >= cutoff) {
                continue;
            }
            if slot.transition(stage.in_flight(), stage.input()) {
                data.record.claim_token = None;
                data.claimed_at = None;
                released += 1;
            }
        }
        if released > 0 {
            tracing::info!(table = %self.table, stage = %stage, released, "Released stale claims");
        }
        Ok(released)
    }

    fn reset_record(&self, id: i64, to: RecordStatus) -> Result<(), SchedulerError> {
        let slot = self.slot(id)?;
        if self.reset_slot(&slot, id, to)? {
            Ok(())
        } else {
            Err(SchedulerError::StatusConflict {
                id,
                expected: to,
                actual: slot.status(),
            })
        }
    }

    fn reset_errors(&self, to: RecordStatus) -> Result<usize, SchedulerError> {
        let mut count = 0;
        for (id, slot) in self
            .slots
            .read()
            .map_err(|_| SchedulerError::LockPoisoned)?
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect::<Vec<_>>()
        {
            if slot.status() == RecordStatus::Error && self.reset_slot(&slot, id, to)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn get(&self, id: i64) -> Result<Option<ProcessingRecord>, SchedulerError> {
        let slot = match self.slot(id) {
            Ok(slot) => slot,
            Err(SchedulerError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let data = slot.lock()?;
        Ok(Some(slot.snapshot(&data)))
    }

    fn status_counts(&self) -> Result<BTreeMap<RecordStatus, u64>, SchedulerError> {
        let mut counts = BTreeMap::new();
        for slot in self.all_slots()? {
            *counts.entry(slot.status()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn recent_errors(&self, limit: usize) -> Result<Vec<IngestionErrorEntry>, SchedulerError> {
        let errors = self.errors.lock().map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(errors.iter().rev().take(limit).cloned().collect())
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}
