//! TriageScheduler: select, resolve, execute, complete.
//!
//! Holds no state of its own between calls; everything lives in the store,
//! so any number of scheduler instances may share one database.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::error::SchedulerError;
use super::traits::{FailurePolicy, RecordStore, StageExecutor};
use super::types::*;
use crate::artifact::ArtifactResolver;

pub struct TriageScheduler {
    store: Arc<dyn RecordStore>,
    policy: Box<dyn FailurePolicy>,
    batch_size: usize,
}

impl TriageScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        policy: Box<dyn FailurePolicy>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            policy,
            batch_size: batch_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Claim up to `limit` eligible records, most urgent first.
    ///
    /// A result shorter than `limit` means the backlog is exhausted.
    pub fn select_batch(
        &self,
        stage: Stage,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, SchedulerError> {
        self.store.claim_batch(stage, limit)
    }

    /// Persist the outcome of one claimed record.
    pub fn complete_one(
        &self,
        record: &ProcessingRecord,
        result: StageResult,
    ) -> Result<Completion, SchedulerError> {
        let stage = record
            .status
            .in_flight_stage()
            .ok_or(SchedulerError::NotClaimed {
                id: record.id,
                status: record.status,
            })?;

        match result {
            StageResult::Success(output) => {
                self.store.complete(record, stage, &output)?;
                tracing::debug!(
                    table = %record.table,
                    record_id = record.id,
                    stage = %stage,
                    "Stage succeeded"
                );
                Ok(Completion::Advanced(stage.output()))
            }
            StageResult::Failure(failure) => {
                let attempt = record.attempts + 1;
                let class = self.policy.classify(&failure, attempt);
                let next = self.store.fail(record, stage, &failure, class)?;
                tracing::warn!(
                    table = %record.table,
                    record_id = record.id,
                    stage = %stage,
                    kind = ?failure.kind,
                    attempt,
                    class = ?class,
                    reason = %failure.reason,
                    "Stage failed"
                );
                Ok(match next {
                    RecordStatus::Error => Completion::Failed,
                    _ => Completion::Requeued,
                })
            }
        }
    }

    /// Resolve the artifact if the stage needs one, run the executor, and
    /// persist the result.
    pub fn process(
        &self,
        record: &ProcessingRecord,
        executor: &dyn StageExecutor,
        resolver: &ArtifactResolver,
    ) -> Result<Completion, SchedulerError> {
        let result = if executor.stage().needs_artifact() {
            match record.local_path.as_deref().map(str::trim) {
                None | Some("") => StageResult::Failure(StageFailure::missing_artifact(
                    "no file reference recorded",
                )),
                Some(reference) => match resolver.resolve(reference) {
                    Some(resolution) => executor.run(record, Some(&resolution.path)),
                    None => StageResult::Failure(StageFailure::missing_artifact(format!(
                        "file not found on this host: {reference}"
                    ))),
                },
            }
        } else {
            executor.run(record, None)
        };
        self.complete_one(record, result)
    }

    /// Drain the stage's backlog once.
    ///
    /// Records requeued during this pass are not run again until the next
    /// pass: when one comes back it is held until the pass ends, so the rest
    /// of the backlog still gets its turn.
    pub fn run_pass(
        &self,
        executor: &dyn StageExecutor,
        resolver: &ArtifactResolver,
        stop: Option<&AtomicBool>,
    ) -> Result<PassSummary, SchedulerError> {
        let stage = executor.stage();
        let start = Instant::now();
        let mut held = Vec::new();

        let result = self.drain(stage, executor, resolver, stop, &mut held);

        for record in &held {
            if let Err(e) = self.store.release(record, stage) {
                tracing::warn!(record_id = record.id, error = %e, "Failed to release held record");
            }
        }

        let summary = result?;
        if summary.claimed > 0 {
            tracing::info!(
                table = %self.store.table(),
                stage = %stage,
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                requeued = summary.requeued,
                failed = summary.failed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Pass complete"
            );
        }
        Ok(summary)
    }

    fn drain(
        &self,
        stage: Stage,
        executor: &dyn StageExecutor,
        resolver: &ArtifactResolver,
        stop: Option<&AtomicBool>,
        held: &mut Vec<ProcessingRecord>,
    ) -> Result<PassSummary, SchedulerError> {
        let stopping = || stop.is_some_and(|s| s.load(Ordering::Relaxed));
        let mut summary = PassSummary::default();
        let mut seen = HashSet::new();

        while !stopping() {
            let batch = self.select_batch(stage, self.batch_size)?;
            let exhausted = batch.len() < self.batch_size;

            let mut pending = batch.into_iter();
            while let Some(record) = pending.next() {
                if stopping() || !seen.insert(record.id) {
                    held.push(record);
                    continue;
                }
                summary.claimed += 1;
                match self.process(&record, executor, resolver) {
                    Ok(completion) => summary.absorb(completion),
                    Err(SchedulerError::StatusConflict { id, actual, .. }) => {
                        tracing::warn!(record_id = id, %actual, "Claim lost before completion");
                    }
                    Err(e) => {
                        // Hand back this record and the rest of the batch.
                        held.push(record);
                        held.extend(pending);
                        return Err(e);
                    }
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::triage::memory_store::MemoryRecordStore;
    use crate::triage::policy::DefaultFailurePolicy;

    struct FnExecutor<F> {
        stage: Stage,
        f: F,
    }

    impl<F> StageExecutor for FnExecutor<F>
    where
        F: Fn(&ProcessingRecord, Option<&Path>) -> StageResult + Send + Sync,
    {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn run(&self, record: &ProcessingRecord, artifact: Option<&Path>) -> StageResult {
            (self.f)(record, artifact)
        }
    }

    fn ocr_ok() -> impl StageExecutor {
        FnExecutor {
            stage: Stage::Ocr,
            f: |_: &ProcessingRecord, artifact: Option<&Path>| {
                let path = artifact.expect("ocr needs a file");
                StageResult::Success(StageOutput::Ocr {
                    text: fs::read_to_string(path).unwrap(),
                    page_count: Some(1),
                })
            },
        }
    }

    fn summarize_ok() -> impl StageExecutor {
        FnExecutor {
            stage: Stage::Summarize,
            f: |record: &ProcessingRecord, artifact: Option<&Path>| {
                assert!(artifact.is_none());
                StageResult::Success(StageOutput::Summary {
                    summary: format!("about {}", record.ocr_text.as_deref().unwrap_or("")),
                    significance: Some(0.5),
                    entities: vec![],
                })
            },
        }
    }

    struct Env {
        _dir: tempfile::TempDir,
        root: PathBuf,
        store: Arc<MemoryRecordStore>,
        scheduler: TriageScheduler,
    }

    impl Env {
        fn new(batch_size: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            fs::create_dir_all(root.join("storage")).unwrap();
            let store = Arc::new(MemoryRecordStore::new(RecordTable::Documents));
            let scheduler = TriageScheduler::new(
                store.clone(),
                Box::new(DefaultFailurePolicy::default()),
                batch_size,
            );
            Self {
                _dir: dir,
                root,
                store,
                scheduler,
            }
        }

        fn resolver(&self) -> ArtifactResolver {
            ArtifactResolver::new(&self.root, "storage")
        }

        fn add_file(&self, name: &str, body: &str) -> i64 {
            fs::write(self.root.join("storage").join(name), body).unwrap();
            self.add_reference(&format!("storage/{name}"))
        }

        fn add_reference(&self, reference: &str) -> i64 {
            self.store.insert(&NewRecord::downloaded(reference)).unwrap()
        }

        fn status(&self, id: i64) -> RecordStatus {
            self.store.get(id).unwrap().unwrap().status
        }
    }

    #[test]
    fn records_flow_through_both_stages() {
        let env = Env::new(2);
        let ids: Vec<i64> = (0..3)
            .map(|i| env.add_file(&format!("{i}.txt"), &format!("page {i}")))
            .collect();
        let resolver = env.resolver();

        let ocr = env.scheduler.run_pass(&ocr_ok(), &resolver, None).unwrap();
        assert_eq!(ocr.claimed, 3);
        assert_eq!(ocr.succeeded, 3);
        assert!(ids
            .iter()
            .all(|id| env.status(*id) == RecordStatus::OcrProcessed));

        let summary = env
            .scheduler
            .run_pass(&summarize_ok(), &resolver, None)
            .unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(
            env.store.summary(ids[1]).unwrap().as_deref(),
            Some("about page 1")
        );
        assert!(ids
            .iter()
            .all(|id| env.status(*id) == RecordStatus::Summarized));
    }

    #[test]
    fn missing_file_is_requeued_not_failed() {
        let env = Env::new(10);
        let id = env.add_reference("storage/never-downloaded.pdf");
        let summary = env
            .scheduler
            .run_pass(&ocr_ok(), &env.resolver(), None)
            .unwrap();
        assert_eq!(summary.requeued, 1);

        let record = env.store.get(id).unwrap().unwrap();
        assert_eq!(record.status, RecordStatus::Downloaded);
        assert!(is_failure_marker(record.ocr_text.as_deref().unwrap()));
        assert!(record
            .last_error
            .as_deref()
            .unwrap()
            .contains("never-downloaded.pdf"));
    }

    #[test]
    fn empty_reference_is_a_missing_artifact() {
        let env = Env::new(10);
        let id = env.add_reference("  ");
        env.scheduler
            .run_pass(&ocr_ok(), &env.resolver(), None)
            .unwrap();
        assert_eq!(
            env.store.get(id).unwrap().unwrap().last_error.as_deref(),
            Some("no file reference recorded")
        );
    }

    #[test]
    fn requeued_records_do_not_starve_the_backlog() {
        let env = Env::new(2);
        let missing_a = env.add_reference("storage/a.pdf");
        let missing_b = env.add_reference("storage/b.pdf");
        let present = env.add_file("c.txt", "c");

        let summary = env
            .scheduler
            .run_pass(&ocr_ok(), &env.resolver(), None)
            .unwrap();
        assert_eq!(summary.claimed, 3);
        assert_eq!(summary.requeued, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(env.status(present), RecordStatus::OcrProcessed);
        // Held records go back to the queue when the pass ends.
        assert_eq!(env.status(missing_a), RecordStatus::Downloaded);
        assert_eq!(env.status(missing_b), RecordStatus::Downloaded);
        assert_eq!(env.store.get(missing_a).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn executor_failures_become_terminal_at_the_cap() {
        let env = Env::new(10);
        let id = env.add_file("flaky.txt", "x");
        let scheduler = TriageScheduler::new(
            env.store.clone(),
            Box::new(DefaultFailurePolicy {
                retry_missing_artifact: true,
                max_attempts: 2,
            }),
            10,
        );
        let flaky = FnExecutor {
            stage: Stage::Ocr,
            f: |_: &ProcessingRecord, _: Option<&Path>| {
                StageResult::Failure(StageFailure::executor("timeout", true))
            },
        };
        let resolver = env.resolver();

        let first = scheduler.run_pass(&flaky, &resolver, None).unwrap();
        assert_eq!(first.requeued, 1);
        let second = scheduler.run_pass(&flaky, &resolver, None).unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(env.status(id), RecordStatus::Error);

        let third = scheduler.run_pass(&flaky, &resolver, None).unwrap();
        assert_eq!(third, PassSummary::default());
    }

    #[test]
    fn complete_one_requires_a_claimed_record() {
        let env = Env::new(10);
        let id = env.add_reference("storage/x.pdf");
        let record = env.store.get(id).unwrap().unwrap();
        let err = env
            .scheduler
            .complete_one(
                &record,
                StageResult::Success(StageOutput::Ocr {
                    text: "t".into(),
                    page_count: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotClaimed { .. }));
    }

    #[test]
    fn stop_flag_releases_unprocessed_claims() {
        let env = Env::new(10);
        let ids: Vec<i64> = (0..4)
            .map(|i| env.add_file(&format!("{i}.txt"), "x"))
            .collect();
        let stop = AtomicBool::new(false);
        let executor = FnExecutor {
            stage: Stage::Ocr,
            f: |_: &ProcessingRecord, _: Option<&Path>| {
                stop.store(true, Ordering::Relaxed);
                StageResult::Success(StageOutput::Ocr {
                    text: "t".into(),
                    page_count: None,
                })
            },
        };

        let summary = env
            .scheduler
            .run_pass(&executor, &env.resolver(), Some(&stop))
            .unwrap();
        assert_eq!(summary.claimed, 1);
        let downloaded = ids
            .iter()
            .filter(|id| env.status(**id) == RecordStatus::Downloaded)
            .count();
        assert_eq!(downloaded, 3);
    }

    /// Store whose first `complete` fails.
    struct FailFirstComplete {
        inner: MemoryRecordStore,
        failed: AtomicBool,
    }

    impl RecordStore for FailFirstComplete {
        fn table(&self) -> RecordTable {
            self.inner.table()
        }

        fn claim_batch(
            &self,
            stage: Stage,
            limit: usize,
        ) -> Result<Vec<ProcessingRecord>, SchedulerError> {
            self.inner.claim_batch(stage, limit)
        }

        fn complete(
            &self,
            record: &ProcessingRecord,
            stage: Stage,
            output: &StageOutput,
        ) -> Result<(), SchedulerError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(SchedulerError::LockPoisoned);
            }
            self.inner.complete(record, stage, output)
        }

        fn fail(
            &self,
            record: &ProcessingRecord,
            stage: Stage,
            failure: &StageFailure,
            class: FailureClass,
        ) -> Result<RecordStatus, SchedulerError> {
            self.inner.fail(record, stage, failure, class)
        }

        fn release(&self, record: &ProcessingRecord, stage: Stage) -> Result<(), SchedulerError> {
            self.inner.release(record, stage)
        }

        fn release_stale_claims(
            &self,
            stage: Stage,
            cutoff: chrono::NaiveDateTime,
        ) -> Result<usize, SchedulerError> {
            self.inner.release_stale_claims(stage, cutoff)
        }

        fn reset_record(&self, id: i64, to: RecordStatus) -> Result<(), SchedulerError> {
            self.inner.reset_record(id, to)
        }

        fn reset_errors(&self, to: RecordStatus) -> Result<usize, SchedulerError> {
            self.inner.reset_errors(to)
        }

        fn get(&self, id: i64) -> Result<Option<ProcessingRecord>, SchedulerError> {
            self.inner.get(id)
        }

        fn status_counts(
            &self,
        ) -> Result<std::collections::BTreeMap<RecordStatus, u64>, SchedulerError> {
            self.inner.status_counts()
        }

        fn recent_errors(&self, limit: usize) -> Result<Vec<IngestionErrorEntry>, SchedulerError> {
            self.inner.recent_errors(limit)
        }
    }

    #[test]
    fn store_error_mid_batch_releases_the_rest_of_the_batch() {
        let inner = MemoryRecordStore::new(RecordTable::Documents);
        let ids: Vec<i64> = (0..3)
            .map(|i| {
                inner
                    .insert(
                        &NewRecord::downloaded(&format!("storage/{i}.pdf"))
                            .with_status(RecordStatus::OcrProcessed),
                    )
                    .unwrap()
            })
            .collect();
        let store = Arc::new(FailFirstComplete {
            inner,
            failed: AtomicBool::new(false),
        });
        let scheduler = TriageScheduler::new(
            store.clone(),
            Box::new(DefaultFailurePolicy::default()),
            10,
        );
        let resolver = ArtifactResolver::new("/nonexistent", "storage");

        let err = scheduler
            .run_pass(&summarize_ok(), &resolver, None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LockPoisoned));
        for id in &ids {
            assert_eq!(
                store.get(*id).unwrap().unwrap().status,
                RecordStatus::OcrProcessed
            );
        }

        let summary = scheduler
            .run_pass(&summarize_ok(), &resolver, None)
            .unwrap();
        assert_eq!(summary.succeeded, 3);
    }

    #[test]
    fn concurrent_workers_complete_each_record_once() {
        const RECORDS: usize = 6;
        const WORKERS: usize = 10;
        let env = Env::new(1);
        for i in 0..RECORDS {
            env.add_file(&format!("{i}.txt"), "x");
        }
        let completed = Mutex::new(Vec::new());

        thread::scope(|s| {
            for _ in 0..WORKERS {
                s.spawn(|| {
                    for record in env.scheduler.select_batch(Stage::Ocr, 1).unwrap() {
                        env.scheduler
                            .complete_one(
                                &record,
                                StageResult::Success(StageOutput::Ocr {
                                    text: "t".into(),
                                    page_count: None,
                                }),
                            )
                            .unwrap();
                        completed.lock().unwrap().push(record.id);
                    }
                });
            }
        });

        let mut completed = completed.into_inner().unwrap();
        completed.sort_unstable();
        let before = completed.len();
        completed.dedup();
        assert_eq!(before, completed.len(), "a record was completed twice");
        assert_eq!(completed.len(), RECORDS);
    }

    #[test]
    fn status_never_regresses_without_reset() {
        let env = Env::new(2);
        let ids: Vec<i64> = (0..4)
            .map(|i| env.add_file(&format!("{i}.txt"), &i.to_string()))
            .collect();
        env.add_reference("storage/absent.pdf");
        let resolver = env.resolver();
        let flaky_summary = FnExecutor {
            stage: Stage::Summarize,
            f: |record: &ProcessingRecord, _: Option<&Path>| {
                if record.id % 2 == 0 {
                    StageResult::Failure(StageFailure::executor("model refused", false))
                } else {
                    StageResult::Success(StageOutput::Summary {
                        summary: "ok".into(),
                        significance: None,
                        entities: vec![],
                    })
                }
            },
        };

        let mut last: Vec<u8> = ids.iter().map(|id| env.status(*id).rank()).collect();
        for _ in 0..3 {
            env.scheduler.run_pass(&ocr_ok(), &resolver, None).unwrap();
            env.scheduler
                .run_pass(&flaky_summary, &resolver, None)
                .unwrap();
            let now: Vec<u8> = ids.iter().map(|id| env.status(*id).rank()).collect();
            for (before, after) in last.iter().zip(&now) {
                assert!(after >= before);
            }
            last = now;
        }

        let errored = ids
            .iter()
            .copied()
            .find(|id| env.status(*id) == RecordStatus::Error)
            .unwrap();
        env.store
            .reset_record(errored, RecordStatus::OcrProcessed)
            .unwrap();
        assert!(env.status(errored).rank() < RecordStatus::Error.rank());
    }
}
