//! Background worker: periodic triage passes.
//!
//! Each cycle first returns stale claims (left behind by a crashed worker)
//! to the queue, then drains every configured stage in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::error::SchedulerError;
use super::scheduler::TriageScheduler;
use super::traits::StageExecutor;
use super::types::{PassSummary, Stage};
use crate::artifact::ArtifactResolver;
use crate::config::IngestConfig;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub stale_claim_age: chrono::Duration,
}

impl WorkerConfig {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            stale_claim_age: config.stale_claim_age(),
        }
    }
}

/// Handle for the worker thread. Dropping it stops the worker and waits for
/// the current record to finish.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Claimed but unprocessed records are released before the thread exits.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop and wait.
    pub fn join(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// One cycle: release stale claims, then one pass per executor.
pub fn run_cycle(
    scheduler: &TriageScheduler,
    executors: &[Box<dyn StageExecutor>],
    resolver: &ArtifactResolver,
    stale_claim_age: chrono::Duration,
    stop: Option<&AtomicBool>,
) -> Result<Vec<(Stage, PassSummary)>, SchedulerError> {
    let mut results = Vec::with_capacity(executors.len());
    for executor in executors {
        if stop.is_some_and(|s| s.load(Ordering::Relaxed)) {
            break;
        }
        let stage = executor.stage();
        let cutoff = Utc::now().naive_utc() - stale_claim_age;
        scheduler.store().release_stale_claims(stage, cutoff)?;
        let summary = scheduler.run_pass(executor.as_ref(), resolver, stop)?;
        results.push((stage, summary));
    }
    Ok(results)
}

/// Block until `stop` is raised or every worker has exited, then shut all
/// of them down. Workers release their unprocessed claims on the way out.
pub fn supervise(handles: Vec<WorkerHandle>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) && !handles.iter().all(WorkerHandle::is_finished) {
        std::thread::sleep(SLEEP_SLICE);
    }
    if stop.load(Ordering::Relaxed) {
        tracing::info!(workers = handles.len(), "Shutdown requested, stopping workers");
    }
    for handle in &handles {
        handle.shutdown();
    }
    for handle in handles {
        handle.join();
    }
}

pub fn start_worker(
    scheduler: Arc<TriageScheduler>,
    executors: Vec<Box<dyn StageExecutor>>,
    resolver: Arc<ArtifactResolver>,
    config: WorkerConfig,
) -> WorkerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::spawn(move || {
        let stages: Vec<&str> = executors.iter().map(|e| e.stage().as_str()).collect();
        tracing::info!(
            table = %scheduler.store().table(),
            stages = ?stages,
            poll_secs = config.poll_interval.as_secs(),
            "Triage worker started"
        );
        worker_loop(&scheduler, &executors, &resolver, &config, &flag);
        tracing::info!("Triage worker shutting down");
    });

    WorkerHandle {
        shutdown,
        handle: Some(handle),
    }
}

fn worker_loop(
    scheduler: &TriageScheduler,
    executors: &[Box<dyn StageExecutor>],
    resolver: &ArtifactResolver,
    config: &WorkerConfig,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = run_cycle(
            scheduler,
            executors,
            resolver,
            config.stale_claim_age,
            Some(shutdown),
        ) {
            tracing::error!(error = %e, "Triage cycle failed");
        }

        let mut slept = Duration::ZERO;
        while slept < config.poll_interval {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            let slice = SLEEP_SLICE.min(config.poll_interval - slept);
            std::thread::sleep(slice);
            slept += slice;
        }
    }
}
