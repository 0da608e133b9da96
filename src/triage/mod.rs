//! Processing triage.
//!
//! Decides which records are eligible for the next pipeline stage and in
//! what order, claims them so no two workers hold the same record, and
//! persists each stage's outcome.
//!
//! ```text
//! claim_batch → resolve artifact → StageExecutor::run → complete / fail
//! ```
//!
//! Retry is not a loop here: a retryable failure returns the record to its
//! input status and the next pass selects it again.

pub mod background;
pub mod error;
pub mod executor;
pub mod memory_store;
pub mod policy;
pub mod scheduler;
pub mod sqlite_store;
pub mod traits;
pub mod types;

pub use background::{run_cycle, start_worker, supervise, WorkerConfig, WorkerHandle};
pub use error::SchedulerError;
pub use executor::CommandExecutor;
pub use memory_store::MemoryRecordStore;
pub use policy::DefaultFailurePolicy;
pub use scheduler::TriageScheduler;
pub use sqlite_store::{new_claim_token, SqliteRecordStore};
pub use traits::*;
pub use types::*;
