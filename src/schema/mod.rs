//! Idempotent schema evolution.
//!
//! ```text
//! SchemaCatalog (live probe) → MigrationEngine (probe, then mutate) → MigrationReport
//! ```
//!
//! There is no version ledger: every run re-probes the live structure and
//! applies only what is missing, so overlapping deployments converge.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod spec;

pub use catalog::{SchemaCatalog, SchemaState, SqliteCatalog, TableState};
pub use engine::{MigrationEngine, MigrationReport, SpecOutcome, SpecReport};
pub use error::MigrationError;
pub use pipeline::pipeline_specs;
pub use spec::{ColumnDef, IndexDef, MigrationSpec, MigrationTarget, TableDef};
