//! Probe-then-mutate migration runner.
//!
//! Each migration, in declaration order:
//! `Probed → Skip | Mutate → Applied | Warned`. A failed mutation is rolled
//! back and reported; the remaining specs still run. Only an introspection
//! failure aborts the run.

use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

use super::catalog::{SchemaCatalog, SqliteCatalog};
use super::error::MigrationError;
use super::spec::{MigrationSpec, MigrationTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecOutcome {
    Applied,
    Skipped,
    Warning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpecReport {
    pub label: String,
    pub kind: &'static str,
    pub required: bool,
    pub outcome: SpecOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub entries: Vec<SpecReport>,
    pub duration_ms: u64,
}

impl MigrationReport {
    pub fn applied(&self) -> usize {
        self.count(|o| matches!(o, SpecOutcome::Applied))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SpecOutcome::Skipped))
    }

    pub fn warnings(&self) -> usize {
        self.count(|o| matches!(o, SpecOutcome::Warning(_)))
    }

    /// A required spec is still missing; the application cannot run.
    pub fn is_blocking(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.required && matches!(e.outcome, SpecOutcome::Warning(_)))
    }

    pub fn outcome_of(&self, label: &str) -> Option<&SpecOutcome> {
        self.entries
            .iter()
            .find(|e| e.label == label)
            .map(|e| &e.outcome)
    }

    fn count(&self, pred: impl Fn(&SpecOutcome) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.outcome)).count()
    }
}

pub struct MigrationEngine<'c> {
    conn: &'c Connection,
    catalog: Box<dyn SchemaCatalog + 'c>,
}

impl<'c> MigrationEngine<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self::with_catalog(conn, SqliteCatalog::new(conn))
    }

    /// Probe through `catalog` and mutate through `conn`.
    pub fn with_catalog(conn: &'c Connection, catalog: impl SchemaCatalog + 'c) -> Self {
        Self {
            conn,
            catalog: Box::new(catalog),
        }
    }

    /// Apply every missing spec, strictly in the given order.
    pub fn apply(&self, specs: &[MigrationSpec]) -> Result<MigrationReport, MigrationError> {
        let start = Instant::now();
        let mut report = MigrationReport::default();

        for spec in specs {
            let outcome = self.apply_one(spec)?;
            match &outcome {
                SpecOutcome::Applied => {
                    tracing::info!(spec = %spec.label(), kind = spec.kind(), "Applied migration")
                }
                SpecOutcome::Skipped => {
                    tracing::debug!(spec = %spec.label(), "Already present, skipped")
                }
                SpecOutcome::Warning(message) => tracing::warn!(
                    spec = %spec.label(),
                    required = spec.required,
                    warning = %message,
                    "Migration not applied"
                ),
            }
            report.entries.push(SpecReport {
                label: spec.label(),
                kind: spec.kind(),
                required: spec.required,
                outcome,
            });
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            applied = report.applied(),
            skipped = report.skipped(),
            warnings = report.warnings(),
            "Migration run complete"
        );
        Ok(report)
    }

    fn apply_one(&self, spec: &MigrationSpec) -> Result<SpecOutcome, MigrationError> {
        if let Err(e) = spec.validate() {
            return Ok(SpecOutcome::Warning(e.to_string()));
        }

        // Re-probed per spec: earlier specs in this run may have changed it.
        let state = self.catalog.snapshot(&[spec.table.as_str()])?;
        let present = match &spec.target {
            MigrationTarget::Table(_) => state.has_table(&spec.table),
            MigrationTarget::Column(column) => state.has_column(&spec.table, &column.name),
            MigrationTarget::Index(index) => state.has_index(&spec.table, &index.name),
        };
        if present {
            return Ok(SpecOutcome::Skipped);
        }

        if let (Some(after), MigrationTarget::Column(_)) = (&spec.after, &spec.target) {
            if !state.has_column(&spec.table, after) {
                return Ok(SpecOutcome::Warning(format!(
                    "predecessor column {}.{after} missing",
                    spec.table
                )));
            }
        }

        let ddl = match spec.to_ddl() {
            Ok(ddl) => ddl,
            Err(e) => return Ok(SpecOutcome::Warning(e.to_string())),
        };

        Ok(match self.mutate(&ddl) {
            Ok(()) => SpecOutcome::Applied,
            Err(e) => SpecOutcome::Warning(e.to_string()),
        })
    }

    /// One statement, one transaction. Dropping an uncommitted transaction
    /// rolls it back.
    fn mutate(&self, ddl: &str) -> Result<(), rusqlite::Error> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(ddl)?;
        tx.commit()
    }
}
