use thiserror::Error;

/// Failures that abort a migration run.
///
/// A single spec failing to apply is not one of these: it is recorded as a
/// warning in the [`super::MigrationReport`] and the run continues.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Introspection failed for table {table}: {reason}")]
    Introspection { table: String, reason: String },
}
