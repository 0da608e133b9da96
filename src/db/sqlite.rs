use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rusqlite::Connection;

use super::DatabaseError;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Open a SQLite connection to the given path.
///
/// Schema evolution is a separate deployment step
/// (see [`crate::schema::MigrationEngine`]); opening never mutates structure.
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    configure_pragmas(&conn)?;
    tracing::debug!(path = %path.display(), "Opened archive database");
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Reject anything that is not a plain SQL identifier.
///
/// Table, column and index names are interpolated into DDL and
/// introspection queries, so they never come from untrusted input unchecked.
pub fn validate_identifier(name: &str) -> Result<&str, DatabaseError> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

/// Validate and double-quote an identifier for use in SQL text.
pub fn quote_identifier(name: &str) -> Result<String, DatabaseError> {
    validate_identifier(name).map(|n| format!("\"{n}\""))
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_database_starts_empty() {
        let conn = open_memory_database().unwrap();
        assert_eq!(count_tables(&conn).unwrap(), 0);
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = open_memory_database().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn file_database_uses_wal_and_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("archive.db");
        let conn = open_database(&path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert!(path.exists());
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("processing_priority").is_ok());
        assert!(validate_identifier("_x1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("documents; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
        assert_eq!(quote_identifier("status").unwrap(), "\"status\"");
    }
}
