//! Live structure introspection.
//!
//! Every call goes to the connected store; nothing here is cached. SQLite's
//! table-valued pragmas stand in for an information schema.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{params, Connection};

use super::error::MigrationError;
use crate::db::validate_identifier;

pub trait SchemaCatalog {
    fn table_exists(&self, table: &str) -> Result<bool, MigrationError>;

    /// Column names of `table`, lowercased. Empty when the table is absent.
    fn columns_of(&self, table: &str) -> Result<BTreeSet<String>, MigrationError>;

    /// Index names of `table`, lowercased. Empty when the table is absent.
    fn indexes_of(&self, table: &str) -> Result<BTreeSet<String>, MigrationError>;

    /// Snapshot the given tables. Absent tables are omitted.
    fn snapshot(&self, tables: &[&str]) -> Result<SchemaState, MigrationError> {
        let mut state = SchemaState::default();
        for table in tables {
            if !self.table_exists(table)? {
                continue;
            }
            state.tables.insert(
                table.to_ascii_lowercase(),
                TableState {
                    columns: self.columns_of(table)?,
                    indexes: self.indexes_of(table)?,
                },
            );
        }
        Ok(state)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableState {
    pub columns: BTreeSet<String>,
    pub indexes: BTreeSet<String>,
}

/// Read-only view of the store's structure at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaState {
    pub tables: BTreeMap<String, TableState>,
}

impl SchemaState {
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_ascii_lowercase())
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(&table.to_ascii_lowercase())
            .is_some_and(|t| t.columns.contains(&column.to_ascii_lowercase()))
    }

    pub fn has_index(&self, table: &str, index: &str) -> bool {
        self.tables
            .get(&table.to_ascii_lowercase())
            .is_some_and(|t| t.indexes.contains(&index.to_ascii_lowercase()))
    }
}

pub struct SqliteCatalog<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCatalog<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn names(&self, table: &str, sql: &str) -> Result<BTreeSet<String>, MigrationError> {
        checked(table)?;
        let introspection = |e: rusqlite::Error| MigrationError::Introspection {
            table: table.to_string(),
            reason: e.to_string(),
        };
        let mut stmt = self.conn.prepare(sql).map_err(introspection)?;
        let rows = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))
            .map_err(introspection)?;
        let mut names = BTreeSet::new();
        for row in rows {
            names.insert(row.map_err(introspection)?.to_ascii_lowercase());
        }
        Ok(names)
    }
}

impl SchemaCatalog for SqliteCatalog<'_> {
    fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
        checked(table)?;
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| MigrationError::Introspection {
                table: table.to_string(),
                reason: e.to_string(),
            })?;
        Ok(count > 0)
    }

    fn columns_of(&self, table: &str) -> Result<BTreeSet<String>, MigrationError> {
        self.names(table, "SELECT name FROM pragma_table_info(?1)")
    }

    fn indexes_of(&self, table: &str) -> Result<BTreeSet<String>, MigrationError> {
        self.names(table, "SELECT name FROM pragma_index_list(?1)")
    }
}

fn checked(table: &str) -> Result<(), MigrationError> {
    validate_identifier(table)
        .map(|_| ())
        .map_err(|e| MigrationError::Introspection {
            table: table.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_database;

    fn setup() -> Connection {
        let conn = open_memory_database().unwrap();
        conn.execute_batch(
            "CREATE TABLE documents (id INTEGER PRIMARY KEY, Title TEXT, status TEXT);
             CREATE INDEX idx_documents_status ON documents (status);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn columns_reflect_live_table() {
        let conn = setup();
        let catalog = SqliteCatalog::new(&conn);
        let columns = catalog.columns_of("documents").unwrap();
        assert_eq!(
            columns.into_iter().collect::<Vec<_>>(),
            vec!["id", "status", "title"]
        );
    }

    #[test]
    fn catalog_is_never_stale() {
        let conn = setup();
        let catalog = SqliteCatalog::new(&conn);
        assert!(!catalog.columns_of("documents").unwrap().contains("ai_summary"));
        conn.execute_batch("ALTER TABLE documents ADD COLUMN ai_summary TEXT")
            .unwrap();
        assert!(catalog.columns_of("documents").unwrap().contains("ai_summary"));
    }

    #[test]
    fn indexes_listed_by_name() {
        let conn = setup();
        let catalog = SqliteCatalog::new(&conn);
        assert!(catalog
            .indexes_of("documents")
            .unwrap()
            .contains("idx_documents_status"));
    }

    #[test]
    fn missing_table_is_empty_not_error() {
        let conn = setup();
        let catalog = SqliteCatalog::new(&conn);
        assert!(!catalog.table_exists("flight_logs").unwrap());
        assert!(catalog.columns_of("flight_logs").unwrap().is_empty());
        assert!(catalog.indexes_of("flight_logs").unwrap().is_empty());
    }

    #[test]
    fn invalid_table_name_is_introspection_error() {
        let conn = setup();
        let catalog = SqliteCatalog::new(&conn);
        let err = catalog.columns_of("documents; --").unwrap_err();
        assert!(matches!(err, MigrationError::Introspection { .. }));
    }

    #[test]
    fn snapshot_is_case_insensitive() {
        let conn = setup();
        let state = SqliteCatalog::new(&conn)
            .snapshot(&["documents", "news_articles"])
            .unwrap();
        assert!(state.has_table("DOCUMENTS"));
        assert!(state.has_column("documents", "TITLE"));
        assert!(state.has_index("documents", "idx_documents_status"));
        assert!(!state.has_table("news_articles"));
    }
}
