//! The structure this deployment expects.
//!
//! Order matters: tables before their columns, `AFTER` predecessors before
//! the columns that follow them, columns before the indexes over them.

use super::spec::{ColumnDef, MigrationSpec};
use crate::config::DEFAULT_PRIORITY;
use crate::triage::RecordTable;

pub fn pipeline_specs() -> Vec<MigrationSpec> {
    let mut specs = Vec::new();

    for table in RecordTable::ALL {
        let t = table.as_str();
        specs.push(
            MigrationSpec::create_table(
                t,
                vec![
                    ColumnDef::new("title", "TEXT"),
                    ColumnDef::new("local_path", "TEXT"),
                    ColumnDef::new("status", "TEXT")
                        .not_null()
                        .default("'pending'"),
                    ColumnDef::new("created_at", "TEXT")
                        .not_null()
                        .default("CURRENT_TIMESTAMP"),
                ],
            )
            .required(),
        );
        specs.extend(processing_columns(t));
        specs.push(MigrationSpec::add_index(
            t,
            &format!("idx_{t}_priority_status"),
            &["status", "processing_priority", "created_at"],
        ));
    }

    specs.push(
        MigrationSpec::create_table(
            "ingestion_errors",
            vec![
                ColumnDef::new("table_name", "TEXT").not_null(),
                ColumnDef::new("record_id", "INTEGER").not_null(),
                ColumnDef::new("step", "TEXT").not_null(),
                ColumnDef::new("message", "TEXT").not_null(),
                ColumnDef::new("created_at", "TEXT")
                    .not_null()
                    .default("CURRENT_TIMESTAMP"),
            ],
        )
        .required(),
    );
    specs.push(MigrationSpec::add_index(
        "ingestion_errors",
        "idx_ingestion_errors_record",
        &["table_name", "record_id"],
    ));

    specs.push(MigrationSpec::create_table(
        "ingestion_batches",
        vec![
            ColumnDef::new("batch_name", "TEXT").not_null(),
            ColumnDef::new("data_set", "TEXT"),
            ColumnDef::new("total_documents", "INTEGER").not_null().default("0"),
            ColumnDef::new("processed_documents", "INTEGER").not_null().default("0"),
            ColumnDef::new("failed_documents", "INTEGER").not_null().default("0"),
            ColumnDef::new("status", "TEXT").not_null().default("'pending'"),
            ColumnDef::new("started_at", "TEXT"),
            ColumnDef::new("completed_at", "TEXT"),
            ColumnDef::new("created_at", "TEXT")
                .not_null()
                .default("CURRENT_TIMESTAMP"),
        ],
    ));
    specs.push(
        MigrationSpec::add_column("documents", ColumnDef::new("data_set", "TEXT"))
            .after("local_path"),
    );
    specs.push(
        MigrationSpec::add_column("documents", ColumnDef::new("batch_id", "INTEGER"))
            .after("data_set"),
    );
    specs.push(MigrationSpec::add_index(
        "documents",
        "idx_documents_batch",
        &["batch_id"],
    ));

    specs
}

fn processing_columns(table: &str) -> Vec<MigrationSpec> {
    let priority = DEFAULT_PRIORITY.to_string();
    vec![
        MigrationSpec::add_column(
            table,
            ColumnDef::new("processing_priority", "INTEGER")
                .not_null()
                .default(&priority),
        )
        .after("status")
        .required(),
        MigrationSpec::add_column(
            table,
            ColumnDef::new("attempts", "INTEGER").not_null().default("0"),
        )
        .after("processing_priority")
        .required(),
        MigrationSpec::add_column(table, ColumnDef::new("claimed_at", "TEXT")).required(),
        MigrationSpec::add_column(table, ColumnDef::new("claim_token", "TEXT")).required(),
        MigrationSpec::add_column(table, ColumnDef::new("last_error", "TEXT")).required(),
        MigrationSpec::add_column(table, ColumnDef::new("ocr_text", "TEXT")).required(),
        MigrationSpec::add_column(table, ColumnDef::new("page_count", "INTEGER")),
        MigrationSpec::add_column(table, ColumnDef::new("ai_summary", "TEXT")).required(),
        MigrationSpec::add_column(table, ColumnDef::new("significance_score", "REAL")),
        MigrationSpec::add_column(table, ColumnDef::new("entities", "TEXT")),
        MigrationSpec::add_column(table, ColumnDef::new("updated_at", "TEXT")),
    ]
}

/// In-memory database with the full pipeline schema applied.
#[cfg(test)]
pub(crate) fn migrated_memory_database() -> rusqlite::Connection {
    let conn = crate::db::open_memory_database().expect("open in-memory DB");
    let report = super::MigrationEngine::new(&conn)
        .apply(&pipeline_specs())
        .expect("migrate in-memory DB");
    assert_eq!(report.warnings(), 0, "{report:?}");
    conn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_tables, open_memory_database};
    use crate::schema::{MigrationEngine, SchemaCatalog, SpecOutcome, SqliteCatalog};

    #[test]
    fn fresh_database_applies_everything() {
        let conn = open_memory_database().unwrap();
        let specs = pipeline_specs();
        let report = MigrationEngine::new(&conn).apply(&specs).unwrap();
        assert_eq!(report.applied(), specs.len());
        assert!(!report.is_blocking());
        // 3 record tables + ingestion_errors + ingestion_batches
        assert_eq!(count_tables(&conn).unwrap(), 5);
    }

    #[test]
    fn rerun_is_a_no_op() {
        let conn = migrated_memory_database();
        let report = MigrationEngine::new(&conn).apply(&pipeline_specs()).unwrap();
        assert_eq!(report.applied(), 0);
        assert_eq!(report.warnings(), 0);
        assert!(report
            .entries
            .iter()
            .all(|e| e.outcome == SpecOutcome::Skipped));
    }

    #[test]
    fn legacy_table_gains_processing_columns() {
        let conn = open_memory_database().unwrap();
        conn.execute_batch(
            "CREATE TABLE documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT, local_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                ai_summary TEXT
             );
             INSERT INTO documents (title, status) VALUES ('old', 'downloaded');",
        )
        .unwrap();

        let report = MigrationEngine::new(&conn).apply(&pipeline_specs()).unwrap();
        assert_eq!(report.outcome_of("documents"), Some(&SpecOutcome::Skipped));
        assert_eq!(
            report.outcome_of("documents.ai_summary"),
            Some(&SpecOutcome::Skipped)
        );
        assert_eq!(
            report.outcome_of("documents.processing_priority"),
            Some(&SpecOutcome::Applied)
        );

        let priority: i64 = conn
            .query_row("SELECT processing_priority FROM documents", [], |r| r.get(0))
            .unwrap();
        assert_eq!(priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn every_record_table_is_indexed_for_triage() {
        let conn = migrated_memory_database();
        let catalog = SqliteCatalog::new(&conn);
        for table in RecordTable::ALL {
            let indexes = catalog.indexes_of(table.as_str()).unwrap();
            assert!(indexes.contains(&format!("idx_{}_priority_status", table.as_str())));
        }
    }
}
