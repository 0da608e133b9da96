//! Declarative structural changes.
//!
//! A [`MigrationSpec`] names one table, column or index the deployment
//! expects. Specs are built in code, never mutated, and rendered to DDL only
//! when the engine finds them missing from the live store.

use serde::{Deserialize, Serialize};

use crate::db::{quote_identifier, validate_identifier, DatabaseError};

/// Column definition: type + nullability + default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    /// Raw SQL default expression (`5`, `'pending'`, `CURRENT_TIMESTAMP`).
    pub default: Option<String>,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, expr: &str) -> Self {
        self.default = Some(expr.to_string());
        self
    }

    fn render(&self) -> Result<String, DatabaseError> {
        if self.sql_type.trim().is_empty()
            || self.sql_type.contains(';')
            || self.sql_type.contains("--")
        {
            return Err(DatabaseError::ConstraintViolation(format!(
                "column {} has an unusable type {:?}",
                self.name, self.sql_type
            )));
        }
        let mut sql = format!("{} {}", quote_identifier(&self.name)?, self.sql_type.trim());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        Ok(sql)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
}

/// A table created when missing. Always gets an integer autoincrement key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub id_column: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationTarget {
    Table(TableDef),
    Column(ColumnDef),
    Index(IndexDef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSpec {
    pub table: String,
    pub target: MigrationTarget,
    /// Column this one should logically follow. Must already exist when the
    /// spec is applied.
    pub after: Option<String>,
    /// The application cannot run if this spec is left unapplied.
    pub required: bool,
}

impl MigrationSpec {
    pub fn create_table(table: &str, columns: Vec<ColumnDef>) -> Self {
        Self {
            table: table.to_string(),
            target: MigrationTarget::Table(TableDef {
                id_column: "id".to_string(),
                columns,
            }),
            after: None,
            required: false,
        }
    }

    pub fn add_column(table: &str, column: ColumnDef) -> Self {
        Self {
            table: table.to_string(),
            target: MigrationTarget::Column(column),
            after: None,
            required: false,
        }
    }

    pub fn add_index(table: &str, name: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            target: MigrationTarget::Index(IndexDef {
                name: name.to_string(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
            }),
            after: None,
            required: false,
        }
    }

    pub fn after(mut self, column: &str) -> Self {
        self.after = Some(column.to_string());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn kind(&self) -> &'static str {
        match self.target {
            MigrationTarget::Table(_) => "table",
            MigrationTarget::Column(_) => "column",
            MigrationTarget::Index(_) => "index",
        }
    }

    /// `table`, `table.column` or `table#index`.
    pub fn label(&self) -> String {
        match &self.target {
            MigrationTarget::Table(_) => self.table.clone(),
            MigrationTarget::Column(column) => format!("{}.{}", self.table, column.name),
            MigrationTarget::Index(index) => format!("{}#{}", self.table, index.name),
        }
    }

    /// Check every identifier the spec would interpolate into SQL.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        validate_identifier(&self.table)?;
        if let Some(after) = &self.after {
            validate_identifier(after)?;
        }
        match &self.target {
            MigrationTarget::Table(def) => {
                validate_identifier(&def.id_column)?;
                for column in &def.columns {
                    validate_identifier(&column.name)?;
                }
            }
            MigrationTarget::Column(column) => {
                validate_identifier(&column.name)?;
            }
            MigrationTarget::Index(index) => {
                validate_identifier(&index.name)?;
                if index.columns.is_empty() {
                    return Err(DatabaseError::ConstraintViolation(format!(
                        "index {} has no columns",
                        index.name
                    )));
                }
                for column in &index.columns {
                    validate_identifier(column)?;
                }
            }
        }
        Ok(())
    }

    /// Render the single DDL statement that applies this spec.
    pub fn to_ddl(&self) -> Result<String, DatabaseError> {
        let table = quote_identifier(&self.table)?;
        match &self.target {
            MigrationTarget::Table(def) => {
                let mut parts = vec![format!(
                    "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                    quote_identifier(&def.id_column)?
                )];
                for column in &def.columns {
                    parts.push(column.render()?);
                }
                Ok(format!(
                    "CREATE TABLE IF NOT EXISTS {table} ({})",
                    parts.join(", ")
                ))
            }
            MigrationTarget::Column(column) => {
                Ok(format!("ALTER TABLE {table} ADD COLUMN {}", column.render()?))
            }
            MigrationTarget::Index(index) => {
                let columns = index
                    .columns
                    .iter()
                    .map(|c| quote_identifier(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {table} ({})",
                    quote_identifier(&index.name)?,
                    columns.join(", ")
                ))
            }
        }
    }
}
