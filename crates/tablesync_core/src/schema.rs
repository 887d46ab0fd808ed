//! Declarative table definitions.
//!
//! A [`SchemaDescriptor`] is pure data: the column list, indexes and the
//! insert/remove policy of one logical table. Turning it into physical DDL
//! is the job of [`crate::migration`].

use crate::error::{CoreError, CoreResult};
use std::collections::HashSet;

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit integer.
    Integer,
    /// Floating point.
    Real,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Blob,
    /// Boolean stored as 0/1.
    Boolean,
    /// Timestamp stored as text or integer, at the consumer's choice.
    Timestamp,
}

impl ColumnType {
    /// The declared SQL type written into DDL.
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
        }
    }

    /// Parses a declared type as reported by `PRAGMA table_info`.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => Some(ColumnType::Integer),
            "REAL" => Some(ColumnType::Real),
            "TEXT" => Some(ColumnType::Text),
            "BLOB" => Some(ColumnType::Blob),
            "BOOLEAN" => Some(ColumnType::Boolean),
            "TIMESTAMP" => Some(ColumnType::Timestamp),
            _ => None,
        }
    }
}

/// One column of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub column_type: ColumnType,
    /// Whether updates may change this column outside the guard bypass.
    pub updatable: bool,
}

/// A secondary index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, unique within the database.
    pub name: String,
    /// Indexed columns in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// Declarative definition of one logical table.
///
/// The first column is the primary key. Once a table exists physically its
/// column list may only grow at the end.
///
/// ```rust,ignore
/// let stops = SchemaDescriptor::new("stops")
///     .column("id", ColumnType::Integer)
///     .column("name", ColumnType::Text)
///     .read_only_column("code", ColumnType::Text)
///     .index("stops_name", &["name"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescriptor {
    table_name: String,
    columns: Vec<ColumnSpec>,
    indexes: Vec<IndexSpec>,
    allow_insert: bool,
    allow_remove: bool,
}

impl SchemaDescriptor {
    /// Creates a descriptor with no columns that allows inserts and removes.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            allow_insert: true,
            allow_remove: true,
        }
    }

    /// Appends an updatable column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            column_type,
            updatable: true,
        });
        self
    }

    /// Appends a column that guard triggers protect against updates.
    #[must_use]
    pub fn read_only_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            column_type,
            updatable: false,
        });
        self
    }

    /// Adds a non-unique index.
    #[must_use]
    pub fn index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        });
        self
    }

    /// Adds a unique index.
    #[must_use]
    pub fn unique_index(mut self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: true,
        });
        self
    }

    /// Sets whether inserts are allowed outside the guard bypass.
    #[must_use]
    pub const fn allow_insert(mut self, value: bool) -> Self {
        self.allow_insert = value;
        self
    }

    /// Sets whether deletes are allowed outside the guard bypass.
    #[must_use]
    pub const fn allow_remove(mut self, value: bool) -> Self {
        self.allow_remove = value;
        self
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Columns in physical order.
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Column names in physical order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Looks up a column by name.
    pub fn find_column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Secondary indexes.
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Insert policy.
    pub fn inserts_allowed(&self) -> bool {
        self.allow_insert
    }

    /// Remove policy.
    pub fn removes_allowed(&self) -> bool {
        self.allow_remove
    }

    /// The primary key column, i.e. the first column.
    pub fn primary_key(&self) -> Option<&ColumnSpec> {
        self.columns.first()
    }

    /// Checks the descriptor for structural problems.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` if the table name is empty or reserved, there
    /// are no columns, a column name repeats, the primary key is not an
    /// integer, or an index references an unknown column.
    pub fn validate(&self) -> CoreResult<()> {
        let table = &self.table_name;
        if table.is_empty() {
            return Err(CoreError::invalid_schema(table, "table name is empty"));
        }
        if table.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(CoreError::invalid_schema(
                table,
                "names starting with sqlite_ are reserved",
            ));
        }

        let Some(pk) = self.columns.first() else {
            return Err(CoreError::invalid_schema(table, "no columns"));
        };
        if pk.column_type != ColumnType::Integer {
            return Err(CoreError::invalid_schema(
                table,
                format!("primary key {} must be INTEGER", pk.name),
            ));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(CoreError::invalid_schema(table, "empty column name"));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(CoreError::invalid_schema(
                    table,
                    format!("column {} declared twice", column.name),
                ));
            }
        }

        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(CoreError::invalid_schema(
                    table,
                    format!("index {} has no columns", index.name),
                ));
            }
            for column in &index.columns {
                if self.find_column(column).is_none() {
                    return Err(CoreError::invalid_schema(
                        table,
                        format!("index {} references unknown column {column}", index.name),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Quotes an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal for use in generated SQL.
pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
