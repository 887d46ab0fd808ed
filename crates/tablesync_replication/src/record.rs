//! Update records and their wire format.
//!
//! An [`UpdateRecord`] describes one mutation for cross-node propagation.
//! Records travel and rest as CBOR; the statement column of the log holds
//! the CBOR encoding of the [`Statement`] alone.

use crate::clock::{NodeId, Timestamp};
use crate::error::{ReplicationError, ReplicationResult};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use tablesync_core::{quote_ident, Row};

/// Replay state of an update record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    /// Not yet applied locally.
    Pending,
    /// Applied; terminal.
    Applied,
    /// Parked after exhausting retries; terminal.
    Failed,
}

impl UpdateState {
    /// Storage code.
    pub const fn code(self) -> i64 {
        match self {
            UpdateState::Pending => 0,
            UpdateState::Applied => 1,
            UpdateState::Failed => 2,
        }
    }

    /// Converts from a storage code.
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(UpdateState::Pending),
            1 => Some(UpdateState::Applied),
            2 => Some(UpdateState::Failed),
            _ => None,
        }
    }

    /// Upper-case name.
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateState::Pending => "PENDING",
            UpdateState::Applied => "APPLIED",
            UpdateState::Failed => "FAILED",
        }
    }

    /// Returns true for states that never change again.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, UpdateState::Pending)
    }

    /// Only PENDING→APPLIED and PENDING→FAILED exist.
    pub const fn can_transition_to(self, next: UpdateState) -> bool {
        matches!(
            (self, next),
            (UpdateState::Pending, UpdateState::Applied) | (UpdateState::Pending, UpdateState::Failed)
        )
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for UpdateState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for UpdateState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_i64()?;
        UpdateState::from_code(code).ok_or(FromSqlError::OutOfRange(code))
    }
}

/// A serialized mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Insert the row, or overwrite it if the key exists.
    Upsert {
        /// Target table.
        table: String,
        /// Primary key column.
        key_column: String,
        /// Full row, key included.
        row: Row,
    },
    /// Delete one row by key.
    Delete {
        /// Target table.
        table: String,
        /// Primary key column.
        key_column: String,
        /// Key of the row.
        row_id: i64,
    },
    /// Raw SQL, not attributable to a single row.
    Sql {
        /// Statement text.
        sql: String,
    },
}

impl Statement {
    /// Creates an upsert.
    pub fn upsert(table: impl Into<String>, key_column: impl Into<String>, row: Row) -> Self {
        Statement::Upsert {
            table: table.into(),
            key_column: key_column.into(),
            row,
        }
    }

    /// Creates a delete.
    pub fn delete(table: impl Into<String>, key_column: impl Into<String>, row_id: i64) -> Self {
        Statement::Delete {
            table: table.into(),
            key_column: key_column.into(),
            row_id,
        }
    }

    /// Creates a raw SQL statement.
    pub fn sql(sql: impl Into<String>) -> Self {
        Statement::Sql { sql: sql.into() }
    }

    /// The row this statement writes, for row-scoped statements.
    pub fn target(&self) -> Option<(&str, i64)> {
        match self {
            Statement::Upsert {
                table,
                key_column,
                row,
            } => row.get_i64(key_column).map(|id| (table.as_str(), id)),
            Statement::Delete { table, row_id, .. } => Some((table.as_str(), *row_id)),
            Statement::Sql { .. } => None,
        }
    }

    /// Checks that the statement can be applied at all.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` for an upsert without an integer key or an
    /// empty SQL statement.
    pub fn validate(&self) -> ReplicationResult<()> {
        match self {
            Statement::Upsert {
                table,
                key_column,
                row,
            } => {
                if row.get_i64(key_column).is_none() {
                    return Err(ReplicationError::InvalidRecord(format!(
                        "upsert into {table} has no integer {key_column}"
                    )));
                }
                Ok(())
            }
            Statement::Delete { .. } => Ok(()),
            Statement::Sql { sql } if sql.trim().is_empty() => {
                Err(ReplicationError::InvalidRecord("empty SQL statement".into()))
            }
            Statement::Sql { .. } => Ok(()),
        }
    }

    /// Executes the statement on a connection.
    ///
    /// Applying the same statement twice leaves the row in the same state.
    pub fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            Statement::Upsert {
                table,
                key_column,
                row,
            } => {
                conn.execute(&upsert_sql(table, key_column, row), params_from_iter(row.values()))?;
            }
            Statement::Delete {
                table,
                key_column,
                row_id,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = ?1",
                    quote_ident(table),
                    quote_ident(key_column)
                );
                conn.execute(&sql, [row_id])?;
            }
            Statement::Sql { sql } => conn.execute_batch(sql)?,
        }
        Ok(())
    }

    /// Encodes the statement as CBOR.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if serialization fails.
    pub fn to_cbor(&self) -> ReplicationResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a statement from CBOR.
    ///
    /// # Errors
    ///
    /// Returns `Codec` for malformed input.
    pub fn from_cbor(bytes: &[u8]) -> ReplicationResult<Self> {
        from_cbor(bytes)
    }
}

fn upsert_sql(table: &str, key_column: &str, row: &Row) -> String {
    let columns: Vec<String> = row.columns().map(quote_ident).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = row
        .columns()
        .filter(|c| *c != key_column)
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();
    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(table),
        columns.join(", "),
        placeholders.join(", "),
        quote_ident(key_column),
        on_conflict
    )
}

impl ToSql for Statement {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        self.to_cbor()
            .map(ToSqlOutput::from)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

impl FromSql for Statement {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Statement::from_cbor(value.as_blob()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One entry of the replication log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// When the mutation was made on its emitting node.
    pub timestamp: Timestamp,
    /// Node that made the mutation.
    pub emitting_node: NodeId,
    /// Per-node sequence number, starting at 1.
    pub index: u64,
    /// Replay state.
    pub state: UpdateState,
    /// The mutation.
    pub statement: Statement,
    /// Failed apply attempts.
    #[serde(default)]
    pub attempts: u32,
    /// Error from the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl UpdateRecord {
    /// Creates a PENDING record.
    pub fn new(timestamp: Timestamp, emitting_node: NodeId, index: u64, statement: Statement) -> Self {
        Self {
            timestamp,
            emitting_node,
            index,
            state: UpdateState::Pending,
            statement,
            attempts: 0,
            last_error: None,
        }
    }

    /// Sort key of the log: `(timestamp, node, index)`.
    pub fn order_key(&self) -> (Timestamp, NodeId, u64) {
        (self.timestamp, self.emitting_node, self.index)
    }

    /// Copy of the record as a receiving node should store it.
    ///
    /// Replay state is local: whatever the sender did, the receiver still
    /// has to apply the record itself.
    pub fn as_received(&self) -> Self {
        Self {
            state: UpdateState::Pending,
            attempts: 0,
            last_error: None,
            ..self.clone()
        }
    }

    /// Encodes the record as CBOR.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if serialization fails.
    pub fn to_cbor(&self) -> ReplicationResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes a record from CBOR.
    ///
    /// # Errors
    ///
    /// Returns `Codec` for malformed input.
    pub fn from_cbor(bytes: &[u8]) -> ReplicationResult<Self> {
        from_cbor(bytes)
    }
}

/// Encodes a batch of records for transfer.
///
/// # Errors
///
/// Returns `Codec` if serialization fails.
pub fn encode_batch(records: &[UpdateRecord]) -> ReplicationResult<Vec<u8>> {
    to_cbor(&records)
}

/// Decodes a batch produced by [`encode_batch`].
///
/// # Errors
///
/// Returns `Codec` for malformed input.
pub fn decode_batch(bytes: &[u8]) -> ReplicationResult<Vec<UpdateRecord>> {
    from_cbor(bytes)
}

fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ReplicationResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(ReplicationError::codec)?;
    Ok(buf)
}

fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> ReplicationResult<T> {
    ciborium::from_reader(bytes).map_err(ReplicationError::codec)
}
