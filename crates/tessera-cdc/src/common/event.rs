//! Change event representation
//!
//! Unified row-level change events shared by the snapshot and streaming
//! phases. Snapshot output is expressed as synthetic `Insert` events stamped
//! with the chunk's high watermark, so consumers see a single event type.
//!
//! ```ignore
//! // Streaming events for one table are strictly ordered by position
//! assert!(event1.position < event2.position);
//! ```

use crate::common::{CdcError, KeyValue, LogPosition, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a captured table (`namespace.table`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Database or schema name
    pub namespace: String,
    /// Table name
    pub table: String,
}

impl TableId {
    pub fn new(namespace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.table)
    }
}

impl FromStr for TableId {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((namespace, table)) if !namespace.is_empty() && !table.is_empty() => {
                Ok(Self::new(namespace, table))
            }
            _ => Err(CdcError::config(format!(
                "table identifier must be namespace.table, got {s:?}"
            ))),
        }
    }
}

/// A row image: column name to value, in column order.
///
/// Values are opaque JSON cells produced by the source's type mapping.
/// Equality is column-wise value equality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(serde_json::Map<String, serde_json::Value>);

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Set a column value.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(column.into(), value.into());
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.0.get(column)
    }

    /// Iterate over columns in order.
    pub fn columns(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a row from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => Ok(Self(map)),
            other => Err(CdcError::schema(format!("row must be an object, got {other}"))),
        }
    }

    /// Extract the primary key of this row.
    pub fn key(&self, column: &str, key_type: crate::common::ChunkKeyType) -> Result<KeyValue> {
        let cell = self
            .get(column)
            .ok_or_else(|| CdcError::schema(format!("row is missing key column {column}")))?;
        KeyValue::from_json(cell, key_type)
    }
}

/// Row-level operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row inserted (also used for finalized snapshot rows)
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// A row-level change captured from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the row belongs to
    pub table_id: TableId,
    /// Primary key of the row
    pub key: KeyValue,
    /// Operation type
    pub op: ChangeOp,
    /// Previous row state (for UPDATE/DELETE)
    pub before: Option<Row>,
    /// Current row state (for INSERT/UPDATE)
    pub after: Option<Row>,
    /// Log position of the change
    pub position: LogPosition,
    /// Event timestamp (Unix epoch millis)
    pub timestamp: i64,
}

impl ChangeEvent {
    /// Create a new INSERT event
    pub fn insert(table_id: TableId, key: KeyValue, after: Row, position: LogPosition) -> Self {
        Self {
            table_id,
            key,
            op: ChangeOp::Insert,
            before: None,
            after: Some(after),
            position,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a new UPDATE event
    pub fn update(
        table_id: TableId,
        key: KeyValue,
        before: Option<Row>,
        after: Row,
        position: LogPosition,
    ) -> Self {
        Self {
            table_id,
            key,
            op: ChangeOp::Update,
            before,
            after: Some(after),
            position,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a new DELETE event
    pub fn delete(table_id: TableId, key: KeyValue, before: Row, position: LogPosition) -> Self {
        Self {
            table_id,
            key,
            op: ChangeOp::Delete,
            before: Some(before),
            after: None,
            position,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Override the event timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The most recent row image carried by this event.
    pub fn row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }
}
