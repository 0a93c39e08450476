//! Traits for snapshot and change log sources
//!
//! Database-agnostic seams. A connector implements [`SnapshotSource`] for
//! catalog queries and bulk reads, and [`LogClient`] for tailing the change
//! log. Both may be backed by the same connection pool.

use crate::common::{
    ChangeEvent, ChunkKeyType, ChunkSplit, KeyColumn, KeyValue, LogPosition, Result, Row,
    TableId,
};
use async_trait::async_trait;

/// Catalog and bulk-read access to a source database.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Primary-key column used to split the table.
    async fn key_column(&self, table: &TableId) -> Result<KeyColumn>;

    /// Minimum and maximum key, or `None` for an empty table.
    async fn key_bounds(
        &self,
        table: &TableId,
        column: &str,
        key_type: ChunkKeyType,
    ) -> Result<Option<(KeyValue, KeyValue)>>;

    /// Approximate number of rows (statistics, not an exact count).
    async fn approximate_row_count(&self, table: &TableId) -> Result<u64>;

    /// Key located `chunk_size` rows after `start` in key order.
    ///
    /// This is the inclusive lower bound of the next chunk. `None` as start
    /// means the beginning of the table. Returns `None` when fewer than
    /// `chunk_size` rows remain.
    async fn next_chunk_end(
        &self,
        table: &TableId,
        column: &str,
        key_type: ChunkKeyType,
        start: Option<&KeyValue>,
        chunk_size: usize,
    ) -> Result<Option<KeyValue>>;

    /// Every `inverse_sampling_rate`-th key in ascending order.
    async fn sample_keys(
        &self,
        table: &TableId,
        column: &str,
        key_type: ChunkKeyType,
        inverse_sampling_rate: u64,
    ) -> Result<Vec<KeyValue>>;

    /// All rows with key in `[split.lower, split.upper)`, ordered by key.
    async fn read_chunk(&self, split: &ChunkSplit) -> Result<Vec<Row>>;

    /// Current end of the change log.
    async fn current_position(&self) -> Result<LogPosition>;
}

/// A raw record pulled from the change log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A row-level change
    Change(ChangeEvent),
    /// The log advanced without a captured change
    Heartbeat(LogPosition),
}

impl LogRecord {
    pub fn position(&self) -> LogPosition {
        match self {
            LogRecord::Change(event) => event.position,
            LogRecord::Heartbeat(position) => *position,
        }
    }
}

/// Factory for change log cursors.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Open a cursor yielding records strictly after `after`.
    ///
    /// Fails with [`CdcError::LogPositionNotAvailable`](crate::common::CdcError::LogPositionNotAvailable)
    /// when `after` has been purged.
    async fn open(&self, after: LogPosition) -> Result<Box<dyn LogCursor>>;
}

/// A live, at-least-once cursor over the change log.
#[async_trait]
pub trait LogCursor: Send {
    /// Wait for the next record. `None` means the log was closed.
    async fn next_record(&mut self) -> Result<Option<LogRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct VecCursor {
        records: VecDeque<LogRecord>,
    }

    #[async_trait]
    impl LogCursor for VecCursor {
        async fn next_record(&mut self) -> Result<Option<LogRecord>> {
            Ok(self.records.pop_front())
        }
    }

    #[tokio::test]
    async fn test_log_cursor_object() {
        let event = ChangeEvent::insert(
            TableId::new("shop", "orders"),
            KeyValue::Long(1),
            Row::new().with("id", 1),
            LogPosition::new(3),
        );
        let mut cursor: Box<dyn LogCursor> = Box::new(VecCursor {
            records: vec![
                LogRecord::Change(event),
                LogRecord::Heartbeat(LogPosition::new(4)),
            ]
            .into(),
        });

        let first = cursor.next_record().await.unwrap().unwrap();
        assert_eq!(first.position(), LogPosition::new(3));
        let second = cursor.next_record().await.unwrap().unwrap();
        assert_eq!(second, LogRecord::Heartbeat(LogPosition::new(4)));
        assert!(cursor.next_record().await.unwrap().is_none());
    }
}
