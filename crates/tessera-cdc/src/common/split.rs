//! # Source Splits
//!
//! Units of work handed out by the [`SplitAssigner`](crate::common::SplitAssigner).
//!
//! ```text
//!          ChunkSplit ──(reader captures watermarks)──▶ ChunkSnapshotSplit
//!              │                                             │
//!              │                                        merge + emit
//!              ▼                                             ▼
//!   ledger: FinishedChunk(split, high) ──(all done)──▶ StreamingSplit
//! ```
//!
//! Chunk bounds are half-open: `[lower, upper)`. A `None` lower bound marks
//! the first chunk of a table, a `None` upper bound the last one.

use crate::common::{ChunkKeyType, KeyValue, LogPosition, Result, Row, TableId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A contiguous primary-key range of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSplit {
    /// Table the chunk belongs to
    pub table_id: TableId,
    /// Stable identifier (`namespace.table:index`)
    pub split_id: String,
    /// Position of the chunk within its table
    pub index: usize,
    /// Name of the primary-key column
    pub key_column: String,
    /// Kind of the primary key
    pub key_type: ChunkKeyType,
    /// Inclusive lower bound, `None` for the first chunk
    pub lower: Option<KeyValue>,
    /// Exclusive upper bound, `None` for the last chunk
    pub upper: Option<KeyValue>,
}

impl ChunkSplit {
    /// Create a chunk split with a derived split identifier.
    pub fn new(
        table_id: TableId,
        index: usize,
        key_column: impl Into<String>,
        key_type: ChunkKeyType,
        lower: Option<KeyValue>,
        upper: Option<KeyValue>,
    ) -> Self {
        let split_id = format!("{table_id}:{index}");
        Self {
            table_id,
            split_id,
            index,
            key_column: key_column.into(),
            key_type,
            lower,
            upper,
        }
    }

    /// Check whether a key falls within `[lower, upper)`.
    ///
    /// Fails when the key kind does not match the bounds.
    pub fn contains(&self, key: &KeyValue) -> Result<bool> {
        if let Some(lower) = &self.lower {
            if key.try_compare(lower)? == Ordering::Less {
                return Ok(false);
            }
        }
        if let Some(upper) = &self.upper {
            if key.try_compare(upper)? != Ordering::Less {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether this chunk covers the whole key space.
    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }
}

impl fmt::Display for ChunkSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lower = self
            .lower
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let upper = self
            .upper
            .as_ref()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "+inf".to_string());
        write!(f, "{} [{lower}, {upper})", self.split_id)
    }
}

/// A chunk whose snapshot window has been captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSnapshotSplit {
    pub split: ChunkSplit,
    /// Log position captured before the bulk read
    pub low_watermark: LogPosition,
    /// Log position captured after the bulk read
    pub high_watermark: LogPosition,
}

impl ChunkSnapshotSplit {
    /// Whether the log advanced while the chunk was being read.
    pub fn has_window(&self) -> bool {
        self.high_watermark > self.low_watermark
    }
}

/// Rows read for a chunk, ordered by key, together with their watermarks.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSnapshot {
    pub split: ChunkSnapshotSplit,
    pub rows: Vec<(KeyValue, Row)>,
}

/// Ledger entry: a chunk and the high watermark it was finalized at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedChunk {
    pub split: ChunkSplit,
    pub high_watermark: LogPosition,
}

/// The single split that tails the change log after all chunks finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSplit {
    /// Position the change log is opened after
    pub starting_position: LogPosition,
    /// Finished chunks used to suppress already-merged events
    pub finished_chunk_ranges: Vec<FinishedChunk>,
}

impl StreamingSplit {
    pub const SPLIT_ID: &'static str = "streaming";
}

/// A unit of work handed to a reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSplit {
    Chunk(ChunkSplit),
    Streaming(StreamingSplit),
}

impl SourceSplit {
    pub fn split_id(&self) -> &str {
        match self {
            SourceSplit::Chunk(split) => &split.split_id,
            SourceSplit::Streaming(_) => StreamingSplit::SPLIT_ID,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(lower: Option<i64>, upper: Option<i64>) -> ChunkSplit {
        ChunkSplit::new(
            TableId::new("shop", "orders"),
            0,
            "id",
            ChunkKeyType::Long,
            lower.map(KeyValue::Long),
            upper.map(KeyValue::Long),
        )
    }

    #[test]
    fn test_split_id() {
        let split = chunk(None, None);
        assert_eq!(split.split_id, "shop.orders:0");
        assert!(split.is_unbounded());
    }

    #[test]
    fn test_contains_half_open() {
        let split = chunk(Some(1), Some(5));
        assert!(!split.contains(&KeyValue::Long(0)).unwrap());
        assert!(split.contains(&KeyValue::Long(1)).unwrap());
        assert!(split.contains(&KeyValue::Long(4)).unwrap());
        assert!(!split.contains(&KeyValue::Long(5)).unwrap());
    }

    #[test]
    fn test_contains_open_ends() {
        assert!(chunk(None, Some(5)).contains(&KeyValue::Long(i64::MIN)).unwrap());
        assert!(chunk(Some(5), None).contains(&KeyValue::Long(i64::MAX)).unwrap());
        assert!(chunk(None, None).contains(&KeyValue::Long(42)).unwrap());
    }

    #[test]
    fn test_contains_rejects_mismatched_kind() {
        assert!(chunk(Some(1), Some(5)).contains(&KeyValue::from("a")).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(chunk(Some(1), None).to_string(), "shop.orders:0 [1, +inf)");
    }

    #[test]
    fn test_source_split_serde() {
        let split = SourceSplit::Streaming(StreamingSplit {
            starting_position: LogPosition::new(7),
            finished_chunk_ranges: vec![FinishedChunk {
                split: chunk(None, None),
                high_watermark: LogPosition::new(7),
            }],
        });
        let json = serde_json::to_string(&split).unwrap();
        let back: SourceSplit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, split);
        assert_eq!(back.split_id(), "streaming");
    }
}
