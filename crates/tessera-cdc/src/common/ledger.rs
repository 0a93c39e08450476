//! Finished-chunk ledger
//!
//! Append-only record of chunks that were merged and emitted, together with
//! the high watermark each one was finalized at. Recording is idempotent per
//! split identifier: the first report wins and later reports are absorbed.

use crate::common::{ChunkSplit, FinishedChunk, LogPosition};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Ledger of finished chunks, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<FinishedChunk>", into = "Vec<FinishedChunk>")]
pub struct FinishedChunkLedger {
    entries: Vec<FinishedChunk>,
    ids: HashSet<String>,
}

impl FinishedChunkLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished chunk. Returns `false` if it was already recorded.
    pub fn record(&mut self, split: ChunkSplit, high_watermark: LogPosition) -> bool {
        if self.ids.contains(&split.split_id) {
            debug!(split_id = %split.split_id, "Chunk already recorded as finished");
            return false;
        }
        self.ids.insert(split.split_id.clone());
        self.entries.push(FinishedChunk {
            split,
            high_watermark,
        });
        true
    }

    pub fn contains(&self, split_id: &str) -> bool {
        self.ids.contains(split_id)
    }

    pub fn get(&self, split_id: &str) -> Option<&FinishedChunk> {
        self.entries.iter().find(|e| e.split.split_id == split_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FinishedChunk] {
        &self.entries
    }

    /// Lowest high watermark recorded, the earliest position streaming may start after.
    pub fn min_high_watermark(&self) -> Option<LogPosition> {
        self.entries.iter().map(|e| e.high_watermark).min()
    }
}

impl From<Vec<FinishedChunk>> for FinishedChunkLedger {
    fn from(entries: Vec<FinishedChunk>) -> Self {
        let mut ledger = Self::new();
        for entry in entries {
            ledger.record(entry.split, entry.high_watermark);
        }
        ledger
    }
}

impl From<FinishedChunkLedger> for Vec<FinishedChunk> {
    fn from(ledger: FinishedChunkLedger) -> Self {
        ledger.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ChunkKeyType, KeyValue, TableId};

    fn split(index: usize) -> ChunkSplit {
        ChunkSplit::new(
            TableId::new("shop", "orders"),
            index,
            "id",
            ChunkKeyType::Long,
            Some(KeyValue::Long(index as i64 * 10)),
            Some(KeyValue::Long(index as i64 * 10 + 10)),
        )
    }

    #[test]
    fn test_record_is_idempotent() {
        let mut ledger = FinishedChunkLedger::new();
        assert!(ledger.record(split(0), LogPosition::new(5)));
        assert!(!ledger.record(split(0), LogPosition::new(9)));
        assert_eq!(ledger.len(), 1);
        // First report wins
        assert_eq!(
            ledger.get("shop.orders:0").unwrap().high_watermark,
            LogPosition::new(5)
        );
    }

    #[test]
    fn test_min_high_watermark() {
        let mut ledger = FinishedChunkLedger::new();
        assert_eq!(ledger.min_high_watermark(), None);
        ledger.record(split(0), LogPosition::new(8));
        ledger.record(split(1), LogPosition::new(3));
        ledger.record(split(2), LogPosition::new(12));
        assert_eq!(ledger.min_high_watermark(), Some(LogPosition::new(3)));
    }

    #[test]
    fn test_serde_dedups_on_load() {
        let entries = vec![
            FinishedChunk {
                split: split(0),
                high_watermark: LogPosition::new(1),
            },
            FinishedChunk {
                split: split(0),
                high_watermark: LogPosition::new(2),
            },
        ];
        let json = serde_json::to_string(&entries).unwrap();
        let ledger: FinishedChunkLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains("shop.orders:0"));

        let back = serde_json::to_value(&ledger).unwrap();
        assert!(back.is_array());
    }
}
