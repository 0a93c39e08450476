//! Chunk snapshot reader
//!
//! Reads one chunk between two log positions:
//!
//! ```text
//! low = current_position()   ──▶  SELECT * WHERE key in [lower, upper) ORDER BY key
//!                            ──▶  high = current_position()
//! ```
//!
//! The bulk read is not atomic with watermark capture. Every change the read
//! may or may not have observed lies in `(low, high]` and is reconciled by
//! the chunk merge.

use crate::common::{
    CdcError, ChunkSnapshot, ChunkSnapshotSplit, ChunkSplit, Result, SnapshotSource,
};
use std::sync::Arc;
use tracing::debug;

/// Bulk reader for chunk splits.
#[derive(Clone)]
pub struct ChunkSnapshotReader {
    source: Arc<dyn SnapshotSource>,
}

impl ChunkSnapshotReader {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self { source }
    }

    /// Capture the low watermark, read the chunk, then capture the high watermark.
    pub async fn read_chunk(&self, split: &ChunkSplit) -> Result<ChunkSnapshot> {
        let low_watermark = self
            .source
            .current_position()
            .await
            .map_err(|e| as_chunk_error(split, e))?;

        let rows = self
            .source
            .read_chunk(split)
            .await
            .map_err(|e| as_chunk_error(split, e))?;

        let mut keyed = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.key(&split.key_column, split.key_type)?;
            keyed.push((key, row));
        }
        keyed.sort_by(|(a, _), (b, _)| a.cmp(b));

        let high_watermark = self
            .source
            .current_position()
            .await
            .map_err(|e| as_chunk_error(split, e))?;

        debug!(
            split_id = %split.split_id,
            low = %low_watermark,
            high = %high_watermark,
            rows = keyed.len(),
            "Read chunk snapshot"
        );

        Ok(ChunkSnapshot {
            split: ChunkSnapshotSplit {
                split: split.clone(),
                low_watermark,
                high_watermark,
            },
            rows: keyed,
        })
    }
}

// Transient source failures surface as chunk read errors so the chunk is
// restarted with fresh watermarks.
fn as_chunk_error(split: &ChunkSplit, error: CdcError) -> CdcError {
    if error.is_retriable() && !matches!(error, CdcError::ChunkReadError { .. }) {
        CdcError::chunk_read(&split.split_id, error.to_string())
    } else {
        error
    }
}
