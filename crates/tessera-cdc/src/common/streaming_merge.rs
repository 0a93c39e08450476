//! # Streaming Merge Engine
//!
//! Tails the change log after every chunk has finished and suppresses events
//! that a chunk's merged output already reflects.
//!
//! ```text
//!                       chunk A high = 100
//! key in A @  95  ──▶  suppressed (already in A's output)
//! key in A @ 105  ──▶  emitted
//! key in no chunk ──▶  emitted (fail-open)
//! ```
//!
//! The comparison is strict: an event at exactly the high watermark was
//! consumed by the chunk merge, which is inclusive of `high`.

use crate::common::{
    ChangeEvent, ChangeLogStream, FinishedChunk, KeyValue, LogPosition, Result, SnapshotStats,
    StreamingSplit, TableId,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides which streaming events to emit.
#[derive(Debug, Clone)]
pub struct StreamingMerger {
    /// Finished chunks per table, ordered by chunk index
    chunks: HashMap<TableId, Vec<FinishedChunk>>,
    last_emitted: Option<LogPosition>,
}

impl StreamingMerger {
    pub fn new(split: &StreamingSplit) -> Self {
        let mut chunks: HashMap<TableId, Vec<FinishedChunk>> = HashMap::new();
        for finished in &split.finished_chunk_ranges {
            chunks
                .entry(finished.split.table_id.clone())
                .or_default()
                .push(finished.clone());
        }
        for table_chunks in chunks.values_mut() {
            table_chunks.sort_by_key(|c| c.split.index);
        }
        Self {
            chunks,
            last_emitted: None,
        }
    }

    /// High watermark of the finished chunk owning `key`, if any.
    pub fn high_watermark_for(&self, table: &TableId, key: &KeyValue) -> Option<LogPosition> {
        let table_chunks = self.chunks.get(table)?;
        // Chunks are contiguous in index order; find the last one starting at or before key
        let candidate = table_chunks.partition_point(|c| match &c.split.lower {
            None => true,
            Some(lower) => matches!(
                lower.try_compare(key),
                Ok(Ordering::Less | Ordering::Equal)
            ),
        });
        let finished = table_chunks.get(candidate.checked_sub(1)?)?;
        match finished.split.contains(key) {
            Ok(true) => Some(finished.high_watermark),
            Ok(false) => None,
            Err(e) => {
                warn!(
                    table = %table,
                    key = %key,
                    error = %e,
                    "Cannot match key against finished chunks, emitting"
                );
                None
            }
        }
    }

    /// Whether a streaming event is not yet covered by a chunk's output.
    pub fn should_emit(&self, event: &ChangeEvent) -> bool {
        match self.high_watermark_for(&event.table_id, &event.key) {
            Some(high) => event.position > high,
            None => true,
        }
    }

    /// Position of the last emitted event.
    pub fn last_emitted(&self) -> Option<LogPosition> {
        self.last_emitted
    }

    fn accept(&mut self, event: &ChangeEvent) -> bool {
        if let Some(last) = self.last_emitted {
            if event.position <= last {
                return false;
            }
        }
        if !self.should_emit(event) {
            return false;
        }
        self.last_emitted = Some(event.position);
        true
    }
}

/// Pull-based reader for the streaming split.
pub struct StreamingReader {
    stream: ChangeLogStream,
    merger: StreamingMerger,
    stats: Arc<SnapshotStats>,
}

impl StreamingReader {
    pub fn new(stream: ChangeLogStream, split: &StreamingSplit, stats: Arc<SnapshotStats>) -> Self {
        Self {
            stream,
            merger: StreamingMerger::new(split),
            stats,
        }
    }

    /// Next event to emit, in strictly increasing position order.
    ///
    /// `Ok(None)` means the change log was closed.
    pub async fn next_event(&mut self) -> Result<Option<ChangeEvent>> {
        while let Some(event) = self.stream.next_change().await? {
            if self.merger.accept(&event) {
                self.stats.record_streaming_emitted(event.position.offset());
                return Ok(Some(event));
            }
            debug!(
                table = %event.table_id,
                key = %event.key,
                position = %event.position,
                "Suppressing event already covered by a finished chunk"
            );
            self.stats.record_streaming_suppressed();
        }
        Ok(None)
    }

    /// Position the log has been consumed up to, including progress markers.
    pub fn consumed_position(&self) -> LogPosition {
        self.stream.last_position()
    }
}
