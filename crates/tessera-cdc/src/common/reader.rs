//! Split reader
//!
//! Pairs a chunk snapshot reader with a change log reader. A chunk split is
//! turned into finalized Insert events; the streaming split is turned into a
//! [`StreamingReader`].

use crate::common::{
    ChangeLogReader, ChunkMergeEngine, ChunkSnapshotReader, ChunkSplit,
    IncrementalSnapshotConfig, LogClient, MergedChunk, Result, SnapshotSource, SnapshotStats,
    StreamingReader, StreamingSplit, TableId,
};
use std::sync::Arc;
use tracing::info;

/// Executes splits handed out by the assigner.
#[derive(Clone)]
pub struct SplitReader {
    snapshot: ChunkSnapshotReader,
    log: ChangeLogReader,
    merge: ChunkMergeEngine,
    stats: Arc<SnapshotStats>,
}

impl SplitReader {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        client: Arc<dyn LogClient>,
        tables: impl IntoIterator<Item = TableId>,
        config: &IncrementalSnapshotConfig,
        stats: Arc<SnapshotStats>,
    ) -> Self {
        Self {
            snapshot: ChunkSnapshotReader::new(source),
            log: ChangeLogReader::new(client, config).with_tables(tables),
            merge: ChunkMergeEngine::new(config.window_timeout),
            stats,
        }
    }

    /// Snapshot one chunk and merge it with its watermark window.
    pub async fn read_chunk(&self, split: &ChunkSplit) -> Result<MergedChunk> {
        let snapshot = self.snapshot.read_chunk(split).await?;
        let window = if snapshot.split.has_window() {
            let mut stream = self.log.open(snapshot.split.low_watermark).await?;
            self.merge.collect_window(&mut stream, &snapshot.split).await?
        } else {
            Vec::new()
        };

        let merged = ChunkMergeEngine::merge(snapshot, &window)?;
        self.stats
            .record_chunk_finished(merged.snapshot_rows as u64, merged.replayed_events as u64);
        Ok(merged)
    }

    /// Open the streaming phase.
    pub async fn stream(&self, split: &StreamingSplit) -> Result<StreamingReader> {
        let stream = self.log.open(split.starting_position).await?;
        info!(
            starting_position = %split.starting_position,
            finished_chunks = split.finished_chunk_ranges.len(),
            "Streaming phase started"
        );
        Ok(StreamingReader::new(stream, split, self.stats.clone()))
    }

    pub fn stats(&self) -> &Arc<SnapshotStats> {
        &self.stats
    }
}
