//! # Chunk Merge Engine
//!
//! Reconciles a chunk's bulk read with the change-log events observed in its
//! watermark window, producing one finalized row per key as of the high
//! watermark.
//!
//! ```text
//!          low                         high
//! log: ─────┼──── u(2) ──── i(4) ───────┼──── u(1) ────▶
//!           │◀──────── replayed ───────▶│  not consumed
//!
//! snapshot {1:a, 2:b, 3:c}
//!   + replay u(2)=b2, i(4)=d
//!   = emit   {1:a, 2:b2, 3:c, 4:d} as Insert @ high
//! ```
//!
//! The window is inclusive at both ends. Replaying a change the bulk read
//! already observed converges to the same row, so the merge is correct
//! regardless of where inside the window the read actually happened.
//! Window events whose key kind differs from the chunk's are skipped with a
//! warning, matching the streaming filter's treatment of the same records.

use crate::common::{
    CdcError, ChangeEvent, ChangeLogStream, ChangeOp, ChunkSnapshot, ChunkSnapshotSplit,
    ChunkSplit, KeyValue, LogItem, Result, Row,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Finalized output of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedChunk {
    /// Chunk and watermarks the output was produced for
    pub split: ChunkSnapshotSplit,
    /// One Insert per surviving row, ordered by key, stamped at `high`
    pub events: Vec<ChangeEvent>,
    /// Rows returned by the bulk read
    pub snapshot_rows: usize,
    /// Window events applied on top of the bulk read
    pub replayed_events: usize,
}

/// Waits for a chunk's merge window and merges it.
#[derive(Debug, Clone)]
pub struct ChunkMergeEngine {
    window_timeout: Duration,
}

impl ChunkMergeEngine {
    pub fn new(window_timeout: Duration) -> Self {
        Self { window_timeout }
    }

    /// Collect the chunk's window events from a stream opened at the low watermark.
    ///
    /// Returns once the log has been observed at or past the high watermark.
    /// Fails with [`CdcError::IncompleteMergeWindow`] if the log closes first
    /// or the window timeout elapses.
    pub async fn collect_window(
        &self,
        stream: &mut ChangeLogStream,
        split: &ChunkSnapshotSplit,
    ) -> Result<Vec<ChangeEvent>> {
        let low = split.low_watermark;
        let high = split.high_watermark;
        let chunk = &split.split;
        let mut window = Vec::new();
        if high <= low {
            return Ok(window);
        }

        let deadline = tokio::time::Instant::now() + self.window_timeout;
        loop {
            let item = match tokio::time::timeout_at(deadline, stream.next()).await {
                Ok(item) => item?,
                Err(_) => {
                    return Err(CdcError::incomplete_merge_window(
                        &chunk.split_id,
                        format!(
                            "log did not reach {high} within {:?}, last seen {}",
                            self.window_timeout,
                            stream.last_position()
                        ),
                    ))
                }
            };
            let Some(item) = item else {
                return Err(CdcError::incomplete_merge_window(
                    &chunk.split_id,
                    format!(
                        "log closed at {} before reaching {high}",
                        stream.last_position()
                    ),
                ));
            };

            let position = item.position();
            if position > high {
                break;
            }
            if let LogItem::Change(event) = item {
                if position >= low
                    && event.table_id == chunk.table_id
                    && in_chunk(chunk, &event)
                {
                    window.push(event);
                }
            }
            if position == high {
                break;
            }
        }

        debug!(
            split_id = %chunk.split_id,
            low = %low,
            high = %high,
            events = window.len(),
            "Collected merge window"
        );
        Ok(window)
    }

    /// Merge a chunk snapshot with its window events.
    pub fn merge(snapshot: ChunkSnapshot, events: &[ChangeEvent]) -> Result<MergedChunk> {
        let split = snapshot.split;
        let chunk = &split.split;
        let low = split.low_watermark;
        let high = split.high_watermark;
        let snapshot_rows = snapshot.rows.len();

        let mut rows: BTreeMap<KeyValue, Row> = snapshot.rows.into_iter().collect();

        let mut window = Vec::with_capacity(events.len());
        for event in events {
            if event.table_id != chunk.table_id || event.position < low || event.position > high {
                continue;
            }
            if in_chunk(chunk, event) {
                window.push(event);
            }
        }
        window.sort_by_key(|event| event.position);

        for event in &window {
            match event.op {
                ChangeOp::Insert | ChangeOp::Update => match &event.after {
                    Some(after) => {
                        rows.insert(event.key.clone(), after.clone());
                    }
                    None => warn!(
                        split_id = %chunk.split_id,
                        key = %event.key,
                        position = %event.position,
                        "Skipping {} without row image", event.op
                    ),
                },
                ChangeOp::Delete => {
                    rows.remove(&event.key);
                }
            }
        }

        let events: Vec<ChangeEvent> = rows
            .into_iter()
            .map(|(key, row)| ChangeEvent::insert(chunk.table_id.clone(), key, row, high))
            .collect();

        debug!(
            split_id = %chunk.split_id,
            snapshot_rows,
            replayed = window.len(),
            emitted = events.len(),
            "Merged chunk"
        );

        Ok(MergedChunk {
            replayed_events: window.len(),
            split,
            events,
            snapshot_rows,
        })
    }
}

/// Whether `event` belongs to `chunk`. Keys of another kind never do.
fn in_chunk(chunk: &ChunkSplit, event: &ChangeEvent) -> bool {
    match chunk.contains(&event.key) {
        Ok(contained) => contained,
        Err(e) => {
            warn!(
                split_id = %chunk.split_id,
                key = %event.key,
                position = %event.position,
                error = %e,
                "Skipping window event with a mismatched key kind"
            );
            false
        }
    }
}
