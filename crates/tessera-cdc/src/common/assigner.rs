//! # Split Assigner
//!
//! Coordinator-side owner of the split pool, the finished-chunk ledger and
//! the streaming split.
//!
//! ```text
//! Splitting ──▶ AssigningChunks ──▶ AllChunksFinished ──▶ StreamingActive ──▶ Closed
//!    │                ▲   │                                   ▲
//!    │                └───┘ next_split / report_finished      │
//!    └── StartupMode::LatestOffset ───────────────────────────┘
//! ```
//!
//! All transitions are serialized behind one async lock. Readers that find
//! no work wait on a notification instead of polling.
//!
//! ## Restart
//!
//! [`SplitAssigner::checkpoint`] captures `(phase, split pool, ledger,
//! streaming split)`. In-flight splits are written back into the pool, so a
//! restored assigner reassigns them from scratch. Finished chunks are never
//! reassigned.

use crate::common::{
    CdcError, ChunkSplit, ChunkSplitter, FinishedChunkLedger, IncrementalSnapshotConfig,
    LogPosition, Result, SnapshotSource, SnapshotStats, SourceSplit, StartupMode, StreamingSplit,
    TableId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Lifecycle phase of a [`SplitAssigner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignerPhase {
    /// Chunk splits not generated yet
    #[default]
    Splitting,
    /// Handing out chunk splits
    AssigningChunks,
    /// Every chunk finished; the streaming split is being created
    AllChunksFinished,
    /// The streaming split exists
    StreamingActive,
    /// Terminal
    Closed,
}

impl fmt::Display for AssignerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssignerPhase::Splitting => "splitting",
            AssignerPhase::AssigningChunks => "assigning_chunks",
            AssignerPhase::AllChunksFinished => "all_chunks_finished",
            AssignerPhase::StreamingActive => "streaming_active",
            AssignerPhase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Serializable assigner checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignerState {
    pub phase: AssignerPhase,
    /// Unfinished chunk splits, including the ones in flight at checkpoint time
    pub pending_splits: Vec<ChunkSplit>,
    pub ledger: FinishedChunkLedger,
    pub streaming_split: Option<StreamingSplit>,
    /// Checkpoint creation time (Unix epoch millis)
    pub created_at: i64,
}

struct AssignerInner {
    phase: AssignerPhase,
    pending: VecDeque<ChunkSplit>,
    /// split id -> (split, reader)
    in_flight: BTreeMap<String, (ChunkSplit, String)>,
    ledger: FinishedChunkLedger,
    streaming: Option<StreamingSplit>,
    streaming_owner: Option<String>,
}

impl AssignerInner {
    fn fresh() -> Self {
        Self {
            phase: AssignerPhase::Splitting,
            pending: VecDeque::new(),
            in_flight: BTreeMap::new(),
            ledger: FinishedChunkLedger::new(),
            streaming: None,
            streaming_owner: None,
        }
    }
}

/// Hands out chunk splits and, once every chunk finished, the streaming split.
pub struct SplitAssigner {
    tables: Vec<TableId>,
    startup_mode: StartupMode,
    source: Arc<dyn SnapshotSource>,
    splitter: ChunkSplitter,
    inner: Mutex<AssignerInner>,
    changed: Notify,
    stats: Arc<SnapshotStats>,
}

impl SplitAssigner {
    /// Create an assigner for a fresh job.
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        tables: Vec<TableId>,
        config: &IncrementalSnapshotConfig,
        stats: Arc<SnapshotStats>,
    ) -> Self {
        Self {
            tables,
            startup_mode: config.startup_mode,
            splitter: ChunkSplitter::new(source.clone(), config),
            source,
            inner: Mutex::new(AssignerInner::fresh()),
            changed: Notify::new(),
            stats,
        }
    }

    /// Rebuild an assigner from a checkpoint.
    pub fn restore(
        source: Arc<dyn SnapshotSource>,
        tables: Vec<TableId>,
        config: &IncrementalSnapshotConfig,
        state: AssignerState,
        stats: Arc<SnapshotStats>,
    ) -> Self {
        let pending: VecDeque<ChunkSplit> = state
            .pending_splits
            .into_iter()
            .filter(|split| !state.ledger.contains(&split.split_id))
            .collect();
        let mut phase = state.phase;
        if phase == AssignerPhase::AllChunksFinished && state.streaming_split.is_some() {
            phase = AssignerPhase::StreamingActive;
        }
        info!(
            phase = %phase,
            pending = pending.len(),
            finished = state.ledger.len(),
            streaming = state.streaming_split.is_some(),
            "Restored split assigner"
        );
        let inner = AssignerInner {
            phase,
            pending,
            in_flight: BTreeMap::new(),
            ledger: state.ledger,
            streaming: state.streaming_split,
            streaming_owner: None,
        };
        Self {
            inner: Mutex::new(inner),
            ..Self::new(source, tables, config, stats)
        }
    }

    /// Generate chunk splits (first start only) and enter the assignment phase.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            AssignerPhase::Splitting => {}
            AssignerPhase::AllChunksFinished => {
                self.create_streaming_split(&mut inner).await?;
                drop(inner);
                self.changed.notify_waiters();
                return Ok(());
            }
            AssignerPhase::Closed => {
                return Err(CdcError::invalid_state("assigner is closed"));
            }
            phase => {
                debug!(phase = %phase, "Assigner already started");
                return Ok(());
            }
        }

        if self.startup_mode == StartupMode::LatestOffset {
            info!("Skipping snapshot, streaming from the latest offset");
            self.create_streaming_split(&mut inner).await?;
            drop(inner);
            self.changed.notify_waiters();
            return Ok(());
        }

        for table in &self.tables {
            let splits = self.splitter.split_table(table).await?;
            self.stats.record_chunks_split(splits.len() as u64);
            inner.pending.extend(splits);
        }
        self.transition(&mut inner, AssignerPhase::AssigningChunks);
        self.finish_if_done(&mut inner).await?;
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Hand the next split to `reader`, if one is available right now.
    pub async fn next_split(&self, reader: &str) -> Result<Option<SourceSplit>> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            AssignerPhase::Splitting => Err(CdcError::invalid_state("assigner not started")),
            AssignerPhase::AssigningChunks => {
                let Some(split) = inner.pending.pop_front() else {
                    return Ok(None);
                };
                debug!(split_id = %split.split_id, reader, "Assigned chunk split");
                inner
                    .in_flight
                    .insert(split.split_id.clone(), (split.clone(), reader.to_string()));
                Ok(Some(SourceSplit::Chunk(split)))
            }
            AssignerPhase::StreamingActive => {
                if inner.streaming_owner.is_some() {
                    return Ok(None);
                }
                let Some(split) = inner.streaming.clone() else {
                    return Err(CdcError::invalid_state("streaming phase without a streaming split"));
                };
                inner.streaming_owner = Some(reader.to_string());
                info!(reader, starting_position = %split.starting_position, "Assigned streaming split");
                Ok(Some(SourceSplit::Streaming(split)))
            }
            AssignerPhase::AllChunksFinished | AssignerPhase::Closed => Ok(None),
        }
    }

    /// Wait until a split is available for `reader`.
    ///
    /// Returns `None` once the assigner has no further work for this reader:
    /// it was closed, or the streaming split belongs to another reader.
    pub async fn await_split(&self, reader: &str) -> Result<Option<SourceSplit>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(split) = self.next_split(reader).await? {
                return Ok(Some(split));
            }
            {
                let inner = self.inner.lock().await;
                match inner.phase {
                    AssignerPhase::Closed => return Ok(None),
                    AssignerPhase::StreamingActive if inner.streaming_owner.is_some() => {
                        return Ok(None)
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Record a finished chunk. Duplicate reports are absorbed and return `false`.
    pub async fn report_finished(&self, split_id: &str, high_watermark: LogPosition) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.ledger.contains(split_id) {
            debug!(split_id, "Ignoring duplicate completion report");
            return Ok(false);
        }

        let split = match inner.in_flight.remove(split_id) {
            Some((split, _)) => split,
            None => {
                let position = inner.pending.iter().position(|s| s.split_id == split_id);
                match position.and_then(|index| inner.pending.remove(index)) {
                    Some(split) => split,
                    None => {
                        return Err(CdcError::invalid_state(format!(
                            "completion reported for unknown split {split_id}"
                        )))
                    }
                }
            }
        };

        inner.ledger.record(split, high_watermark);
        info!(
            split_id,
            high_watermark = %high_watermark,
            finished = inner.ledger.len(),
            remaining = inner.pending.len() + inner.in_flight.len(),
            "Chunk finished"
        );
        self.finish_if_done(&mut inner).await?;
        drop(inner);
        self.changed.notify_waiters();
        Ok(true)
    }

    /// Return a failed chunk to the front of the pool.
    pub async fn report_failed(&self, split_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(split_id) {
            Some((split, reader)) => {
                warn!(split_id, reader, "Chunk failed, returning it to the pool");
                inner.pending.push_front(split);
            }
            None => debug!(split_id, "Failure reported for a split not in flight"),
        }
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Advance the streaming split's resume position.
    pub async fn report_streaming_position(&self, position: LogPosition) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let phase = inner.phase;
        match inner.streaming.as_mut() {
            Some(streaming) if phase == AssignerPhase::StreamingActive => {
                if position > streaming.starting_position {
                    streaming.starting_position = position;
                }
                Ok(())
            }
            _ => Err(CdcError::invalid_state(format!(
                "streaming position reported in phase {phase}"
            ))),
        }
    }

    /// Capture a restorable checkpoint.
    pub async fn checkpoint(&self) -> AssignerState {
        let inner = self.inner.lock().await;
        let mut in_flight: Vec<ChunkSplit> =
            inner.in_flight.values().map(|(split, _)| split.clone()).collect();
        in_flight.sort_by(|a, b| (&a.table_id, a.index).cmp(&(&b.table_id, b.index)));

        let pending_splits = in_flight
            .into_iter()
            .chain(inner.pending.iter().cloned())
            .collect();
        AssignerState {
            phase: inner.phase,
            pending_splits,
            ledger: inner.ledger.clone(),
            streaming_split: inner.streaming.clone(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Stop handing out work.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.transition(&mut inner, AssignerPhase::Closed);
        drop(inner);
        self.changed.notify_waiters();
    }

    pub async fn phase(&self) -> AssignerPhase {
        self.inner.lock().await.phase
    }

    pub async fn ledger(&self) -> FinishedChunkLedger {
        self.inner.lock().await.ledger.clone()
    }

    pub async fn streaming_split(&self) -> Option<StreamingSplit> {
        self.inner.lock().await.streaming.clone()
    }

    /// Number of unfinished chunk splits (pending and in flight).
    pub async fn remaining_chunks(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.pending.len() + inner.in_flight.len()
    }

    fn transition(&self, inner: &mut AssignerInner, phase: AssignerPhase) {
        if inner.phase != phase {
            info!(from = %inner.phase, to = %phase, "Assigner phase changed");
            inner.phase = phase;
        }
    }

    async fn finish_if_done(&self, inner: &mut AssignerInner) -> Result<()> {
        if inner.phase == AssignerPhase::AssigningChunks
            && inner.pending.is_empty()
            && inner.in_flight.is_empty()
        {
            self.transition(inner, AssignerPhase::AllChunksFinished);
            self.create_streaming_split(inner).await?;
        }
        Ok(())
    }

    async fn create_streaming_split(&self, inner: &mut AssignerInner) -> Result<()> {
        // Events above the lowest high watermark may still be missing from some chunk
        let starting_position = match inner.ledger.min_high_watermark() {
            Some(position) => position,
            None => self.source.current_position().await?,
        };
        inner.streaming = Some(StreamingSplit {
            starting_position,
            finished_chunk_ranges: inner.ledger.entries().to_vec(),
        });
        inner.streaming_owner = None;
        self.transition(inner, AssignerPhase::StreamingActive);
        Ok(())
    }
}
