//! # Incremental Snapshot Pipeline
//!
//! Drives a [`SplitAssigner`] with a bounded pool of workers until every
//! chunk is finished, then tails the change log until shutdown or log end.
//!
//! ```text
//!            ┌──────────────┐  next_split   ┌──────────┐  read_chunk   ┌────────┐
//! checkpoint │ SplitAssigner│──────────────▶│ worker N │──────────────▶│  sink  │
//!  ◀─────────│  (one lock)  │◀──────────────│          │  stream       │        │
//!            └──────────────┘ report_*      └──────────┘──────────────▶└────────┘
//! ```
//!
//! - Up to `max_concurrent_chunks` chunks are read and merged in parallel.
//! - Retriable chunk failures restart the chunk from a fresh low watermark,
//!   following `chunk_retry`. Exhausted retries fail the job with the split id.
//! - The assigner state is checkpointed after every finished chunk, when
//!   streaming starts, and when the pipeline stops.
//! - The worker that receives the streaming split runs the streaming phase;
//!   the others exit.
//!
//! Delivery is at-least-once: a chunk emitted right before a crash is emitted
//! again after restart because its completion was not checkpointed yet.
//!
//! ## Usage
//!
//! ```ignore
//! let pipeline = IncrementalSnapshotPipeline::builder()
//!     .source(source.clone())
//!     .log_client(source)
//!     .table(TableId::new("shop", "orders"))
//!     .sink(Arc::new(sink))
//!     .checkpoint(Arc::new(FileCheckpointStore::new("/var/lib/tessera").await?), "orders")
//!     .build()
//!     .await?;
//!
//! let handle = pipeline.handle();
//! tokio::spawn(async move { pipeline.run().await });
//! // ...
//! handle.shutdown();
//! ```

use crate::common::{
    CdcError, ChunkSplit, EventSink, IncrementalSnapshotConfig, LogClient, Result, RetryConfig,
    SharedCheckpointBackend, SnapshotSource, SnapshotStats, SnapshotStatsSnapshot, SourceSplit,
    SplitAssigner, SplitReader, StreamingSplit, TableId,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cloneable handle for stopping a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl PipelineHandle {
    /// Ask the pipeline to stop. Chunks in progress are finished first.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn stopped(rx: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop request
    let _ = rx.wait_for(|stop| *stop).await.map(|_| ());
}

/// Serializes checkpoint writes so a later state is never overwritten by an
/// earlier one.
#[derive(Clone)]
struct Checkpointer {
    backend: Option<SharedCheckpointBackend>,
    key: String,
    assigner: Arc<SplitAssigner>,
    lock: Arc<Mutex<()>>,
}

impl Checkpointer {
    async fn save(&self) -> Result<()> {
        let Some(backend) = &self.backend else {
            return Ok(());
        };
        let _guard = self.lock.lock().await;
        let state = self.assigner.checkpoint().await;
        backend.save(&self.key, &state).await
    }
}

/// Builder for [`IncrementalSnapshotPipeline`].
#[derive(Default)]
pub struct IncrementalSnapshotPipelineBuilder {
    source: Option<Arc<dyn SnapshotSource>>,
    client: Option<Arc<dyn LogClient>>,
    tables: Vec<TableId>,
    config: IncrementalSnapshotConfig,
    sink: Option<Arc<dyn EventSink>>,
    checkpoint: Option<(SharedCheckpointBackend, String)>,
}

impl IncrementalSnapshotPipelineBuilder {
    pub fn source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn log_client(mut self, client: Arc<dyn LogClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Capture one more table.
    pub fn table(mut self, table: TableId) -> Self {
        self.tables.push(table);
        self
    }

    pub fn tables(mut self, tables: impl IntoIterator<Item = TableId>) -> Self {
        self.tables.extend(tables);
        self
    }

    pub fn config(mut self, config: IncrementalSnapshotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Persist the assigner state under `key` and resume from it on build.
    pub fn checkpoint(mut self, backend: SharedCheckpointBackend, key: impl Into<String>) -> Self {
        self.checkpoint = Some((backend, key.into()));
        self
    }

    /// Validate the configuration and restore a checkpoint, if one exists.
    pub async fn build(self) -> Result<IncrementalSnapshotPipeline> {
        self.config.validate()?;
        let source = self
            .source
            .ok_or_else(|| CdcError::config("pipeline requires a snapshot source"))?;
        let client = self
            .client
            .ok_or_else(|| CdcError::config("pipeline requires a log client"))?;
        let sink = self
            .sink
            .ok_or_else(|| CdcError::config("pipeline requires an event sink"))?;
        if self.tables.is_empty() {
            return Err(CdcError::config("pipeline requires at least one table"));
        }

        let stats = Arc::new(SnapshotStats::new());
        let restored = match &self.checkpoint {
            Some((backend, key)) => backend.load(key).await?,
            None => None,
        };
        let assigner = Arc::new(match restored {
            Some(state) => {
                info!(
                    checkpoint_created_at = state.created_at,
                    "Resuming from checkpoint"
                );
                SplitAssigner::restore(
                    source.clone(),
                    self.tables.clone(),
                    &self.config,
                    state,
                    stats.clone(),
                )
            }
            None => SplitAssigner::new(
                source.clone(),
                self.tables.clone(),
                &self.config,
                stats.clone(),
            ),
        });

        let reader = SplitReader::new(
            source,
            client,
            self.tables.iter().cloned(),
            &self.config,
            stats.clone(),
        );
        let (backend, key) = match self.checkpoint {
            Some((backend, key)) => (Some(backend), key),
            None => (None, String::new()),
        };
        let checkpointer = Checkpointer {
            backend,
            key,
            assigner: assigner.clone(),
            lock: Arc::new(Mutex::new(())),
        };
        let (shutdown, _) = watch::channel(false);

        Ok(IncrementalSnapshotPipeline {
            config: self.config,
            assigner,
            reader,
            sink,
            checkpointer,
            stats,
            shutdown: Arc::new(shutdown),
        })
    }
}

/// Snapshot-then-stream driver for a set of tables.
pub struct IncrementalSnapshotPipeline {
    config: IncrementalSnapshotConfig,
    assigner: Arc<SplitAssigner>,
    reader: SplitReader,
    sink: Arc<dyn EventSink>,
    checkpointer: Checkpointer,
    stats: Arc<SnapshotStats>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl IncrementalSnapshotPipeline {
    pub fn builder() -> IncrementalSnapshotPipelineBuilder {
        IncrementalSnapshotPipelineBuilder::default()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn assigner(&self) -> &Arc<SplitAssigner> {
        &self.assigner
    }

    pub fn stats(&self) -> SnapshotStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run until shutdown, log end, or the first unrecoverable error.
    pub async fn run(&self) -> Result<()> {
        let run_id = Uuid::new_v4();
        info!(%run_id, workers = self.config.max_concurrent_chunks, "Starting incremental snapshot");

        self.assigner.start().await?;
        self.checkpointer.save().await?;

        let mut workers = JoinSet::new();
        for index in 0..self.config.max_concurrent_chunks {
            let worker = Worker {
                id: format!("worker-{index}"),
                assigner: self.assigner.clone(),
                reader: self.reader.clone(),
                sink: self.sink.clone(),
                checkpointer: self.checkpointer.clone(),
                chunk_retry: self.config.chunk_retry.clone(),
                checkpoint_on_chunk_finish: self.config.checkpoint_on_chunk_finish,
                streaming_checkpoint_interval: self.config.streaming_checkpoint_interval,
                stats: self.stats.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            workers.spawn(worker.run());
        }

        let mut failure: Option<CdcError> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| CdcError::invalid_state(format!("worker task failed: {e}")))
                .and_then(|result| result);
            let Err(e) = result else {
                continue;
            };
            if failure.is_some() {
                debug!(error = %e, "Additional worker failure");
                continue;
            }
            error!(%run_id, error = %e, "Incremental snapshot failed");
            if let Err(save_error) = self.checkpointer.save().await {
                warn!(error = %save_error, "Could not checkpoint after failure");
            }
            self.assigner.close().await;
            self.shutdown.send_replace(true);
            failure = Some(e);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        self.checkpointer.save().await?;
        let stats = self.stats.snapshot();
        info!(
            %run_id,
            chunks_finished = stats.chunks_finished,
            snapshot_rows = stats.snapshot_rows,
            streaming_emitted = stats.streaming_emitted,
            "Incremental snapshot stopped"
        );
        Ok(())
    }
}

struct Worker {
    id: String,
    assigner: Arc<SplitAssigner>,
    reader: SplitReader,
    sink: Arc<dyn EventSink>,
    checkpointer: Checkpointer,
    chunk_retry: RetryConfig,
    checkpoint_on_chunk_finish: bool,
    streaming_checkpoint_interval: u64,
    stats: Arc<SnapshotStats>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) -> Result<()> {
        loop {
            let split = tokio::select! {
                _ = stopped(&mut self.shutdown) => return Ok(()),
                split = self.assigner.await_split(&self.id) => split?,
            };
            match split {
                Some(SourceSplit::Chunk(split)) => self.process_chunk(split).await?,
                Some(SourceSplit::Streaming(split)) => return self.process_streaming(split).await,
                None => {
                    debug!(worker = %self.id, "No more splits");
                    return Ok(());
                }
            }
        }
    }

    async fn process_chunk(&self, split: ChunkSplit) -> Result<()> {
        let mut attempt = 0u32;
        let merged = loop {
            match self.reader.read_chunk(&split).await {
                Ok(merged) => break merged,
                Err(e) if e.is_chunk_retriable() && self.chunk_retry.should_retry(attempt) => {
                    let delay = self.chunk_retry.delay_for_attempt(attempt);
                    self.stats.record_chunk_retry(e.error_code());
                    warn!(
                        worker = %self.id,
                        split_id = %split.split_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Restarting chunk"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return self.fail_chunk(&split, e).await,
            }
        };

        let high_watermark = merged.split.high_watermark;
        if let Err(e) = self.sink.emit_batch(merged.events).await {
            return self.fail_chunk(&split, e).await;
        }
        self.assigner
            .report_finished(&split.split_id, high_watermark)
            .await?;
        if self.checkpoint_on_chunk_finish {
            self.checkpointer.save().await?;
        }
        Ok(())
    }

    async fn fail_chunk(&self, split: &ChunkSplit, error: CdcError) -> Result<()> {
        self.assigner.report_failed(&split.split_id).await?;
        Err(error.for_split(split.split_id.clone()))
    }

    async fn process_streaming(&mut self, split: StreamingSplit) -> Result<()> {
        let mut streaming = self.reader.stream(&split).await?;
        self.checkpointer.save().await?;

        let mut since_checkpoint = 0u64;
        loop {
            let next = tokio::select! {
                _ = stopped(&mut self.shutdown) => {
                    info!(worker = %self.id, "Streaming stopped on shutdown");
                    break;
                }
                next = streaming.next_event() => next?,
            };
            let Some(event) = next else {
                info!(worker = %self.id, "Change log closed, streaming finished");
                break;
            };
            self.sink.emit(event).await?;
            self.assigner
                .report_streaming_position(streaming.consumed_position())
                .await?;
            since_checkpoint += 1;
            if self.streaming_checkpoint_interval > 0
                && since_checkpoint >= self.streaming_checkpoint_interval
            {
                self.checkpointer.save().await?;
                since_checkpoint = 0;
            }
        }

        self.assigner
            .report_streaming_position(streaming.consumed_position())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::memory::MemoryDatabase;
    use crate::common::{
        AssignerPhase, CheckpointBackend, CollectingSink, ColumnKind, KeyColumn, LogPosition,
        MemoryCheckpointStore, Row,
    };
    use std::time::Duration;

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    async fn database(rows: i64) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(orders(), KeyColumn::new("id", ColumnKind::Long))
            .await
            .unwrap();
        db.load(&orders(), (1..=rows).map(|id| Row::new().with("id", id)))
            .await
            .unwrap();
        db
    }

    #[tokio::test]
    async fn test_build_requires_parts() {
        let err = IncrementalSnapshotPipeline::builder().build().await.err().unwrap();
        assert!(matches!(err, CdcError::Config(_)));

        let db = database(1).await;
        let err = IncrementalSnapshotPipeline::builder()
            .source(Arc::new(db.clone()))
            .log_client(Arc::new(db))
            .sink(Arc::new(CollectingSink::new()))
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[tokio::test]
    async fn test_run_to_log_end() {
        let db = database(25).await;
        db.close_log().await;
        let sink = CollectingSink::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let pipeline = IncrementalSnapshotPipeline::builder()
            .source(Arc::new(db.clone()))
            .log_client(Arc::new(db.clone()))
            .table(orders())
            .sink(Arc::new(sink.clone()))
            .config(
                IncrementalSnapshotConfig::builder()
                    .chunk_size(10)
                    .max_concurrent_chunks(2)
                    .build(),
            )
            .checkpoint(store.clone(), "job")
            .build()
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), pipeline.run())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sink.len(), 25);
        assert_eq!(pipeline.stats().chunks_finished, 3);
        assert_eq!(
            pipeline.assigner().phase().await,
            AssignerPhase::StreamingActive
        );

        let state = store.load("job").await.unwrap().unwrap();
        assert_eq!(state.ledger.len(), 3);
        assert!(state.pending_splits.is_empty());
        assert!(state.streaming_split.is_some());
    }

    #[tokio::test]
    async fn test_streaming_progress_is_checkpointed_periodically() {
        let db = database(3).await;
        let sink = CollectingSink::new();
        let store = Arc::new(MemoryCheckpointStore::new());
        let pipeline = IncrementalSnapshotPipeline::builder()
            .source(Arc::new(db.clone()))
            .log_client(Arc::new(db.clone()))
            .table(orders())
            .sink(Arc::new(sink.clone()))
            .config(
                IncrementalSnapshotConfig::builder()
                    .streaming_checkpoint_interval(2)
                    .build(),
            )
            .checkpoint(store.clone(), "job")
            .build()
            .await
            .unwrap();
        let handle = pipeline.handle();
        let running = tokio::spawn(async move { pipeline.run().await });

        sink.wait_for_len(3, Duration::from_secs(5)).await.unwrap();
        for id in 4..=6 {
            db.insert(&orders(), Row::new().with("id", id)).await.unwrap();
        }
        sink.wait_for_len(6, Duration::from_secs(5)).await.unwrap();

        // Saved after the second streamed event while the job keeps running
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let state = store.load("job").await.unwrap().unwrap();
                let position = state.streaming_split.map(|s| s.starting_position);
                if position >= Some(LogPosition::new(2)) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!running.is_finished());

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let state = store.load("job").await.unwrap().unwrap();
        assert_eq!(
            state.streaming_split.unwrap().starting_position,
            LogPosition::new(3)
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_streaming() {
        let db = database(3).await;
        let sink = CollectingSink::new();
        let pipeline = IncrementalSnapshotPipeline::builder()
            .source(Arc::new(db.clone()))
            .log_client(Arc::new(db.clone()))
            .table(orders())
            .sink(Arc::new(sink.clone()))
            .build()
            .await
            .unwrap();
        let handle = pipeline.handle();
        let running = tokio::spawn(async move { pipeline.run().await });

        sink.wait_for_len(3, Duration::from_secs(5)).await.unwrap();
        db.insert(&orders(), Row::new().with("id", 4)).await.unwrap();
        sink.wait_for_len(4, Duration::from_secs(5)).await.unwrap();

        handle.shutdown();
        assert!(handle.is_shutdown());
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
