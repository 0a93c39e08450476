//! # tessera-cdc - Incremental Snapshots for Change Data Capture
//!
//! Produces a consistent initial image of one or more tables while their
//! change log keeps moving, then hands over to log streaming without losing
//! or duplicating a change.
//!
//! ## How it works
//!
//! ```text
//! table ──▶ ChunkSplitter ──▶ [c0][c1][c2]...           SplitAssigner
//!                                 │                         │
//!                  low ─▶ bulk read ─▶ high                 │ all chunks finished
//!                                 │                         ▼
//!       change log [low, high] ──▶ ChunkMergeEngine ──▶ Inserts @ high
//!                                                           │
//!       change log (min high, ∞) ──▶ StreamingReader ──▶ emit if pos > chunk high
//! ```
//!
//! 1. Each table is split into key-range chunks.
//! 2. A chunk is read between two log positions (low and high watermark) and
//!    the log changes in that window are replayed over the rows read.
//! 3. Once every chunk is finished, the log is tailed from the lowest high
//!    watermark; an event is emitted only if its chunk has not seen it yet.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> tessera_cdc::Result<()> {
//! use std::sync::Arc;
//! use tessera_cdc::common::{ColumnKind, KeyColumn, MemoryDatabase};
//! use tessera_cdc::{CollectingSink, IncrementalSnapshotPipeline, Row, TableId};
//!
//! let db = MemoryDatabase::new();
//! let orders = TableId::new("shop", "orders");
//! db.create_table(orders.clone(), KeyColumn::new("id", ColumnKind::Long)).await?;
//! db.load(&orders, (1..=100).map(|id| Row::new().with("id", id))).await?;
//!
//! let sink = CollectingSink::new();
//! let pipeline = IncrementalSnapshotPipeline::builder()
//!     .source(Arc::new(db.clone()))
//!     .log_client(Arc::new(db))
//!     .table(orders)
//!     .sink(Arc::new(sink.clone()))
//!     .build()
//!     .await?;
//!
//! let handle = pipeline.handle();
//! tokio::spawn(async move { pipeline.run().await });
//! // ... later
//! handle.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Data model, errors, configuration and the pipeline driver.
//!
//! ### Tier 2: Integration Types (crate root)
//! Traits a connector implements, sinks, checkpoint backends.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! The individual engine stages for custom drivers: splitter, readers, merge
//! engines, assigner, ledger, retry helpers, the in-memory source.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    CdcError,
    ErrorCategory,
    Result,
    // Data model
    ChangeEvent,
    ChangeOp,
    KeyValue,
    LogPosition,
    Row,
    TableId,
    // Configuration
    IncrementalSnapshotConfig,
    IncrementalSnapshotConfigBuilder,
    StartupMode,
    // Driver
    IncrementalSnapshotPipeline,
    PipelineHandle,
};

// =============================================================================
// TIER 2: Integration Types
// =============================================================================

// Source seams
pub use common::{LogClient, LogCursor, LogRecord, SnapshotSource};

// Sinks
pub use common::{ChannelSink, CollectingSink, EventSink};

// Checkpoints
pub use common::{
    AssignerState, CheckpointBackend, FileCheckpointStore, MemoryCheckpointStore,
};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
// Not re-exported at crate root:
//
// Splitting:
//   - common::ChunkSplitter, SplitStrategy, ChunkSplit
//
// Reading and merging:
//   - common::ChunkSnapshotReader, ChangeLogReader, ChangeLogStream
//   - common::ChunkMergeEngine, MergedChunk
//   - common::StreamingReader, StreamingMerger
//   - common::SplitReader
//
// Coordination:
//   - common::SplitAssigner, AssignerPhase, FinishedChunkLedger
//
// Resilience:
//   - common::RetryConfig, RetryConfigBuilder, retry_with_backoff
//
// Testing:
//   - common::memory::MemoryDatabase, Mutation
