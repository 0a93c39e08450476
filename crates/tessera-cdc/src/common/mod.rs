//! # Common Snapshot Types and Traits
//!
//! Database-agnostic building blocks of the incremental snapshot engine:
//!
//! - [`KeyValue`], [`LogPosition`], [`ChangeEvent`] - the data model
//! - [`SnapshotSource`], [`LogClient`] - seams a connector implements
//! - [`ChunkSplitter`] - splits a table's key space into chunks
//! - [`ChunkSnapshotReader`] - bulk reads bracketed by watermarks
//! - [`ChangeLogReader`] - deduplicated, reconnecting log stream
//! - [`ChunkMergeEngine`] - replays a chunk's window over its rows
//! - [`SplitAssigner`] - split pool, finished-chunk ledger, phases
//! - [`StreamingReader`] - post-snapshot tail with coverage filter
//! - [`IncrementalSnapshotPipeline`] - drives everything end to end
//! - [`CheckpointBackend`] - durable assigner state
//! - [`SnapshotStats`] - counters mirrored to the `metrics` facade
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Common Module                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ChunkSplitter     ←─── even / sampled / query-based splits │
//! │  SplitAssigner     ←─── pool, ledger, streaming split       │
//! │  SplitReader       ←─── snapshot reader + log reader        │
//! │  ChunkMergeEngine  ←─── window [low, high] replay           │
//! │  StreamingReader   ←─── suppress events ≤ chunk high        │
//! │  Checkpoint        ←─── memory / atomic JSON files          │
//! │  EventSink         ←─── collecting / channel sinks          │
//! │  MemoryDatabase    ←─── in-memory source with fault knobs   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod assigner;
mod checkpoint;
mod chunk_merge;
mod config;
mod error;
mod event;
mod ledger;
mod log_reader;
pub mod memory;
mod metrics;
mod pipeline;
mod position;
mod reader;
mod resilience;
mod sink;
mod snapshot_reader;
mod split;
mod splitter;
mod streaming_merge;
mod traits;
mod value;

pub use assigner::*;
pub use checkpoint::*;
pub use chunk_merge::*;
pub use config::*;
pub use error::*;
pub use event::*;
pub use ledger::*;
pub use log_reader::*;
pub use memory::{MemoryDatabase, Mutation};
pub use metrics::*;
pub use pipeline::*;
pub use position::*;
pub use reader::*;
pub use resilience::*;
pub use sink::*;
pub use snapshot_reader::*;
pub use split::*;
pub use splitter::*;
pub use streaming_merge::*;
pub use traits::*;
pub use value::*;
