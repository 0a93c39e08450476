//! Test harness for incremental snapshot integration tests
//!
//! Everything runs against the in-memory source, so no containers are needed.
//!
//! Features:
//! - Seeded tables and deterministic row generators
//! - A pipeline builder with fast retry settings
//! - Fluent assertions over emitted change events

#![allow(dead_code, unused_imports)] // Each test binary uses a different subset

pub mod assertions;
pub mod data_generators;

pub use assertions::{replay, ChangeEventAssertions, ChangeEventVecExt};
pub use data_generators::{
    audit_table, customers_table, order_row, orders_table, seeded_orders, string_keyed_customers,
};

use std::sync::{Arc, Once};
use std::time::Duration;
use tessera_cdc::common::{
    MemoryDatabase, RetryConfig, SharedCheckpointBackend, SnapshotStats,
};
use tessera_cdc::{
    CollectingSink, IncrementalSnapshotConfig, IncrementalSnapshotPipeline, TableId,
};

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("tessera_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Upper bound for any single wait in a test
pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy that keeps failing tests fast
pub fn fast_retry(max_retries: i32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .build()
}

/// Configuration with small chunks and fast retries
pub fn test_config(chunk_size: usize, workers: usize) -> IncrementalSnapshotConfig {
    IncrementalSnapshotConfig::builder()
        .chunk_size(chunk_size)
        .max_concurrent_chunks(workers)
        .window_timeout(Duration::from_secs(10))
        .chunk_retry(fast_retry(3))
        .log_retry(fast_retry(5))
        .build()
}

/// Build a pipeline over `db` that collects into `sink`.
pub async fn build_pipeline(
    db: &MemoryDatabase,
    tables: Vec<TableId>,
    config: IncrementalSnapshotConfig,
    sink: &CollectingSink,
    checkpoint: Option<(SharedCheckpointBackend, &str)>,
) -> IncrementalSnapshotPipeline {
    let mut builder = IncrementalSnapshotPipeline::builder()
        .source(Arc::new(db.clone()))
        .log_client(Arc::new(db.clone()))
        .tables(tables)
        .config(config)
        .sink(Arc::new(sink.clone()));
    if let Some((backend, key)) = checkpoint {
        builder = builder.checkpoint(backend, key);
    }
    builder.build().await.expect("pipeline should build")
}

/// Run a pipeline to completion, failing the test if it hangs.
pub async fn run_to_end(pipeline: &IncrementalSnapshotPipeline) -> tessera_cdc::Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, pipeline.run())
        .await
        .expect("pipeline did not finish in time")
}

pub fn new_stats() -> Arc<SnapshotStats> {
    Arc::new(SnapshotStats::new())
}
