//! # Change Log Reader
//!
//! Tails the source change log from a position and delivers an ordered,
//! deduplicated stream scoped to the captured tables.
//!
//! ```text
//! LogClient ──▶ LogCursor ──▶ [reader task] ──bounded mpsc──▶ ChangeLogStream
//!                   ▲              │
//!                   └── reopen ────┘  (ConnectionLost, from last position)
//! ```
//!
//! | Raw record | Delivered as |
//! |------------|--------------|
//! | change on a captured table | [`LogItem::Change`] |
//! | change on another table | [`LogItem::Progress`] |
//! | heartbeat | [`LogItem::Progress`] |
//! | position `<=` last delivered | dropped (at-least-once redelivery) |
//!
//! The reader task blocks when the buffer is full, so a slow consumer
//! throttles log consumption instead of growing memory.

use crate::common::{
    retry_with_backoff, CdcError, ChangeEvent, IncrementalSnapshotConfig, LogClient, LogCursor,
    LogPosition, LogRecord, Result, RetryConfig, TableId,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An item delivered by a [`ChangeLogStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum LogItem {
    /// A change on a captured table
    Change(ChangeEvent),
    /// The log reached this position without a captured change
    Progress(LogPosition),
}

impl LogItem {
    pub fn position(&self) -> LogPosition {
        match self {
            LogItem::Change(event) => event.position,
            LogItem::Progress(position) => *position,
        }
    }
}

/// Opens [`ChangeLogStream`]s against a [`LogClient`].
#[derive(Clone)]
pub struct ChangeLogReader {
    client: Arc<dyn LogClient>,
    tables: Option<Arc<HashSet<TableId>>>,
    buffer_capacity: usize,
    retry: RetryConfig,
}

impl ChangeLogReader {
    /// Create a reader capturing every table.
    pub fn new(client: Arc<dyn LogClient>, config: &IncrementalSnapshotConfig) -> Self {
        Self {
            client,
            tables: None,
            buffer_capacity: config.log_buffer_capacity.max(1),
            retry: config.log_retry.clone(),
        }
    }

    /// Restrict captured changes to the given tables.
    pub fn with_tables(mut self, tables: impl IntoIterator<Item = TableId>) -> Self {
        self.tables = Some(Arc::new(tables.into_iter().collect()));
        self
    }

    /// Open a stream of records strictly after `after`.
    ///
    /// A purged start position fails here with
    /// [`CdcError::LogPositionNotAvailable`] and is never retried.
    pub async fn open(&self, after: LogPosition) -> Result<ChangeLogStream> {
        let client = self.client.clone();
        let cursor = retry_with_backoff(&self.retry, "open change log", CdcError::is_retriable, || {
            let client = client.clone();
            async move { client.open(after).await }
        })
        .await?;

        debug!(after = %after, "Opened change log");

        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let task = ReaderTask {
            client: self.client.clone(),
            tables: self.tables.clone(),
            retry: self.retry.clone(),
            last_position: after,
            tx,
        };
        let handle = tokio::spawn(task.run(cursor));

        Ok(ChangeLogStream {
            rx,
            task: handle,
            last_position: after,
        })
    }
}

struct ReaderTask {
    client: Arc<dyn LogClient>,
    tables: Option<Arc<HashSet<TableId>>>,
    retry: RetryConfig,
    last_position: LogPosition,
    tx: mpsc::Sender<Result<LogItem>>,
}

impl ReaderTask {
    async fn run(mut self, mut cursor: Box<dyn LogCursor>) {
        loop {
            match cursor.next_record().await {
                Ok(Some(record)) => {
                    let position = record.position();
                    if position <= self.last_position {
                        debug!(position = %position, "Dropping redelivered log record");
                        continue;
                    }
                    self.last_position = position;
                    let item = self.classify(record);
                    if self.tx.send(Ok(item)).await.is_err() {
                        // Consumer went away
                        return;
                    }
                }
                Ok(None) => {
                    info!(last = %self.last_position, "Change log closed");
                    return;
                }
                Err(e) if e.is_retriable() => {
                    warn!(
                        last = %self.last_position,
                        error = %e,
                        "Change log connection lost, reopening"
                    );
                    metrics::counter!("tessera_cdc_log_reconnects_total").increment(1);
                    match self.reopen().await {
                        Ok(reopened) => cursor = reopened,
                        Err(e) => {
                            error!(error = %e, "Failed to reopen change log");
                            let _ = self.tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Change log failed");
                    let _ = self.tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    fn classify(&self, record: LogRecord) -> LogItem {
        match record {
            LogRecord::Change(event) => {
                let captured = self
                    .tables
                    .as_ref()
                    .map_or(true, |tables| tables.contains(&event.table_id));
                if captured {
                    LogItem::Change(event)
                } else {
                    LogItem::Progress(event.position)
                }
            }
            LogRecord::Heartbeat(position) => LogItem::Progress(position),
        }
    }

    async fn reopen(&self) -> Result<Box<dyn LogCursor>> {
        let after = self.last_position;
        let client = self.client.clone();
        retry_with_backoff(&self.retry, "reopen change log", CdcError::is_retriable, || {
            let client = client.clone();
            async move { client.open(after).await }
        })
        .await
    }
}

/// A live stream over the change log.
///
/// Positions strictly increase. Dropping the stream stops the reader task.
pub struct ChangeLogStream {
    rx: mpsc::Receiver<Result<LogItem>>,
    task: JoinHandle<()>,
    last_position: LogPosition,
}

impl ChangeLogStream {
    /// Wait for the next item. `Ok(None)` means the log was closed.
    pub async fn next(&mut self) -> Result<Option<LogItem>> {
        match self.rx.recv().await {
            Some(Ok(item)) => {
                self.last_position = item.position();
                Ok(Some(item))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Wait for the next change, skipping progress markers.
    pub async fn next_change(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            match self.next().await? {
                Some(LogItem::Change(event)) => return Ok(Some(event)),
                Some(LogItem::Progress(_)) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Position of the last item handed to the consumer.
    pub fn last_position(&self) -> LogPosition {
        self.last_position
    }
}

impl Drop for ChangeLogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}
