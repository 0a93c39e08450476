//! Event sinks
//!
//! Destinations for finalized change events. The pipeline emits every
//! chunk's output before the streaming phase starts, and streaming events in
//! log order.
//!
//! - [`CollectingSink`]: in-memory, with a blocking wait helper for tests
//! - [`ChannelSink`]: bounded `tokio::mpsc` hand-off to a consumer task

use crate::common::{CdcError, ChangeEvent, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// Receives finalized change events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit one event.
    async fn emit(&self, event: ChangeEvent) -> Result<()>;

    /// Emit a batch of events in order.
    async fn emit_batch(&self, events: Vec<ChangeEvent>) -> Result<()> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }
}

/// Collects events in memory.
///
/// Cloning shares the underlying buffer, so a test can hand one clone to the
/// pipeline and wait on another.
#[derive(Clone)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
    count: Arc<watch::Sender<usize>>,
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectingSink {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(count),
        }
    }

    /// Copy of every event collected so far.
    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().await.clone()
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `len` events were collected.
    ///
    /// Fails with [`CdcError::Timeout`] if that does not happen in time.
    pub async fn wait_for_len(&self, len: usize, timeout: Duration) -> Result<Vec<ChangeEvent>> {
        let mut rx = self.count.subscribe();
        // Release the watch guard before touching the event buffer
        let reached = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= len))
            .await
            .map(|waited| waited.map(|_| ()));
        match reached {
            Ok(Ok(_)) => Ok(self.events().await),
            Ok(Err(_)) => Err(CdcError::invalid_state("collecting sink dropped")),
            Err(_) => Err(CdcError::timeout(format!(
                "expected {len} events within {timeout:?}, got {}",
                self.len()
            ))),
        }
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        let mut events = self.events.lock().await;
        events.push(event);
        self.count.send_replace(events.len());
        Ok(())
    }

    async fn emit_batch(&self, batch: Vec<ChangeEvent>) -> Result<()> {
        let mut events = self.events.lock().await;
        events.extend(batch);
        self.count.send_replace(events.len());
        Ok(())
    }
}

/// Forwards events over a bounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ChangeEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: ChangeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CdcError::invalid_state("event receiver dropped"))
    }
}
