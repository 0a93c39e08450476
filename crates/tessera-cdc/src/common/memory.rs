//! # In-Memory Source
//!
//! [`MemoryDatabase`] implements both [`SnapshotSource`] and [`LogClient`]
//! over a set of in-memory tables and an append-only change log. Every
//! mutation appends one record; positions start at 1 and grow by one.
//!
//! Besides embedding, it is the test double for the whole engine and can
//! inject the failures a real connector sees:
//!
//! | Knob | Effect |
//! |------|--------|
//! | [`fail_next_chunk_reads`](MemoryDatabase::fail_next_chunk_reads) | bulk reads fail with `SourceUnavailable` |
//! | [`drop_connection_after`](MemoryDatabase::drop_connection_after) | a cursor fails with `ConnectionLost` once |
//! | [`set_duplicate_delivery`](MemoryDatabase::set_duplicate_delivery) | cursors deliver every record twice |
//! | [`purge_through`](MemoryDatabase::purge_through) | old log positions become unavailable |
//! | [`interleave_after_next_read`](MemoryDatabase::interleave_after_next_read) | mutations land between a bulk read and its high watermark |

use crate::common::{
    CdcError, ChangeEvent, ChunkKeyType, ChunkSplit, KeyColumn, KeyValue, LogClient, LogCursor,
    LogPosition, LogRecord, Result, Row, SnapshotSource, TableId,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// A mutation applied through [`MemoryDatabase::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(TableId, Row),
    /// Upsert: updates the row with the same key, inserting it if absent
    Update(TableId, Row),
    Delete(TableId, KeyValue),
}

struct MemoryTable {
    key: KeyColumn,
    rows: BTreeMap<KeyValue, Row>,
}

impl MemoryTable {
    fn key_type(&self) -> Result<ChunkKeyType> {
        ChunkKeyType::try_from(&self.key.kind)
    }
}

#[derive(Default)]
struct State {
    tables: HashMap<TableId, MemoryTable>,
    log: BTreeMap<LogPosition, LogRecord>,
    head: LogPosition,
    purged_through: LogPosition,
    closed: bool,
    interleave: Vec<Mutation>,
}

impl State {
    fn table_mut(&mut self, table: &TableId) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| CdcError::schema(format!("Unknown table {table}")))
    }

    fn table(&self, table: &TableId) -> Result<&MemoryTable> {
        self.tables
            .get(table)
            .ok_or_else(|| CdcError::schema(format!("Unknown table {table}")))
    }

    fn append(&mut self, record: impl FnOnce(LogPosition) -> LogRecord) -> Result<LogPosition> {
        if self.closed {
            return Err(CdcError::invalid_state("change log is closed"));
        }
        let position = self.head.next();
        self.log.insert(position, record(position));
        self.head = position;
        Ok(position)
    }

    fn apply(&mut self, mutation: Mutation) -> Result<LogPosition> {
        match mutation {
            Mutation::Insert(table_id, row) => {
                let table = self.table_mut(&table_id)?;
                let key = row.key(&table.key.name, table.key_type()?)?;
                if table.rows.contains_key(&key) {
                    return Err(CdcError::invalid_state(format!(
                        "Duplicate key {key} in {table_id}"
                    )));
                }
                table.rows.insert(key.clone(), row.clone());
                self.append(|position| {
                    LogRecord::Change(ChangeEvent::insert(table_id, key, row, position))
                })
            }
            Mutation::Update(table_id, row) => {
                let table = self.table_mut(&table_id)?;
                let key = row.key(&table.key.name, table.key_type()?)?;
                let before = table.rows.insert(key.clone(), row.clone());
                self.append(|position| {
                    LogRecord::Change(ChangeEvent::update(table_id, key, before, row, position))
                })
            }
            Mutation::Delete(table_id, key) => {
                let table = self.table_mut(&table_id)?;
                let before = table.rows.remove(&key).ok_or_else(|| {
                    CdcError::invalid_state(format!("No row with key {key} in {table_id}"))
                })?;
                self.append(|position| {
                    LogRecord::Change(ChangeEvent::delete(table_id, key, before, position))
                })
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
    failing_reads: AtomicUsize,
    drop_armed: AtomicBool,
    drop_after: AtomicUsize,
    duplicate_delivery: AtomicBool,
    /// `u64::MAX` means "use the real row count"
    row_count_override: AtomicU64,
}

/// In-memory tables plus change log.
///
/// Cloning shares the same database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                failing_reads: AtomicUsize::new(0),
                drop_armed: AtomicBool::new(false),
                drop_after: AtomicUsize::new(0),
                duplicate_delivery: AtomicBool::new(false),
                row_count_override: AtomicU64::new(u64::MAX),
            }),
        }
    }

    /// Register an empty table.
    pub async fn create_table(&self, table: TableId, key: KeyColumn) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.tables.contains_key(&table) {
            return Err(CdcError::schema(format!("Table {table} already exists")));
        }
        state.tables.insert(
            table,
            MemoryTable {
                key,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Bulk-load rows without writing change log records.
    pub async fn load(&self, table: &TableId, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let table = state.table_mut(table)?;
        let key_type = table.key_type()?;
        for row in rows {
            let key = row.key(&table.key.name, key_type)?;
            table.rows.insert(key, row);
        }
        Ok(())
    }

    /// Apply a mutation and log it.
    pub async fn apply(&self, mutation: Mutation) -> Result<LogPosition> {
        let position = self.inner.state.lock().await.apply(mutation)?;
        self.inner.appended.notify_waiters();
        Ok(position)
    }

    pub async fn insert(&self, table: &TableId, row: Row) -> Result<LogPosition> {
        self.apply(Mutation::Insert(table.clone(), row)).await
    }

    pub async fn update(&self, table: &TableId, row: Row) -> Result<LogPosition> {
        self.apply(Mutation::Update(table.clone(), row)).await
    }

    pub async fn delete(&self, table: &TableId, key: KeyValue) -> Result<LogPosition> {
        self.apply(Mutation::Delete(table.clone(), key)).await
    }

    /// Append a record that carries no change.
    pub async fn heartbeat(&self) -> LogPosition {
        let appended = self
            .inner
            .state
            .lock()
            .await
            .append(LogRecord::Heartbeat);
        self.inner.appended.notify_waiters();
        appended.unwrap_or(LogPosition::ZERO)
    }

    /// Stop accepting mutations. Cursors end once they have drained the log.
    pub async fn close_log(&self) {
        self.inner.state.lock().await.closed = true;
        self.inner.appended.notify_waiters();
    }

    /// Drop every log record at or below `position`.
    pub async fn purge_through(&self, position: LogPosition) {
        let mut state = self.inner.state.lock().await;
        state.log.retain(|p, _| *p > position);
        if position > state.purged_through {
            state.purged_through = position;
        }
        drop(state);
        self.inner.appended.notify_waiters();
    }

    /// Position of the last log record.
    pub async fn head_position(&self) -> LogPosition {
        self.inner.state.lock().await.head
    }

    /// Current rows of a table, ordered by key.
    pub async fn rows(&self, table: &TableId) -> Result<Vec<Row>> {
        let state = self.inner.state.lock().await;
        Ok(state.table(table)?.rows.values().cloned().collect())
    }

    /// Apply `mutations` right after the next bulk read collected its rows.
    pub async fn interleave_after_next_read(&self, mutations: Vec<Mutation>) {
        self.inner.state.lock().await.interleave.extend(mutations);
    }

    /// Fail the next `count` bulk reads.
    pub fn fail_next_chunk_reads(&self, count: usize) {
        self.inner.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next cursor that has delivered `records` records fail once.
    pub fn drop_connection_after(&self, records: usize) {
        self.inner.drop_after.store(records, Ordering::SeqCst);
        self.inner.drop_armed.store(true, Ordering::SeqCst);
    }

    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Report `count` from [`SnapshotSource::approximate_row_count`] for every table.
    pub fn set_approximate_row_count(&self, count: Option<u64>) {
        self.inner
            .row_count_override
            .store(count.unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    fn take_read_failure(&self) -> bool {
        self.inner
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SnapshotSource for MemoryDatabase {
    async fn key_column(&self, table: &TableId) -> Result<KeyColumn> {
        let state = self.inner.state.lock().await;
        Ok(state.table(table)?.key.clone())
    }

    async fn key_bounds(
        &self,
        table: &TableId,
        _column: &str,
        _key_type: ChunkKeyType,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        let state = self.inner.state.lock().await;
        let rows = &state.table(table)?.rows;
        match (rows.keys().next(), rows.keys().next_back()) {
            (Some(min), Some(max)) => Ok(Some((min.clone(), max.clone()))),
            _ => Ok(None),
        }
    }

    async fn approximate_row_count(&self, table: &TableId) -> Result<u64> {
        let state = self.inner.state.lock().await;
        let actual = state.table(table)?.rows.len() as u64;
        match self.inner.row_count_override.load(Ordering::SeqCst) {
            u64::MAX => Ok(actual),
            count => Ok(count),
        }
    }

    async fn next_chunk_end(
        &self,
        table: &TableId,
        _column: &str,
        _key_type: ChunkKeyType,
        start: Option<&KeyValue>,
        chunk_size: usize,
    ) -> Result<Option<KeyValue>> {
        let state = self.inner.state.lock().await;
        let rows = &state.table(table)?.rows;
        let lower = match start {
            Some(start) => Bound::Included(start),
            None => Bound::Unbounded,
        };
        Ok(rows
            .range::<KeyValue, _>((lower, Bound::Unbounded))
            .nth(chunk_size)
            .map(|(key, _)| key.clone()))
    }

    async fn sample_keys(
        &self,
        table: &TableId,
        _column: &str,
        _key_type: ChunkKeyType,
        inverse_sampling_rate: u64,
    ) -> Result<Vec<KeyValue>> {
        let state = self.inner.state.lock().await;
        let rate = inverse_sampling_rate.max(1) as usize;
        Ok(state
            .table(table)?
            .rows
            .keys()
            .step_by(rate)
            .cloned()
            .collect())
    }

    async fn read_chunk(&self, split: &ChunkSplit) -> Result<Vec<Row>> {
        if self.take_read_failure() {
            return Err(CdcError::source_unavailable(format!(
                "injected read failure for {}",
                split.split_id
            )));
        }

        let mut state = self.inner.state.lock().await;
        let lower = match &split.lower {
            Some(lower) => Bound::Included(lower),
            None => Bound::Unbounded,
        };
        let upper = match &split.upper {
            Some(upper) => Bound::Excluded(upper),
            None => Bound::Unbounded,
        };
        let rows: Vec<Row> = state
            .table(&split.table_id)?
            .rows
            .range::<KeyValue, _>((lower, upper))
            .map(|(_, row)| row.clone())
            .collect();

        let interleaved = std::mem::take(&mut state.interleave);
        let applied = !interleaved.is_empty();
        for mutation in interleaved {
            let position = state.apply(mutation)?;
            debug!(split_id = %split.split_id, position = %position, "Applied interleaved mutation");
        }
        drop(state);
        if applied {
            self.inner.appended.notify_waiters();
        }
        Ok(rows)
    }

    async fn current_position(&self) -> Result<LogPosition> {
        Ok(self.head_position().await)
    }
}

#[async_trait]
impl LogClient for MemoryDatabase {
    async fn open(&self, after: LogPosition) -> Result<Box<dyn LogCursor>> {
        let state = self.inner.state.lock().await;
        if after < state.purged_through {
            return Err(CdcError::log_position_not_available(after));
        }
        Ok(Box::new(MemoryLogCursor {
            inner: self.inner.clone(),
            last: after,
            delivered: 0,
            duplicate: None,
        }))
    }
}

struct MemoryLogCursor {
    inner: Arc<Inner>,
    last: LogPosition,
    delivered: usize,
    duplicate: Option<LogRecord>,
}

#[async_trait]
impl LogCursor for MemoryLogCursor {
    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if let Some(record) = self.duplicate.take() {
            return Ok(Some(record));
        }
        if self.inner.drop_armed.load(Ordering::SeqCst)
            && self.delivered >= self.inner.drop_after.load(Ordering::SeqCst)
            && self.inner.drop_armed.swap(false, Ordering::SeqCst)
        {
            return Err(CdcError::connection_lost(format!(
                "injected disconnect after {}",
                self.last
            )));
        }

        loop {
            let notified = self.inner.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock().await;
                if self.last < state.purged_through {
                    return Err(CdcError::log_position_not_available(self.last));
                }
                let next = state
                    .log
                    .range((Bound::Excluded(self.last), Bound::Unbounded))
                    .next()
                    .map(|(_, record)| record.clone());
                match next {
                    Some(record) => {
                        self.last = record.position();
                        self.delivered += 1;
                        if self.inner.duplicate_delivery.load(Ordering::SeqCst) {
                            self.duplicate = Some(record.clone());
                        }
                        return Ok(Some(record));
                    }
                    None if state.closed => return Ok(None),
                    None => {}
                }
            }
            notified.await;
        }
    }
}
