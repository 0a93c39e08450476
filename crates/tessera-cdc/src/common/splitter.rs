//! # Chunk Splitter
//!
//! Partitions a table's primary-key space into disjoint, exhaustive chunks.
//!
//! ## Strategies
//!
//! | Strategy | When | Bounds |
//! |----------|------|--------|
//! | Single | empty table, `min == max` | one unbounded chunk |
//! | Even | integral key, distribution factor in range | `min + k * step` |
//! | Sampled | `row_count / chunk_size > sample_sharding_threshold` | every n-th sampled key |
//! | Query | otherwise | source query for the key `chunk_size` rows ahead |
//!
//! The distribution factor is `(max - min + 1) / approximate_row_count`. For a
//! dense auto-increment key it is close to `1.0`; sparse keys produce larger
//! factors and larger, still evenly sized, steps.
//!
//! ```text
//! bounds:   b1        b2        b3
//! chunks: [-inf, b1) [b1, b2) [b2, b3) [b3, +inf)
//! ```

use crate::common::{
    ChunkKeyType, ChunkSplit, IncrementalSnapshotConfig, KeyValue, Result, SnapshotSource,
    TableId,
};
use bigdecimal::BigDecimal;
use num_traits::ToPrimitive;
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Splitting strategy selected for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    Single,
    Even,
    Sampled,
    Query,
}

/// Splits captured tables into [`ChunkSplit`]s.
pub struct ChunkSplitter {
    source: Arc<dyn SnapshotSource>,
    chunk_size: usize,
    factor_lower: f64,
    factor_upper: f64,
    sample_sharding_threshold: u64,
    inverse_sampling_rate: u64,
}

impl ChunkSplitter {
    pub fn new(source: Arc<dyn SnapshotSource>, config: &IncrementalSnapshotConfig) -> Self {
        Self {
            source,
            chunk_size: config.chunk_size.max(1),
            factor_lower: config.even_distribution_factor_lower,
            factor_upper: config.even_distribution_factor_upper,
            sample_sharding_threshold: config.sample_sharding_threshold,
            inverse_sampling_rate: config.inverse_sampling_rate.max(1),
        }
    }

    /// Generate the chunk splits for one table.
    pub async fn split_table(&self, table: &TableId) -> Result<Vec<ChunkSplit>> {
        let (strategy, splits) = self.split_table_with_strategy(table).await?;
        info!(
            table = %table,
            strategy = ?strategy,
            chunks = splits.len(),
            "Split table into chunks"
        );
        Ok(splits)
    }

    /// Generate the chunk splits for one table and report the strategy used.
    pub async fn split_table_with_strategy(
        &self,
        table: &TableId,
    ) -> Result<(SplitStrategy, Vec<ChunkSplit>)> {
        let key_column = self.source.key_column(table).await?;
        let key_type = ChunkKeyType::try_from(&key_column.kind)?;
        let column = key_column.name.as_str();

        let (min, max) = match self.source.key_bounds(table, column, key_type).await? {
            Some(bounds) => bounds,
            None => {
                debug!(table = %table, "Table is empty, using a single chunk");
                return Ok((
                    SplitStrategy::Single,
                    chunks_from_bounds(table, column, key_type, Vec::new()),
                ));
            }
        };
        if min.try_compare(&max)? != Ordering::Less {
            return Ok((
                SplitStrategy::Single,
                chunks_from_bounds(table, column, key_type, Vec::new()),
            ));
        }

        let row_count = self.source.approximate_row_count(table).await?;

        if key_type.is_integral() {
            let factor = distribution_factor(&min, &max, row_count)?;
            if factor >= self.factor_lower && factor <= self.factor_upper {
                debug!(table = %table, factor, "Key is evenly distributed");
                let bounds = if row_count <= self.chunk_size as u64 {
                    Vec::new()
                } else {
                    self.even_bounds(&min, &max, factor)?
                };
                return Ok((
                    SplitStrategy::Even,
                    chunks_from_bounds(table, column, key_type, bounds),
                ));
            }
            debug!(table = %table, factor, "Key is unevenly distributed");
        }

        let shard_count = row_count / self.chunk_size as u64;
        if shard_count > self.sample_sharding_threshold {
            let samples = self
                .source
                .sample_keys(table, column, key_type, self.inverse_sampling_rate)
                .await?;
            let bounds = self.sampled_bounds(&min, &max, samples)?;
            return Ok((
                SplitStrategy::Sampled,
                chunks_from_bounds(table, column, key_type, bounds),
            ));
        }

        let bounds = self.query_bounds(table, column, key_type, &min).await?;
        Ok((
            SplitStrategy::Query,
            chunks_from_bounds(table, column, key_type, bounds),
        ))
    }

    fn even_bounds(&self, min: &KeyValue, max: &KeyValue, factor: f64) -> Result<Vec<KeyValue>> {
        let step = (factor * self.chunk_size as f64).ceil();
        if !step.is_finite() || step >= i64::MAX as f64 {
            return Ok(Vec::new());
        }
        let step = (step as i64).max(1);

        let mut bounds = Vec::new();
        let mut next = match min.plus(step) {
            Ok(next) => next,
            Err(_) => return Ok(bounds),
        };
        while next.try_compare(max)? != Ordering::Greater {
            let following = next.plus(step);
            bounds.push(next);
            next = match following {
                Ok(following) => following,
                // Overflow past the key domain ends the sequence
                Err(_) => break,
            };
        }
        Ok(bounds)
    }

    fn sampled_bounds(
        &self,
        min: &KeyValue,
        max: &KeyValue,
        samples: Vec<KeyValue>,
    ) -> Result<Vec<KeyValue>> {
        let stride = (self.chunk_size as u64 / self.inverse_sampling_rate).max(1) as usize;
        let mut bounds: Vec<KeyValue> = Vec::new();
        for sample in samples.into_iter().skip(stride - 1).step_by(stride) {
            if sample.try_compare(min)? != Ordering::Greater
                || sample.try_compare(max)? == Ordering::Greater
            {
                continue;
            }
            if let Some(last) = bounds.last() {
                if sample.try_compare(last)? != Ordering::Greater {
                    continue;
                }
            }
            bounds.push(sample);
        }
        Ok(bounds)
    }

    async fn query_bounds(
        &self,
        table: &TableId,
        column: &str,
        key_type: ChunkKeyType,
        min: &KeyValue,
    ) -> Result<Vec<KeyValue>> {
        let mut bounds: Vec<KeyValue> = Vec::new();
        let mut start = min.clone();
        while let Some(end) = self
            .source
            .next_chunk_end(table, column, key_type, Some(&start), self.chunk_size)
            .await?
        {
            if end.try_compare(&start)? != Ordering::Greater {
                warn!(
                    table = %table,
                    start = %start,
                    end = %end,
                    "Source returned a non-increasing chunk end, stopping split"
                );
                break;
            }
            bounds.push(end.clone());
            start = end;
        }
        Ok(bounds)
    }
}

/// `(max - min + 1) / row_count`, or `f64::MAX` when the count is unknown.
pub fn distribution_factor(min: &KeyValue, max: &KeyValue, row_count: u64) -> Result<f64> {
    if row_count == 0 {
        return Ok(f64::MAX);
    }
    let span = max.minus(min)? + BigDecimal::from(1);
    let factor = span / BigDecimal::from(row_count);
    Ok(factor.to_f64().unwrap_or(f64::MAX))
}

/// Turn strictly increasing split points into half-open chunks.
pub fn chunks_from_bounds(
    table: &TableId,
    column: &str,
    key_type: ChunkKeyType,
    bounds: Vec<KeyValue>,
) -> Vec<ChunkSplit> {
    let mut splits = Vec::with_capacity(bounds.len() + 1);
    let mut lower: Option<KeyValue> = None;
    for bound in bounds {
        let index = splits.len();
        splits.push(ChunkSplit::new(
            table.clone(),
            index,
            column,
            key_type,
            lower.take(),
            Some(bound.clone()),
        ));
        lower = Some(bound);
    }
    let index = splits.len();
    splits.push(ChunkSplit::new(
        table.clone(),
        index,
        column,
        key_type,
        lower,
        None,
    ));
    splits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::memory::MemoryDatabase;
    use crate::common::{CdcError, ColumnKind, KeyColumn, Row};

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    fn config(chunk_size: usize) -> IncrementalSnapshotConfig {
        IncrementalSnapshotConfig::builder()
            .chunk_size(chunk_size)
            .build()
    }

    async fn table_with_keys(keys: impl IntoIterator<Item = i64>) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.create_table(orders(), KeyColumn::new("id", ColumnKind::Long))
            .await
            .unwrap();
        db.load(
            &orders(),
            keys.into_iter().map(|id| Row::new().with("id", id)),
        )
        .await
        .unwrap();
        db
    }

    fn assert_exhaustive(splits: &[ChunkSplit]) {
        assert!(splits.first().unwrap().lower.is_none());
        assert!(splits.last().unwrap().upper.is_none());
        for pair in splits.windows(2) {
            assert_eq!(pair[0].upper, pair[1].lower);
            assert_eq!(pair[0].index + 1, pair[1].index);
        }
    }

    #[test]
    fn test_chunks_from_bounds() {
        let splits = chunks_from_bounds(
            &orders(),
            "id",
            ChunkKeyType::Long,
            vec![KeyValue::Long(10), KeyValue::Long(20)],
        );
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].upper, Some(KeyValue::Long(10)));
        assert_eq!(splits[1].lower, Some(KeyValue::Long(10)));
        assert_eq!(splits[2].split_id, "shop.orders:2");
        assert_exhaustive(&splits);
    }

    #[test]
    fn test_distribution_factor() {
        let factor = distribution_factor(&KeyValue::Long(1), &KeyValue::Long(100), 100).unwrap();
        assert!((factor - 1.0).abs() < 1e-9);
        let sparse = distribution_factor(&KeyValue::Long(1), &KeyValue::Long(1000), 100).unwrap();
        assert!((sparse - 10.0).abs() < 1e-9);
        assert_eq!(
            distribution_factor(&KeyValue::Long(1), &KeyValue::Long(2), 0).unwrap(),
            f64::MAX
        );
    }

    #[tokio::test]
    async fn test_empty_table_single_chunk() {
        let db = table_with_keys(Vec::new()).await;
        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Single);
        assert_eq!(splits.len(), 1);
        assert!(splits[0].is_unbounded());
    }

    #[tokio::test]
    async fn test_single_row_single_chunk() {
        let db = table_with_keys(vec![7]).await;
        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let splits = splitter.split_table(&orders()).await.unwrap();
        assert_eq!(splits.len(), 1);
        assert!(splits[0].is_unbounded());
    }

    #[tokio::test]
    async fn test_even_split_dense_keys() {
        let db = table_with_keys(1..=100).await;
        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Even);
        // bounds 11, 21, ..., 91
        assert_eq!(splits.len(), 10);
        assert_eq!(splits[0].upper, Some(KeyValue::Long(11)));
        assert_eq!(splits[9].lower, Some(KeyValue::Long(91)));
        assert_exhaustive(&splits);
    }

    #[tokio::test]
    async fn test_small_table_single_even_chunk() {
        let db = table_with_keys(1..=5).await;
        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Even);
        assert_eq!(splits.len(), 1);
    }

    #[tokio::test]
    async fn test_skewed_keys_use_query_split() {
        let keys: Vec<i64> = (1..=20).chain([1_000_000, 2_000_000]).collect();
        let db = table_with_keys(keys.clone()).await;
        let splitter = ChunkSplitter::new(Arc::new(db), &config(5));
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Query);
        assert_exhaustive(&splits);

        // Every key lands in exactly one chunk
        for key in keys {
            let key = KeyValue::Long(key);
            let owners = splits.iter().filter(|s| s.contains(&key).unwrap()).count();
            assert_eq!(owners, 1, "key {key} owned by {owners} chunks");
        }
        // 22 rows at 5 per chunk
        assert_eq!(splits.len(), 5);
    }

    #[tokio::test]
    async fn test_sampled_split_for_large_tables() {
        let keys: Vec<i64> = (1..=400).map(|k| k * k * k).collect();
        let db = table_with_keys(keys.clone()).await;
        let config = IncrementalSnapshotConfig::builder()
            .chunk_size(20)
            .sample_sharding_threshold(2)
            .inverse_sampling_rate(10)
            .build();
        let splitter = ChunkSplitter::new(Arc::new(db), &config);
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Sampled);
        assert_exhaustive(&splits);
        assert!(splits.len() > 1);
        for key in keys {
            let key = KeyValue::Long(key);
            assert_eq!(splits.iter().filter(|s| s.contains(&key).unwrap()).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_string_keys_use_query_split() {
        let db = MemoryDatabase::new();
        db.create_table(orders(), KeyColumn::new("code", ColumnKind::String))
            .await
            .unwrap();
        db.load(
            &orders(),
            ["a", "b", "c", "d", "e"].map(|code| Row::new().with("code", code)),
        )
        .await
        .unwrap();

        let splitter = ChunkSplitter::new(Arc::new(db), &config(2));
        let (strategy, splits) = splitter.split_table_with_strategy(&orders()).await.unwrap();
        assert_eq!(strategy, SplitStrategy::Query);
        assert_eq!(splits.len(), 3);
        assert_eq!(splits[0].upper, Some(KeyValue::from("c")));
        assert_eq!(splits[1].upper, Some(KeyValue::from("e")));
    }

    #[tokio::test]
    async fn test_int_key_overflow_stops_split() {
        let db = MemoryDatabase::new();
        db.create_table(orders(), KeyColumn::new("id", ColumnKind::Int))
            .await
            .unwrap();
        db.load(
            &orders(),
            (i32::MAX - 25..=i32::MAX).map(|id| Row::new().with("id", id)),
        )
        .await
        .unwrap();

        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let splits = splitter.split_table(&orders()).await.unwrap();
        assert_exhaustive(&splits);
        assert_eq!(splits.len(), 3);
    }

    #[tokio::test]
    async fn test_unsupported_key_type() {
        let db = MemoryDatabase::new();
        db.create_table(orders(), KeyColumn::new("score", ColumnKind::Double))
            .await
            .unwrap();
        let splitter = ChunkSplitter::new(Arc::new(db), &config(10));
        let err = splitter.split_table(&orders()).await.unwrap_err();
        assert!(matches!(err, CdcError::UnsupportedKeyType(_)));
    }
}
