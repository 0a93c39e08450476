//! Custom assertions for change event testing
//!
//! Fluent, readable assertions over emitted events with detailed messages.

use pretty_assertions::assert_eq;
use std::collections::{BTreeMap, HashSet};
use tessera_cdc::{ChangeEvent, ChangeOp, KeyValue, Row, TableId};

/// Fluent assertion builder for change events
pub struct ChangeEventAssertions<'a> {
    events: &'a [ChangeEvent],
}

impl<'a> ChangeEventAssertions<'a> {
    pub fn new(events: &'a [ChangeEvent]) -> Self {
        Self { events }
    }

    /// Assert the number of events
    pub fn has_count(self, expected: usize) -> Self {
        assert_eq!(
            self.events.len(),
            expected,
            "Expected {} events, got {}",
            expected,
            self.events.len()
        );
        self
    }

    /// Assert count of a specific operation
    pub fn has_op_count(self, op: ChangeOp, expected: usize) -> Self {
        let count = self.events.iter().filter(|e| e.op == op).count();
        assert_eq!(count, expected, "Expected {expected} {op} events, got {count}");
        self
    }

    /// Assert every event is a finalized insert
    pub fn all_inserts(self) -> Self {
        for event in self.events {
            assert_eq!(
                event.op,
                ChangeOp::Insert,
                "Expected only inserts, found {} for key {} at {}",
                event.op,
                event.key,
                event.position
            );
            assert!(event.after.is_some(), "Insert without row image: {event:?}");
        }
        self
    }

    /// Assert no key appears twice per table
    pub fn has_unique_keys(self) -> Self {
        let mut seen = HashSet::new();
        for event in self.events {
            assert!(
                seen.insert((event.table_id.clone(), event.key.clone())),
                "Key {} of {} emitted more than once",
                event.key,
                event.table_id
            );
        }
        self
    }

    /// Assert positions strictly increase
    pub fn is_strictly_ordered_by_position(self) -> Self {
        for window in self.events.windows(2) {
            assert!(
                window[0].position < window[1].position,
                "Positions not strictly increasing: {} then {}",
                window[0].position,
                window[1].position
            );
        }
        self
    }

    /// Keys emitted for `table`, sorted
    pub fn keys_for(&self, table: &TableId) -> Vec<KeyValue> {
        let mut keys: Vec<KeyValue> = self
            .events
            .iter()
            .filter(|e| &e.table_id == table)
            .map(|e| e.key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Extension trait for event slices
pub trait ChangeEventVecExt {
    fn assert(&self) -> ChangeEventAssertions<'_>;
}

impl ChangeEventVecExt for [ChangeEvent] {
    fn assert(&self) -> ChangeEventAssertions<'_> {
        ChangeEventAssertions::new(self)
    }
}

impl ChangeEventVecExt for Vec<ChangeEvent> {
    fn assert(&self) -> ChangeEventAssertions<'_> {
        ChangeEventAssertions::new(self)
    }
}

/// Apply events in order and return the resulting image of `table`.
pub fn replay(events: &[ChangeEvent], table: &TableId) -> BTreeMap<KeyValue, Row> {
    let mut image = BTreeMap::new();
    for event in events.iter().filter(|e| &e.table_id == table) {
        match event.op {
            ChangeOp::Insert | ChangeOp::Update => {
                let row = event.after.clone().expect("insert/update carries a row");
                image.insert(event.key.clone(), row);
            }
            ChangeOp::Delete => {
                image.remove(&event.key);
            }
        }
    }
    image
}
