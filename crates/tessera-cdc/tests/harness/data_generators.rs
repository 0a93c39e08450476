//! Test data generators
//!
//! Deterministic tables and rows so failures reproduce.

use tessera_cdc::common::{ColumnKind, KeyColumn, MemoryDatabase};
use tessera_cdc::{Row, TableId};

pub fn orders_table() -> TableId {
    TableId::new("shop", "orders")
}

pub fn customers_table() -> TableId {
    TableId::new("shop", "customers")
}

pub fn audit_table() -> TableId {
    TableId::new("shop", "audit")
}

/// An order row with a status and an amount derived from the id
pub fn order_row(id: i64, status: &str) -> Row {
    Row::new()
        .with("id", id)
        .with("status", status)
        .with("amount", id * 100 + 7)
}

/// A database with `shop.orders` holding ids `1..=rows`, all "new".
pub async fn seeded_orders(rows: i64) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.create_table(orders_table(), KeyColumn::new("id", ColumnKind::Long))
        .await
        .expect("create orders");
    db.load(&orders_table(), (1..=rows).map(|id| order_row(id, "new")))
        .await
        .expect("load orders");
    db
}

/// Adds `shop.customers` keyed by strings `c0000..`.
pub async fn string_keyed_customers(db: &MemoryDatabase, rows: usize) {
    db.create_table(customers_table(), KeyColumn::new("code", ColumnKind::String))
        .await
        .expect("create customers");
    db.load(
        &customers_table(),
        (0..rows).map(|i| {
            Row::new()
                .with("code", format!("c{i:04}"))
                .with("name", format!("customer {i}"))
        }),
    )
    .await
    .expect("load customers");
}
