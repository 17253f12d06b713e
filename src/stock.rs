//! Branch stock: listing, manual corrections, low-stock and reorder views.
//!
//! Sales and purchases move stock through their own transactions; this
//! module is the back-office view plus the count-correction path.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::config::Session;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::Quantity;

#[derive(Debug, Clone, Serialize)]
pub struct StockRow {
    pub stock_id: i64,
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub brand_name: Option<String>,
    pub unit: String,
    pub on_hand: Quantity,
    pub min_level: Quantity,
}

pub fn list_stock(db: &DbState, branch_id: i64) -> PosResult<Vec<StockRow>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT bs.id, p.id, p.barcode, p.name, b.name, p.unit, bs.quantity, bs.min_level
         FROM branch_stock bs
         JOIN products p ON p.id = bs.product_id
         LEFT JOIN brands b ON b.id = p.brand_id
         WHERE bs.branch_id = ?1
         ORDER BY p.name",
    )?;
    let rows = stmt.query_map(params![branch_id], map_stock_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

fn map_stock_row(row: &rusqlite::Row) -> rusqlite::Result<StockRow> {
    Ok(StockRow {
        stock_id: row.get(0)?,
        product_id: row.get(1)?,
        barcode: row.get(2)?,
        name: row.get(3)?,
        brand_name: row.get(4)?,
        unit: row.get(5)?,
        on_hand: row.get(6)?,
        min_level: row.get(7)?,
    })
}

/// Set the absolute on-hand amount after a physical count.
pub fn correct_stock(
    db: &DbState,
    session: &Session,
    stock_id: i64,
    new_quantity: Quantity,
) -> PosResult<()> {
    let conn = db.lock();

    let old: Quantity = conn
        .query_row(
            "SELECT quantity FROM branch_stock WHERE id = ?1",
            params![stock_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("stock record {stock_id} not found")))?;

    conn.execute(
        "UPDATE branch_stock SET quantity = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![new_quantity, stock_id],
    )
    .map_err(|e| PosError::db("update stock", e))?;

    audit::record(
        &conn,
        Some(session.user_id),
        audit::ACTION_STOCK_CORRECTION,
        &format!("stock {stock_id}: {old} -> {new_quantity}"),
    );
    info!(stock_id, %old, new = %new_quantity, "stock corrected");
    Ok(())
}

/// Rows at or below their minimum level. Uses the branch-stock minimum when
/// set, otherwise the product's catalog minimum.
pub fn low_stock(db: &DbState, branch_id: i64) -> PosResult<Vec<StockRow>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT bs.id, p.id, p.barcode, p.name, b.name, p.unit, bs.quantity,
                CASE WHEN bs.min_level > 0 THEN bs.min_level ELSE p.min_stock_level END
         FROM branch_stock bs
         JOIN products p ON p.id = bs.product_id
         LEFT JOIN brands b ON b.id = p.brand_id
         WHERE bs.branch_id = ?1 AND p.active = 1
           AND bs.quantity <= CASE WHEN bs.min_level > 0 THEN bs.min_level
                                   ELSE p.min_stock_level END
         ORDER BY p.name",
    )?;
    let rows = stmt.query_map(params![branch_id], map_stock_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

#[derive(Debug, Clone, Serialize)]
pub struct ReorderSuggestion {
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub on_hand: Quantity,
    pub min_level: Quantity,
    /// Enough to reach twice the minimum level.
    pub suggested_order: Quantity,
}

pub fn reorder_suggestions(db: &DbState, branch_id: i64) -> PosResult<Vec<ReorderSuggestion>> {
    let rows = low_stock(db, branch_id)?;
    Ok(rows
        .into_iter()
        .filter(|r| r.min_level.hundredths() > 0)
        .map(|r| {
            let target = Quantity::from_hundredths(r.min_level.hundredths() * 2);
            ReorderSuggestion {
                product_id: r.product_id,
                barcode: r.barcode,
                name: r.name,
                on_hand: r.on_hand,
                min_level: r.min_level,
                suggested_order: target - r.on_hand,
            }
        })
        .collect())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{add_product, NewProduct};
    use crate::config::Session;
    use crate::db;
    use crate::money::Money;
    use rusqlite::Connection;

    fn test_state() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState::for_test(conn)
    }

    fn seed_product(db: &DbState, barcode: &str, name: &str, min_units: i64) -> i64 {
        add_product(
            db,
            &Session::new(1, 1),
            &NewProduct {
                barcode,
                name,
                unit: "pcs",
                brand: None,
                category: None,
                buy_price: Money::from_cents(100),
                sell_price: Money::from_cents(200),
                vat_bps: 1000,
                min_stock_level: Quantity::from_units(min_units),
            },
        )
        .expect("seed product")
    }

    #[test]
    fn test_correct_stock() {
        let db = test_state();
        seed_product(&db, "1001", "Rice 1kg", 3);

        let rows = list_stock(&db, 1).expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].on_hand, Quantity::from_units(0));

        correct_stock(&db, &Session::new(1, 1), rows[0].stock_id, Quantity::from_units(12))
            .expect("correct");

        let rows = list_stock(&db, 1).expect("list");
        assert_eq!(rows[0].on_hand, Quantity::from_units(12));

        let err = correct_stock(&db, &Session::new(1, 1), 999, Quantity::from_units(1)).unwrap_err();
        assert!(matches!(err, PosError::NotFound(_)));
    }

    #[test]
    fn test_low_stock_and_reorder() {
        let db = test_state();
        seed_product(&db, "1001", "Rice 1kg", 3);
        seed_product(&db, "1002", "Flour 1kg", 0);

        let rows = list_stock(&db, 1).expect("list");
        let rice = rows.iter().find(|r| r.name == "Rice 1kg").expect("rice");
        correct_stock(&db, &Session::new(1, 1), rice.stock_id, Quantity::from_units(2))
            .expect("correct");

        // Rice (2 <= min 3) and Flour (0 <= min 0) are both low.
        let low = low_stock(&db, 1).expect("low stock");
        assert_eq!(low.len(), 2);

        // Only rice has a positive minimum, so only it gets a suggestion:
        // target 6, on hand 2, order 4.
        let suggestions = reorder_suggestions(&db, 1).expect("reorder");
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].name, "Rice 1kg");
        assert_eq!(suggestions[0].suggested_order, Quantity::from_units(4));
    }
}
