//! Read-only reporting queries.
//!
//! Everything here aggregates persisted rows; nothing mutates. Refunded
//! sales are excluded throughout. Profit is an estimate: revenue minus the
//! product's current catalog buy price, which is the latest purchase cost.

use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;

use crate::db::DbState;
use crate::error::PosResult;
use crate::money::{Money, Quantity};
use crate::sales::STATUS_COMPLETED;

fn fmt(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// Daily sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DailySales {
    pub day: String,
    pub transactions: i64,
    pub revenue: Money,
    pub discount: Money,
}

pub fn daily_sales(
    db: &DbState,
    branch_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> PosResult<Vec<DailySales>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT date(created_at), COUNT(*), COALESCE(SUM(total_amount), 0),
                COALESCE(SUM(discount_amount + promo_discount_amount), 0)
         FROM sales
         WHERE branch_id = ?1 AND status = ?2
           AND date(created_at) BETWEEN ?3 AND ?4
         GROUP BY date(created_at)
         ORDER BY date(created_at)",
    )?;
    let rows = stmt.query_map(
        params![branch_id, STATUS_COMPLETED, fmt(from), fmt(to)],
        |row| {
            Ok(DailySales {
                day: row.get(0)?,
                transactions: row.get(1)?,
                revenue: row.get(2)?,
                discount: row.get(3)?,
            })
        },
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Best sellers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BestSeller {
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub units_sold: i64,
    pub revenue: Money,
}

fn best_sellers(
    db: &DbState,
    branch_id: i64,
    from: NaiveDate,
    to: NaiveDate,
    order_by: &str,
    limit: i64,
) -> PosResult<Vec<BestSeller>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT p.id, p.barcode, p.name, SUM(sl.quantity),
                COALESCE(SUM(sl.line_total - sl.discount_amount), 0)
         FROM sale_lines sl
         JOIN sales s ON s.id = sl.sale_id
         JOIN products p ON p.id = sl.product_id
         WHERE s.branch_id = ?1 AND s.status = ?2
           AND date(s.created_at) BETWEEN ?3 AND ?4
         GROUP BY p.id
         ORDER BY {order_by} DESC
         LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![branch_id, STATUS_COMPLETED, fmt(from), fmt(to), limit],
        |row| {
            Ok(BestSeller {
                product_id: row.get(0)?,
                barcode: row.get(1)?,
                name: row.get(2)?,
                units_sold: row.get(3)?,
                revenue: row.get(4)?,
            })
        },
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn best_sellers_by_quantity(
    db: &DbState,
    branch_id: i64,
    from: NaiveDate,
    to: NaiveDate,
    limit: i64,
) -> PosResult<Vec<BestSeller>> {
    best_sellers(db, branch_id, from, to, "SUM(sl.quantity)", limit)
}

pub fn best_sellers_by_revenue(
    db: &DbState,
    branch_id: i64,
    from: NaiveDate,
    to: NaiveDate,
    limit: i64,
) -> PosResult<Vec<BestSeller>> {
    best_sellers(
        db,
        branch_id,
        from,
        to,
        "SUM(sl.line_total - sl.discount_amount)",
        limit,
    )
}

// ---------------------------------------------------------------------------
// Profit estimate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProfitRow {
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub units_sold: i64,
    pub revenue: Money,
    pub estimated_cost: Money,
    pub estimated_profit: Money,
}

pub fn profit_estimate(
    db: &DbState,
    branch_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> PosResult<Vec<ProfitRow>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT p.id, p.barcode, p.name, SUM(sl.quantity),
                COALESCE(SUM(sl.line_total - sl.discount_amount), 0),
                COALESCE(SUM(sl.quantity * p.buy_price), 0)
         FROM sale_lines sl
         JOIN sales s ON s.id = sl.sale_id
         JOIN products p ON p.id = sl.product_id
         WHERE s.branch_id = ?1 AND s.status = ?2
           AND date(s.created_at) BETWEEN ?3 AND ?4
         GROUP BY p.id
         ORDER BY p.name",
    )?;
    let rows = stmt.query_map(
        params![branch_id, STATUS_COMPLETED, fmt(from), fmt(to)],
        |row| {
            let revenue: Money = row.get(4)?;
            let cost: Money = row.get(5)?;
            Ok(ProfitRow {
                product_id: row.get(0)?,
                barcode: row.get(1)?,
                name: row.get(2)?,
                units_sold: row.get(3)?,
                revenue,
                estimated_cost: cost,
                estimated_profit: revenue - cost,
            })
        },
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExpiringLine {
    pub purchase_id: i64,
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub quantity: Quantity,
    pub expires_on: String,
    /// Negative when already expired.
    pub days_left: i64,
}

/// Purchase lines expiring within `within_days` of `today` (already-expired
/// lines included).
pub fn expiring_purchase_lines(
    db: &DbState,
    today: NaiveDate,
    within_days: i64,
) -> PosResult<Vec<ExpiringLine>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT pl.purchase_id, pl.product_id, p.barcode, p.name, pl.quantity, pl.expires_on,
                CAST(julianday(pl.expires_on) - julianday(?1) AS INTEGER)
         FROM purchase_lines pl
         JOIN products p ON p.id = pl.product_id
         WHERE pl.expires_on IS NOT NULL
           AND julianday(pl.expires_on) - julianday(?1) <= ?2
         ORDER BY pl.expires_on",
    )?;
    let rows = stmt.query_map(params![fmt(today), within_days], |row| {
        Ok(ExpiringLine {
            purchase_id: row.get(0)?,
            product_id: row.get(1)?,
            barcode: row.get(2)?,
            name: row.get(3)?,
            quantity: row.get(4)?,
            expires_on: row.get(5)?,
            days_left: row.get(6)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

    fn test_state() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        DbState::for_test(conn)
    }

    fn seed_product(db: &DbState, id: i64, name: &str, buy_cents: i64) {
        let conn = db.lock();
        conn.execute(
            "INSERT INTO products (id, barcode, name, buy_price, sell_price)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![id, format!("bc-{id}"), name, buy_cents],
        )
        .expect("seed product");
    }

    fn seed_sale(db: &DbState, status: &str, created_at: &str, lines: &[(i64, i64, i64)]) {
        let conn = db.lock();
        let total: i64 = lines.iter().map(|(_, qty, price)| qty * price).sum();
        conn.execute(
            "INSERT INTO sales (branch_id, total_amount, status, created_at)
             VALUES (1, ?1, ?2, ?3)",
            params![total, status, created_at],
        )
        .expect("seed sale");
        let sale_id = conn.last_insert_rowid();
        for (product_id, qty, price) in lines {
            conn.execute(
                "INSERT INTO sale_lines (sale_id, product_id, quantity, unit_price, line_total)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sale_id, product_id, qty, price, qty * price],
            )
            .expect("seed line");
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    #[test]
    fn test_daily_sales_groups_and_excludes_refunds() {
        let db = test_state();
        seed_product(&db, 1, "Cola", 1000);
        seed_sale(&db, "completed", "2026-08-01 09:00:00", &[(1, 2, 2500)]);
        seed_sale(&db, "completed", "2026-08-01 17:00:00", &[(1, 1, 2500)]);
        seed_sale(&db, "completed", "2026-08-02 10:00:00", &[(1, 1, 2500)]);
        seed_sale(&db, "refunded", "2026-08-02 11:00:00", &[(1, 4, 2500)]);

        let rows = daily_sales(&db, 1, date("2026-08-01"), date("2026-08-02")).expect("daily");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].day, "2026-08-01");
        assert_eq!(rows[0].transactions, 2);
        assert_eq!(rows[0].revenue, Money::from_cents(7500));
        assert_eq!(rows[1].revenue, Money::from_cents(2500));
    }

    #[test]
    fn test_best_sellers_orderings() {
        let db = test_state();
        seed_product(&db, 1, "Gum", 20);
        seed_product(&db, 2, "Caviar", 50_000);
        // gum: 30 units at 0.50; caviar: 1 unit at 700.00
        seed_sale(&db, "completed", "2026-08-01 09:00:00", &[(1, 30, 50), (2, 1, 70_000)]);

        let by_qty =
            best_sellers_by_quantity(&db, 1, date("2026-08-01"), date("2026-08-01"), 5).expect("qty");
        assert_eq!(by_qty[0].name, "Gum");
        assert_eq!(by_qty[0].units_sold, 30);

        let by_rev =
            best_sellers_by_revenue(&db, 1, date("2026-08-01"), date("2026-08-01"), 5).expect("rev");
        assert_eq!(by_rev[0].name, "Caviar");
        assert_eq!(by_rev[0].revenue, Money::from_cents(70_000));
    }

    #[test]
    fn test_profit_estimate_uses_buy_price() {
        let db = test_state();
        seed_product(&db, 1, "Cola", 1500);
        seed_sale(&db, "completed", "2026-08-01 09:00:00", &[(1, 4, 2500)]);

        let rows = profit_estimate(&db, 1, date("2026-08-01"), date("2026-08-01")).expect("profit");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revenue, Money::from_cents(10_000));
        assert_eq!(rows[0].estimated_cost, Money::from_cents(6_000));
        assert_eq!(rows[0].estimated_profit, Money::from_cents(4_000));
    }

    #[test]
    fn test_expiring_lines_window() {
        let db = test_state();
        seed_product(&db, 1, "Yogurt", 500);
        {
            let conn = db.lock();
            conn.execute("INSERT INTO purchases (id) VALUES (1)", [])
                .expect("purchase");
            for (expiry, qty) in [("2026-08-30", 10), ("2026-09-20", 5), ("2026-08-20", 2)] {
                conn.execute(
                    "INSERT INTO purchase_lines (purchase_id, product_id, quantity, unit_cost, expires_on)
                     VALUES (1, 1, ?1, 500, ?2)",
                    params![Quantity::from_units(qty), expiry],
                )
                .expect("line");
            }
        }

        // within 7 days of Aug 26: the Aug 30 batch and the already-expired
        // Aug 20 batch, not the Sep 20 one
        let rows = expiring_purchase_lines(&db, date("2026-08-26"), 7).expect("expiring");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].expires_on, "2026-08-20");
        assert_eq!(rows[0].days_left, -6);
        assert_eq!(rows[1].expires_on, "2026-08-30");
        assert_eq!(rows[1].days_left, 4);
    }
}
