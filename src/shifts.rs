//! Shift lifecycle and cash-drawer reconciliation.
//!
//! One open shift per user. Closing recomputes every figure from the
//! persisted sales and customer payments tagged with the shift, never from
//! anything the UI accumulated. Expected drawer cash is the opening float
//! plus cash sales plus cash received against customer balances; the
//! variance against the counted amount is signed and informational, it
//! never blocks the close. A closed shift is terminal.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::{Money, ZERO};
use crate::sales::STATUS_COMPLETED;

#[derive(Debug, Clone, Serialize)]
pub struct Shift {
    pub id: i64,
    pub user_id: i64,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub opening_cash: Money,
    pub closing_cash: Option<Money>,
    pub total_sales: Option<Money>,
    pub cash_sales: Option<Money>,
    pub card_sales: Option<Money>,
    pub credit_sales: Option<Money>,
    pub total_discount: Option<Money>,
    pub cash_received: Option<Money>,
    pub card_received: Option<Money>,
    pub variance: Option<Money>,
    pub notes: Option<String>,
    pub active: bool,
}

fn map_shift_row(row: &rusqlite::Row) -> rusqlite::Result<Shift> {
    Ok(Shift {
        id: row.get(0)?,
        user_id: row.get(1)?,
        started_at: row.get(2)?,
        ended_at: row.get(3)?,
        opening_cash: row.get(4)?,
        closing_cash: row.get(5)?,
        total_sales: row.get(6)?,
        cash_sales: row.get(7)?,
        card_sales: row.get(8)?,
        credit_sales: row.get(9)?,
        total_discount: row.get(10)?,
        cash_received: row.get(11)?,
        card_received: row.get(12)?,
        variance: row.get(13)?,
        notes: row.get(14)?,
        active: row.get(15)?,
    })
}

const SHIFT_COLUMNS: &str = "id, user_id, started_at, ended_at, opening_cash, closing_cash,
                             total_sales, cash_sales, card_sales, credit_sales, total_discount,
                             cash_received, card_received, variance, notes, active";

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub fn start_shift(db: &DbState, user_id: i64, opening_cash: Money) -> PosResult<i64> {
    if opening_cash.is_negative() {
        return Err(PosError::validation("opening cash cannot be negative"));
    }

    let conn = db.lock();

    let open: Option<i64> = conn
        .query_row(
            "SELECT id FROM shifts WHERE user_id = ?1 AND active = 1",
            params![user_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(open_id) = open {
        return Err(PosError::conflict(format!(
            "user already has an open shift (id {open_id})"
        )));
    }

    conn.execute(
        "INSERT INTO shifts (user_id, opening_cash) VALUES (?1, ?2)",
        params![user_id, opening_cash],
    )
    .map_err(|e| PosError::db("insert shift", e))?;

    let shift_id = conn.last_insert_rowid();
    audit::record(
        &conn,
        Some(user_id),
        audit::ACTION_SHIFT_START,
        &format!("shift {shift_id} opened with float {opening_cash}"),
    );
    info!(shift_id, user_id, opening_cash = %opening_cash, "shift started");
    Ok(shift_id)
}

pub fn active_shift(db: &DbState, user_id: i64) -> PosResult<Option<Shift>> {
    let conn = db.lock();
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE user_id = ?1 AND active = 1"),
        params![user_id],
        map_shift_row,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_shift(db: &DbState, shift_id: i64) -> PosResult<Shift> {
    let conn = db.lock();
    conn.query_row(
        &format!("SELECT {SHIFT_COLUMNS} FROM shifts WHERE id = ?1"),
        params![shift_id],
        map_shift_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("shift {shift_id} not found")))
}

// ---------------------------------------------------------------------------
// Close + reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ShiftSummary {
    pub total_sales: Money,
    pub cash_sales: Money,
    pub card_sales: Money,
    pub credit_sales: Money,
    pub total_discount: Money,
    pub cash_received: Money,
    pub card_received: Money,
}

/// Recompute the shift's figures from persisted rows. Refunded sales drop
/// out because their payments are no longer 'completed'.
fn summarize(conn: &Connection, shift_id: i64) -> PosResult<ShiftSummary> {
    let sum_payments = |method: &str| -> PosResult<Money> {
        conn.query_row(
            "SELECT COALESCE(SUM(p.amount), 0)
             FROM payments p
             JOIN sales s ON s.id = p.sale_id
             WHERE s.shift_id = ?1 AND p.method = ?2 AND p.status = ?3",
            params![shift_id, method, STATUS_COMPLETED],
            |row| row.get(0),
        )
        .map_err(|e| PosError::db("sum shift payments", e))
    };

    let cash_sales = sum_payments("cash")?;
    let card_sales = sum_payments("card")?;
    let credit_sales = sum_payments("store_credit")?;

    let (total_sales, total_discount): (Money, Money) = conn
        .query_row(
            "SELECT COALESCE(SUM(total_amount), 0),
                    COALESCE(SUM(discount_amount + promo_discount_amount), 0)
             FROM sales WHERE shift_id = ?1 AND status = ?2",
            params![shift_id, STATUS_COMPLETED],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| PosError::db("sum shift sales", e))?;

    let sum_received = |method: &str| -> PosResult<Money> {
        conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM customer_payments
             WHERE shift_id = ?1 AND method = ?2",
            params![shift_id, method],
            |row| row.get(0),
        )
        .map_err(|e| PosError::db("sum received payments", e))
    };

    Ok(ShiftSummary {
        total_sales,
        cash_sales,
        card_sales,
        credit_sales,
        total_discount,
        cash_received: sum_received("cash")?,
        card_received: sum_received("card")?,
    })
}

/// Live view of an open shift's numbers, for the drawer screen.
pub fn shift_summary(db: &DbState, shift_id: i64) -> PosResult<ShiftSummary> {
    get_shift(db, shift_id)?;
    let conn = db.lock();
    summarize(&conn, shift_id)
}

/// Close a shift. `counted_cash` is the operator's drawer count; when it is
/// not supplied the variance is recorded as zero.
pub fn end_shift(
    db: &DbState,
    shift_id: i64,
    counted_cash: Option<Money>,
    notes: Option<&str>,
) -> PosResult<Shift> {
    let conn = db.lock();

    let row: Option<(i64, Money, bool)> = conn
        .query_row(
            "SELECT user_id, opening_cash, active FROM shifts WHERE id = ?1",
            params![shift_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((user_id, opening_cash, active)) = row else {
        return Err(PosError::not_found(format!("shift {shift_id} not found")));
    };
    if !active {
        return Err(PosError::conflict(format!("shift {shift_id} is already closed")));
    }

    let summary = summarize(&conn, shift_id)?;
    let expected_cash = opening_cash + summary.cash_sales + summary.cash_received;
    let variance = match counted_cash {
        Some(counted) => counted - expected_cash,
        None => ZERO,
    };

    conn.execute(
        "UPDATE shifts SET
            ended_at = datetime('now'),
            closing_cash = ?1,
            total_sales = ?2,
            cash_sales = ?3,
            card_sales = ?4,
            credit_sales = ?5,
            total_discount = ?6,
            cash_received = ?7,
            card_received = ?8,
            variance = ?9,
            notes = ?10,
            active = 0
         WHERE id = ?11",
        params![
            counted_cash,
            summary.total_sales,
            summary.cash_sales,
            summary.card_sales,
            summary.credit_sales,
            summary.total_discount,
            summary.cash_received,
            summary.card_received,
            variance,
            notes,
            shift_id,
        ],
    )
    .map_err(|e| PosError::db("close shift", e))?;

    audit::record(
        &conn,
        Some(user_id),
        audit::ACTION_SHIFT_END,
        &format!("shift {shift_id} closed, expected {expected_cash}, variance {variance}"),
    );
    info!(
        shift_id,
        expected = %expected_cash,
        variance = %variance,
        "shift closed"
    );
    drop(conn);

    get_shift(db, shift_id)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{add_product, search_products, NewProduct};
    use crate::config::{PosConfig, Session};
    use crate::customers;
    use crate::db;
    use crate::money::Quantity;
    use crate::sales::{finalize_sale, refund_sale, PaymentInput, PaymentMethod, SaleOptions};
    use rusqlite::Connection;

    fn test_state() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::run_migrations_for_test(&conn);
        conn.execute(
            "INSERT INTO users (id, username, password_hash) VALUES (1, 'kasa1', 'x')",
            [],
        )
        .expect("seed user");
        DbState::for_test(conn)
    }

    fn seed_product(db: &DbState, barcode: &str, price_cents: i64) {
        let id = add_product(
            db,
            &Session::new(1, 1),
            &NewProduct {
                barcode,
                name: &format!("Item {barcode}"),
                unit: "pcs",
                brand: None,
                category: None,
                buy_price: Money::from_cents(price_cents / 2),
                sell_price: Money::from_cents(price_cents),
                vat_bps: 1000,
                min_stock_level: Quantity::from_units(0),
            },
        )
        .expect("seed product");
        let conn = db.lock();
        conn.execute(
            "UPDATE branch_stock SET quantity = ?1 WHERE product_id = ?2",
            params![Quantity::from_units(100), id],
        )
        .expect("seed stock");
    }

    fn sell(
        db: &DbState,
        session: &Session,
        barcode: &str,
        qty: i64,
        payments: &[PaymentInput],
    ) -> i64 {
        let mut cart = crate::cart::Cart::new();
        let hits = search_products(db, 1, barcode).expect("search");
        cart.add(&hits[0], qty).expect("add");
        finalize_sale(
            db,
            &PosConfig::default(),
            session,
            &cart,
            payments,
            &SaleOptions::default(),
        )
        .expect("finalize")
    }

    #[test]
    fn test_single_open_shift_per_user() {
        let db = test_state();
        start_shift(&db, 1, Money::from_cents(10_000)).expect("start");

        let err = start_shift(&db, 1, Money::from_cents(5_000)).unwrap_err();
        assert!(matches!(err, PosError::Conflict(_)));

        assert!(active_shift(&db, 1).expect("active").is_some());
        assert!(active_shift(&db, 2).expect("active").is_none());
    }

    #[test]
    fn test_variance_zero_when_count_matches() {
        let db = test_state();
        seed_product(&db, "4001", 2500);

        let shift_id = start_shift(&db, 1, Money::from_cents(10_000)).expect("start");
        let session = Session::new(1, 1).with_shift(shift_id);

        // 2 x 25.00 cash
        sell(
            &db,
            &session,
            "4001",
            2,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(5000),
            }],
        );

        // expected = 100.00 float + 50.00 cash sales
        let shift =
            end_shift(&db, shift_id, Some(Money::from_cents(15_000)), None).expect("end shift");
        assert!(!shift.active);
        assert_eq!(shift.cash_sales, Some(Money::from_cents(5000)));
        assert_eq!(shift.variance, Some(ZERO));
    }

    #[test]
    fn test_variance_is_signed() {
        let db = test_state();
        seed_product(&db, "4001", 2500);

        let shift_id = start_shift(&db, 1, Money::from_cents(10_000)).expect("start");
        let session = Session::new(1, 1).with_shift(shift_id);
        sell(
            &db,
            &session,
            "4001",
            1,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(2500),
            }],
        );

        // expected 125.00, counted 120.00 -> short by 5.00
        let shift = end_shift(&db, shift_id, Some(Money::from_cents(12_000)), Some("short"))
            .expect("end shift");
        assert_eq!(shift.variance, Some(Money::from_cents(-500)));
        assert_eq!(shift.notes.as_deref(), Some("short"));
    }

    #[test]
    fn test_breakdown_by_method_and_customer_payments() {
        let db = test_state();
        seed_product(&db, "4001", 10_000);
        let customer_id = customers::add_customer(&db, "Ali", None, None).expect("customer");

        let shift_id = start_shift(&db, 1, ZERO).expect("start");
        let session = Session::new(1, 1).with_shift(shift_id);

        let mut cart = crate::cart::Cart::new();
        let hits = search_products(&db, 1, "4001").expect("search");
        cart.add(&hits[0], 1).expect("add");
        finalize_sale(
            &db,
            &PosConfig::default(),
            &session,
            &cart,
            &[
                PaymentInput {
                    method: PaymentMethod::Cash,
                    amount: Money::from_cents(4000),
                },
                PaymentInput {
                    method: PaymentMethod::Card,
                    amount: Money::from_cents(3000),
                },
                PaymentInput {
                    method: PaymentMethod::StoreCredit,
                    amount: Money::from_cents(3000),
                },
            ],
            &SaleOptions {
                customer_id: Some(customer_id),
                ..Default::default()
            },
        )
        .expect("finalize");

        customers::record_payment(
            &db,
            &session,
            customer_id,
            Money::from_cents(1500),
            PaymentMethod::Cash,
            None,
        )
        .expect("customer payment");

        let summary = shift_summary(&db, shift_id).expect("summary");
        assert_eq!(summary.total_sales, Money::from_cents(10_000));
        assert_eq!(summary.cash_sales, Money::from_cents(4000));
        assert_eq!(summary.card_sales, Money::from_cents(3000));
        assert_eq!(summary.credit_sales, Money::from_cents(3000));
        assert_eq!(summary.cash_received, Money::from_cents(1500));

        // expected = 0 + 40.00 + 15.00 = 55.00; counted 55.00 -> variance 0
        let shift = end_shift(&db, shift_id, Some(Money::from_cents(5500)), None).expect("end");
        assert_eq!(shift.variance, Some(ZERO));
    }

    #[test]
    fn test_refunded_sale_drops_out_of_reconciliation() {
        let db = test_state();
        seed_product(&db, "4001", 2500);

        let shift_id = start_shift(&db, 1, ZERO).expect("start");
        let session = Session::new(1, 1).with_shift(shift_id);

        let sale_id = sell(
            &db,
            &session,
            "4001",
            1,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(2500),
            }],
        );
        refund_sale(&db, &session, sale_id, "test", None).expect("refund");

        let summary = shift_summary(&db, shift_id).expect("summary");
        assert_eq!(summary.total_sales, ZERO);
        assert_eq!(summary.cash_sales, ZERO);
    }

    #[test]
    fn test_close_is_terminal() {
        let db = test_state();
        let shift_id = start_shift(&db, 1, ZERO).expect("start");
        end_shift(&db, shift_id, None, None).expect("end");

        let err = end_shift(&db, shift_id, None, None).unwrap_err();
        assert!(matches!(err, PosError::Conflict(_)));

        let err = end_shift(&db, 999, None, None).unwrap_err();
        assert!(matches!(err, PosError::NotFound(_)));

        // a new shift can start now
        start_shift(&db, 1, ZERO).expect("restart");
    }

    #[test]
    fn test_close_without_count_records_zero_variance() {
        let db = test_state();
        let shift_id = start_shift(&db, 1, Money::from_cents(5000)).expect("start");
        let shift = end_shift(&db, shift_id, None, None).expect("end");
        assert_eq!(shift.closing_cash, None);
        assert_eq!(shift.variance, Some(ZERO));
    }
}
