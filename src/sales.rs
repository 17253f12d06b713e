//! Sale finalization and refunds.
//!
//! `finalize_sale` turns a cart plus payments into persistent rows in one
//! BEGIN IMMEDIATE transaction: sale header, lines, stock decrements,
//! payments, store-credit balance, loyalty points, coupon consumption.
//! Either everything lands or nothing does. `refund_sale` is the symmetric
//! reversal of a completed sale.
//!
//! Stock policy: a missing stock row never blocks a sale. The decrement
//! inserts a negative-quantity row instead, which surfaces the count error
//! in the stock screens rather than at the register.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit;
use crate::cart::Cart;
use crate::config::{PosConfig, Session};
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::{Money, Quantity};

pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_REFUNDED: &str = "refunded";

// ---------------------------------------------------------------------------
// Payment types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    /// "Veresiye": the amount is added to the customer's account balance
    /// and collected later.
    StoreCredit,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::StoreCredit => "store_credit",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PaymentInput {
    pub method: PaymentMethod,
    pub amount: Money,
}

/// Optional extras attached to a finalize call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaleOptions {
    pub customer_id: Option<i64>,
    /// Order-level discount, on top of any line discounts already inside
    /// the cart totals.
    pub order_discount: Money,
    pub promotion_discount: Money,
    pub promotion_id: Option<i64>,
    /// `customer_coupons` row redeemed with this sale.
    pub customer_coupon_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

pub fn finalize_sale(
    db: &DbState,
    cfg: &PosConfig,
    session: &Session,
    cart: &Cart,
    payments: &[PaymentInput],
    opts: &SaleOptions,
) -> PosResult<i64> {
    if cart.is_empty() {
        return Err(PosError::validation("cart is empty"));
    }
    for p in payments {
        if !p.amount.is_positive() {
            return Err(PosError::validation("payment amounts must be positive"));
        }
    }

    let store_credit: Money = payments
        .iter()
        .filter(|p| p.method == PaymentMethod::StoreCredit)
        .map(|p| p.amount)
        .sum();
    if store_credit.is_positive() && opts.customer_id.is_none() {
        return Err(PosError::validation(
            "store-credit payment requires a customer on the sale",
        ));
    }

    let totals = cart.totals();

    let conn = db.lock();
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<i64> {
        conn.execute(
            "INSERT INTO sales
                (branch_id, customer_id, user_id, shift_id, total_amount,
                 discount_amount, promo_discount_amount, coupon_id, promotion_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.branch_id,
                opts.customer_id,
                session.user_id,
                session.shift_id,
                totals.grand_total,
                opts.order_discount,
                opts.promotion_discount,
                opts.customer_coupon_id,
                opts.promotion_id,
                STATUS_COMPLETED,
            ],
        )
        .map_err(|e| PosError::db("insert sale", e))?;
        let sale_id = conn.last_insert_rowid();

        for line in cart.lines() {
            conn.execute(
                "INSERT INTO sale_lines
                    (sale_id, product_id, quantity, unit_price, line_total, discount_amount)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sale_id,
                    line.product_id,
                    line.quantity,
                    line.unit_price,
                    line.gross_total(),
                    line.discount,
                ],
            )
            .map_err(|e| PosError::db("insert sale line", e))?;

            let sold = Quantity::from_units(line.quantity);
            let changed = conn
                .execute(
                    "UPDATE branch_stock
                     SET quantity = quantity - ?1, updated_at = datetime('now')
                     WHERE product_id = ?2 AND branch_id = ?3",
                    params![sold, line.product_id, session.branch_id],
                )
                .map_err(|e| PosError::db("decrement stock", e))?;
            if changed == 0 {
                conn.execute(
                    "INSERT INTO branch_stock (product_id, branch_id, quantity)
                     VALUES (?1, ?2, ?3)",
                    params![line.product_id, session.branch_id, -sold],
                )
                .map_err(|e| PosError::db("insert negative stock", e))?;
                warn!(
                    product_id = line.product_id,
                    branch_id = session.branch_id,
                    "sold without a stock record, created negative row"
                );
            }
        }

        for p in payments {
            conn.execute(
                "INSERT INTO payments (sale_id, method, amount, status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![sale_id, p.method.as_str(), p.amount, STATUS_COMPLETED],
            )
            .map_err(|e| PosError::db("insert payment", e))?;
        }

        if store_credit.is_positive() {
            // validated above
            let customer_id = opts.customer_id.unwrap_or_default();
            let changed = conn
                .execute(
                    "UPDATE customers SET balance = balance + ?1 WHERE id = ?2",
                    params![store_credit, customer_id],
                )
                .map_err(|e| PosError::db("update customer balance", e))?;
            if changed == 0 {
                return Err(PosError::not_found(format!(
                    "customer {customer_id} not found"
                )));
            }
        }

        // Loyalty points on the net amount. A failure here is logged and
        // swallowed: the sale must not die over a points update.
        if let Some(customer_id) = opts.customer_id {
            let net = totals.grand_total - opts.order_discount - opts.promotion_discount;
            let points = net.loyalty_points(cfg.loyalty_rate_bps);
            if points > 0 {
                let res = conn.execute(
                    "UPDATE customers SET loyalty_points = loyalty_points + ?1 WHERE id = ?2",
                    params![points, customer_id],
                );
                match res {
                    Ok(_) => info!(sale_id, customer_id, points, "loyalty points awarded"),
                    Err(e) => warn!(sale_id, customer_id, "loyalty update failed: {e}"),
                }
            }
        }

        if let Some(cc_id) = opts.customer_coupon_id {
            let changed = conn
                .execute(
                    "UPDATE customer_coupons
                     SET status = 'used', used_sale_id = ?1, used_at = datetime('now')
                     WHERE id = ?2 AND status = 'usable'",
                    params![sale_id, cc_id],
                )
                .map_err(|e| PosError::db("mark coupon used", e))?;
            if changed == 0 {
                warn!(sale_id, customer_coupon_id = cc_id, "coupon was not usable, left untouched");
            }
        }

        Ok(sale_id)
    })();

    match result {
        Ok(sale_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            audit::record(
                &conn,
                Some(session.user_id),
                audit::ACTION_SALE_COMPLETE,
                &format!("sale {sale_id} total {}", totals.grand_total),
            );
            info!(
                sale_id,
                branch_id = session.branch_id,
                total = %totals.grand_total,
                "sale finalized"
            );
            Ok(sale_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Refund
// ---------------------------------------------------------------------------

pub fn refund_sale(
    db: &DbState,
    session: &Session,
    sale_id: i64,
    reason: &str,
    notes: Option<&str>,
) -> PosResult<i64> {
    let conn = db.lock();

    let header: Option<(i64, Option<i64>, Money, String, Option<i64>)> = conn
        .query_row(
            "SELECT branch_id, customer_id, total_amount, status, coupon_id
             FROM sales WHERE id = ?1",
            params![sale_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            },
        )
        .optional()?;

    let Some((branch_id, customer_id, total, status, coupon_id)) = header else {
        return Err(PosError::not_found(format!("sale {sale_id} not found")));
    };
    if status == STATUS_REFUNDED {
        return Err(PosError::conflict(format!("sale {sale_id} is already refunded")));
    }
    if status != STATUS_COMPLETED {
        return Err(PosError::conflict(format!(
            "sale {sale_id} has status '{status}' and cannot be refunded"
        )));
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<i64> {
        conn.execute(
            "INSERT INTO refunds (sale_id, user_id, amount, reason, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sale_id, session.user_id, total, reason, notes],
        )
        .map_err(|e| PosError::db("insert refund", e))?;
        let refund_id = conn.last_insert_rowid();

        // Put every line's quantity back. A line whose stock row vanished
        // since the sale is skipped, matching the decrement policy.
        let mut stmt = conn
            .prepare("SELECT product_id, quantity FROM sale_lines WHERE sale_id = ?1")
            .map_err(|e| PosError::db("prepare sale lines", e))?;
        let lines: Vec<(i64, i64)> = stmt
            .query_map(params![sale_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| PosError::db("read sale lines", e))?
            .collect::<Result<_, _>>()
            .map_err(|e| PosError::db("collect sale lines", e))?;

        for (product_id, quantity) in lines {
            conn.execute(
                "UPDATE branch_stock
                 SET quantity = quantity + ?1, updated_at = datetime('now')
                 WHERE product_id = ?2 AND branch_id = ?3",
                params![Quantity::from_units(quantity), product_id, branch_id],
            )
            .map_err(|e| PosError::db("restore stock", e))?;
        }

        // Reverse the store-credit part of the payment mix.
        let store_credit: Money = conn
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM payments
                 WHERE sale_id = ?1 AND method = 'store_credit' AND status = ?2",
                params![sale_id, STATUS_COMPLETED],
                |row| row.get(0),
            )
            .map_err(|e| PosError::db("sum store credit", e))?;
        if store_credit.is_positive() {
            let Some(customer_id) = customer_id else {
                return Err(PosError::Conflict(format!(
                    "sale {sale_id} has store-credit payments but no customer"
                )));
            };
            conn.execute(
                "UPDATE customers SET balance = balance - ?1 WHERE id = ?2",
                params![store_credit, customer_id],
            )
            .map_err(|e| PosError::db("reverse customer balance", e))?;
        }

        if let Some(cc_id) = coupon_id {
            conn.execute(
                "UPDATE customer_coupons
                 SET status = 'usable', used_sale_id = NULL, used_at = NULL
                 WHERE id = ?1",
                params![cc_id],
            )
            .map_err(|e| PosError::db("restore coupon", e))?;
        }

        conn.execute(
            "UPDATE sales SET status = ?1 WHERE id = ?2",
            params![STATUS_REFUNDED, sale_id],
        )
        .map_err(|e| PosError::db("update sale status", e))?;
        conn.execute(
            "UPDATE payments SET status = ?1 WHERE sale_id = ?2",
            params![STATUS_REFUNDED, sale_id],
        )
        .map_err(|e| PosError::db("update payment status", e))?;

        Ok(refund_id)
    })();

    match result {
        Ok(refund_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            audit::record(
                &conn,
                Some(session.user_id),
                audit::ACTION_SALE_REFUND,
                &format!("refund {refund_id} for sale {sale_id}, amount {total}"),
            );
            info!(refund_id, sale_id, amount = %total, "sale refunded");
            Ok(refund_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SaleHeader {
    pub id: i64,
    pub branch_id: i64,
    pub customer_id: Option<i64>,
    pub user_id: Option<i64>,
    pub shift_id: Option<i64>,
    pub total_amount: Money,
    pub discount_amount: Money,
    pub promo_discount_amount: Money,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleLine {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub line_total: Money,
    pub discount_amount: Money,
}

#[derive(Debug, Clone, Serialize)]
pub struct SalePayment {
    pub method: String,
    pub amount: Money,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaleDetail {
    pub header: SaleHeader,
    pub lines: Vec<SaleLine>,
    pub payments: Vec<SalePayment>,
}

pub fn get_sale(db: &DbState, sale_id: i64) -> PosResult<SaleDetail> {
    let conn = db.lock();

    let header = conn
        .query_row(
            "SELECT id, branch_id, customer_id, user_id, shift_id, total_amount,
                    discount_amount, promo_discount_amount, status, created_at
             FROM sales WHERE id = ?1",
            params![sale_id],
            |row| {
                Ok(SaleHeader {
                    id: row.get(0)?,
                    branch_id: row.get(1)?,
                    customer_id: row.get(2)?,
                    user_id: row.get(3)?,
                    shift_id: row.get(4)?,
                    total_amount: row.get(5)?,
                    discount_amount: row.get(6)?,
                    promo_discount_amount: row.get(7)?,
                    status: row.get(8)?,
                    created_at: row.get(9)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("sale {sale_id} not found")))?;

    let mut stmt = conn.prepare(
        "SELECT sl.product_id, p.name, sl.quantity, sl.unit_price, sl.line_total,
                sl.discount_amount
         FROM sale_lines sl
         JOIN products p ON p.id = sl.product_id
         WHERE sl.sale_id = ?1
         ORDER BY sl.id",
    )?;
    let lines = stmt
        .query_map(params![sale_id], |row| {
            Ok(SaleLine {
                product_id: row.get(0)?,
                product_name: row.get(1)?,
                quantity: row.get(2)?,
                unit_price: row.get(3)?,
                line_total: row.get(4)?,
                discount_amount: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT method, amount, status FROM payments WHERE sale_id = ?1 ORDER BY id",
    )?;
    let payments = stmt
        .query_map(params![sale_id], |row| {
            Ok(SalePayment {
                method: row.get(0)?,
                amount: row.get(1)?,
                status: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SaleDetail {
        header,
        lines,
        payments,
    })
}

/// Most recent sales at a branch, for the refund/lookup screen.
pub fn list_recent(db: &DbState, branch_id: i64, limit: i64) -> PosResult<Vec<SaleHeader>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, branch_id, customer_id, user_id, shift_id, total_amount,
                discount_amount, promo_discount_amount, status, created_at
         FROM sales WHERE branch_id = ?1
         ORDER BY id DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![branch_id, limit], |row| {
        Ok(SaleHeader {
            id: row.get(0)?,
            branch_id: row.get(1)?,
            customer_id: row.get(2)?,
            user_id: row.get(3)?,
            shift_id: row.get(4)?,
            total_amount: row.get(5)?,
            discount_amount: row.get(6)?,
            promo_discount_amount: row.get(7)?,
            status: row.get(8)?,
            created_at: row.get(9)?,
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
    use crate::catalog::{add_product, search_products, NewProduct};
    use crate::db;
    use crate::money::ZERO;
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

    fn session() -> Session {
        Session::new(1, 1)
    }

    fn cfg() -> PosConfig {
        PosConfig::default()
    }

    fn seed_product(db: &DbState, barcode: &str, price_cents: i64, stock_units: i64) -> i64 {
        let id = add_product(
            db,
            &session(),
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
            "UPDATE branch_stock SET quantity = ?1 WHERE product_id = ?2 AND branch_id = 1",
            params![Quantity::from_units(stock_units), id],
        )
        .expect("seed stock");
        id
    }

    fn seed_customer(db: &DbState, name: &str) -> i64 {
        let conn = db.lock();
        conn.execute("INSERT INTO customers (name) VALUES (?1)", params![name])
            .expect("seed customer");
        conn.last_insert_rowid()
    }

    fn cart_with(db: &DbState, barcode: &str, qty: i64) -> Cart {
        let mut cart = Cart::new();
        let hits = search_products(db, 1, barcode).expect("search");
        cart.add(&hits[0], qty).expect("add to cart");
        cart
    }

    fn stock_of(db: &DbState, product_id: i64) -> Quantity {
        let conn = db.lock();
        conn.query_row(
            "SELECT quantity FROM branch_stock WHERE product_id = ?1 AND branch_id = 1",
            params![product_id],
            |r| r.get(0),
        )
        .expect("stock row")
    }

    fn balance_of(db: &DbState, customer_id: i64) -> Money {
        let conn = db.lock();
        conn.query_row(
            "SELECT balance FROM customers WHERE id = ?1",
            params![customer_id],
            |r| r.get(0),
        )
        .expect("customer row")
    }

    #[test]
    fn test_finalize_cash_sale() {
        let db = test_state();
        let product_id = seed_product(&db, "3001", 2500, 10);
        let cart = cart_with(&db, "3001", 2);

        let sale_id = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(5000),
            }],
            &SaleOptions::default(),
        )
        .expect("finalize");

        let detail = get_sale(&db, sale_id).expect("get sale");
        assert_eq!(detail.header.status, STATUS_COMPLETED);
        assert_eq!(detail.header.total_amount, Money::from_cents(5000));
        assert_eq!(detail.lines.len(), 1);
        assert_eq!(detail.lines[0].quantity, 2);
        assert_eq!(detail.payments.len(), 1);
        assert_eq!(detail.payments[0].method, "cash");

        assert_eq!(stock_of(&db, product_id), Quantity::from_units(8));
    }

    #[test]
    fn test_empty_cart_is_rejected() {
        let db = test_state();
        let err = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &Cart::new(),
            &[],
            &SaleOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
    }

    #[test]
    fn test_store_credit_updates_balance_and_points() {
        let db = test_state();
        seed_product(&db, "3001", 12_500, 10);
        let customer_id = seed_customer(&db, "Ali");
        let cart = cart_with(&db, "3001", 2); // total 250.00

        finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::StoreCredit,
                amount: Money::from_cents(25_000),
            }],
            &SaleOptions {
                customer_id: Some(customer_id),
                ..Default::default()
            },
        )
        .expect("finalize");

        assert_eq!(balance_of(&db, customer_id), Money::from_cents(25_000));

        // 250.00 at 0.01 points per unit -> 2 points
        let conn = db.lock();
        let points: i64 = conn
            .query_row(
                "SELECT loyalty_points FROM customers WHERE id = ?1",
                params![customer_id],
                |r| r.get(0),
            )
            .expect("points");
        assert_eq!(points, 2);
    }

    #[test]
    fn test_store_credit_without_customer_leaves_nothing_behind() {
        let db = test_state();
        let product_id = seed_product(&db, "3001", 1000, 5);
        let cart = cart_with(&db, "3001", 1);

        let err = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::StoreCredit,
                amount: Money::from_cents(1000),
            }],
            &SaleOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));

        let conn = db.lock();
        let sales: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales", [], |r| r.get(0))
            .expect("count");
        let payments: i64 = conn
            .query_row("SELECT COUNT(*) FROM payments", [], |r| r.get(0))
            .expect("count");
        assert_eq!(sales, 0);
        assert_eq!(payments, 0);
        drop(conn);
        assert_eq!(stock_of(&db, product_id), Quantity::from_units(5));
    }

    #[test]
    fn test_missing_customer_rolls_back_whole_sale() {
        let db = test_state();
        let product_id = seed_product(&db, "3001", 1000, 5);
        let cart = cart_with(&db, "3001", 1);

        let err = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::StoreCredit,
                amount: Money::from_cents(1000),
            }],
            &SaleOptions {
                customer_id: Some(999),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, PosError::NotFound(_)));

        // the transaction rolled back the lines and stock decrement too
        let conn = db.lock();
        let lines: i64 = conn
            .query_row("SELECT COUNT(*) FROM sale_lines", [], |r| r.get(0))
            .expect("count");
        assert_eq!(lines, 0);
        drop(conn);
        assert_eq!(stock_of(&db, product_id), Quantity::from_units(5));
    }

    #[test]
    fn test_missing_stock_row_goes_negative() {
        let db = test_state();
        let product_id = seed_product(&db, "3001", 1000, 5);
        {
            let conn = db.lock();
            conn.execute(
                "DELETE FROM branch_stock WHERE product_id = ?1",
                params![product_id],
            )
            .expect("delete stock");
        }

        // search joins stock with COALESCE 0, add is allowed anyway
        let mut cart = Cart::new();
        let hits = search_products(&db, 1, "3001").expect("search");
        let outcome = cart.add(&hits[0], 3).expect("add");
        assert!(outcome.stock_short);

        finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(3000),
            }],
            &SaleOptions::default(),
        )
        .expect("finalize");

        assert_eq!(stock_of(&db, product_id), Quantity::from_units(-3));
    }

    #[test]
    fn test_refund_restores_stock_balance_and_status() {
        let db = test_state();
        let product_id = seed_product(&db, "3001", 2000, 10);
        let customer_id = seed_customer(&db, "Ayse");
        let cart = cart_with(&db, "3001", 3);

        let sale_id = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[
                PaymentInput {
                    method: PaymentMethod::Cash,
                    amount: Money::from_cents(2000),
                },
                PaymentInput {
                    method: PaymentMethod::StoreCredit,
                    amount: Money::from_cents(4000),
                },
            ],
            &SaleOptions {
                customer_id: Some(customer_id),
                ..Default::default()
            },
        )
        .expect("finalize");

        assert_eq!(stock_of(&db, product_id), Quantity::from_units(7));
        assert_eq!(balance_of(&db, customer_id), Money::from_cents(4000));

        refund_sale(&db, &session(), sale_id, "damaged goods", None).expect("refund");

        assert_eq!(stock_of(&db, product_id), Quantity::from_units(10));
        assert_eq!(balance_of(&db, customer_id), ZERO);

        let detail = get_sale(&db, sale_id).expect("get sale");
        assert_eq!(detail.header.status, STATUS_REFUNDED);
        assert!(detail.payments.iter().all(|p| p.status == STATUS_REFUNDED));
    }

    #[test]
    fn test_double_refund_conflicts() {
        let db = test_state();
        seed_product(&db, "3001", 2000, 10);
        let cart = cart_with(&db, "3001", 1);

        let sale_id = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(2000),
            }],
            &SaleOptions::default(),
        )
        .expect("finalize");

        refund_sale(&db, &session(), sale_id, "changed mind", None).expect("refund");
        let err = refund_sale(&db, &session(), sale_id, "again", None).unwrap_err();
        assert!(matches!(err, PosError::Conflict(_)));

        let err = refund_sale(&db, &session(), 999, "ghost", None).unwrap_err();
        assert!(matches!(err, PosError::NotFound(_)));
    }

    #[test]
    fn test_coupon_lifecycle_through_sale_and_refund() {
        let db = test_state();
        seed_product(&db, "3001", 5000, 10);
        let customer_id = seed_customer(&db, "Fatma");

        let cc_id = {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO coupons (code, discount_kind, discount_value) VALUES ('WELCOME', 'amount', 500)",
                [],
            )
            .expect("coupon");
            let coupon_id = conn.last_insert_rowid();
            conn.execute(
                "INSERT INTO customer_coupons (customer_id, coupon_id) VALUES (?1, ?2)",
                params![customer_id, coupon_id],
            )
            .expect("customer coupon");
            conn.last_insert_rowid()
        };

        let cart = cart_with(&db, "3001", 1);
        let sale_id = finalize_sale(
            &db,
            &cfg(),
            &session(),
            &cart,
            &[PaymentInput {
                method: PaymentMethod::Cash,
                amount: Money::from_cents(4500),
            }],
            &SaleOptions {
                customer_id: Some(customer_id),
                order_discount: Money::from_cents(500),
                customer_coupon_id: Some(cc_id),
                ..Default::default()
            },
        )
        .expect("finalize");

        {
            let conn = db.lock();
            let (status, used_sale): (String, Option<i64>) = conn
                .query_row(
                    "SELECT status, used_sale_id FROM customer_coupons WHERE id = ?1",
                    params![cc_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .expect("coupon row");
            assert_eq!(status, "used");
            assert_eq!(used_sale, Some(sale_id));
        }

        refund_sale(&db, &session(), sale_id, "return", None).expect("refund");

        let conn = db.lock();
        let (status, used_sale): (String, Option<i64>) = conn
            .query_row(
                "SELECT status, used_sale_id FROM customer_coupons WHERE id = ?1",
                params![cc_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("coupon row");
        assert_eq!(status, "usable");
        assert_eq!(used_sale, None);
    }
}
