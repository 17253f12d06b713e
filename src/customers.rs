//! Customers: store-credit accounts, loyalty points, coupons.
//!
//! `balance` is money the customer owes the shop (store-credit sales add to
//! it, payments received subtract). Points and coupons ride along on the
//! same row.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::config::Session;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::Money;
use crate::sales::PaymentMethod;

#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub id: i64,
    pub name: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub balance: Money,
    pub loyalty_points: i64,
    pub active: bool,
}

fn map_customer_row(row: &rusqlite::Row) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        address: row.get(3)?,
        balance: row.get(4)?,
        loyalty_points: row.get(5)?,
        active: row.get(6)?,
    })
}

const CUSTOMER_COLUMNS: &str = "id, name, phone, address, balance, loyalty_points, active";

pub fn add_customer(
    db: &DbState,
    name: &str,
    phone: Option<&str>,
    address: Option<&str>,
) -> PosResult<i64> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PosError::validation("customer name is required"));
    }

    let conn = db.lock();

    if let Some(phone) = phone {
        let dup: Option<i64> = conn
            .query_row("SELECT id FROM customers WHERE phone = ?1", params![phone], |r| r.get(0))
            .optional()?;
        if dup.is_some() {
            return Err(PosError::conflict(format!(
                "a customer with phone '{phone}' already exists"
            )));
        }
    }

    conn.execute(
        "INSERT INTO customers (name, phone, address) VALUES (?1, ?2, ?3)",
        params![name, phone, address],
    )
    .map_err(|e| PosError::db("insert customer", e))?;

    let id = conn.last_insert_rowid();
    info!(customer_id = id, "customer created");
    Ok(id)
}

pub fn update_customer(
    db: &DbState,
    customer_id: i64,
    name: &str,
    phone: Option<&str>,
    address: Option<&str>,
) -> PosResult<()> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PosError::validation("customer name is required"));
    }

    let conn = db.lock();

    if let Some(phone) = phone {
        let dup: Option<i64> = conn
            .query_row(
                "SELECT id FROM customers WHERE phone = ?1 AND id != ?2",
                params![phone, customer_id],
                |r| r.get(0),
            )
            .optional()?;
        if dup.is_some() {
            return Err(PosError::conflict(format!(
                "a customer with phone '{phone}' already exists"
            )));
        }
    }

    let changed = conn.execute(
        "UPDATE customers SET name = ?1, phone = ?2, address = ?3 WHERE id = ?4",
        params![name, phone, address, customer_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("customer {customer_id} not found")));
    }
    Ok(())
}

pub fn set_customer_active(db: &DbState, customer_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();
    let changed = conn.execute(
        "UPDATE customers SET active = ?1 WHERE id = ?2",
        params![active, customer_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("customer {customer_id} not found")));
    }
    Ok(())
}

pub fn get_customer(db: &DbState, customer_id: i64) -> PosResult<Customer> {
    let conn = db.lock();
    conn.query_row(
        &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
        params![customer_id],
        map_customer_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("customer {customer_id} not found")))
}

pub fn list_customers(
    db: &DbState,
    search: Option<&str>,
    include_inactive: bool,
) -> PosResult<Vec<Customer>> {
    let conn = db.lock();
    let like = format!("%{}%", search.unwrap_or("").trim());
    let mut stmt = conn.prepare(&format!(
        "SELECT {CUSTOMER_COLUMNS} FROM customers
         WHERE (active = 1 OR ?1) AND (name LIKE ?2 OR COALESCE(phone, '') LIKE ?2)
         ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![include_inactive, like], map_customer_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Payments against balance
// ---------------------------------------------------------------------------

/// Receive money from a customer against their store-credit balance. Tagged
/// with the session's open shift so the reconciliation picks it up.
pub fn record_payment(
    db: &DbState,
    session: &Session,
    customer_id: i64,
    amount: Money,
    method: PaymentMethod,
    notes: Option<&str>,
) -> PosResult<i64> {
    if !amount.is_positive() {
        return Err(PosError::validation("payment amount must be positive"));
    }
    if method == PaymentMethod::StoreCredit {
        return Err(PosError::validation(
            "a balance payment cannot itself be store credit",
        ));
    }

    let conn = db.lock();

    let exists: Option<i64> = conn
        .query_row("SELECT id FROM customers WHERE id = ?1", params![customer_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(PosError::not_found(format!("customer {customer_id} not found")));
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<i64> {
        conn.execute(
            "INSERT INTO customer_payments (customer_id, shift_id, amount, method, notes)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![customer_id, session.shift_id, amount, method.as_str(), notes],
        )
        .map_err(|e| PosError::db("insert customer payment", e))?;
        let payment_id = conn.last_insert_rowid();

        conn.execute(
            "UPDATE customers SET balance = balance - ?1 WHERE id = ?2",
            params![amount, customer_id],
        )
        .map_err(|e| PosError::db("decrease balance", e))?;

        Ok(payment_id)
    })();

    match result {
        Ok(payment_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            audit::record(
                &conn,
                Some(session.user_id),
                audit::ACTION_CUSTOMER_PAYMENT,
                &format!("customer {customer_id} paid {amount} ({})", method.as_str()),
            );
            info!(customer_id, payment_id, amount = %amount, "customer payment recorded");
            Ok(payment_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Manual loyalty adjustment (goodwill credit or redemption at the desk).
/// The resulting total may not go negative.
pub fn adjust_loyalty_points(db: &DbState, customer_id: i64, delta: i64) -> PosResult<i64> {
    if delta == 0 {
        return Err(PosError::validation("point adjustment cannot be zero"));
    }

    let conn = db.lock();
    let current: i64 = conn
        .query_row(
            "SELECT loyalty_points FROM customers WHERE id = ?1",
            params![customer_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("customer {customer_id} not found")))?;

    let new_total = current + delta;
    if new_total < 0 {
        return Err(PosError::validation(format!(
            "customer has {current} points, cannot remove {}",
            -delta
        )));
    }

    conn.execute(
        "UPDATE customers SET loyalty_points = ?1 WHERE id = ?2",
        params![new_total, customer_id],
    )?;
    info!(customer_id, delta, new_total, "loyalty points adjusted");
    Ok(new_total)
}

// ---------------------------------------------------------------------------
// Statement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatementEntry {
    /// "sale" or "payment".
    pub kind: String,
    pub reference_id: i64,
    pub date: String,
    /// Positive for sales (debt up), negative for received payments.
    pub amount: Money,
    pub note: String,
}

/// Sales and received payments merged chronologically.
pub fn statement(db: &DbState, customer_id: i64) -> PosResult<Vec<StatementEntry>> {
    // existence check keeps NotFound distinct from an empty history
    get_customer(db, customer_id)?;

    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT 'sale', s.id, s.created_at, s.total_amount, 'sale (' || s.status || ')'
         FROM sales s WHERE s.customer_id = ?1
         UNION ALL
         SELECT 'payment', cp.id, cp.created_at, -cp.amount,
                'payment (' || cp.method || ')'
         FROM customer_payments cp WHERE cp.customer_id = ?1
         ORDER BY 3, 2",
    )?;
    let rows = stmt.query_map(params![customer_id], |row| {
        Ok(StatementEntry {
            kind: row.get(0)?,
            reference_id: row.get(1)?,
            date: row.get(2)?,
            amount: row.get(3)?,
            note: row.get(4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Coupons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CustomerCoupon {
    pub id: i64,
    pub code: String,
    pub description: Option<String>,
    pub discount_kind: String,
    pub discount_value: i64,
    pub min_sale_amount: Money,
    pub expires_on: Option<String>,
    pub status: String,
}

pub fn define_coupon(
    db: &DbState,
    code: &str,
    description: Option<&str>,
    discount_kind: &str,
    discount_value: i64,
    min_sale_amount: Money,
) -> PosResult<i64> {
    let code = code.trim();
    if code.is_empty() {
        return Err(PosError::validation("coupon code is required"));
    }
    if discount_kind != "amount" && discount_kind != "percent" {
        return Err(PosError::validation("discount kind must be 'amount' or 'percent'"));
    }
    if discount_value <= 0 {
        return Err(PosError::validation("discount value must be positive"));
    }
    if discount_kind == "percent" && discount_value >= 10_000 {
        return Err(PosError::validation("percent discount must be below 100"));
    }

    let conn = db.lock();

    let dup: Option<i64> = conn
        .query_row("SELECT id FROM coupons WHERE code = ?1", params![code], |r| r.get(0))
        .optional()?;
    if dup.is_some() {
        return Err(PosError::conflict(format!("coupon code '{code}' already exists")));
    }

    conn.execute(
        "INSERT INTO coupons (code, description, discount_kind, discount_value, min_sale_amount)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![code, description, discount_kind, discount_value, min_sale_amount],
    )
    .map_err(|e| PosError::db("insert coupon", e))?;

    Ok(conn.last_insert_rowid())
}

/// Hand a defined coupon to a customer as a usable instance.
pub fn assign_coupon(
    db: &DbState,
    customer_id: i64,
    coupon_id: i64,
    expires_on: Option<&str>,
) -> PosResult<i64> {
    let conn = db.lock();

    let customer: Option<i64> = conn
        .query_row("SELECT id FROM customers WHERE id = ?1", params![customer_id], |r| r.get(0))
        .optional()?;
    if customer.is_none() {
        return Err(PosError::not_found(format!("customer {customer_id} not found")));
    }
    let coupon: Option<i64> = conn
        .query_row(
            "SELECT id FROM coupons WHERE id = ?1 AND active = 1",
            params![coupon_id],
            |r| r.get(0),
        )
        .optional()?;
    if coupon.is_none() {
        return Err(PosError::not_found(format!("active coupon {coupon_id} not found")));
    }

    conn.execute(
        "INSERT INTO customer_coupons (customer_id, coupon_id, expires_on)
         VALUES (?1, ?2, ?3)",
        params![customer_id, coupon_id, expires_on],
    )
    .map_err(|e| PosError::db("insert customer coupon", e))?;

    let id = conn.last_insert_rowid();
    info!(customer_id, coupon_id, customer_coupon_id = id, "coupon assigned");
    Ok(id)
}

pub fn list_customer_coupons(
    db: &DbState,
    customer_id: i64,
    only_usable: bool,
) -> PosResult<Vec<CustomerCoupon>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT cc.id, c.code, c.description, c.discount_kind, c.discount_value,
                c.min_sale_amount, cc.expires_on, cc.status
         FROM customer_coupons cc
         JOIN coupons c ON c.id = cc.coupon_id
         WHERE cc.customer_id = ?1
           AND (cc.status = 'usable' OR NOT ?2)
           AND (cc.expires_on IS NULL OR cc.expires_on >= date('now') OR NOT ?2)
         ORDER BY cc.id",
    )?;
    let rows = stmt.query_map(params![customer_id, only_usable], |row| {
        Ok(CustomerCoupon {
            id: row.get(0)?,
            code: row.get(1)?,
            description: row.get(2)?,
            discount_kind: row.get(3)?,
            discount_value: row.get(4)?,
            min_sale_amount: row.get(5)?,
            expires_on: row.get(6)?,
            status: row.get(7)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================
