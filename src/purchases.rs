//! Purchase receipts: goods coming in from suppliers.
//!
//! Recording a purchase bumps branch stock (creating the row when the
//! product has never been stocked here) and refreshes the product's catalog
//! buy price with the latest cost. Per-line expiry dates feed the expiry
//! report.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::config::Session;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::{Money, Quantity};

pub struct PurchaseInput<'a> {
    pub supplier_id: Option<i64>,
    pub invoice_no: Option<&'a str>,
    pub notes: Option<&'a str>,
}

pub struct PurchaseLineInput {
    pub product_id: i64,
    pub quantity: Quantity,
    pub unit_cost: Money,
    pub expires_on: Option<NaiveDate>,
}

pub fn record_purchase(
    db: &DbState,
    session: &Session,
    input: &PurchaseInput,
    lines: &[PurchaseLineInput],
) -> PosResult<i64> {
    if lines.is_empty() {
        return Err(PosError::validation("a purchase needs at least one line"));
    }
    for line in lines {
        if line.quantity.hundredths() <= 0 {
            return Err(PosError::validation("line quantities must be positive"));
        }
        if line.unit_cost.is_negative() {
            return Err(PosError::validation("unit cost cannot be negative"));
        }
    }

    let conn = db.lock();

    if let Some(supplier_id) = input.supplier_id {
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM suppliers WHERE id = ?1",
                params![supplier_id],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(PosError::not_found(format!("supplier {supplier_id} not found")));
        }
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<i64> {
        conn.execute(
            "INSERT INTO purchases (supplier_id, invoice_no, notes) VALUES (?1, ?2, ?3)",
            params![input.supplier_id, input.invoice_no, input.notes],
        )
        .map_err(|e| PosError::db("insert purchase", e))?;
        let purchase_id = conn.last_insert_rowid();

        for line in lines {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM products WHERE id = ?1",
                    params![line.product_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| PosError::db("check product", e))?;
            if exists.is_none() {
                return Err(PosError::not_found(format!(
                    "product {} not found",
                    line.product_id
                )));
            }

            conn.execute(
                "INSERT INTO purchase_lines
                    (purchase_id, product_id, quantity, unit_cost, expires_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    purchase_id,
                    line.product_id,
                    line.quantity,
                    line.unit_cost,
                    line.expires_on.map(|d| d.format("%Y-%m-%d").to_string()),
                ],
            )
            .map_err(|e| PosError::db("insert purchase line", e))?;

            let changed = conn
                .execute(
                    "UPDATE branch_stock
                     SET quantity = quantity + ?1, updated_at = datetime('now')
                     WHERE product_id = ?2 AND branch_id = ?3",
                    params![line.quantity, line.product_id, session.branch_id],
                )
                .map_err(|e| PosError::db("increment stock", e))?;
            if changed == 0 {
                conn.execute(
                    "INSERT INTO branch_stock (product_id, branch_id, quantity)
                     VALUES (?1, ?2, ?3)",
                    params![line.product_id, session.branch_id, line.quantity],
                )
                .map_err(|e| PosError::db("insert stock row", e))?;
            }

            // latest cost becomes the catalog buy price
            conn.execute(
                "UPDATE products SET buy_price = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![line.unit_cost, line.product_id],
            )
            .map_err(|e| PosError::db("update buy price", e))?;
        }

        Ok(purchase_id)
    })();

    match result {
        Ok(purchase_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            audit::record(
                &conn,
                Some(session.user_id),
                audit::ACTION_STOCK_PURCHASE,
                &format!("purchase {purchase_id}, {} line(s)", lines.len()),
            );
            info!(purchase_id, lines = lines.len(), "purchase recorded");
            Ok(purchase_id)
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
pub struct PurchaseHeader {
    pub id: i64,
    pub supplier_id: Option<i64>,
    pub supplier_name: Option<String>,
    pub invoice_no: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseLine {
    pub product_id: i64,
    pub product_name: String,
    pub quantity: Quantity,
    pub unit_cost: Money,
    pub expires_on: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseDetail {
    pub header: PurchaseHeader,
    pub lines: Vec<PurchaseLine>,
}

pub fn list_purchases(db: &DbState, supplier_id: Option<i64>) -> PosResult<Vec<PurchaseHeader>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT p.id, p.supplier_id, s.name, p.invoice_no, p.notes, p.created_at
         FROM purchases p
         LEFT JOIN suppliers s ON s.id = p.supplier_id
         WHERE ?1 IS NULL OR p.supplier_id = ?1
         ORDER BY p.id DESC",
    )?;
    let rows = stmt.query_map(params![supplier_id], |row| {
        Ok(PurchaseHeader {
            id: row.get(0)?,
            supplier_id: row.get(1)?,
            supplier_name: row.get(2)?,
            invoice_no: row.get(3)?,
            notes: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn get_purchase(db: &DbState, purchase_id: i64) -> PosResult<PurchaseDetail> {
    let conn = db.lock();

    let header = conn
        .query_row(
            "SELECT p.id, p.supplier_id, s.name, p.invoice_no, p.notes, p.created_at
             FROM purchases p
             LEFT JOIN suppliers s ON s.id = p.supplier_id
             WHERE p.id = ?1",
            params![purchase_id],
            |row| {
                Ok(PurchaseHeader {
                    id: row.get(0)?,
                    supplier_id: row.get(1)?,
                    supplier_name: row.get(2)?,
                    invoice_no: row.get(3)?,
                    notes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("purchase {purchase_id} not found")))?;

    let mut stmt = conn.prepare(
        "SELECT pl.product_id, p.name, pl.quantity, pl.unit_cost, pl.expires_on
         FROM purchase_lines pl
         JOIN products p ON p.id = pl.product_id
         WHERE pl.purchase_id = ?1
         ORDER BY pl.id",
    )?;
    let lines = stmt
        .query_map(params![purchase_id], |row| {
            Ok(PurchaseLine {
                product_id: row.get(0)?,
                product_name: row.get(1)?,
                quantity: row.get(2)?,
                unit_cost: row.get(3)?,
                expires_on: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PurchaseDetail { header, lines })
}

// ===========================================================================
// Tests
// ===========================================================================
