//! Branch price snapshots and promotions.
//!
//! Promotions are catalog data: a tagged union of the two supported kinds,
//! date-bounded and per-product. Nothing here applies a promotion to a cart
//! automatically; the ring-up flow asks for "active today" and the operator
//! decides.

use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::Money;

// ---------------------------------------------------------------------------
// Branch prices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct BranchPrice {
    pub product_id: i64,
    pub branch_id: i64,
    pub buy_price: Money,
    pub sell_price: Money,
    pub vat_bps: i64,
}

pub fn get_branch_price(db: &DbState, branch_id: i64, product_id: i64) -> PosResult<BranchPrice> {
    let conn = db.lock();
    conn.query_row(
        "SELECT product_id, branch_id, buy_price, sell_price, vat_bps
         FROM branch_prices WHERE branch_id = ?1 AND product_id = ?2",
        params![branch_id, product_id],
        |row| {
            Ok(BranchPrice {
                product_id: row.get(0)?,
                branch_id: row.get(1)?,
                buy_price: row.get(2)?,
                sell_price: row.get(3)?,
                vat_bps: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        PosError::not_found(format!("no price for product {product_id} at branch {branch_id}"))
    })
}

pub fn upsert_branch_price(db: &DbState, price: &BranchPrice) -> PosResult<()> {
    if price.sell_price.is_negative() || price.buy_price.is_negative() {
        return Err(PosError::validation("prices cannot be negative"));
    }
    let conn = db.lock();
    conn.execute(
        "INSERT INTO branch_prices (product_id, branch_id, buy_price, sell_price, vat_bps)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(product_id, branch_id) DO UPDATE SET
            buy_price = excluded.buy_price,
            sell_price = excluded.sell_price,
            vat_bps = excluded.vat_bps,
            updated_at = datetime('now')",
        params![
            price.product_id,
            price.branch_id,
            price.buy_price,
            price.sell_price,
            price.vat_bps
        ],
    )
    .map_err(|e| PosError::db("upsert branch price", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Promotions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromotionKind {
    /// Buy at least `required_qty` of the product, take `discount` off.
    QuantityDiscount { required_qty: i64, discount: Money },
    /// Buy `required_qty`, get `free_qty` free. `free_product_id` defaults
    /// to the promotion's own product.
    BuyXGetY {
        required_qty: i64,
        free_qty: i64,
        free_product_id: Option<i64>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct Promotion {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub product_id: i64,
    pub kind: PromotionKind,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    pub active: bool,
}

pub struct NewPromotion<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub product_id: i64,
    pub kind: PromotionKind,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
}

fn validate_promotion(input: &NewPromotion) -> PosResult<()> {
    if input.name.trim().is_empty() {
        return Err(PosError::validation("promotion name is required"));
    }
    if let (Some(start), Some(end)) = (input.starts_on, input.ends_on) {
        if end < start {
            return Err(PosError::validation("end date cannot be before start date"));
        }
    }
    match &input.kind {
        PromotionKind::QuantityDiscount { required_qty, discount } => {
            if *required_qty <= 0 {
                return Err(PosError::validation("required quantity must be positive"));
            }
            if !discount.is_positive() {
                return Err(PosError::validation("discount amount must be positive"));
            }
        }
        PromotionKind::BuyXGetY { required_qty, free_qty, .. } => {
            if *required_qty <= 0 || *free_qty <= 0 {
                return Err(PosError::validation(
                    "required and free quantities must be positive",
                ));
            }
        }
    }
    Ok(())
}

fn kind_columns(kind: &PromotionKind) -> (&'static str, i64, Money, i64, Option<i64>) {
    match kind {
        PromotionKind::QuantityDiscount { required_qty, discount } => {
            ("quantity_discount", *required_qty, *discount, 0, None)
        }
        PromotionKind::BuyXGetY {
            required_qty,
            free_qty,
            free_product_id,
        } => ("buy_x_get_y", *required_qty, Money::from_cents(0), *free_qty, *free_product_id),
    }
}

pub fn add_promotion(db: &DbState, input: &NewPromotion) -> PosResult<i64> {
    validate_promotion(input)?;
    let (kind, required_qty, discount, free_qty, free_product_id) = kind_columns(&input.kind);

    let conn = db.lock();

    let product_exists: Option<i64> = conn
        .query_row(
            "SELECT id FROM products WHERE id = ?1",
            params![input.product_id],
            |r| r.get(0),
        )
        .optional()?;
    if product_exists.is_none() {
        return Err(PosError::not_found(format!("product {} not found", input.product_id)));
    }

    let dup: Option<i64> = conn
        .query_row(
            "SELECT id FROM promotions WHERE name = ?1",
            params![input.name.trim()],
            |r| r.get(0),
        )
        .optional()?;
    if dup.is_some() {
        return Err(PosError::conflict(format!(
            "promotion '{}' already exists",
            input.name.trim()
        )));
    }

    conn.execute(
        "INSERT INTO promotions
            (name, description, kind, product_id, required_qty, discount_amount,
             free_qty, free_product_id, starts_on, ends_on)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            input.name.trim(),
            input.description,
            kind,
            input.product_id,
            required_qty,
            discount,
            free_qty,
            free_product_id,
            input.starts_on.map(|d| d.format("%Y-%m-%d").to_string()),
            input.ends_on.map(|d| d.format("%Y-%m-%d").to_string()),
        ],
    )
    .map_err(|e| PosError::db("insert promotion", e))?;

    let id = conn.last_insert_rowid();
    info!(promotion_id = id, kind, "promotion created");
    Ok(id)
}

pub fn set_promotion_active(db: &DbState, promotion_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();
    let changed = conn.execute(
        "UPDATE promotions SET active = ?1 WHERE id = ?2",
        params![active, promotion_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("promotion {promotion_id} not found")));
    }
    Ok(())
}

fn map_promotion_row(row: &Row) -> rusqlite::Result<Promotion> {
    let kind_tag: String = row.get(3)?;
    let required_qty: i64 = row.get(4)?;
    let discount: Money = row.get(5)?;
    let free_qty: i64 = row.get(6)?;
    let free_product_id: Option<i64> = row.get(7)?;

    let kind = if kind_tag == "buy_x_get_y" {
        PromotionKind::BuyXGetY {
            required_qty,
            free_qty,
            free_product_id,
        }
    } else {
        PromotionKind::QuantityDiscount {
            required_qty,
            discount,
        }
    };

    let starts_on: Option<String> = row.get(8)?;
    let ends_on: Option<String> = row.get(9)?;

    Ok(Promotion {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        product_id: row.get(10)?,
        kind,
        starts_on: starts_on.and_then(|s| s.parse().ok()),
        ends_on: ends_on.and_then(|s| s.parse().ok()),
        active: row.get(11)?,
    })
}

const PROMOTION_COLUMNS: &str = "id, name, description, kind, required_qty, discount_amount,
                                 free_qty, free_product_id, starts_on, ends_on, product_id, active";

pub fn list_promotions(db: &DbState, include_inactive: bool) -> PosResult<Vec<Promotion>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROMOTION_COLUMNS} FROM promotions WHERE active = 1 OR ?1 ORDER BY name"
    ))?;
    let rows = stmt.query_map(params![include_inactive], map_promotion_row)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// The promotion in effect for a product on `today`: active flag set and
/// `today` inside the inclusive, open-ended date window.
pub fn active_for_product(
    db: &DbState,
    product_id: i64,
    today: NaiveDate,
) -> PosResult<Option<Promotion>> {
    let today = today.format("%Y-%m-%d").to_string();
    let conn = db.lock();
    conn.query_row(
        &format!(
            "SELECT {PROMOTION_COLUMNS} FROM promotions
             WHERE product_id = ?1 AND active = 1
               AND (starts_on IS NULL OR starts_on <= ?2)
               AND (ends_on IS NULL OR ends_on >= ?2)
             ORDER BY id DESC LIMIT 1"
        ),
        params![product_id, today],
        map_promotion_row,
    )
    .optional()
    .map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================
