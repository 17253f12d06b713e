//! Product catalog: products, brands, categories, suppliers.
//!
//! Prices on the product row are the company-wide defaults; the branch
//! actually sells at the `branch_prices` snapshot (see `pricing`). Adding a
//! product seeds both a price row and a zero stock row for the session's
//! branch so the ring-up path never has to special-case brand-new items.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::info;

use crate::audit;
use crate::config::Session;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::money::{Money, Quantity};

// ---------------------------------------------------------------------------
// Brands and categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Brand {
    pub id: i64,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub expiry_required: bool,
    pub active: bool,
}

/// Find a brand by name (case-sensitive) or create it.
fn get_or_create_brand(conn: &Connection, name: &str) -> PosResult<i64> {
    let existing: Option<i64> = conn
        .query_row("SELECT id FROM brands WHERE name = ?1", params![name], |r| r.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO brands (name) VALUES (?1)", params![name])
        .map_err(|e| PosError::db("insert brand", e))?;
    Ok(conn.last_insert_rowid())
}

fn get_or_create_category(conn: &Connection, name: &str) -> PosResult<i64> {
    let existing: Option<i64> = conn
        .query_row("SELECT id FROM categories WHERE name = ?1", params![name], |r| r.get(0))
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    conn.execute("INSERT INTO categories (name) VALUES (?1)", params![name])
        .map_err(|e| PosError::db("insert category", e))?;
    Ok(conn.last_insert_rowid())
}

pub fn list_brands(db: &DbState, include_inactive: bool) -> PosResult<Vec<Brand>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, name, active FROM brands WHERE active = 1 OR ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![include_inactive], |row| {
        Ok(Brand {
            id: row.get(0)?,
            name: row.get(1)?,
            active: row.get(2)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn list_categories(db: &DbState, include_inactive: bool) -> PosResult<Vec<Category>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, name, description, expiry_required, active
         FROM categories WHERE active = 1 OR ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![include_inactive], |row| {
        Ok(Category {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            expiry_required: row.get(3)?,
            active: row.get(4)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Deactivating a brand still referenced by active products is refused.
pub fn set_brand_active(db: &DbState, brand_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();

    if !active {
        let in_use: i64 = conn.query_row(
            "SELECT COUNT(*) FROM products WHERE brand_id = ?1 AND active = 1",
            params![brand_id],
            |r| r.get(0),
        )?;
        if in_use > 0 {
            return Err(PosError::conflict(format!(
                "brand is used by {in_use} active product(s)"
            )));
        }
    }

    let changed = conn.execute(
        "UPDATE brands SET active = ?1 WHERE id = ?2",
        params![active, brand_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("brand {brand_id} not found")));
    }
    Ok(())
}

pub fn set_category_active(db: &DbState, category_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();

    if !active {
        let in_use: i64 = conn.query_row(
            "SELECT COUNT(*) FROM products WHERE category_id = ?1 AND active = 1",
            params![category_id],
            |r| r.get(0),
        )?;
        if in_use > 0 {
            return Err(PosError::conflict(format!(
                "category is used by {in_use} active product(s)"
            )));
        }
    }

    let changed = conn.execute(
        "UPDATE categories SET active = ?1 WHERE id = ?2",
        params![active, category_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("category {category_id} not found")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Suppliers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub contact_name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub active: bool,
}

pub fn add_supplier(
    db: &DbState,
    name: &str,
    contact_name: Option<&str>,
    phone: Option<&str>,
    email: Option<&str>,
    address: Option<&str>,
) -> PosResult<i64> {
    let name = name.trim();
    if name.is_empty() {
        return Err(PosError::validation("supplier name is required"));
    }

    let conn = db.lock();

    let dup: Option<i64> = conn
        .query_row("SELECT id FROM suppliers WHERE name = ?1", params![name], |r| r.get(0))
        .optional()?;
    if dup.is_some() {
        return Err(PosError::conflict(format!("supplier '{name}' already exists")));
    }
    if let Some(phone) = phone {
        let dup: Option<i64> = conn
            .query_row("SELECT id FROM suppliers WHERE phone = ?1", params![phone], |r| r.get(0))
            .optional()?;
        if dup.is_some() {
            return Err(PosError::conflict(format!("supplier phone '{phone}' already exists")));
        }
    }

    conn.execute(
        "INSERT INTO suppliers (name, contact_name, phone, email, address)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![name, contact_name, phone, email, address],
    )
    .map_err(|e| PosError::db("insert supplier", e))?;

    let id = conn.last_insert_rowid();
    info!(supplier_id = id, "supplier created");
    Ok(id)
}

pub fn list_suppliers(db: &DbState, include_inactive: bool) -> PosResult<Vec<Supplier>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT id, name, contact_name, phone, email, address, active
         FROM suppliers WHERE active = 1 OR ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![include_inactive], |row| {
        Ok(Supplier {
            id: row.get(0)?,
            name: row.get(1)?,
            contact_name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            address: row.get(5)?,
            active: row.get(6)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn set_supplier_active(db: &DbState, supplier_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();
    let changed = conn.execute(
        "UPDATE suppliers SET active = ?1 WHERE id = ?2",
        params![active, supplier_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("supplier {supplier_id} not found")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Product {
    pub id: i64,
    pub barcode: String,
    pub name: String,
    pub unit: String,
    pub brand_id: Option<i64>,
    pub brand_name: Option<String>,
    pub category_id: Option<i64>,
    pub category_name: Option<String>,
    pub buy_price: Money,
    pub sell_price: Money,
    pub vat_bps: i64,
    pub min_stock_level: Quantity,
    pub previous_sell_price: Option<Money>,
    pub active: bool,
}

pub struct NewProduct<'a> {
    pub barcode: &'a str,
    pub name: &'a str,
    pub unit: &'a str,
    pub brand: Option<&'a str>,
    pub category: Option<&'a str>,
    pub buy_price: Money,
    pub sell_price: Money,
    pub vat_bps: i64,
    pub min_stock_level: Quantity,
}

/// A product ready to ring up at a branch: the branch price snapshot plus
/// current on-hand.
#[derive(Debug, Clone, Serialize)]
pub struct PricedProduct {
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub unit: String,
    pub unit_price: Money,
    pub vat_bps: i64,
    pub on_hand: Quantity,
}

/// Create a product plus its branch price and zero stock rows.
pub fn add_product(db: &DbState, session: &Session, input: &NewProduct) -> PosResult<i64> {
    let barcode = input.barcode.trim();
    let name = input.name.trim();
    if barcode.is_empty() {
        return Err(PosError::validation("barcode is required"));
    }
    if name.is_empty() {
        return Err(PosError::validation("product name is required"));
    }
    if input.buy_price.is_negative() || input.sell_price.is_negative() {
        return Err(PosError::validation("prices cannot be negative"));
    }

    let conn = db.lock();

    let dup: Option<i64> = conn
        .query_row("SELECT id FROM products WHERE barcode = ?1", params![barcode], |r| r.get(0))
        .optional()?;
    if dup.is_some() {
        return Err(PosError::conflict(format!("barcode '{barcode}' already exists")));
    }

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<i64> {
        let brand_id = match input.brand {
            Some(b) if !b.trim().is_empty() => Some(get_or_create_brand(&conn, b.trim())?),
            _ => None,
        };
        let category_id = match input.category {
            Some(c) if !c.trim().is_empty() => Some(get_or_create_category(&conn, c.trim())?),
            _ => None,
        };

        conn.execute(
            "INSERT INTO products
                (barcode, name, unit, brand_id, category_id, buy_price, sell_price,
                 vat_bps, min_stock_level)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                barcode,
                name,
                input.unit,
                brand_id,
                category_id,
                input.buy_price,
                input.sell_price,
                input.vat_bps,
                input.min_stock_level,
            ],
        )
        .map_err(|e| PosError::db("insert product", e))?;
        let product_id = conn.last_insert_rowid();

        conn.execute(
            "INSERT INTO branch_prices (product_id, branch_id, buy_price, sell_price, vat_bps)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                product_id,
                session.branch_id,
                input.buy_price,
                input.sell_price,
                input.vat_bps
            ],
        )
        .map_err(|e| PosError::db("insert branch price", e))?;

        conn.execute(
            "INSERT INTO branch_stock (product_id, branch_id, quantity, min_level)
             VALUES (?1, ?2, 0, ?3)",
            params![product_id, session.branch_id, input.min_stock_level],
        )
        .map_err(|e| PosError::db("insert branch stock", e))?;

        Ok(product_id)
    })();

    match result {
        Ok(product_id) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            info!(product_id, barcode, "product created");
            Ok(product_id)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Update the catalog row. A sell-price change records the old price in
/// `previous_sell_price` and refreshes the session branch's price snapshot.
pub fn update_product(
    db: &DbState,
    session: &Session,
    product_id: i64,
    input: &NewProduct,
) -> PosResult<()> {
    if input.buy_price.is_negative() || input.sell_price.is_negative() {
        return Err(PosError::validation("prices cannot be negative"));
    }

    let conn = db.lock();

    let old_sell: Money = conn
        .query_row(
            "SELECT sell_price FROM products WHERE id = ?1",
            params![product_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| PosError::not_found(format!("product {product_id} not found")))?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| PosError::db("begin transaction", e))?;

    let result = (|| -> PosResult<()> {
        let brand_id = match input.brand {
            Some(b) if !b.trim().is_empty() => Some(get_or_create_brand(&conn, b.trim())?),
            _ => None,
        };
        let category_id = match input.category {
            Some(c) if !c.trim().is_empty() => Some(get_or_create_category(&conn, c.trim())?),
            _ => None,
        };

        conn.execute(
            "UPDATE products SET
                name = ?1, unit = ?2, brand_id = ?3, category_id = ?4,
                buy_price = ?5, sell_price = ?6, vat_bps = ?7, min_stock_level = ?8,
                previous_sell_price = CASE WHEN sell_price != ?6 THEN sell_price
                                           ELSE previous_sell_price END,
                updated_at = datetime('now')
             WHERE id = ?9",
            params![
                input.name.trim(),
                input.unit,
                brand_id,
                category_id,
                input.buy_price,
                input.sell_price,
                input.vat_bps,
                input.min_stock_level,
                product_id,
            ],
        )
        .map_err(|e| PosError::db("update product", e))?;

        conn.execute(
            "INSERT INTO branch_prices (product_id, branch_id, buy_price, sell_price, vat_bps)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(product_id, branch_id) DO UPDATE SET
                buy_price = excluded.buy_price,
                sell_price = excluded.sell_price,
                vat_bps = excluded.vat_bps,
                updated_at = datetime('now')",
            params![
                product_id,
                session.branch_id,
                input.buy_price,
                input.sell_price,
                input.vat_bps
            ],
        )
        .map_err(|e| PosError::db("upsert branch price", e))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| PosError::db("commit transaction", e))?;
            if old_sell != input.sell_price {
                audit::record(
                    &conn,
                    Some(session.user_id),
                    audit::ACTION_PRICE_CHANGE,
                    &format!(
                        "product {product_id} sell price {} -> {}",
                        old_sell, input.sell_price
                    ),
                );
            }
            info!(product_id, "product updated");
            Ok(())
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

pub fn set_product_active(db: &DbState, product_id: i64, active: bool) -> PosResult<()> {
    let conn = db.lock();
    let changed = conn.execute(
        "UPDATE products SET active = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![active, product_id],
    )?;
    if changed == 0 {
        return Err(PosError::not_found(format!("product {product_id} not found")));
    }
    info!(product_id, active, "product active flag changed");
    Ok(())
}

pub fn get_product(db: &DbState, product_id: i64) -> PosResult<Product> {
    let conn = db.lock();
    conn.query_row(
        "SELECT p.id, p.barcode, p.name, p.unit, p.brand_id, b.name, p.category_id, c.name,
                p.buy_price, p.sell_price, p.vat_bps, p.min_stock_level,
                p.previous_sell_price, p.active
         FROM products p
         LEFT JOIN brands b ON b.id = p.brand_id
         LEFT JOIN categories c ON c.id = p.category_id
         WHERE p.id = ?1",
        params![product_id],
        map_product_row,
    )
    .optional()?
    .ok_or_else(|| PosError::not_found(format!("product {product_id} not found")))
}

fn map_product_row(row: &rusqlite::Row) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        barcode: row.get(1)?,
        name: row.get(2)?,
        unit: row.get(3)?,
        brand_id: row.get(4)?,
        brand_name: row.get(5)?,
        category_id: row.get(6)?,
        category_name: row.get(7)?,
        buy_price: row.get(8)?,
        sell_price: row.get(9)?,
        vat_bps: row.get(10)?,
        min_stock_level: row.get(11)?,
        previous_sell_price: row.get(12)?,
        active: row.get(13)?,
    })
}

/// Ring-up lookup: exact barcode match first, then name substring. Only
/// active products with a price row at this branch are sellable.
pub fn search_products(db: &DbState, branch_id: i64, term: &str) -> PosResult<Vec<PricedProduct>> {
    let term = term.trim();
    if term.is_empty() {
        return Ok(Vec::new());
    }

    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT p.id, p.barcode, p.name, p.unit, bp.sell_price, bp.vat_bps,
                COALESCE(bs.quantity, 0)
         FROM products p
         JOIN branch_prices bp ON bp.product_id = p.id AND bp.branch_id = ?1
         LEFT JOIN branch_stock bs ON bs.product_id = p.id AND bs.branch_id = ?1
         WHERE p.active = 1 AND (p.barcode = ?2 OR p.name LIKE ?3)
         ORDER BY CASE WHEN p.barcode = ?2 THEN 0 ELSE 1 END, p.name
         LIMIT 10",
    )?;
    let like = format!("%{term}%");
    let rows = stmt.query_map(params![branch_id, term, like], |row| {
        Ok(PricedProduct {
            product_id: row.get(0)?,
            barcode: row.get(1)?,
            name: row.get(2)?,
            unit: row.get(3)?,
            unit_price: row.get(4)?,
            vat_bps: row.get(5)?,
            on_hand: row.get(6)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// Shelf-label data: current and previous sell price at the branch.
#[derive(Debug, Clone, Serialize)]
pub struct LabelData {
    pub barcode: String,
    pub name: String,
    pub sell_price: Money,
    pub previous_sell_price: Option<Money>,
    pub unit: String,
}

pub fn label_data(db: &DbState, branch_id: i64, product_id: i64) -> PosResult<LabelData> {
    let conn = db.lock();
    conn.query_row(
        "SELECT p.barcode, p.name, bp.sell_price, p.previous_sell_price, p.unit
         FROM products p
         JOIN branch_prices bp ON bp.product_id = p.id AND bp.branch_id = ?1
         WHERE p.id = ?2",
        params![branch_id, product_id],
        |row| {
            Ok(LabelData {
                barcode: row.get(0)?,
                name: row.get(1)?,
                sell_price: row.get(2)?,
                previous_sell_price: row.get(3)?,
                unit: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| {
        PosError::not_found(format!("product {product_id} has no price at branch {branch_id}"))
    })
}

// ===========================================================================
// Tests
// ===========================================================================
