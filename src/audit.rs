//! Fire-and-forget activity log.
//!
//! `record` must never fail the business operation that calls it; insert
//! errors are logged and swallowed. Callers pass an already-locked
//! connection after their own transaction committed.

use chrono::NaiveDate;
use rusqlite::{params, Connection};
use serde::Serialize;
use tracing::warn;

use crate::error::PosResult;

// Action kinds. Kept as plain strings in the table so old rows survive
// renames.
pub const ACTION_LOGIN: &str = "login";
pub const ACTION_SALE_COMPLETE: &str = "sale_complete";
pub const ACTION_SALE_REFUND: &str = "sale_refund";
pub const ACTION_SHIFT_START: &str = "shift_start";
pub const ACTION_SHIFT_END: &str = "shift_end";
pub const ACTION_STOCK_CORRECTION: &str = "stock_correction";
pub const ACTION_STOCK_PURCHASE: &str = "stock_purchase";
pub const ACTION_CUSTOMER_PAYMENT: &str = "customer_payment";
pub const ACTION_PRICE_CHANGE: &str = "price_change";

/// Append one activity row. Errors are swallowed.
pub fn record(conn: &Connection, user_id: Option<i64>, action: &str, details: &str) {
    let res = conn.execute(
        "INSERT INTO activity_log (user_id, action, details) VALUES (?1, ?2, ?3)",
        params![user_id, action, details],
    );
    if let Err(e) = res {
        warn!(action, "activity log insert failed: {e}");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub action: String,
    pub details: Option<String>,
    pub created_at: String,
}

/// Query the log, newest first. All filters optional.
pub fn list(
    conn: &Connection,
    action: Option<&str>,
    user_id: Option<i64>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: i64,
) -> PosResult<Vec<ActivityEntry>> {
    let mut sql = String::from(
        "SELECT a.id, a.user_id, u.username, a.action, a.details, a.created_at
         FROM activity_log a
         LEFT JOIN users u ON u.id = a.user_id
         WHERE 1=1",
    );
    let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(action) = action {
        args.push(Box::new(action.to_string()));
        sql.push_str(&format!(" AND a.action = ?{}", args.len()));
    }
    if let Some(user_id) = user_id {
        args.push(Box::new(user_id));
        sql.push_str(&format!(" AND a.user_id = ?{}", args.len()));
    }
    if let Some(from) = from {
        args.push(Box::new(from.format("%Y-%m-%d").to_string()));
        sql.push_str(&format!(" AND date(a.created_at) >= ?{}", args.len()));
    }
    if let Some(to) = to {
        args.push(Box::new(to.format("%Y-%m-%d").to_string()));
        sql.push_str(&format!(" AND date(a.created_at) <= ?{}", args.len()));
    }

    args.push(Box::new(limit));
    sql.push_str(&format!(" ORDER BY a.id DESC LIMIT ?{}", args.len()));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
        Ok(ActivityEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            username: row.get(2)?,
            action: row.get(3)?,
            details: row.get(4)?,
            created_at: row.get(5)?,
        })
    })?;

    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

// ===========================================================================
// Tests
// ===========================================================================
