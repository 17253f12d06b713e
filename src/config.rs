//! Runtime configuration and the caller session.
//!
//! `PosConfig` is loaded once from the settings table and passed by
//! reference into the flows that need it. `Session` carries the active
//! branch, user, and open shift so nothing in the crate assumes a
//! hardcoded terminal identity.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{self, DbState};

/// Loyalty coefficient default: 0.01 points per major unit of net sale.
const DEFAULT_LOYALTY_RATE_BPS: i64 = 100;
/// Default VAT when a product row does not carry one: 10%.
const DEFAULT_VAT_BPS: i64 = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosConfig {
    /// Loyalty points per major unit, in basis points (100 = 0.01).
    pub loyalty_rate_bps: i64,
    /// Default VAT rate in basis points (1000 = 10%).
    pub default_vat_bps: i64,
}

impl Default for PosConfig {
    fn default() -> Self {
        PosConfig {
            loyalty_rate_bps: DEFAULT_LOYALTY_RATE_BPS,
            default_vat_bps: DEFAULT_VAT_BPS,
        }
    }
}

impl PosConfig {
    /// Load from the settings table, falling back to defaults for unset or
    /// unparseable values.
    pub fn load(db: &DbState) -> PosConfig {
        let conn = db.lock();

        let loyalty_rate_bps = db::get_setting(&conn, "loyalty", "rate")
            .and_then(|v| parse_rate_bps(&v))
            .unwrap_or_else(|| {
                warn!("loyalty rate setting missing or invalid, using default");
                DEFAULT_LOYALTY_RATE_BPS
            });

        let default_vat_bps = db::get_setting(&conn, "catalog", "default_vat_percent")
            .and_then(|v| parse_percent_bps(&v))
            .unwrap_or(DEFAULT_VAT_BPS);

        PosConfig {
            loyalty_rate_bps,
            default_vat_bps,
        }
    }
}

/// "0.01" (points per unit) -> 100 bps.
fn parse_rate_bps(raw: &str) -> Option<i64> {
    let v: f64 = raw.trim().parse().ok()?;
    if !(0.0..=100.0).contains(&v) {
        return None;
    }
    Some((v * 10_000.0).round() as i64)
}

/// "10" or "18.5" (percent) -> 1000 / 1850 bps.
fn parse_percent_bps(raw: &str) -> Option<i64> {
    let v: f64 = raw.trim().parse().ok()?;
    if !(0.0..=100.0).contains(&v) {
        return None;
    }
    Some((v * 100.0).round() as i64)
}

/// The identity every mutating call runs under.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Session {
    pub branch_id: i64,
    pub user_id: i64,
    /// Open shift, when one is running; sales and customer payments are
    /// tagged with it.
    pub shift_id: Option<i64>,
}

impl Session {
    pub fn new(branch_id: i64, user_id: i64) -> Session {
        Session {
            branch_id,
            user_id,
            shift_id: None,
        }
    }

    pub fn with_shift(mut self, shift_id: i64) -> Session {
        self.shift_id = Some(shift_id);
        self
    }
}

// ===========================================================================
// Tests
// ===========================================================================
