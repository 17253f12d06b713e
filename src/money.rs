//! Fixed-point money and stock quantities.
//!
//! `Money` is a signed count of cents (two fractional digits). All money
//! arithmetic in the crate happens on these integers; binary floating point
//! never touches a monetary path. Percentages travel as basis points
//! (2550 = 25.50%) and the derived amount rounds half-up.
//!
//! `Quantity` is the stock ledger's unit: hundredths of a stock unit, which
//! mirrors the NUMERIC(10,2) columns the schema uses for on-hand amounts.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Money
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(i64);

pub const ZERO: Money = Money(0);

impl Money {
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Whole major units (lira, dollars, ...) with no fractional part.
    pub const fn from_units(units: i64) -> Self {
        Money(units * 100)
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn abs(self) -> Money {
        Money(self.0.abs())
    }

    /// `bps` of this amount, rounded half-up (10_000 bps = 100%).
    ///
    /// 25.50% of 10.00 -> (1000 * 2550 + 5000) / 10000 = 255 cents.
    pub const fn percent_bps(self, bps: i64) -> Money {
        Money((self.0 * bps + 5000) / 10_000)
    }

    /// Loyalty points earned at a coefficient expressed in basis points
    /// per major unit (100 bps = 0.01 points per unit). Floor, never round.
    pub const fn loyalty_points(self, rate_bps: i64) -> i64 {
        self.0 * rate_bps / 1_000_000
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl std::ops::Mul<i64> for Money {
    type Output = Money;
    fn mul(self, rhs: i64) -> Money {
        Money(self.0 * rhs)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    /// "12.34", "-0.05". Display only; storage is always raw cents.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl ToSql for Money {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Money {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Money)
    }
}

// ---------------------------------------------------------------------------
// Quantity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Quantity(i64);

impl Quantity {
    pub const fn from_hundredths(h: i64) -> Self {
        Quantity(h)
    }

    /// Whole stock units.
    pub const fn from_units(units: i64) -> Self {
        Quantity(units * 100)
    }

    pub const fn hundredths(self) -> i64 {
        self.0
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl Add for Quantity {
    type Output = Quantity;
    fn add(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 + rhs.0)
    }
}

impl Sub for Quantity {
    type Output = Quantity;
    fn sub(self, rhs: Quantity) -> Quantity {
        Quantity(self.0 - rhs.0)
    }
}

impl Neg for Quantity {
    type Output = Quantity;
    fn neg(self) -> Quantity {
        Quantity(-self.0)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl ToSql for Quantity {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Quantity {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(Quantity(i)),
            // Legacy rows imported as REAL.
            ValueRef::Real(r) => Ok(Quantity((r * 100.0).round() as i64)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(1234).to_string(), "12.34");
        assert_eq!(Money::from_cents(-5).to_string(), "-0.05");
        assert_eq!(Money::from_cents(0).to_string(), "0.00");
        assert_eq!(Quantity::from_hundredths(-250).to_string(), "-2.50");
    }

    #[test]
    fn test_percent_rounds_half_up() {
        // 10% of 0.05 = 0.005 -> rounds up to 0.01
        assert_eq!(Money::from_cents(5).percent_bps(1000).cents(), 1);
        // 25.50% of 10.00 = 2.55 exactly
        assert_eq!(Money::from_units(10).percent_bps(2550).cents(), 255);
        // 33% of 0.01 = 0.0033 -> 0.00
        assert_eq!(Money::from_cents(1).percent_bps(3300).cents(), 0);
    }

    #[test]
    fn test_loyalty_points_floor() {
        // coefficient 0.01 (100 bps per unit): 199.99 -> 1 point
        assert_eq!(Money::from_cents(19_999).loyalty_points(100), 1);
        assert_eq!(Money::from_units(200).loyalty_points(100), 2);
        assert_eq!(Money::from_cents(9_999).loyalty_points(100), 0);
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_units(5);
        let b = Money::from_cents(250);
        assert_eq!((a + b).cents(), 750);
        assert_eq!((a - b).cents(), 250);
        assert_eq!((b * 3).cents(), 750);
        assert_eq!((-b).cents(), -250);

        let total: Money = [a, b, b].into_iter().sum();
        assert_eq!(total.cents(), 1000);
    }

    #[test]
    fn test_quantity_units() {
        let q = Quantity::from_units(3);
        assert_eq!(q.hundredths(), 300);
        assert!((q - Quantity::from_units(5)).is_negative());
    }
}
