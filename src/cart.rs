//! In-memory sale cart.
//!
//! The cart is pure state: it never touches the database. The ring-up flow
//! feeds it `PricedProduct` lookups and the finalizer reads it back out.
//! Totals are recomputed from the lines on every call, so reading them is
//! idempotent and free of hidden caches.

use serde::Serialize;

use crate::catalog::PricedProduct;
use crate::error::{PosError, PosResult};
use crate::money::{Money, Quantity, ZERO};

#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub product_id: i64,
    pub barcode: String,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i64,
    pub discount: Money,
    pub discount_label: Option<String>,
}

impl CartLine {
    /// Quantity times unit price, before any discount.
    pub fn gross_total(&self) -> Money {
        self.unit_price * self.quantity
    }

    pub fn net_total(&self) -> Money {
        self.gross_total() - self.discount
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CartTotals {
    pub subtotal: Money,
    pub discount_total: Money,
    pub grand_total: Money,
}

/// Result of an add: which line the product landed on and whether the
/// projected quantity exceeds what the branch has on hand. The shortage is
/// informational; overselling is allowed.
#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub line_index: usize,
    pub quantity: i64,
    pub stock_short: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum LineDiscount {
    Amount(Money),
    /// Basis points, exclusive range (0, 10000).
    Percent(i64),
}

#[derive(Debug, Default)]
pub struct Cart {
    lines: Vec<CartLine>,
}

impl Cart {
    pub fn new() -> Cart {
        Cart::default()
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Add `quantity` units of a product, merging into an existing line for
    /// the same product.
    pub fn add(&mut self, item: &PricedProduct, quantity: i64) -> PosResult<AddOutcome> {
        if quantity <= 0 {
            return Err(PosError::validation("quantity must be positive"));
        }

        let index = match self.lines.iter().position(|l| l.product_id == item.product_id) {
            Some(i) => {
                self.lines[i].quantity += quantity;
                i
            }
            None => {
                self.lines.push(CartLine {
                    product_id: item.product_id,
                    barcode: item.barcode.clone(),
                    name: item.name.clone(),
                    unit_price: item.unit_price,
                    quantity,
                    discount: ZERO,
                    discount_label: None,
                });
                self.lines.len() - 1
            }
        };

        let projected = self.lines[index].quantity;
        Ok(AddOutcome {
            line_index: index,
            quantity: projected,
            stock_short: Quantity::from_units(projected) > item.on_hand,
        })
    }

    /// Replace a line's quantity. Any discount on the line is cleared
    /// because its amount was computed against the old total.
    pub fn set_quantity(&mut self, index: usize, quantity: i64) -> PosResult<()> {
        if quantity <= 0 {
            return Err(PosError::validation("quantity must be positive"));
        }
        let line = self
            .lines
            .get_mut(index)
            .ok_or_else(|| PosError::not_found(format!("no cart line at index {index}")))?;

        line.quantity = quantity;
        line.discount = ZERO;
        line.discount_label = None;
        Ok(())
    }

    /// Apply a discount to one line, replacing any previous one. Returns the
    /// computed amount.
    pub fn apply_discount(&mut self, index: usize, discount: LineDiscount) -> PosResult<Money> {
        let line = self
            .lines
            .get_mut(index)
            .ok_or_else(|| PosError::not_found(format!("no cart line at index {index}")))?;

        let gross = line.unit_price * line.quantity;
        let (amount, label) = match discount {
            LineDiscount::Amount(amount) => {
                if !amount.is_positive() {
                    return Err(PosError::validation("discount amount must be positive"));
                }
                if amount >= gross {
                    return Err(PosError::validation(
                        "discount cannot reach or exceed the line total",
                    ));
                }
                (amount, format!("{amount} off"))
            }
            LineDiscount::Percent(bps) => {
                if bps <= 0 || bps >= 10_000 {
                    return Err(PosError::validation(
                        "percent discount must be between 0 and 100 exclusive",
                    ));
                }
                let amount = gross.percent_bps(bps);
                (amount, format!("{}.{:02}% off", bps / 100, bps % 100))
            }
        };

        line.discount = amount;
        line.discount_label = Some(label);
        Ok(amount)
    }

    pub fn remove(&mut self, index: usize) -> PosResult<CartLine> {
        if index >= self.lines.len() {
            return Err(PosError::not_found(format!("no cart line at index {index}")));
        }
        Ok(self.lines.remove(index))
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn totals(&self) -> CartTotals {
        let subtotal: Money = self.lines.iter().map(|l| l.gross_total()).sum();
        let discount_total: Money = self.lines.iter().map(|l| l.discount).sum();
        CartTotals {
            subtotal,
            discount_total,
            grand_total: subtotal - discount_total,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn item(product_id: i64, price_cents: i64, on_hand_units: i64) -> PricedProduct {
        PricedProduct {
            product_id,
            barcode: format!("bc-{product_id}"),
            name: format!("Product {product_id}"),
            unit: "pcs".into(),
            unit_price: Money::from_cents(price_cents),
            vat_bps: 1000,
            on_hand: Quantity::from_units(on_hand_units),
        }
    }

    #[test]
    fn test_empty_cart_totals_are_zero() {
        let cart = Cart::new();
        let t = cart.totals();
        assert_eq!(t.subtotal, ZERO);
        assert_eq!(t.discount_total, ZERO);
        assert_eq!(t.grand_total, ZERO);
    }

    #[test]
    fn test_add_merges_lines_per_product() {
        let mut cart = Cart::new();
        cart.add(&item(1, 2500, 100), 2).expect("add");
        let outcome = cart.add(&item(1, 2500, 100), 3).expect("add again");

        assert_eq!(cart.lines().len(), 1);
        assert_eq!(outcome.line_index, 0);
        assert_eq!(outcome.quantity, 5);
        assert_eq!(cart.totals().grand_total, Money::from_cents(12_500));
    }

    #[test]
    fn test_stock_short_flag() {
        let mut cart = Cart::new();
        let outcome = cart.add(&item(1, 1000, 2), 2).expect("add");
        assert!(!outcome.stock_short);
        let outcome = cart.add(&item(1, 1000, 2), 1).expect("add");
        assert!(outcome.stock_short);
    }

    #[test]
    fn test_totals_are_idempotent() {
        let mut cart = Cart::new();
        cart.add(&item(1, 2500, 10), 2).expect("add");
        cart.add(&item(2, 999, 10), 1).expect("add");
        cart.apply_discount(0, LineDiscount::Amount(Money::from_cents(500)))
            .expect("discount");

        let first = cart.totals();
        let second = cart.totals();
        assert_eq!(first, second);
        assert_eq!(first.subtotal, Money::from_cents(5999));
        assert_eq!(first.discount_total, Money::from_cents(500));
        assert_eq!(first.grand_total, Money::from_cents(5499));
    }

    #[test]
    fn test_amount_discount_bounds() {
        let mut cart = Cart::new();
        cart.add(&item(1, 1000, 10), 2).expect("add");

        // equal to the line total is rejected, just under is fine
        let err = cart
            .apply_discount(0, LineDiscount::Amount(Money::from_cents(2000)))
            .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));

        let applied = cart
            .apply_discount(0, LineDiscount::Amount(Money::from_cents(1999)))
            .expect("discount");
        assert_eq!(applied, Money::from_cents(1999));

        let err = cart
            .apply_discount(0, LineDiscount::Amount(ZERO))
            .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
    }

    #[test]
    fn test_percent_discount_bounds_and_rounding() {
        let mut cart = Cart::new();
        cart.add(&item(1, 5, 10), 3).expect("add"); // gross 0.15

        for bps in [0, -100, 10_000, 12_000] {
            let err = cart.apply_discount(0, LineDiscount::Percent(bps)).unwrap_err();
            assert!(matches!(err, PosError::Validation(_)));
        }

        // 10% of 0.15 = 0.015 -> rounds half-up to 0.02
        let applied = cart
            .apply_discount(0, LineDiscount::Percent(1000))
            .expect("discount");
        assert_eq!(applied, Money::from_cents(2));
        assert_eq!(cart.lines()[0].discount_label.as_deref(), Some("10.00% off"));
    }

    #[test]
    fn test_set_quantity_resets_discount() {
        let mut cart = Cart::new();
        cart.add(&item(1, 1000, 10), 3).expect("add");
        cart.apply_discount(0, LineDiscount::Percent(2500)).expect("discount");
        assert_eq!(cart.lines()[0].discount, Money::from_cents(750));

        cart.set_quantity(0, 1).expect("set quantity");
        assert_eq!(cart.lines()[0].discount, ZERO);
        assert!(cart.lines()[0].discount_label.is_none());
        assert_eq!(cart.totals().grand_total, Money::from_cents(1000));

        let err = cart.set_quantity(0, 0).unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cart = Cart::new();
        cart.add(&item(1, 1000, 10), 1).expect("add");
        cart.add(&item(2, 2000, 10), 1).expect("add");

        let removed = cart.remove(0).expect("remove");
        assert_eq!(removed.product_id, 1);
        assert_eq!(cart.lines().len(), 1);

        assert!(matches!(cart.remove(5).unwrap_err(), PosError::NotFound(_)));

        cart.clear();
        assert!(cart.is_empty());
    }
}
