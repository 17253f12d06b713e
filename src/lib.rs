//! Corner POS - retail point-of-sale core.
//!
//! Embedded business-logic library for a single-register shop: catalog and
//! stock over SQLite, an in-memory cart, transactional sale finalization
//! with refunds, customer store-credit accounts, and shift cash
//! reconciliation. A desktop shell calls these functions directly; the
//! crate owns the data and the rules, not the screens.

pub mod audit;
pub mod cart;
pub mod catalog;
pub mod config;
pub mod customers;
pub mod db;
pub mod error;
pub mod money;
pub mod pricing;
pub mod purchases;
pub mod reports;
pub mod sales;
pub mod shifts;
pub mod stock;
pub mod users;

pub use config::{PosConfig, Session};
pub use db::DbState;
pub use error::{PosError, PosResult};
pub use money::{Money, Quantity};
