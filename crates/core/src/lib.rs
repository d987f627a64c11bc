//! Commerce and ledger core for a course marketplace.
//!
//! Wallet balances are backed by an append-only ledger; course purchases,
//! coupon redemptions, instructor earnings and deposit credits each commit
//! as a single unit of work against the [`store::Store`]. [`service::Commerce`]
//! is the entry point that wires the components together.

pub mod auth;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod coupon;
pub mod deposit;
pub mod enrollment;
pub mod error;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod progress;
pub mod service;
pub mod store;
#[cfg(feature = "trace")]
pub mod telemetry;

pub use config::CommerceConfig;
pub use error::{CommerceError, CouponError, ErrorKind, Result};
pub use service::{Collaborators, Commerce};
