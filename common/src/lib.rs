//! LedgerCore Common Types
//!
//! This crate contains shared types used across the ledger core,
//! including identifiers, amounts, transaction records and errors.

pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod request;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use request::*;
pub use error::*;
pub use time::*;
