//! Durable state owned by this tool.

pub mod ledger;

pub use ledger::{Ledger, LedgerEntry};
