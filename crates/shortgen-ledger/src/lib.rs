//! Per-user quota and reward-ticket ledger.
//!
//! This crate provides:
//! - Atomic daily-quota reservation and refund
//! - Bonus credits granted through a replay-safe reward-ticket protocol
//! - Lazy daily rollover with no timer process

pub mod error;
pub mod ledger;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{QuotaLedger, DEFAULT_DAILY_QUOTA, TICKET_TTL_MINUTES};
