//! Ledger error types.

use thiserror::Error;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("Daily quota exceeded: {used} of {limit} used")]
    QuotaExceeded { used: u32, limit: u32 },

    #[error("Invalid reward ticket")]
    InvalidTicket,

    #[error("Reward ticket expired")]
    ExpiredTicket,

    #[error("Reward ticket already redeemed")]
    AlreadyRedeemed,
}

impl LedgerError {
    /// Check if this is a quota exhaustion error (user action needed).
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, LedgerError::QuotaExceeded { .. })
    }
}
