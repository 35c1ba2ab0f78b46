//! Quota accounts and reward tickets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user daily quota bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaAccount {
    /// Jobs allowed per day from the user's plan
    pub daily_quota: u32,
    /// Jobs reserved since the last reset
    pub daily_used: u32,
    /// Bonus credits granted via reward tickets, consumed after the daily quota
    pub bonus_credits: u32,
    /// When the next daily reset happens
    pub reset_at: DateTime<Utc>,
}

impl QuotaAccount {
    /// Create a fresh account with the given daily quota.
    pub fn new(daily_quota: u32) -> Self {
        Self {
            daily_quota,
            daily_used: 0,
            bonus_credits: 0,
            reset_at: Utc::now() + Duration::days(1),
        }
    }

    /// Apply the daily rollover if it is due.
    ///
    /// Resets `daily_used` and advances `reset_at` past `now`, one day at a
    /// time so a multi-day gap still lands on a future reset. Safe to call on
    /// every access; a no-op when the reset is still ahead.
    pub fn rollover_if_due(&mut self, now: DateTime<Utc>) {
        if now < self.reset_at {
            return;
        }
        self.daily_used = 0;
        while self.reset_at <= now {
            self.reset_at += Duration::days(1);
        }
    }

    /// Units still available today (daily quota plus bonus credits).
    pub fn remaining(&self) -> u32 {
        (self.daily_quota + self.bonus_credits).saturating_sub(self.daily_used)
    }

    /// Check the ledger invariant: used never exceeds quota plus bonus.
    pub fn is_consistent(&self) -> bool {
        self.daily_used <= self.daily_quota + self.bonus_credits
    }
}

/// Snapshot of a user's quota state for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub daily_quota: u32,
    pub daily_used: u32,
    pub bonus_credits: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl From<&QuotaAccount> for QuotaUsage {
    fn from(account: &QuotaAccount) -> Self {
        Self {
            daily_quota: account.daily_quota,
            daily_used: account.daily_used,
            bonus_credits: account.bonus_credits,
            remaining: account.remaining(),
            reset_at: account.reset_at,
        }
    }
}

/// A short-lived, single-use token proving eligibility for one bonus credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardTicket {
    /// Opaque, unguessable ticket id
    pub id: String,
    /// User the ticket was issued to
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Write-once: flips to true exactly once on redemption
    pub redeemed: bool,
}

impl RewardTicket {
    /// Issue a new ticket for a user with the given time-to-live.
    pub fn issue(user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            created_at: now,
            expires_at: now + ttl,
            redeemed: false,
        }
    }

    /// Check whether the ticket has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_counts_bonus() {
        let mut account = QuotaAccount::new(5);
        assert_eq!(account.remaining(), 5);

        account.daily_used = 5;
        assert_eq!(account.remaining(), 0);

        account.bonus_credits = 2;
        assert_eq!(account.remaining(), 2);
        assert!(account.is_consistent());
    }

    #[test]
    fn test_rollover_resets_usage_once() {
        let mut account = QuotaAccount::new(5);
        account.daily_used = 5;
        account.reset_at = Utc::now() - Duration::hours(1);

        let now = Utc::now();
        account.rollover_if_due(now);
        assert_eq!(account.daily_used, 0);
        assert!(account.reset_at > now);

        // Second observation of the same rollover is a no-op.
        let reset_at = account.reset_at;
        account.daily_used = 2;
        account.rollover_if_due(now);
        assert_eq!(account.daily_used, 2);
        assert_eq!(account.reset_at, reset_at);
    }

    #[test]
    fn test_rollover_skips_missed_days() {
        let mut account = QuotaAccount::new(5);
        account.reset_at = Utc::now() - Duration::days(3);

        account.rollover_if_due(Utc::now());
        assert!(account.reset_at > Utc::now());
        assert!(account.reset_at <= Utc::now() + Duration::days(1));
    }

    #[test]
    fn test_ticket_expiry() {
        let mut ticket = RewardTicket::issue("user123", Duration::minutes(10));
        assert!(!ticket.is_expired(Utc::now()));
        assert!(!ticket.redeemed);

        ticket.expires_at = Utc::now() - Duration::seconds(1);
        assert!(ticket.is_expired(Utc::now()));
    }
}
