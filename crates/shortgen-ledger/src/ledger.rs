//! Quota and reward-ticket ledger.
//!
//! All multi-field invariants (quota reservation, ticket redemption) are
//! enforced inside a single mutex-guarded critical section, never as a
//! read-then-write pair. The daily reset is computed lazily on every account
//! access, so no timer task is needed and concurrent callers converge on the
//! same post-reset state.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use shortgen_models::{QuotaAccount, QuotaUsage, RewardTicket};

use crate::error::{LedgerError, LedgerResult};

/// Default jobs per user per day (free tier).
pub const DEFAULT_DAILY_QUOTA: u32 = 5;

/// How long an issued reward ticket stays redeemable.
pub const TICKET_TTL_MINUTES: i64 = 10;

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<String, QuotaAccount>,
    tickets: HashMap<String, RewardTicket>,
}

/// Per-user quota and bonus-credit bookkeeping.
#[derive(Debug)]
pub struct QuotaLedger {
    state: Mutex<LedgerState>,
    default_daily_quota: u32,
    ticket_ttl: Duration,
}

impl Default for QuotaLedger {
    fn default() -> Self {
        Self::new(DEFAULT_DAILY_QUOTA)
    }
}

impl QuotaLedger {
    /// Create a ledger with the given default daily quota for new accounts.
    pub fn new(default_daily_quota: u32) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            default_daily_quota,
            ticket_ttl: Duration::minutes(TICKET_TTL_MINUTES),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Override a user's daily quota (plan change).
    pub fn set_daily_quota(&self, user_id: &str, daily_quota: u32) {
        let mut state = self.lock();
        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, Utc::now());
        account.daily_quota = daily_quota;
    }

    /// Atomically reserve one generation unit for the user.
    ///
    /// Fails with `QuotaExceeded` when `daily_used` has reached
    /// `daily_quota + bonus_credits`; otherwise increments `daily_used`.
    pub fn reserve(&self, user_id: &str) -> LedgerResult<()> {
        let mut state = self.lock();
        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, Utc::now());

        if account.remaining() == 0 {
            debug!(
                user_id = %user_id,
                used = account.daily_used,
                quota = account.daily_quota,
                bonus = account.bonus_credits,
                "Quota reservation rejected"
            );
            return Err(LedgerError::QuotaExceeded {
                used: account.daily_used,
                limit: account.daily_quota + account.bonus_credits,
            });
        }

        account.daily_used += 1;
        debug!(user_id = %user_id, used = account.daily_used, "Reserved quota unit");
        Ok(())
    }

    /// Return one reserved unit (render failure path). Floored at zero.
    pub fn refund(&self, user_id: &str) {
        let mut state = self.lock();
        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, Utc::now());
        account.daily_used = account.daily_used.saturating_sub(1);
        debug!(user_id = %user_id, used = account.daily_used, "Refunded quota unit");
    }

    /// Grant `n` bonus credits to the user.
    pub fn grant_bonus(&self, user_id: &str, n: u32) {
        let mut state = self.lock();
        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, Utc::now());
        account.bonus_credits += n;
        info!(user_id = %user_id, bonus = account.bonus_credits, "Granted bonus credits");
    }

    /// Issue a short-lived, single-use reward ticket for the user.
    pub fn issue_ticket(&self, user_id: &str) -> String {
        let ticket = RewardTicket::issue(user_id, self.ticket_ttl);
        let ticket_id = ticket.id.clone();

        let mut state = self.lock();
        prune_dead_tickets(&mut state.tickets, Utc::now());
        state.tickets.insert(ticket_id.clone(), ticket);

        debug!(user_id = %user_id, ticket_id = %ticket_id, "Issued reward ticket");
        ticket_id
    }

    /// Redeem a ticket for one bonus credit.
    ///
    /// Ownership, expiry, and redemption state are checked and the credit is
    /// granted in one critical section, so a ticket can never grant credit
    /// twice: the second of two concurrent callers observes `AlreadyRedeemed`.
    pub fn redeem(&self, ticket_id: &str, user_id: &str) -> LedgerResult<()> {
        let mut state = self.lock();
        let now = Utc::now();

        let ticket = state
            .tickets
            .get_mut(ticket_id)
            .ok_or(LedgerError::InvalidTicket)?;
        if ticket.user_id != user_id {
            return Err(LedgerError::InvalidTicket);
        }
        if ticket.is_expired(now) {
            return Err(LedgerError::ExpiredTicket);
        }
        if ticket.redeemed {
            return Err(LedgerError::AlreadyRedeemed);
        }
        ticket.redeemed = true;

        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, now);
        account.bonus_credits += 1;

        info!(user_id = %user_id, ticket_id = %ticket_id, "Redeemed reward ticket");
        Ok(())
    }

    /// Snapshot the user's quota state.
    pub fn usage(&self, user_id: &str) -> QuotaUsage {
        let mut state = self.lock();
        let default_quota = self.default_daily_quota;
        let account = account_mut(&mut state, user_id, default_quota, Utc::now());
        QuotaUsage::from(&*account)
    }

    #[cfg(test)]
    fn set_reset_at(&self, user_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(account) = state.accounts.get_mut(user_id) {
            account.reset_at = at;
        }
    }

    #[cfg(test)]
    fn expire_ticket(&self, ticket_id: &str) {
        let mut state = self.lock();
        if let Some(ticket) = state.tickets.get_mut(ticket_id) {
            ticket.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

/// Fetch (or create) the user's account with the lazy rollover applied.
fn account_mut<'a>(
    state: &'a mut LedgerState,
    user_id: &str,
    default_daily_quota: u32,
    now: DateTime<Utc>,
) -> &'a mut QuotaAccount {
    let account = state
        .accounts
        .entry(user_id.to_string())
        .or_insert_with(|| QuotaAccount::new(default_daily_quota));
    account.rollover_if_due(now);
    account
}

/// Drop tickets that can never be redeemed anymore.
fn prune_dead_tickets(tickets: &mut HashMap<String, RewardTicket>, now: DateTime<Utc>) {
    let horizon = now - Duration::hours(1);
    tickets.retain(|_, t| !t.redeemed && t.expires_at > horizon);
}
