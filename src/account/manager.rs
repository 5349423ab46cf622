//! In-memory account manager.
//!
//! Wraps a [`Vec<Account>`] with a selection policy (sticky / round-robin /
//! lowest-usage), health/rate-limit filtering and auto-recovery, and the
//! mutators the dispatcher calls after a refresh or a non-2xx response.
//! Guarded by a single `Mutex` (per-account serialisation,
//! selection is a short read and mutation a short write, so lock contention
//! stays cheap).

use std::sync::Mutex;

use crate::codec::{self, AuthMethod, RefreshParts};
use crate::config::AccountSelectionStrategy;
use crate::error::{Error, Result};

use super::model::Account;

/// The outcome of a refresh, applied via [`AccountManager::update_from_auth`].
pub struct AuthUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
    pub real_email: Option<String>,
}

struct Inner {
    accounts: Vec<Account>,
    cursor: usize,
}

/// In-memory projection of the account store, implementing the selection
/// policy and the health/rate-limit state machine.
pub struct AccountManager {
    inner: Mutex<Inner>,
    strategy: AccountSelectionStrategy,
}

impl AccountManager {
    pub fn new(accounts: Vec<Account>, strategy: AccountSelectionStrategy) -> Self {
        Self {
            inner: Mutex::new(Inner { accounts, cursor: 0 }),
            strategy,
        }
    }

    /// Returns a snapshot of all accounts (e.g. for persistence via the store).
    pub fn snapshot(&self) -> Vec<Account> {
        self.inner.lock().expect("account manager mutex poisoned").accounts.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("account manager mutex poisoned").accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_account(&self, account: Account) {
        self.inner
            .lock()
            .expect("account manager mutex poisoned")
            .accounts
            .push(account);
    }

    /// Selects the account to use for the next request, applying the filter +
    /// strategy. Returns `None` when every account is temporarily
    /// unavailable: never returns an unhealthy account past
    /// its recovery time, nor a rate-limited one.
    pub fn select_for_request(&self, now_ms: i64) -> Option<Account> {
        let mut inner = self.inner.lock().expect("account manager mutex poisoned");

        // Auto-recover in place before filtering.
        for account in inner.accounts.iter_mut() {
            if account.should_auto_recover(now_ms) {
                account.auto_recover();
            }
        }

        let eligible_indices: Vec<usize> = inner
            .accounts
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_healthy && !a.is_rate_limited(now_ms))
            .map(|(i, _)| i)
            .collect();

        if eligible_indices.is_empty() {
            return None;
        }

        let chosen_index = match self.strategy {
            AccountSelectionStrategy::Sticky => {
                if let Some(&idx) = eligible_indices.iter().find(|&&i| i >= inner.cursor) {
                    idx
                } else {
                    eligible_indices[0]
                }
            }
            AccountSelectionStrategy::RoundRobin => {
                let n = eligible_indices.len();
                let pos = inner.cursor % n;
                let idx = eligible_indices[pos];
                inner.cursor = inner.cursor.wrapping_add(1);
                idx
            }
            AccountSelectionStrategy::LowestUsage => *eligible_indices
                .iter()
                .min_by_key(|&&i| {
                    let a = &inner.accounts[i];
                    (a.used_count, a.last_used)
                })
                .expect("eligible_indices is non-empty"),
        };

        if matches!(self.strategy, AccountSelectionStrategy::Sticky) {
            inner.cursor = chosen_index;
        }

        let account = inner.accounts[chosen_index].clone();
        inner.accounts[chosen_index].last_used = now_ms;
        Some(account)
    }

    /// The shortest wait (in ms) until any account becomes available again,
    /// for callers to back off by when `select_for_request` returns `None`.
    pub fn min_wait_time_ms(&self, now_ms: i64) -> Option<i64> {
        let inner = self.inner.lock().expect("account manager mutex poisoned");
        inner
            .accounts
            .iter()
            .filter_map(|a| {
                let rate_limit_wait = a
                    .rate_limit_reset_time
                    .filter(|&t| t > now_ms)
                    .map(|t| t - now_ms);
                let recovery_wait = if a.is_healthy {
                    None
                } else {
                    a.recovery_time.filter(|&t| t > now_ms).map(|t| t - now_ms)
                };
                match (rate_limit_wait, recovery_wait) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (Some(a), None) => Some(a),
                    (None, Some(b)) => Some(b),
                    (None, None) => None,
                }
            })
            .min()
    }

    fn with_account_mut<F: FnOnce(&mut Account)>(&self, id: &str, f: F) -> bool {
        let mut inner = self.inner.lock().expect("account manager mutex poisoned");
        if let Some(account) = inner.accounts.iter_mut().find(|a| a.id == id) {
            f(account);
            true
        } else {
            false
        }
    }

    pub fn mark_rate_limited(&self, id: &str, now_ms: i64, retry_after_ms: i64) {
        self.with_account_mut(id, |a| {
            a.rate_limit_reset_time = Some(now_ms + retry_after_ms);
        });
    }

    pub fn mark_unhealthy(&self, id: &str, reason: impl Into<String>, recovery_time: Option<i64>) {
        self.with_account_mut(id, |a| a.mark_unhealthy(reason, recovery_time));
    }

    /// Applies a `getUsageLimits` result: the usage counters,
    /// and the real email if the upstream resolved one (replacing any
    /// placeholder address and recomputing `id`).
    pub fn update_usage(&self, id: &str, used_count: u64, limit_count: u64, real_email: Option<String>) {
        self.with_account_mut(id, |a| {
            a.used_count = used_count;
            a.limit_count = limit_count;
            if let Some(email) = real_email {
                if !email.is_empty() && email != a.email {
                    a.email = email;
                    a.recompute_id();
                }
            }
        });
    }

    /// Applies a successful refresh: new access token/expiry, re-encoded
    /// refresh triple, and the real email if the upstream resolved one.
    pub fn update_from_auth(&self, id: &str, update: AuthUpdate) -> Result<()> {
        let mut inner = self.inner.lock().expect("account manager mutex poisoned");
        let account = inner
            .accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::Translation(format!("no such account: {id}")))?;

        account.access_token = update.access_token;
        account.expires_at = update.expires_at;
        if let Some(refresh_token) = update.refresh_token {
            account.refresh_token = refresh_token;
        }
        if let Some(email) = update.real_email {
            account.email = email;
            account.recompute_id();
        }
        account.fail_count = 0;
        account.last_sync = update.expires_at;
        Ok(())
    }

    /// Removes an account outright (terminal refresh failure).
    pub fn remove_account(&self, id: &str) {
        let mut inner = self.inner.lock().expect("account manager mutex poisoned");
        inner.accounts.retain(|a| a.id != id);
    }

    /// Re-encodes an account's credential bundle via the component-A codec.
    pub fn encode_refresh_string(account: &Account) -> Result<String> {
        codec::encode(&RefreshParts {
            refresh_token: account.refresh_token.clone(),
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            start_url: account.start_url.clone(),
            auth_method: account.auth_method,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> Account {
        Account::new(
            email.into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "cid".into(),
            "sec".into(),
            None,
            None,
            "rt".into(),
        )
    }

    #[test]
    fn selection_skips_unhealthy_and_rate_limited() {
        let mut a1 = account("a@x.com");
        a1.mark_unhealthy("Quota exhausted", Some(i64::MAX));
        let a2 = account("b@x.com");
        let mut a3 = account("c@x.com");
        a3.rate_limit_reset_time = Some(i64::MAX);

        let manager = AccountManager::new(vec![a1, a2.clone(), a3], AccountSelectionStrategy::RoundRobin);
        let selected = manager.select_for_request(1000).unwrap();
        assert_eq!(selected.id, a2.id);
    }

    #[test]
    fn selection_returns_none_when_all_unavailable() {
        let mut a1 = account("a@x.com");
        a1.mark_unhealthy("Forbidden", None);
        let manager = AccountManager::new(vec![a1], AccountSelectionStrategy::Sticky);
        assert!(manager.select_for_request(1000).is_none());
    }

    #[test]
    fn unhealthy_account_auto_recovers_when_due() {
        let mut a1 = account("a@x.com");
        a1.mark_unhealthy("Quota exhausted", Some(500));
        let manager = AccountManager::new(vec![a1.clone()], AccountSelectionStrategy::Sticky);

        assert!(manager.select_for_request(100).is_none());
        let selected = manager.select_for_request(600).unwrap();
        assert_eq!(selected.id, a1.id);
        assert!(selected.is_healthy);
    }

    #[test]
    fn round_robin_advances_through_eligible_accounts() {
        let a1 = account("a@x.com");
        let a2 = account("b@x.com");
        let manager = AccountManager::new(vec![a1.clone(), a2.clone()], AccountSelectionStrategy::RoundRobin);

        let first = manager.select_for_request(0).unwrap();
        let second = manager.select_for_request(0).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn lowest_usage_picks_least_used_account() {
        let mut a1 = account("a@x.com");
        a1.used_count = 100;
        let mut a2 = account("b@x.com");
        a2.used_count = 5;
        let manager = AccountManager::new(vec![a1, a2.clone()], AccountSelectionStrategy::LowestUsage);

        let selected = manager.select_for_request(0).unwrap();
        assert_eq!(selected.id, a2.id);
    }

    #[test]
    fn mark_rate_limited_sets_reset_time() {
        let a1 = account("a@x.com");
        let id = a1.id.clone();
        let manager = AccountManager::new(vec![a1], AccountSelectionStrategy::Sticky);
        manager.mark_rate_limited(&id, 1000, 30_000);

        assert!(manager.select_for_request(1000).is_none());
        assert!(manager.select_for_request(31_001).is_some());
    }

    #[test]
    fn update_from_auth_rotates_tokens_and_recomputes_id_on_email_change() {
        let a1 = account("builder-id-placeholder+abc@awsapps.local");
        let old_id = a1.id.clone();
        let manager = AccountManager::new(vec![a1], AccountSelectionStrategy::Sticky);

        manager
            .update_from_auth(
                &old_id,
                AuthUpdate {
                    access_token: "AT2".into(),
                    refresh_token: Some("RT2".into()),
                    expires_at: 99999,
                    real_email: Some("real@company.com".into()),
                },
            )
            .unwrap();

        let snapshot = manager.snapshot();
        let updated = &snapshot[0];
        assert_eq!(updated.access_token, "AT2");
        assert_eq!(updated.refresh_token, "RT2");
        assert_eq!(updated.email, "real@company.com");
        assert_ne!(updated.id, old_id);
    }

    #[test]
    fn remove_account_drops_it() {
        let a1 = account("a@x.com");
        let id = a1.id.clone();
        let manager = AccountManager::new(vec![a1], AccountSelectionStrategy::Sticky);
        manager.remove_account(&id);
        assert!(manager.is_empty());
    }
}
