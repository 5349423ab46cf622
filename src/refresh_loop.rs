//! Proactive refresh loop.
//!
//! A cooperative periodic task: every `interval`, refreshes any account
//! whose access token is within `buffer` of expiry, then
//! persists the fleet. Errors are logged, never fatal; the loop
//! stops cleanly when `shutdown` fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::account::{AccountManager, AccountStore, AuthUpdate, LoadedAccounts};
use crate::refresh;

/// Runs the proactive refresh loop until `shutdown` is signalled.
///
/// `now_ms` supplies the current epoch-ms time on each tick (injected so the
/// loop's decisions are testable without wall-clock sleeps).
pub async fn run(
    http: reqwest::Client,
    manager: Arc<AccountManager>,
    store: Arc<AccountStore>,
    interval: Duration,
    buffer_ms: i64,
    mut shutdown: watch::Receiver<bool>,
    now_ms: impl Fn() -> i64 + Send + Sync + 'static,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tick(&http, &manager, &store, buffer_ms, now_ms()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("proactive refresh loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Runs a single pass: refreshes every account within `buffer_ms` of expiry.
pub async fn tick(http: &reqwest::Client, manager: &AccountManager, store: &AccountStore, buffer_ms: i64, now_ms: i64) {
    let due: Vec<_> = manager
        .snapshot()
        .into_iter()
        .filter(|a| a.expires_at > now_ms && a.expires_at - now_ms <= buffer_ms)
        .collect();

    if due.is_empty() {
        return;
    }

    let mut any_refreshed = false;
    for account in due {
        match refresh::refresh(http, &account, now_ms).await {
            Ok(refreshed) => {
                let result = manager.update_from_auth(
                    &account.id,
                    AuthUpdate {
                        access_token: refreshed.access_token,
                        refresh_token: refreshed.refresh_token,
                        expires_at: refreshed.expires_at,
                        real_email: None,
                    },
                );
                match result {
                    Ok(()) => {
                        any_refreshed = true;
                        info!(account_id = %account.id, "proactively refreshed access token");
                    }
                    Err(e) => error!(account_id = %account.id, error = %e, "failed to apply proactive refresh"),
                }
            }
            Err(e) if e.is_terminal_for_account() => {
                warn!(account_id = %account.id, error = %e, "proactive refresh failed terminally, removing account");
                manager.remove_account(&account.id);
                any_refreshed = true;
            }
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "proactive refresh failed, will retry next tick");
            }
        }
    }

    if any_refreshed {
        let snapshot = LoadedAccounts {
            accounts: manager.snapshot(),
            active_index: 0,
        };
        if let Err(e) = store.save(&snapshot) {
            error!(error = %e, "failed to persist accounts after proactive refresh");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::codec::AuthMethod;
    use crate::config::AccountSelectionStrategy;

    fn account_expiring_at(expires_at: i64) -> Account {
        let mut a = Account::new(
            "a@b.com".into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "cid".into(),
            "sec".into(),
            None,
            None,
            "rt".into(),
        );
        a.expires_at = expires_at;
        a.access_token = "old".into();
        a
    }

    #[tokio::test]
    async fn tick_skips_accounts_not_near_expiry() {
        let manager = AccountManager::new(vec![account_expiring_at(1_000_000)], AccountSelectionStrategy::Sticky);
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts.json"));
        let http = reqwest::Client::new();

        // now_ms is far before expiry minus buffer, so nothing should be touched.
        tick(&http, &manager, &store, 600_000, 0).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].access_token, "old");
    }
}
