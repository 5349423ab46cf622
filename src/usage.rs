//! Usage & quota tracker.

use chrono::{Datelike, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::account::AccountManager;
use crate::error::Result;

#[derive(Debug, Deserialize, Default)]
struct UsageLimitsResponse {
    #[serde(alias = "usedCount")]
    used_count: Option<u64>,
    #[serde(alias = "limitCount")]
    limit_count: Option<u64>,
    #[serde(alias = "userInfo")]
    user_info: Option<UserInfo>,
}

#[derive(Debug, Deserialize, Default)]
struct UserInfo {
    email: Option<String>,
}

/// Computed epoch-ms instant of the first moment of next UTC month, the
/// recovery time used both for 402 quarantine (4.J) and quota exhaustion
/// (4.K).
pub fn next_utc_month_start_ms(now_ms: i64) -> i64 {
    let now = Utc
        .timestamp_millis_opt(now_ms)
        .single()
        .unwrap_or_else(Utc::now);
    let (next_year, next_month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .expect("valid first-of-month date")
        .timestamp_millis()
}

/// Fetches `getUsageLimits` for `account_id` and applies the result to the
/// account manager: `usedCount`/`limitCount`, the resolved real email if one
/// was returned, and, on exhaustion, a quota-exhausted quarantine.
pub async fn refresh_usage(
    client: &reqwest::Client,
    manager: &AccountManager,
    account_id: &str,
    now_ms: i64,
) -> Result<()> {
    let account = {
        let snapshot = manager.snapshot();
        match snapshot.into_iter().find(|a| a.id == account_id) {
            Some(a) => a,
            None => return Ok(()),
        }
    };

    let host = kiro_gateway::config::kiro_api_host(&account.region);
    let mut url = format!(
        "{host}/getUsageLimits?isEmailRequired=true&origin=AI_EDITOR&resourceType=AGENTIC_REQUEST"
    );
    if let Some(arn) = &account.profile_arn {
        url.push_str("&profileArn=");
        url.push_str(arn);
    }

    let response = match client
        .get(&url)
        .bearer_auth(&account.access_token)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            warn!(account_id, error = %e, "usage limits request failed");
            return Ok(());
        }
    };

    if !response.status().is_success() {
        warn!(account_id, status = response.status().as_u16(), "usage limits returned non-2xx");
        return Ok(());
    }

    let parsed: UsageLimitsResponse = match response.json().await {
        Ok(p) => p,
        Err(e) => {
            warn!(account_id, error = %e, "failed to parse usage limits response");
            return Ok(());
        }
    };

    apply_usage(manager, account_id, parsed, now_ms);
    Ok(())
}

fn apply_usage(manager: &AccountManager, account_id: &str, response: UsageLimitsResponse, now_ms: i64) {
    let used_count = response.used_count.unwrap_or(0);
    let limit_count = response.limit_count.unwrap_or(0);
    let real_email = response.user_info.and_then(|u| u.email);

    manager.update_usage(account_id, used_count, limit_count, real_email.clone());

    if limit_count > 0 && used_count >= limit_count {
        let recovery_time = next_utc_month_start_ms(now_ms);
        manager.mark_unhealthy(account_id, "Quota exhausted", Some(recovery_time));
    }

    debug!(account_id, used_count, limit_count, email = ?real_email, "usage limits applied");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_month_rolls_over_december() {
        // 2025-12-15T12:00:00Z
        let december = Utc.with_ymd_and_hms(2025, 12, 15, 12, 0, 0).unwrap().timestamp_millis();
        let next = next_utc_month_start_ms(december);
        let expected = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn next_month_mid_year() {
        let march = Utc.with_ymd_and_hms(2026, 3, 10, 8, 30, 0).unwrap().timestamp_millis();
        let next = next_utc_month_start_ms(march);
        let expected = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(next, expected);
    }

    #[test]
    fn response_accepts_camel_case_fields() {
        let parsed: UsageLimitsResponse = serde_json::from_str(
            r#"{"usedCount": 10, "limitCount": 100, "userInfo": {"email": "a@b.com"}}"#,
        )
        .unwrap();
        assert_eq!(parsed.used_count, Some(10));
        assert_eq!(parsed.limit_count, Some(100));
        assert_eq!(parsed.user_info.unwrap().email.as_deref(), Some("a@b.com"));
    }
}
