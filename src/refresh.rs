//! Token refresher.
//!
//! Fleet-aware generalisation of `kiro-gateway-rs`'s
//! [`aws_sso_oidc::refresh_token`](kiro_gateway) — same endpoint and body
//! shape, but dispatched per-account rather than against one configured
//! client, and classifying failures into the fleet [`Error::TokenRefresh`]
//! variant instead of a single `RefreshFailed` string.

use serde::Deserialize;
use tracing::{debug, info};

use crate::account::Account;
use crate::error::{Error, Result};

/// Accepts both camelCase and snake_case response fields.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "accessToken")]
    access_token: Option<String>,
    #[serde(alias = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(alias = "expiresIn")]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// The outcome of a successful refresh, ready to hand to
/// [`crate::account::AccountManager::update_from_auth`].
pub struct RefreshedCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: i64,
}

/// Refreshes `account`'s access token against
/// `POST https://oidc.<region>.amazonaws.com/token`.
pub async fn refresh(client: &reqwest::Client, account: &Account, now_ms: i64) -> Result<RefreshedCredentials> {
    let url = kiro_gateway::config::aws_sso_oidc_url(&account.region);

    let payload = serde_json::json!({
        "grantType": "refresh_token",
        "refreshToken": account.refresh_token,
        "clientId": account.client_id,
        "clientSecret": account.client_secret,
    });

    info!(account_id = %account.id, region = %account.region, "refreshing access token");

    let response = client
        .post(&url)
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await
        .map_err(|e| Error::TokenRefresh {
            code: "NETWORK_ERROR".into(),
            message: e.to_string(),
        })?;

    let status = response.status();
    let body_text = response.text().await.unwrap_or_default();

    if !status.is_success() {
        let parsed: ErrorBody = serde_json::from_str(&body_text).unwrap_or_default();
        let code = parsed
            .error
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
        let message = parsed
            .error_description
            .unwrap_or_else(|| body_text.clone());
        return Err(Error::TokenRefresh { code, message });
    }

    let parsed: RefreshResponse = serde_json::from_str(&body_text).map_err(|_| Error::TokenRefresh {
        code: "INVALID_RESPONSE".into(),
        message: "could not parse refresh response body".into(),
    })?;

    let access_token = parsed.access_token.ok_or_else(|| Error::TokenRefresh {
        code: "INVALID_RESPONSE".into(),
        message: "response did not include an access token".into(),
    })?;

    let expires_in = parsed.expires_in.unwrap_or(3600);
    let expires_at = now_ms + expires_in * 1000;

    debug!(account_id = %account.id, "access token refreshed");

    Ok(RefreshedCredentials {
        access_token,
        // The returned refresh token may be absent; reuse the previous one.
        refresh_token: parsed.refresh_token,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_accepts_camel_and_snake_case() {
        let camel: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"a","refreshToken":"r","expiresIn":10}"#).unwrap();
        assert_eq!(camel.access_token.as_deref(), Some("a"));
        assert_eq!(camel.refresh_token.as_deref(), Some("r"));
        assert_eq!(camel.expires_in, Some(10));

        let snake: RefreshResponse =
            serde_json::from_str(r#"{"access_token":"a2","refresh_token":"r2","expires_in":20}"#).unwrap();
        assert_eq!(snake.access_token.as_deref(), Some("a2"));
        assert_eq!(snake.refresh_token.as_deref(), Some("r2"));
        assert_eq!(snake.expires_in, Some(20));
    }

    #[test]
    fn response_tolerates_missing_refresh_token() {
        let response: RefreshResponse =
            serde_json::from_str(r#"{"accessToken":"a","expiresIn":10}"#).unwrap();
        assert_eq!(response.access_token.as_deref(), Some("a"));
        assert!(response.refresh_token.is_none());
    }

    #[test]
    fn permanent_refresh_failure_classifier_recognises_invalid_grant() {
        assert!(Error::is_permanent_refresh_failure("invalid_grant"));
    }
}
