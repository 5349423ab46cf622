//! Fleet-level error taxonomy.
//!
//! Mirrors the shape of [`kiro_gateway::Error`]: one `thiserror`-derived enum,
//! `#[from]` conversions for the usual infrastructure errors, and a
//! `requires_reauth()`-style classifier, extended with the dispatcher-level
//! variants from the error-handling design (token refresh, quota, rate limit,
//! auth, translation, no-available-accounts, upstream, max-retries).

use std::time::Duration;
use thiserror::Error;

/// The fleet-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Token refresh failed with a classified sub-code.
    #[error("token refresh failed ({code}): {message}")]
    TokenRefresh {
        /// `invalid_grant`, `MISSING_CREDENTIALS`, `NETWORK_ERROR`, `INVALID_RESPONSE`, or `HTTP_<n>`.
        code: String,
        /// Human-readable detail from the upstream response, if any.
        message: String,
    },

    /// The account's usage quota is exhausted for the current billing period.
    #[error("quota exhausted, recovers at {recovery_time:?}")]
    QuotaExhausted {
        /// Epoch-ms instant the account auto-recovers, if known.
        recovery_time: Option<i64>,
    },

    /// Upstream returned 429.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimit {
        /// Seconds to wait before retrying, if the upstream supplied one.
        retry_after: Option<u64>,
    },

    /// Upstream returned 401/403 outside the automatic-refresh path.
    #[error("auth error (status {status:?})")]
    Auth {
        /// HTTP status code, if applicable.
        status: Option<u16>,
    },

    /// The request body was malformed or named an unsupported model.
    #[error("translation error: {0}")]
    Translation(String),

    /// Every account is quarantined or rate-limited.
    #[error("no available accounts")]
    NoAvailableAccounts,

    /// Upstream returned a non-2xx status not otherwise classified.
    #[error("upstream error (status {status}): {body}")]
    Upstream {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated if large.
        body: String,
    },

    /// The dispatcher's retry loop exhausted `rate_limit_max_retries`.
    #[error("max retries exceeded (last status {status:?})")]
    MaxRetriesExceeded {
        /// Last observed upstream status code, if any.
        status: Option<u16>,
    },

    /// A device-code authorization attempt failed terminally.
    #[error("device authorization failed: {0}")]
    DeviceAuthorization(String),

    /// Required field missing while encoding/decoding the compound refresh string.
    #[error("missing credential field: {0}")]
    MissingCredentials(String),

    /// The compound refresh-token string carried an unrecognized trailing tag.
    #[error("unrecognized auth method tag: {0}")]
    UnknownAuthMethodTag(String),

    /// Account-store lock could not be acquired within the retry budget.
    #[error("account store lock unavailable at {path}")]
    LockUnavailable {
        /// Lock file path.
        path: std::path::PathBuf,
    },

    /// Account-store I/O error.
    #[error("account store I/O error at {path}: {message}")]
    StorageIo {
        /// Path that caused the error.
        path: std::path::PathBuf,
        /// Error description.
        message: String,
    },

    /// Network/HTTP error.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// General I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by the underlying single-account library.
    #[error("gateway library error: {0}")]
    Gateway(#[from] kiro_gateway::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,
}

impl Error {
    /// True when the error indicates the caller should force a token refresh
    /// and retry, rather than surface a user-visible failure.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Auth { status: Some(401) } | Error::RateLimit { .. } | Error::Network(_)
        )
    }

    /// True when the underlying account should be removed outright (terminal
    /// refresh failure).
    #[must_use]
    pub fn is_terminal_for_account(&self) -> bool {
        match self {
            Error::TokenRefresh { code, .. } => code == "invalid_grant",
            Error::Auth {
                status: Some(401) | Some(403),
            } => true,
            _ => false,
        }
    }

    /// Builds a [`Duration`] from a [`Error::RateLimit`]'s `retry_after`,
    /// defaulting to 60s per the dispatcher status-code policy.
    #[must_use]
    pub fn retry_after_duration(&self) -> Duration {
        match self {
            Error::RateLimit { retry_after } => Duration::from_secs(retry_after.unwrap_or(60)),
            _ => Duration::from_secs(60),
        }
    }

    /// Classify a raw `error` field from an upstream refresh/auth response
    /// body per the permanent-error classifier.
    #[must_use]
    pub fn is_permanent_refresh_failure(message: &str) -> bool {
        matches!(
            message,
            "Invalid refresh token"
                | "Expired/InvalidTokenException"
                | "HTTP_401"
                | "HTTP_403"
                | "invalid_grant"
        )
    }

    /// Creates a storage I/O error.
    #[must_use]
    pub fn storage_io(path: impl Into<std::path::PathBuf>, message: impl Into<String>) -> Self {
        Self::StorageIo {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_terminal() {
        let err = Error::TokenRefresh {
            code: "invalid_grant".into(),
            message: "revoked".into(),
        };
        assert!(err.is_terminal_for_account());
    }

    #[test]
    fn unauthorized_is_recoverable_but_not_terminal_on_first_try() {
        let err = Error::Auth { status: Some(401) };
        assert!(err.is_recoverable());
    }

    #[test]
    fn rate_limit_defaults_retry_after_to_sixty_seconds() {
        let err = Error::RateLimit { retry_after: None };
        assert_eq!(err.retry_after_duration(), Duration::from_secs(60));
    }

    #[test]
    fn permanent_refresh_failure_classifier() {
        assert!(Error::is_permanent_refresh_failure("HTTP_401"));
        assert!(Error::is_permanent_refresh_failure("Invalid refresh token"));
        assert!(!Error::is_permanent_refresh_failure("NETWORK_ERROR"));
    }
}
