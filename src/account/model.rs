//! The `Account` data model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec::AuthMethod;

/// Closed set of supported regions; anything else normalises to `us-east-1`.
const KNOWN_REGIONS: &[&str] = &["us-east-1", "us-west-2"];

/// Normalises a region string to one of the closed set, defaulting to
/// `us-east-1` for anything unrecognised.
pub fn normalize_region(region: &str) -> String {
    if KNOWN_REGIONS.contains(&region) {
        region.to_string()
    } else {
        "us-east-1".to_string()
    }
}

/// Computes the deterministic 32-hex account ID from the four identifying
/// fields. Stable across runs and across process restarts.
pub fn account_id(email: &str, auth_method: AuthMethod, client_id: &str, profile_arn: Option<&str>) -> String {
    let method_tag = match auth_method {
        AuthMethod::BuilderId => "builder-id",
        AuthMethod::IdentityCenter => "identity-center",
    };
    let mut hasher = Sha256::new();
    hasher.update(email.as_bytes());
    hasher.update(b"\0");
    hasher.update(method_tag.as_bytes());
    hasher.update(b"\0");
    hasher.update(client_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(profile_arn.unwrap_or("").as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").expect("writing to a String never fails");
    }
    s
}

/// Builds the synthetic placeholder email used before the real one is
/// discovered via the usage endpoint.
pub fn placeholder_email(auth_method: AuthMethod, seed: &str) -> String {
    let method_tag = match auth_method {
        AuthMethod::BuilderId => "builder-id",
        AuthMethod::IdentityCenter => "identity-center",
    };
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let hash16 = hex_encode(&digest[..8]);
    format!("{method_tag}-placeholder+{hash16}@awsapps.local")
}

/// One authenticated identity in the fleet.
#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub email: String,
    pub auth_method: AuthMethod,
    pub region: String,
    pub client_id: String,
    pub client_secret: String,
    pub start_url: Option<String>,
    #[serde(default)]
    pub profile_arn: Option<String>,
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub expires_at: i64,

    #[serde(default = "default_true")]
    pub is_healthy: bool,
    #[serde(default)]
    pub unhealthy_reason: String,
    #[serde(default)]
    pub recovery_time: Option<i64>,

    #[serde(default)]
    pub rate_limit_reset_time: Option<i64>,
    #[serde(default)]
    pub fail_count: u32,
    #[serde(default)]
    pub last_used: i64,
    #[serde(default)]
    pub last_sync: i64,

    #[serde(default)]
    pub used_count: u64,
    #[serde(default)]
    pub limit_count: u64,
}

fn default_true() -> bool {
    true
}

impl Account {
    /// Creates a new healthy account, computing its deterministic ID.
    pub fn new(
        email: String,
        auth_method: AuthMethod,
        region: String,
        client_id: String,
        client_secret: String,
        start_url: Option<String>,
        profile_arn: Option<String>,
        refresh_token: String,
    ) -> Self {
        let id = account_id(&email, auth_method, &client_id, profile_arn.as_deref());
        Self {
            id,
            email,
            auth_method,
            region: normalize_region(&region),
            client_id,
            client_secret,
            start_url,
            profile_arn,
            refresh_token,
            access_token: String::new(),
            expires_at: 0,
            is_healthy: true,
            unhealthy_reason: String::new(),
            recovery_time: None,
            rate_limit_reset_time: None,
            fail_count: 0,
            last_used: 0,
            last_sync: 0,
            used_count: 0,
            limit_count: 0,
        }
    }

    /// Recomputes `id` from the current identifying fields. Any mutation of
    /// `email`/`auth_method`/`client_id`/`profile_arn` must be followed by a
    /// call to this, or the account will be indexed under its old identity.
    pub fn recompute_id(&mut self) {
        self.id = account_id(
            &self.email,
            self.auth_method,
            &self.client_id,
            self.profile_arn.as_deref(),
        );
    }

    /// True if `recoveryTime` has passed (or was never set for an unhealthy
    /// account, which never auto-recovers).
    pub fn should_auto_recover(&self, now_ms: i64) -> bool {
        !self.is_healthy && self.recovery_time.is_some_and(|t| now_ms >= t)
    }

    /// Clears the unhealthy triple, per the manager's auto-recovery rule.
    pub fn auto_recover(&mut self) {
        self.is_healthy = true;
        self.unhealthy_reason.clear();
        self.recovery_time = None;
    }

    pub fn mark_unhealthy(&mut self, reason: impl Into<String>, recovery_time: Option<i64>) {
        self.is_healthy = false;
        self.unhealthy_reason = reason.into();
        self.recovery_time = recovery_time;
    }

    pub fn is_rate_limited(&self, now_ms: i64) -> bool {
        self.rate_limit_reset_time.is_some_and(|t| t > now_ms)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("auth_method", &self.auth_method)
            .field("region", &self.region)
            .field("client_id", &"[REDACTED]")
            .field("client_secret", &"[REDACTED]")
            .field("start_url", &self.start_url)
            .field("profile_arn", &self.profile_arn)
            .field("refresh_token", &"[REDACTED]")
            .field("access_token", &if self.access_token.is_empty() { "" } else { "[REDACTED]" })
            .field("expires_at", &self.expires_at)
            .field("is_healthy", &self.is_healthy)
            .field("unhealthy_reason", &self.unhealthy_reason)
            .field("recovery_time", &self.recovery_time)
            .field("rate_limit_reset_time", &self.rate_limit_reset_time)
            .field("fail_count", &self.fail_count)
            .field("last_used", &self.last_used)
            .field("used_count", &self.used_count)
            .field("limit_count", &self.limit_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_normalizes_unknown_values() {
        assert_eq!(normalize_region("us-east-1"), "us-east-1");
        assert_eq!(normalize_region("us-west-2"), "us-west-2");
        assert_eq!(normalize_region("eu-west-1"), "us-east-1");
        assert_eq!(normalize_region(""), "us-east-1");
    }

    #[test]
    fn account_id_is_stable_and_pure() {
        let id1 = account_id("a@b.com", AuthMethod::BuilderId, "cid", None);
        let id2 = account_id("a@b.com", AuthMethod::BuilderId, "cid", None);
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 32);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn account_id_changes_with_any_identifying_field() {
        let base = account_id("a@b.com", AuthMethod::BuilderId, "cid", None);
        assert_ne!(base, account_id("x@b.com", AuthMethod::BuilderId, "cid", None));
        assert_ne!(base, account_id("a@b.com", AuthMethod::IdentityCenter, "cid", None));
        assert_ne!(base, account_id("a@b.com", AuthMethod::BuilderId, "other", None));
        assert_ne!(
            base,
            account_id("a@b.com", AuthMethod::BuilderId, "cid", Some("arn:x"))
        );
    }

    #[test]
    fn unhealthy_account_auto_recovers_only_after_recovery_time() {
        let mut account = Account::new(
            "a@b.com".into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "cid".into(),
            "sec".into(),
            None,
            None,
            "rt".into(),
        );
        account.mark_unhealthy("Quota exhausted", Some(1000));
        assert!(!account.should_auto_recover(500));
        assert!(account.should_auto_recover(1000));
        account.auto_recover();
        assert!(account.is_healthy);
        assert!(account.unhealthy_reason.is_empty());
    }

    #[test]
    fn debug_impl_redacts_secrets() {
        let mut account = Account::new(
            "a@b.com".into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "cid".into(),
            "super-secret".into(),
            None,
            None,
            "refresh-secret".into(),
        );
        account.access_token = "access-secret".into();
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("refresh-secret"));
        assert!(!rendered.contains("access-secret"));
    }
}
