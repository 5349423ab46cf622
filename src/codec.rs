//! Compound refresh-token string codec.
//!
//! Packs `refreshToken`, `clientId`/`clientSecret`, `startUrl` and the auth
//! method into one pipe-delimited string so the whole credential bundle can
//! live in a single JSON field on [`crate::account::Account`]. Two canonical
//! shapes, dispatched by the trailing tag:
//!
//! - `idc`             -> `<refreshToken>|<clientId>|<clientSecret>|idc`
//! - `identity-center`  -> `<refreshToken>|<clientId>|<clientSecret>|<startUrl>|identity-center`
//!
//! `decode` additionally accepts the legacy tags `social`, `sso`, `desktop`
//! produced by sibling implementations, mapping them onto the canonical
//! [`AuthMethod`] values below; `encode` never emits them.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonical auth method vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    BuilderId,
    IdentityCenter,
}

impl AuthMethod {
    fn canonical_tag(self) -> &'static str {
        match self {
            AuthMethod::BuilderId => "idc",
            AuthMethod::IdentityCenter => "identity-center",
        }
    }

    /// Maps a trailing tag (canonical or legacy) onto a canonical auth method.
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "idc" | "social" | "desktop" => Some(AuthMethod::BuilderId),
            "identity-center" | "sso" => Some(AuthMethod::IdentityCenter),
            _ => None,
        }
    }
}

/// The decoded credential bundle packed into a refresh-token string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshParts {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    pub start_url: Option<String>,
    pub auth_method: AuthMethod,
}

/// Encodes `parts` into its canonical pipe-delimited form.
///
/// `idc` needs only `refreshToken`/`clientId`/`clientSecret`; `identity-center`
/// additionally requires `startUrl`. Fails with [`Error::MissingCredentials`]
/// if a required field is empty, or [`Error::Translation`] if any field
/// itself contains a `|` (which would make the encoding ambiguous).
pub fn encode(parts: &RefreshParts) -> Result<String> {
    if parts.refresh_token.is_empty() {
        return Err(Error::MissingCredentials("refreshToken".into()));
    }
    if parts.client_id.is_empty() {
        return Err(Error::MissingCredentials("clientId".into()));
    }
    if parts.client_secret.is_empty() {
        return Err(Error::MissingCredentials("clientSecret".into()));
    }

    let fields: Vec<&str> = match parts.auth_method {
        AuthMethod::BuilderId => {
            vec![&parts.refresh_token, &parts.client_id, &parts.client_secret]
        }
        AuthMethod::IdentityCenter => {
            let start_url = parts
                .start_url
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| Error::MissingCredentials("startUrl".into()))?;
            vec![
                &parts.refresh_token,
                &parts.client_id,
                &parts.client_secret,
                start_url,
            ]
        }
    };

    for field in &fields {
        if field.contains('|') {
            return Err(Error::Translation(
                "refresh-token field may not contain '|'".into(),
            ));
        }
    }

    let mut segments = fields;
    let tag = parts.auth_method.canonical_tag();
    segments.push(tag);
    Ok(segments.join("|"))
}

/// Decodes a pipe-delimited refresh-token string, dispatching on the trailing
/// segment. Accepts both canonical (`idc`, `identity-center`) and legacy
/// (`social`, `sso`, `desktop`) tags.
pub fn decode(encoded: &str) -> Result<RefreshParts> {
    let segments: Vec<&str> = encoded.split('|').collect();
    let tag = *segments
        .last()
        .ok_or_else(|| Error::Translation("empty refresh-token string".into()))?;

    let auth_method = AuthMethod::from_tag(tag)
        .ok_or_else(|| Error::UnknownAuthMethodTag(tag.to_string()))?;

    match auth_method {
        AuthMethod::BuilderId => {
            if segments.len() != 4 {
                return Err(Error::Translation(format!(
                    "expected 4 segments for tag {tag:?}, got {}",
                    segments.len()
                )));
            }
            Ok(RefreshParts {
                refresh_token: segments[0].to_string(),
                client_id: segments[1].to_string(),
                client_secret: segments[2].to_string(),
                start_url: None,
                auth_method,
            })
        }
        AuthMethod::IdentityCenter => {
            if segments.len() != 5 {
                return Err(Error::Translation(format!(
                    "expected 5 segments for tag {tag:?}, got {}",
                    segments.len()
                )));
            }
            Ok(RefreshParts {
                refresh_token: segments[0].to_string(),
                client_id: segments[1].to_string(),
                client_secret: segments[2].to_string(),
                start_url: Some(segments[3].to_string()),
                auth_method,
            })
        }
    }
}

/// Validates that a decoded bundle carries everything its auth method needs.
pub fn validate(parts: &RefreshParts) -> bool {
    if parts.refresh_token.is_empty() || parts.client_id.is_empty() || parts.client_secret.is_empty() {
        return false;
    }
    match parts.auth_method {
        AuthMethod::BuilderId => true,
        AuthMethod::IdentityCenter => parts
            .start_url
            .as_deref()
            .is_some_and(|u| u.starts_with("https://")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_pipe() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_.:/-]{1,40}".prop_filter("no pipes", |s| !s.contains('|'))
    }

    #[test]
    fn encodes_builder_id_four_segments() {
        let parts = RefreshParts {
            refresh_token: "r".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            start_url: None,
            auth_method: AuthMethod::BuilderId,
        };
        assert_eq!(encode(&parts).unwrap(), "r|c|s|idc");
    }

    #[test]
    fn encodes_identity_center_five_segments() {
        let parts = RefreshParts {
            refresh_token: "r".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            start_url: Some("https://x.y/start".into()),
            auth_method: AuthMethod::IdentityCenter,
        };
        assert_eq!(
            encode(&parts).unwrap(),
            "r|c|s|https://x.y/start|identity-center"
        );
    }

    #[test]
    fn decode_legacy_tags_map_to_canonical_methods() {
        let social = decode("r|c|s|social").unwrap();
        assert_eq!(social.auth_method, AuthMethod::BuilderId);

        let desktop = decode("r|c|s|desktop").unwrap();
        assert_eq!(desktop.auth_method, AuthMethod::BuilderId);

        let sso = decode("r|c|s|https://x.y/start|sso").unwrap();
        assert_eq!(sso.auth_method, AuthMethod::IdentityCenter);
        assert_eq!(sso.start_url.as_deref(), Some("https://x.y/start"));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let err = decode("r|c|s|bogus").unwrap_err();
        assert!(matches!(err, Error::UnknownAuthMethodTag(_)));
    }

    #[test]
    fn encode_rejects_missing_start_url_for_identity_center() {
        let parts = RefreshParts {
            refresh_token: "r".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            start_url: None,
            auth_method: AuthMethod::IdentityCenter,
        };
        let err = encode(&parts).unwrap_err();
        assert!(matches!(err, Error::MissingCredentials(_)));
    }

    #[test]
    fn encode_rejects_empty_refresh_token() {
        let parts = RefreshParts {
            refresh_token: String::new(),
            client_id: "c".into(),
            client_secret: "s".into(),
            start_url: None,
            auth_method: AuthMethod::BuilderId,
        };
        assert!(matches!(
            encode(&parts).unwrap_err(),
            Error::MissingCredentials(_)
        ));
    }

    #[test]
    fn validate_requires_https_start_url_for_identity_center() {
        let mut parts = RefreshParts {
            refresh_token: "r".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            start_url: Some("http://insecure".into()),
            auth_method: AuthMethod::IdentityCenter,
        };
        assert!(!validate(&parts));
        parts.start_url = Some("https://secure".into());
        assert!(validate(&parts));
    }

    proptest! {
        #[test]
        fn round_trip_builder_id(
            rt in no_pipe(), cid in no_pipe(), sec in no_pipe(),
        ) {
            let parts = RefreshParts {
                refresh_token: rt,
                client_id: cid,
                client_secret: sec,
                start_url: None,
                auth_method: AuthMethod::BuilderId,
            };
            let encoded = encode(&parts).unwrap();
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, parts);
        }

        #[test]
        fn round_trip_identity_center(
            rt in no_pipe(), cid in no_pipe(), sec in no_pipe(), path in no_pipe(),
        ) {
            let start_url = format!("https://{path}");
            let parts = RefreshParts {
                refresh_token: rt,
                client_id: cid,
                client_secret: sec,
                start_url: Some(start_url),
                auth_method: AuthMethod::IdentityCenter,
            };
            let encoded = encode(&parts).unwrap();
            let decoded = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, parts);
        }
    }
}
