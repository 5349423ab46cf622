//! Gateway dispatcher.
//!
//! The entry point a caller drives once an [`AccountManager`] is hydrated:
//! picks an account via E, refreshes it via F when near expiry or after a
//! 401, builds the upstream payload via `kiro_gateway::convert::request`,
//! posts it, and runs the status-code state machine that quarantines or
//! rate-limits the account before retrying. On 2xx it frames the response
//! through `kiro_gateway::convert::response` and fires off K in the
//! background.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use kiro_gateway::config::generate_assistant_response_url;
use kiro_gateway::convert::model_resolver::ModelResolver;
use kiro_gateway::convert::request::build_kiro_payload;
use kiro_gateway::convert::response::ResponseAccumulator;
use kiro_gateway::models::request::MessagesRequest;
use kiro_gateway::models::response::MessagesResponse;
use kiro_gateway::models::stream::StreamEvent;
use kiro_gateway::transport::{headers, sse};

use crate::account::{Account, AccountManager, AccountStore, AuthUpdate, LoadedAccounts};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::refresh;
use crate::usage;

/// `https?://q\.[a-z0-9-]+\.amazonaws\.com` — the URL family this dispatcher
/// intercepts; anything else should pass through unchanged.
pub fn matches_kiro_url(url: &str) -> bool {
    let re = regex_lite::Regex::new(r"^https?://q\.[a-z0-9-]+\.amazonaws\.com").expect("static pattern is valid");
    re.is_match(url)
}

const ACCESS_TOKEN_EXPIRY_BUFFER_MS: i64 = 60_000;

/// `machineId = sha256(profileArn || clientId || "KIRO_DEFAULT_MACHINE")`,
/// computed per-account here (rather than once per process, as the
/// single-account library does) since a fleet process juggles many
/// credential sets at once.
fn machine_id(account: &Account) -> String {
    let mut input = String::new();
    if let Some(arn) = &account.profile_arn {
        input.push_str(arn);
    }
    input.push_str(&account.client_id);
    input.push_str("KIRO_DEFAULT_MACHINE");
    let hash = Sha256::digest(input.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Wires account selection, token refresh, request translation, the upstream
/// call, and response parsing together behind a per-status-code retry policy.
pub struct Dispatcher {
    http: reqwest::Client,
    manager: Arc<AccountManager>,
    store: Arc<AccountStore>,
    resolver: ModelResolver,
    config: Config,
}

impl Dispatcher {
    pub fn new(http: reqwest::Client, manager: Arc<AccountManager>, store: Arc<AccountStore>, config: Config) -> Self {
        Self {
            http,
            manager,
            store,
            resolver: ModelResolver::new(),
            config,
        }
    }

    /// Persists the current fleet snapshot. Called after any mutation that
    /// changes a persistent field (refresh, health, rate limit, usage).
    fn persist(&self) {
        let snapshot = LoadedAccounts {
            accounts: self.manager.snapshot(),
            active_index: 0,
        };
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist account state");
        }
    }

    async fn ensure_fresh(&self, account: &Account, now_ms: i64) -> Result<Account> {
        if account.expires_at - now_ms > ACCESS_TOKEN_EXPIRY_BUFFER_MS {
            return Ok(account.clone());
        }

        match refresh::refresh(&self.http, account, now_ms).await {
            Ok(refreshed) => {
                self.manager.update_from_auth(
                    &account.id,
                    AuthUpdate {
                        access_token: refreshed.access_token,
                        refresh_token: refreshed.refresh_token,
                        expires_at: refreshed.expires_at,
                        real_email: None,
                    },
                )?;
                self.persist();
                self.manager
                    .snapshot()
                    .into_iter()
                    .find(|a| a.id == account.id)
                    .ok_or_else(|| Error::Translation("account vanished after refresh".into()))
            }
            Err(e) if e.is_terminal_for_account() => {
                self.manager.remove_account(&account.id);
                self.persist();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the account-selection/refresh/retry loop up through a successful
    /// upstream response. Shared by the streaming
    /// and non-streaming entry points, which differ only in how they drain
    /// the 2xx response body.
    async fn dispatch_until_success(
        &self,
        request: &MessagesRequest,
        now_ms: &(impl Fn() -> i64 + Sync),
    ) -> Result<(Account, reqwest::Response, String)> {
        let max_retries = self.config.rate_limit_max_retries;
        let mut attempt: u32 = 0;
        let mut refreshed_for_401 = false;

        loop {
            let now = now_ms();
            let account = self
                .manager
                .select_for_request(now)
                .ok_or(Error::NoAvailableAccounts)?;

            let account = match self.ensure_fresh(&account, now).await {
                Ok(a) => a,
                Err(e) if e.is_terminal_for_account() => continue,
                Err(e) => return Err(e),
            };

            let model_id = self.resolver.resolve(&request.model)?;
            let payload = build_kiro_payload(request, &model_id, account.profile_arn.as_deref())?;
            let url = generate_assistant_response_url(&account.region, account.profile_arn.as_deref());
            let fingerprint = machine_id(&account);
            // generateAssistantResponse always returns a framed stream upstream,
            // whether the caller asked for `stream: true` or not, so this endpoint
            // always sends `Connection: close` regardless of which path dispatches it.
            let hdrs = headers::kiro_streaming_headers(&account.access_token, &fingerprint);

            let send_result = self.http.post(&url).headers(hdrs).json(&payload).send().await;

            let response = match send_result {
                Ok(r) => r,
                Err(e) => {
                    attempt += 1;
                    if attempt > max_retries {
                        return Err(Error::MaxRetriesExceeded { status: None });
                    }
                    let delay = Duration::from_millis(self.config.rate_limit_retry_delay_ms) * 2u32.pow(attempt - 1);
                    warn!(error = %e, attempt, "network error dispatching request, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status().as_u16();

            if response.status().is_success() {
                if self.config.usage_tracking_enabled {
                    let http = self.http.clone();
                    let manager = self.manager.clone();
                    let account_id = account.id.clone();
                    tokio::spawn(async move {
                        let _ = usage::refresh_usage(&http, &manager, &account_id, now).await;
                    });
                }

                return Ok((account, response, model_id));
            }

            match status {
                401 if !refreshed_for_401 => {
                    refreshed_for_401 = true;
                    info!(account_id = %account.id, "401 on first iteration, forcing refresh");
                    match refresh::refresh(&self.http, &account, now).await {
                        Ok(refreshed) => {
                            self.manager.update_from_auth(
                                &account.id,
                                AuthUpdate {
                                    access_token: refreshed.access_token,
                                    refresh_token: refreshed.refresh_token,
                                    expires_at: refreshed.expires_at,
                                    real_email: None,
                                },
                            )?;
                            self.persist();
                        }
                        Err(e) if e.is_terminal_for_account() => {
                            self.manager.remove_account(&account.id);
                            self.persist();
                        }
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                402 => {
                    let recovery_time = usage::next_utc_month_start_ms(now);
                    self.manager
                        .mark_unhealthy(&account.id, "Quota exhausted", Some(recovery_time));
                    self.persist();
                    continue;
                }
                403 => {
                    self.manager.mark_unhealthy(&account.id, "Forbidden", None);
                    self.persist();
                    continue;
                }
                429 => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(60);
                    self.manager.mark_rate_limited(&account.id, now, (retry_after as i64) * 1000);
                    self.persist();

                    attempt += 1;
                    if attempt > max_retries {
                        return Err(Error::MaxRetriesExceeded { status: Some(status) });
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.rate_limit_retry_delay_ms)).await;
                    continue;
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::Upstream { status, body });
                }
            }
        }
    }

    /// Sends a non-streaming Messages API request end to end.
    pub async fn send(&self, request: MessagesRequest, now_ms: impl Fn() -> i64 + Sync) -> Result<MessagesResponse> {
        let (_account, response, model_id) = self.dispatch_until_success(&request, &now_ms).await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::Translation(format!("failed to read upstream body: {e}")))?;
        let mut accumulator = ResponseAccumulator::new(&model_id);
        let mut buffer = body;
        for event in sse::drain_events(&mut buffer) {
            accumulator.process_event(event);
        }
        Ok(accumulator.into_response())
    }

    /// Sends a streaming Messages API request, returning an OpenAI/Anthropic-
    /// style SSE event stream once an upstream 2xx response has
    /// been secured. Partial-stream failures (cancellation, a read error once
    /// bytes are already flowing) surface as an `Err` item rather than a
    /// silent truncation.
    pub async fn send_stream(
        &self,
        request: MessagesRequest,
        now_ms: impl Fn() -> i64 + Sync + 'static,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>> {
        let (_account, response, model_id) = self.dispatch_until_success(&request, &now_ms).await?;

        let stream = try_stream! {
            let mut accumulator = ResponseAccumulator::new(&model_id);
            yield accumulator.message_start_event();

            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result
                    .map_err(|e| Error::Translation(format!("stream read error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for event in sse::drain_events(&mut buffer) {
                    for se in accumulator.process_event(event) {
                        yield se;
                    }
                }
            }

            for event in sse::drain_events(&mut buffer) {
                for se in accumulator.process_event(event) {
                    yield se;
                }
            }

            for event in accumulator.finish_events() {
                yield event;
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::AuthMethod;
    use crate::config::AccountSelectionStrategy;

    #[test]
    fn matches_kiro_url_accepts_known_hosts() {
        assert!(matches_kiro_url("https://q.us-east-1.amazonaws.com/generateAssistantResponse"));
        assert!(matches_kiro_url("http://q.us-west-2.amazonaws.com/foo"));
    }

    #[test]
    fn matches_kiro_url_rejects_other_hosts() {
        assert!(!matches_kiro_url("https://example.com/generateAssistantResponse"));
        assert!(!matches_kiro_url("https://evil.q.us-east-1.amazonaws.com.attacker.net/x"));
    }

    #[test]
    fn machine_id_changes_with_profile_arn() {
        let mut a1 = Account::new(
            "a@b.com".into(),
            AuthMethod::BuilderId,
            "us-east-1".into(),
            "client-1".into(),
            "secret".into(),
            None,
            None,
            "rt".into(),
        );
        let without_arn = machine_id(&a1);
        a1.profile_arn = Some("arn:aws:codewhisperer:us-east-1:1234:profile/ABC".into());
        let with_arn = machine_id(&a1);
        assert_ne!(without_arn, with_arn);
        assert_eq!(without_arn.len(), 64);
    }

    #[test]
    fn dispatcher_can_be_constructed_with_empty_fleet() {
        let manager = Arc::new(AccountManager::new(vec![], AccountSelectionStrategy::Sticky));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let _dispatcher = Dispatcher::new(reqwest::Client::new(), manager, store, Config::default());
    }

    #[tokio::test]
    async fn send_and_send_stream_fail_fast_with_no_accounts() {
        let manager = Arc::new(AccountManager::new(vec![], AccountSelectionStrategy::Sticky));
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(dir.path().join("accounts.json")));
        let dispatcher = Dispatcher::new(reqwest::Client::new(), manager, store, Config::default());

        let request = MessagesRequest {
            model: "claude-sonnet-4-5".into(),
            max_tokens: 64,
            messages: vec![],
            system: None,
            tools: None,
            tool_choice: None,
            stream: false,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            thinking: None,
        };

        let err = dispatcher.send(request.clone(), || 0).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableAccounts));

        let err = dispatcher.send_stream(request, || 0).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableAccounts));
    }
}
