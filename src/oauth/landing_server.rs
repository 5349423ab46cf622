//! Loopback landing server.
//!
//! A short-lived `axum` server bound to `127.0.0.1` on the first free port in
//! `[19847, 19856]`, giving the user a page to confirm the device code on
//! without leaving their terminal. The device-code poll runs
//! concurrently and reports its outcome into [`LandingState`]; the page polls
//! `GET /status` until it sees a terminal state, then the whole server is
//! torn down.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use minijinja::{context, Environment};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{Error, Result};

const PORT_RANGE: std::ops::RangeInclusive<u16> = 19847..=19856;
const OVERALL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const PAGE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Kiro Gateway Authorization</title>
  <meta charset="utf-8">
</head>
<body>
  <h1>Authorize Kiro Gateway</h1>
  <p>Confirm this code at <a href="{{ verification_uri }}" target="_blank">{{ verification_uri }}</a>:</p>
  <h2>{{ user_code }}</h2>
  <p id="message">Waiting for confirmation&hellip;</p>
  <script>
    async function poll() {
      const res = await fetch('/status');
      const body = await res.json();
      if (body.status === 'success') {
        window.location.href = '/success';
        return;
      }
      if (body.status === 'failed' || body.status === 'timeout') {
        window.location.href = '/error';
        return;
      }
      setTimeout(poll, 2000);
    }
    poll();
  </script>
</body>
</html>
"#;

/// The state of an in-flight device-code authorization, shared between the
/// poller task and the HTTP handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Success,
    Failed(String),
    Timeout,
}

struct LandingState {
    status: Mutex<AuthorizationStatus>,
    verification_uri: String,
    user_code: String,
}

/// A bound-but-not-yet-serving landing server.
pub struct LandingServer {
    addr: SocketAddr,
    state: Arc<LandingState>,
    listener: TcpListener,
}

impl LandingServer {
    /// Binds to the first free port in `[19847, 19856]` on `127.0.0.1`.
    pub async fn bind(verification_uri: impl Into<String>, user_code: impl Into<String>) -> Result<Self> {
        let mut last_err = None;
        for port in PORT_RANGE {
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "landing server bound");
                    return Ok(Self {
                        addr,
                        state: Arc::new(LandingState {
                            status: Mutex::new(AuthorizationStatus::Pending),
                            verification_uri: verification_uri.into(),
                            user_code: user_code.into(),
                        }),
                        listener,
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::Config(format!(
            "no free loopback port in {}..={} ({})",
            PORT_RANGE.start(),
            PORT_RANGE.end(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A handle the caller uses to report the poll outcome as it resolves.
    pub fn handle(&self) -> LandingHandle {
        LandingHandle { state: self.state.clone() }
    }

    /// Serves until a terminal status is reached or `OVERALL_TIMEOUT` elapses,
    /// whichever comes first.
    pub async fn serve_until_terminal(self) {
        let state = self.state.clone();
        let app = Router::new()
            .route("/", get(root))
            .route("/status", get(status))
            .route("/success", get(success))
            .route("/error", get(error_page))
            .with_state(state.clone());

        let serve = axum::serve(self.listener, app.into_make_service());

        tokio::select! {
            result = serve => {
                if let Err(e) = result {
                    warn!(error = %e, "landing server exited with error");
                }
            }
            _ = wait_for_terminal(state.clone()) => {
                info!("landing server reached a terminal status, shutting down");
            }
            _ = tokio::time::sleep(OVERALL_TIMEOUT) => {
                warn!("landing server timed out waiting for authorization");
                *state.status.lock().expect("landing state mutex poisoned") = AuthorizationStatus::Timeout;
            }
        }
    }
}

async fn wait_for_terminal(state: Arc<LandingState>) {
    loop {
        {
            let status = state.status.lock().expect("landing state mutex poisoned");
            if !matches!(*status, AuthorizationStatus::Pending) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Lets the device-code poller report its outcome into the landing page.
#[derive(Clone)]
pub struct LandingHandle {
    state: Arc<LandingState>,
}

impl LandingHandle {
    pub fn mark_success(&self) {
        *self.state.status.lock().expect("landing state mutex poisoned") = AuthorizationStatus::Success;
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        *self.state.status.lock().expect("landing state mutex poisoned") = AuthorizationStatus::Failed(reason.into());
    }
}

async fn root(State(state): State<Arc<LandingState>>) -> impl IntoResponse {
    let mut env = Environment::new();
    env.add_template("page", PAGE_TEMPLATE).expect("landing page template is valid");
    let tmpl = env.get_template("page").expect("just registered");
    let rendered = tmpl
        .render(context! {
            verification_uri => state.verification_uri,
            user_code => state.user_code,
        })
        .unwrap_or_else(|e| format!("template error: {e}"));
    Html(rendered)
}

async fn status(State(state): State<Arc<LandingState>>) -> impl IntoResponse {
    let status = state.status.lock().expect("landing state mutex poisoned").clone();
    let (status_str, error) = match status {
        AuthorizationStatus::Pending => ("pending", None),
        AuthorizationStatus::Success => ("success", None),
        AuthorizationStatus::Failed(reason) => ("failed", Some(reason)),
        AuthorizationStatus::Timeout => ("timeout", None),
    };
    Json(serde_json::json!({ "status": status_str, "error": error }))
}

async fn success() -> impl IntoResponse {
    Html("<html><body><h1>Authorized</h1><p>You can close this tab.</p></body></html>")
}

async fn error_page() -> impl IntoResponse {
    Html("<html><body><h1>Authorization failed</h1></body></html>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_picks_a_port_in_range() {
        let server = LandingServer::bind("https://example.com/verify", "ABCD-EFGH")
            .await
            .unwrap();
        assert!(PORT_RANGE.contains(&server.addr().port()));
    }

    #[tokio::test]
    async fn handle_reports_terminal_status() {
        let server = LandingServer::bind("https://example.com/verify", "ABCD-EFGH")
            .await
            .unwrap();
        let handle = server.handle();
        handle.mark_success();
        let status = server.state.status.lock().unwrap().clone();
        assert_eq!(status, AuthorizationStatus::Success);
    }
}
