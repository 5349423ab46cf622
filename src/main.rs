//! kiro-fleet-gateway -- multi-account OAuth gateway for AWS CodeWhisperer / Kiro.
//!
//! This is the application entry point. It wires together:
//!   - Configuration loading (file + env overrides)
//!   - The account store/manager (fleet hydration)
//!   - The proactive refresh loop (background task)
//!   - The HTTP server exposing a Messages-API-compatible `/v1/messages` route
//!   - The `authorize` subcommand, which runs the interactive device-code flow

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use kiro_fleet_gateway::account::{placeholder_email, Account, AccountManager, AccountStore};
use kiro_fleet_gateway::codec::AuthMethod;
use kiro_fleet_gateway::config::Config;
use kiro_fleet_gateway::dispatcher::Dispatcher;
use kiro_fleet_gateway::{oauth, refresh_loop};

const BUILDER_ID_START_URL: &str = "https://view.awsapps.com/start";

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

enum Command {
    Serve { config_path: Option<PathBuf> },
    Authorize { region: String, start_url: Option<String> },
}

fn parse_args() -> Command {
    let mut args = std::env::args().skip(1);

    match args.next().as_deref() {
        Some("authorize") => {
            let mut region = "us-east-1".to_string();
            let mut start_url = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--region" => region = args.next().unwrap_or(region),
                    "--start-url" => start_url = args.next(),
                    "--help" | "-h" => {
                        print_usage();
                        std::process::exit(0);
                    }
                    other => {
                        eprintln!("Unknown argument: {other}");
                        std::process::exit(1);
                    }
                }
            }
            Command::Authorize { region, start_url }
        }
        Some("serve") | None => {
            let mut config_path = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--config" | "-c" => config_path = args.next().map(PathBuf::from),
                    "--help" | "-h" => {
                        print_usage();
                        std::process::exit(0);
                    }
                    other => {
                        eprintln!("Unknown argument: {other}");
                        std::process::exit(1);
                    }
                }
            }
            Command::Serve { config_path }
        }
        Some("--help") | Some("-h") => {
            print_usage();
            std::process::exit(0);
        }
        Some("--version") | Some("-V") => {
            println!("kiro-fleet-gateway {}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(other) => {
            eprintln!("Unknown subcommand: {other}");
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        "\
kiro-fleet-gateway {version} -- Multi-account OAuth gateway for AWS CodeWhisperer / Kiro

USAGE:
    kiro-fleet-gateway [serve] [OPTIONS]
    kiro-fleet-gateway authorize --region <REGION> [--start-url <URL>]

OPTIONS (serve):
    -c, --config <PATH>    Path to a project-level kiro.json config file
    -h, --help             Print this help message

OPTIONS (authorize):
        --region <REGION>      AWS region to register the OIDC client in [default: us-east-1]
        --start-url <URL>      SSO start URL for Identity-Center; omit for Builder-ID

ENVIRONMENT:
    RUST_LOG                Override log level (e.g. RUST_LOG=debug)
    KIRO_LOG_FORMAT=json     Emit structured JSON logs instead of text
    KIRO_*                   Any configuration key, see kiro.json",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = parse_args();
    init_tracing();

    match command {
        Command::Authorize { region, start_url } => run_authorize(region, start_url).await,
        Command::Serve { config_path } => run_serve(config_path).await,
    }
}

async fn run_authorize(region: String, start_url: Option<String>) -> anyhow::Result<()> {
    let (start_url, auth_method) = match start_url {
        Some(url) => (url, AuthMethod::IdentityCenter),
        None => (BUILDER_ID_START_URL.to_string(), AuthMethod::BuilderId),
    };

    let http = reqwest::Client::new();
    tracing::info!(region = %region, auth_method = ?auth_method, "beginning device authorization");

    let challenge = oauth::begin_authorization(&http, &region, &start_url).await?;

    let landing =
        oauth::LandingServer::bind(challenge.verification_uri_complete.clone(), challenge.user_code.clone()).await?;
    let handle = landing.handle();
    println!();
    println!("  Open {} and enter code: {}", challenge.verification_uri, challenge.user_code);
    println!("  Or visit: {}", challenge.verification_uri_complete);
    println!("  A landing page is also available at http://{}", landing.addr());
    println!();

    let poll_http = http.clone();
    let poll_challenge = challenge.clone();
    let poll_handle = handle.clone();
    let poll_task = tokio::spawn(async move {
        let result = oauth::poll_for_token(
            &poll_http,
            &poll_challenge,
            |d| Box::pin(tokio::time::sleep(d)),
            || chrono::Utc::now().timestamp_millis(),
        )
        .await;
        match &result {
            Ok(_) => poll_handle.mark_success(),
            Err(e) => poll_handle.mark_failed(e.to_string()),
        }
        result
    });

    landing.serve_until_terminal().await;
    let token = poll_task.await??;

    let store = AccountStore::new(AccountStore::default_path());
    let mut loaded = store.load()?;

    let account = Account::new(
        placeholder_email(auth_method, &challenge.client_id),
        auth_method,
        region,
        challenge.client_id,
        challenge.client_secret,
        Some(start_url),
        None,
        token.refresh_token,
    );
    let mut account = account;
    account.access_token = token.access_token;
    account.expires_at = token.expires_at_ms;

    tracing::info!(account_id = %account.id, "authorization complete, persisting account");
    loaded.accounts.push(account);
    store.save(&loaded)?;

    println!("Account authorized and saved.");
    Ok(())
}

struct AppState {
    dispatcher: Arc<Dispatcher>,
}

async fn run_serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let user_config_path = Config::user_config_path();
    let project_path = config_path
        .or_else(|| std::env::current_dir().ok().map(|dir| Config::project_config_path(&dir)));
    let config = Config::load(&user_config_path, project_path.as_deref());

    let store = Arc::new(AccountStore::new(AccountStore::default_path()));
    let loaded = store.load()?;
    tracing::info!(accounts = loaded.accounts.len(), "fleet hydrated from account store");

    let manager = Arc::new(AccountManager::new(loaded.accounts, config.account_selection_strategy));
    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
        .build()?;

    let dispatcher = Arc::new(Dispatcher::new(http.clone(), manager.clone(), store.clone(), config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh_handle = if config.proactive_token_refresh {
        let interval = std::time::Duration::from_secs(config.token_refresh_interval_seconds);
        let buffer_ms = (config.token_refresh_buffer_seconds * 1000) as i64;
        Some(tokio::spawn(refresh_loop::run(
            http,
            manager,
            store,
            interval,
            buffer_ms,
            shutdown_rx,
            || chrono::Utc::now().timestamp_millis(),
        )))
    } else {
        None
    };

    let state = Arc::new(AppState { dispatcher });
    let app = Router::new()
        .route("/v1/messages", post(handle_messages))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = "127.0.0.1:8787".parse().expect("static address is valid");
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "kiro-fleet-gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down gracefully");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }

    Ok(())
}

fn error_status(e: &kiro_fleet_gateway::Error) -> axum::http::StatusCode {
    match e {
        kiro_fleet_gateway::Error::NoAvailableAccounts => axum::http::StatusCode::SERVICE_UNAVAILABLE,
        kiro_fleet_gateway::Error::Upstream { status, .. } => {
            axum::http::StatusCode::from_u16(*status).unwrap_or(axum::http::StatusCode::BAD_GATEWAY)
        }
        kiro_fleet_gateway::Error::MaxRetriesExceeded { .. } => axum::http::StatusCode::BAD_GATEWAY,
        _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `POST /v1/messages` -- dispatches to the streaming or non-streaming path
/// depending on the caller's `stream` flag.
async fn handle_messages(
    State(state): State<Arc<AppState>>,
    Json(request): Json<kiro_gateway::models::request::MessagesRequest>,
) -> Response {
    if request.stream {
        handle_streaming(state, request).await
    } else {
        handle_non_streaming(state, request).await
    }
}

async fn handle_non_streaming(
    state: Arc<AppState>,
    request: kiro_gateway::models::request::MessagesRequest,
) -> Response {
    match state.dispatcher.send(request, || chrono::Utc::now().timestamp_millis()).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "dispatch failed");
            let status = error_status(&e);
            (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// Streams the upstream response as OpenAI/Anthropic-style SSE frames.
/// A failure before the upstream 2xx is secured is reported as
/// a plain error response; a failure mid-stream is surfaced as a terminal
/// `error` SSE event rather than a silently truncated stream.
async fn handle_streaming(
    state: Arc<AppState>,
    request: kiro_gateway::models::request::MessagesRequest,
) -> Response {
    let stream = match state
        .dispatcher
        .send_stream(request, || chrono::Utc::now().timestamp_millis())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "stream dispatch failed");
            let status = error_status(&e);
            return (status, Json(serde_json::json!({ "error": e.to_string() }))).into_response();
        }
    };

    let events = stream.map(|item| {
        let event = match item {
            Ok(stream_event) => Event::default()
                .event(stream_event_name(&stream_event))
                .json_data(&stream_event)
                .unwrap_or_else(|_| Event::default().event("error").data("{}")),
            Err(e) => Event::default()
                .event("error")
                .json_data(serde_json::json!({ "error": { "type": "stream_error", "message": e.to_string() } }))
                .unwrap_or_else(|_| Event::default().event("error").data("{}")),
        };
        Ok::<_, std::convert::Infallible>(event)
    });

    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// The Anthropic-style SSE `event:` line name for a given frame, so that
/// clients can dispatch without parsing the JSON body's `type` field.
fn stream_event_name(event: &kiro_gateway::models::stream::StreamEvent) -> &'static str {
    use kiro_gateway::models::stream::StreamEvent;
    match event {
        StreamEvent::MessageStart { .. } => "message_start",
        StreamEvent::ContentBlockStart { .. } => "content_block_start",
        StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
        StreamEvent::ContentBlockStop { .. } => "content_block_stop",
        StreamEvent::MessageDelta { .. } => "message_delta",
        StreamEvent::MessageStop => "message_stop",
        StreamEvent::Ping => "ping",
        StreamEvent::Error { .. } => "error",
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if std::env::var("KIRO_LOG_FORMAT").as_deref() == Ok("json") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT (Ctrl+C)"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
