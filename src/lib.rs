//! # kiro-fleet-gateway
//!
//! Multi-account OAuth gateway fronting AWS CodeWhisperer / Kiro's streaming
//! inference endpoint: a fleet of AWS SSO OIDC accounts behind one
//! Anthropic/OpenAI-style chat surface, with automatic rotation, health
//! tracking, and proactive token refresh. Built on top of the single-account
//! [`kiro_gateway`] client for request translation and response framing.

pub mod account;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod oauth;
pub mod refresh;
pub mod refresh_loop;
pub mod usage;

pub use account::{Account, AccountManager, AccountStore, AuthUpdate, LoadedAccounts};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
