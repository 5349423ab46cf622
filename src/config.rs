//! Fleet configuration: JSON file + `KIRO_`-prefixed environment overrides.
//!
//! A typed struct with serde defaults, loaded from a file and then overlaid
//! with environment variables, tracking which keys came from the environment
//! for diagnostics. No web-UI settings report, no multi-provider sections,
//! no TOML - just the JSON config file this fleet actually reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tracks which configuration keys were overridden by an environment variable.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

/// Account selection strategy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AccountSelectionStrategy {
    #[default]
    Sticky,
    RoundRobin,
    LowestUsage,
}

impl std::str::FromStr for AccountSelectionStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "sticky" => Ok(Self::Sticky),
            "round-robin" | "roundrobin" => Ok(Self::RoundRobin),
            "lowest-usage" | "lowestusage" => Ok(Self::LowestUsage),
            _ => Err(format!("unknown account selection strategy: {s}")),
        }
    }
}

impl std::fmt::Display for AccountSelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sticky => write!(f, "sticky"),
            Self::RoundRobin => write!(f, "round-robin"),
            Self::LowestUsage => write!(f, "lowest-usage"),
        }
    }
}

/// The full fleet configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_true")]
    pub proactive_token_refresh: bool,
    #[serde(default = "default_refresh_interval")]
    pub token_refresh_interval_seconds: u64,
    #[serde(default = "default_refresh_buffer")]
    pub token_refresh_buffer_seconds: u64,
    #[serde(default)]
    pub account_selection_strategy: AccountSelectionStrategy,
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default = "default_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub rate_limit_retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget_tokens: u32,
    #[serde(default = "default_true")]
    pub usage_tracking_enabled: bool,
    #[serde(default)]
    pub debug: bool,

    /// Env var overrides are not part of the on-disk JSON shape.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

const fn default_true() -> bool {
    true
}
const fn default_refresh_interval() -> u64 {
    300
}
const fn default_refresh_buffer() -> u64 {
    600
}
fn default_region() -> String {
    "us-east-1".to_string()
}
const fn default_max_retries() -> u32 {
    3
}
const fn default_retry_delay_ms() -> u64 {
    5000
}
const fn default_request_timeout_ms() -> u64 {
    120_000
}
const fn default_thinking_budget() -> u32 {
    20_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proactive_token_refresh: default_true(),
            token_refresh_interval_seconds: default_refresh_interval(),
            token_refresh_buffer_seconds: default_refresh_buffer(),
            account_selection_strategy: AccountSelectionStrategy::default(),
            default_region: default_region(),
            rate_limit_max_retries: default_max_retries(),
            rate_limit_retry_delay_ms: default_retry_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            thinking_budget_tokens: default_thinking_budget(),
            usage_tracking_enabled: default_true(),
            debug: false,
            env_overrides: EnvOverrides::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the user config file at `path`, overlaid by
    /// a project-local `.opencode/kiro.json` (if `project_path` is given and
    /// the file exists), overlaid by `KIRO_` environment variables. A missing
    /// or malformed file at either layer is not an error - it's skipped and
    /// the defaults (or the previous layer) carry forward.
    pub fn load(path: &Path, project_path: Option<&Path>) -> Self {
        let mut config = Self::default();
        config.merge_file(path);
        if let Some(project_path) = project_path {
            config.merge_file(project_path);
        }
        config.apply_env_overrides();
        config
    }

    /// Reads `path` as JSON and merges any fields present into `self`,
    /// logging and falling back to the current values on any error.
    fn merge_file(&mut self, path: &Path) {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                tracing::debug!(path = %path.display(), "config file not found, skipping");
                return;
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "malformed config file, ignoring");
                return;
            }
        };

        self.merge_value(&value);
    }

    fn merge_value(&mut self, value: &serde_json::Value) {
        let Some(obj) = value.as_object() else {
            return;
        };

        macro_rules! merge_bool {
            ($key:expr, $field:expr) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_bool()) {
                    $field = v;
                }
            };
        }
        macro_rules! merge_u64 {
            ($key:expr, $field:expr) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_u64()) {
                    $field = v;
                }
            };
        }
        macro_rules! merge_u32 {
            ($key:expr, $field:expr) => {
                if let Some(v) = obj.get($key).and_then(|v| v.as_u64()) {
                    $field = v as u32;
                }
            };
        }

        merge_bool!("proactive_token_refresh", self.proactive_token_refresh);
        merge_u64!(
            "token_refresh_interval_seconds",
            self.token_refresh_interval_seconds
        );
        merge_u64!(
            "token_refresh_buffer_seconds",
            self.token_refresh_buffer_seconds
        );
        if let Some(s) = obj.get("account_selection_strategy").and_then(|v| v.as_str()) {
            if let Ok(strategy) = s.parse() {
                self.account_selection_strategy = strategy;
            }
        }
        if let Some(s) = obj.get("default_region").and_then(|v| v.as_str()) {
            self.default_region = s.to_string();
        }
        merge_u32!("rate_limit_max_retries", self.rate_limit_max_retries);
        merge_u64!("rate_limit_retry_delay_ms", self.rate_limit_retry_delay_ms);
        merge_u64!("request_timeout_ms", self.request_timeout_ms);
        merge_u32!("thinking_budget_tokens", self.thinking_budget_tokens);
        merge_bool!("usage_tracking_enabled", self.usage_tracking_enabled);
        merge_bool!("debug", self.debug);
    }

    /// Applies `KIRO_*` environment variable overrides, recording each one
    /// that fires in `env_overrides`.
    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }

        env_bool!(
            "proactive_token_refresh",
            "KIRO_PROACTIVE_TOKEN_REFRESH",
            self.proactive_token_refresh
        );
        env_parse!(
            "token_refresh_interval_seconds",
            "KIRO_TOKEN_REFRESH_INTERVAL_SECONDS",
            self.token_refresh_interval_seconds
        );
        env_parse!(
            "token_refresh_buffer_seconds",
            "KIRO_TOKEN_REFRESH_BUFFER_SECONDS",
            self.token_refresh_buffer_seconds
        );
        if let Ok(val) = std::env::var("KIRO_ACCOUNT_SELECTION_STRATEGY") {
            if let Ok(strategy) = val.parse() {
                self.account_selection_strategy = strategy;
                ov.record(
                    "account_selection_strategy",
                    "KIRO_ACCOUNT_SELECTION_STRATEGY",
                );
            }
        }
        if let Ok(val) = std::env::var("KIRO_DEFAULT_REGION") {
            self.default_region = val;
            ov.record("default_region", "KIRO_DEFAULT_REGION");
        }
        env_parse!(
            "rate_limit_max_retries",
            "KIRO_RATE_LIMIT_MAX_RETRIES",
            self.rate_limit_max_retries
        );
        env_parse!(
            "rate_limit_retry_delay_ms",
            "KIRO_RATE_LIMIT_RETRY_DELAY_MS",
            self.rate_limit_retry_delay_ms
        );
        env_parse!(
            "request_timeout_ms",
            "KIRO_REQUEST_TIMEOUT_MS",
            self.request_timeout_ms
        );
        env_parse!(
            "thinking_budget_tokens",
            "KIRO_THINKING_BUDGET_TOKENS",
            self.thinking_budget_tokens
        );
        env_bool!(
            "usage_tracking_enabled",
            "KIRO_USAGE_TRACKING_ENABLED",
            self.usage_tracking_enabled
        );
        env_bool!("debug", "KIRO_DEBUG", self.debug);

        self.env_overrides = ov;
    }

    /// The user-level config path: `$CONFIG/opencode/kiro.json`, where
    /// `$CONFIG` is `$XDG_CONFIG_HOME` if set, else the platform config dir.
    pub fn user_config_path() -> PathBuf {
        config_home().join("opencode").join("kiro.json")
    }

    /// The project-level config path relative to `project_dir`.
    pub fn project_config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(".opencode").join("kiro.json")
    }
}

fn config_home() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(dir);
    }
    dirs::config_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_table() {
        let config = Config::default();
        assert!(config.proactive_token_refresh);
        assert_eq!(config.token_refresh_interval_seconds, 300);
        assert_eq!(config.token_refresh_buffer_seconds, 600);
        assert_eq!(
            config.account_selection_strategy,
            AccountSelectionStrategy::Sticky
        );
        assert_eq!(config.default_region, "us-east-1");
        assert_eq!(config.rate_limit_max_retries, 3);
        assert_eq!(config.rate_limit_retry_delay_ms, 5000);
        assert_eq!(config.request_timeout_ms, 120_000);
        assert_eq!(config.thinking_budget_tokens, 20_000);
        assert!(config.usage_tracking_enabled);
        assert!(!config.debug);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/tmp/does-not-exist-kiro-config.json"), None);
        assert_eq!(config.rate_limit_max_retries, 3);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiro.json");
        std::fs::write(&path, "{ not valid json").unwrap();
        let config = Config::load(&path, None);
        assert_eq!(config.default_region, "us-east-1");
    }

    #[test]
    fn file_values_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiro.json");
        std::fs::write(
            &path,
            r#"{"default_region": "us-west-2", "rate_limit_max_retries": 5, "account_selection_strategy": "round-robin"}"#,
        )
        .unwrap();
        let config = Config::load(&path, None);
        assert_eq!(config.default_region, "us-west-2");
        assert_eq!(config.rate_limit_max_retries, 5);
        assert_eq!(
            config.account_selection_strategy,
            AccountSelectionStrategy::RoundRobin
        );
    }

    #[test]
    fn project_file_overrides_user_file() {
        let dir = tempfile::tempdir().unwrap();
        let user_path = dir.path().join("user.json");
        let project_path = dir.path().join("project.json");
        std::fs::write(&user_path, r#"{"default_region": "us-west-2"}"#).unwrap();
        std::fs::write(&project_path, r#"{"default_region": "us-east-1", "debug": true}"#)
            .unwrap();
        let config = Config::load(&user_path, Some(&project_path));
        assert_eq!(config.default_region, "us-east-1");
        assert!(config.debug);
    }

    #[test]
    fn env_override_wins_over_file_and_is_tracked() {
        // SAFETY: tests touching process env run sequentially within this crate.
        unsafe {
            std::env::set_var("KIRO_DEFAULT_REGION", "us-west-2");
            std::env::set_var("KIRO_DEBUG", "true");
        }
        let config = Config::load(Path::new("/tmp/does-not-exist-kiro-config.json"), None);
        assert_eq!(config.default_region, "us-west-2");
        assert!(config.debug);
        assert!(config.env_overrides.is_overridden("default_region"));
        assert_eq!(
            config.env_overrides.env_var_for("default_region"),
            Some("KIRO_DEFAULT_REGION")
        );
        unsafe {
            std::env::remove_var("KIRO_DEFAULT_REGION");
            std::env::remove_var("KIRO_DEBUG");
        }
    }

    #[test]
    fn account_selection_strategy_parses_variants() {
        assert_eq!(
            "sticky".parse::<AccountSelectionStrategy>().unwrap(),
            AccountSelectionStrategy::Sticky
        );
        assert_eq!(
            "round-robin".parse::<AccountSelectionStrategy>().unwrap(),
            AccountSelectionStrategy::RoundRobin
        );
        assert_eq!(
            "lowest-usage".parse::<AccountSelectionStrategy>().unwrap(),
            AccountSelectionStrategy::LowestUsage
        );
        assert!("bogus".parse::<AccountSelectionStrategy>().is_err());
    }
}
