//! Model name normalization and resolution.
//!
//! Translates Anthropic-style model names to Kiro model IDs.
//! Examples:
//! - "claude-sonnet-4-5" -> "claude-sonnet-4.5"
//! - "claude-sonnet-4-5-20250514" -> "claude-sonnet-4.5"
//! - "claude-3-5-sonnet-20241022" -> "claude-3.5-sonnet"
//! - "claude-3-5-sonnet-v2" -> "claude-3.5-sonnet"

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

/// Normalize a model name by applying Kiro's naming rules.
///
/// 1. Replace dashes between version numbers with dots (e.g., `4-5` -> `4.5`)
/// 2. Strip date suffixes (e.g., `-20250514`)
/// 3. Strip version suffixes (e.g., `-v2`)
/// 4. Convert legacy `claude-3-X-name` to `claude-3.X-name`
pub fn normalize_model_name(name: &str) -> String {
    let mut result = name.to_string();

    // Strip date suffix first: "-20241022", "-20250514" (8 digits at end)
    let re_date = regex_lite::Regex::new(r"-\d{8}$").unwrap();
    result = re_date.replace(&result, "").to_string();

    // Strip version suffix: "-v1", "-v2"
    let re_vsuffix = regex_lite::Regex::new(r"-v\d+$").unwrap();
    result = re_vsuffix.replace(&result, "").to_string();

    // Replace dash between adjacent single digits: "4-5" -> "4.5", "3-5" -> "3.5"
    // regex-lite doesn't support lookahead, so use a simple pattern:
    // Match digit-dash-digit and replace with digit.digit
    let re_version_dash = regex_lite::Regex::new(r"(\d)-(\d)").unwrap();
    result = re_version_dash.replace_all(&result, "${1}.${2}").to_string();

    result
}

/// Model resolver with caching and alias support.
pub struct ModelResolver {
    /// Direct aliases (e.g., "sonnet" -> "claude-sonnet-4.5").
    aliases: HashMap<String, String>,
    /// Cached model ID lookups.
    cache: RwLock<HashMap<String, String>>,
    /// Available models from Kiro API (model_id values).
    available_models: RwLock<Vec<String>>,
}

impl ModelResolver {
    /// Create a new model resolver.
    pub fn new() -> Self {
        Self {
            aliases: Self::default_aliases(),
            cache: RwLock::new(HashMap::new()),
            available_models: RwLock::new(Vec::new()),
        }
    }

    /// Set the list of available models (from ListAvailableModels).
    pub fn set_available_models(&self, models: Vec<String>) {
        let mut available = self.available_models.write().unwrap();
        *available = models;

        // Clear cache when models list changes
        let mut cache = self.cache.write().unwrap();
        cache.clear();
    }

    /// Resolve a model name to a Kiro model ID against the closed table of
    /// aliases, dynamically-discovered available models, hidden models, and
    /// the static fallback list. A name matching none of these is
    /// an unsupported model and fails rather than being passed through
    /// unchecked.
    ///
    /// Resolution order:
    /// 1. Check direct aliases
    /// 2. Normalize the name
    /// 3. Check cache
    /// 4. Match against available models
    /// 5. Check hidden models
    /// 6. Match the static fallback list
    /// 7. Fail with [`Error::Conversion`]
    pub fn resolve(&self, name: &str) -> Result<String> {
        // 1. Direct alias
        if let Some(alias) = self.aliases.get(name) {
            debug!(name, resolved = alias.as_str(), "Model alias matched");
            return Ok(alias.clone());
        }

        // 2. Normalize
        let normalized = normalize_model_name(name);

        // 3. Cache lookup
        {
            let cache = self.cache.read().unwrap();
            if let Some(cached) = cache.get(&normalized) {
                return Ok(cached.clone());
            }
        }

        // 4. Match against available models
        let available = self.available_models.read().unwrap();
        for model_id in available.iter() {
            let norm_available = normalize_model_name(model_id);
            if norm_available == normalized {
                let mut cache = self.cache.write().unwrap();
                cache.insert(normalized, model_id.clone());
                debug!(name, resolved = model_id.as_str(), "Model matched from available");
                return Ok(model_id.clone());
            }
        }
        drop(available);

        // 5. Check hidden models
        for (hidden_name, hidden_id) in crate::config::hidden_models() {
            if normalized == hidden_name || name == hidden_id {
                let result = hidden_id.to_string();
                let mut cache = self.cache.write().unwrap();
                cache.insert(normalized, result.clone());
                debug!(name, resolved = result.as_str(), "Hidden model matched");
                return Ok(result);
            }
        }

        // 6. Match the static fallback list (also a closed table, just
        // without a region-specific discovery round-trip).
        for fallback in crate::config::fallback_models() {
            if normalized == fallback || name == fallback {
                let mut cache = self.cache.write().unwrap();
                cache.insert(normalized, fallback.to_string());
                debug!(name, resolved = fallback, "Model matched from fallback list");
                return Ok(fallback.to_string());
            }
        }

        // 7. Unknown model: the caller asked for something outside every
        // table this resolver knows about.
        Err(Error::Conversion(format!("unsupported model: {name}")))
    }

    fn default_aliases() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("auto".into(), "auto".into());
        m.insert("sonnet".into(), "claude-sonnet-4".into());
        m.insert("haiku".into(), "claude-haiku-4.5".into());
        m.insert("opus".into(), "claude-opus-4.5".into());
        m
    }
}

impl Default for ModelResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version_dash() {
        assert_eq!(normalize_model_name("claude-sonnet-4-5"), "claude-sonnet-4.5");
        assert_eq!(normalize_model_name("claude-haiku-4-5"), "claude-haiku-4.5");
    }

    #[test]
    fn test_normalize_strip_date() {
        assert_eq!(
            normalize_model_name("claude-sonnet-4-5-20250514"),
            "claude-sonnet-4.5"
        );
        assert_eq!(
            normalize_model_name("claude-3-5-sonnet-20241022"),
            "claude-3.5-sonnet"
        );
    }

    #[test]
    fn test_normalize_strip_version_suffix() {
        assert_eq!(
            normalize_model_name("claude-3-5-sonnet-v2"),
            "claude-3.5-sonnet"
        );
    }

    #[test]
    fn test_normalize_passthrough() {
        assert_eq!(normalize_model_name("auto"), "auto");
        assert_eq!(
            normalize_model_name("claude-sonnet-4.5"),
            "claude-sonnet-4.5"
        );
    }

    #[test]
    fn test_resolver_aliases() {
        let resolver = ModelResolver::new();
        assert_eq!(resolver.resolve("auto").unwrap(), "auto");
        assert_eq!(resolver.resolve("sonnet").unwrap(), "claude-sonnet-4");
    }

    #[test]
    fn test_resolver_normalizes() {
        let resolver = ModelResolver::new();
        assert_eq!(
            resolver.resolve("claude-sonnet-4-5-20250514").unwrap(),
            "claude-sonnet-4.5"
        );
    }

    #[test]
    fn test_resolver_matches_fallback_list() {
        let resolver = ModelResolver::new();
        assert_eq!(resolver.resolve("claude-opus-4.5").unwrap(), "claude-opus-4.5");
    }

    #[test]
    fn test_resolver_matches_hidden_model() {
        let resolver = ModelResolver::new();
        assert_eq!(
            resolver.resolve("claude-3.7-sonnet").unwrap(),
            "CLAUDE_3_7_SONNET_20250219_V1_0"
        );
    }

    #[test]
    fn test_resolver_fails_on_unknown_model() {
        let resolver = ModelResolver::new();
        let err = resolver.resolve("gpt-5-turbo-nonsense").unwrap_err();
        assert!(err.to_string().contains("unsupported model"));
    }

    #[test]
    fn test_resolver_matches_discovered_available_model() {
        let resolver = ModelResolver::new();
        resolver.set_available_models(vec!["claude-sonnet-4.7".to_string()]);
        assert_eq!(resolver.resolve("claude-sonnet-4-7").unwrap(), "claude-sonnet-4.7");
    }
}
