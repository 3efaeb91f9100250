//! Driver configuration
//!
//! Construction parameters for the iteration driver plus the sanitization
//! applied to the sandbox configuration bag before it reaches observers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default iteration budget per completion.
pub const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Default recursion ceiling. Depth 1 is the guaranteed contract; anything
/// at or beyond the ceiling degrades to a direct LM call.
pub const DEFAULT_MAX_DEPTH: u32 = 1;

/// Configuration for an [`RlmDriver`](crate::driver::RlmDriver).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Sandbox backend name (`local` or `container`).
    pub backend: String,
    /// Backend-specific configuration bag, passed through to the sandbox
    /// factory and (sanitized) to observers.
    pub sandbox: Map<String, Value>,
    /// Recursion depth this driver operates at.
    pub depth: u32,
    pub max_depth: u32,
    pub max_iterations: u32,
    /// Override for the published system prompt.
    pub system_prompt: Option<String>,
    /// Keep the sandbox session alive across successive completion calls.
    pub persistent: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: crate::sandbox::LOCAL_BACKEND.to_string(),
            sandbox: Map::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
            persistent: false,
        }
    }
}

/// True when a configuration key must never reach loggers or printers.
///
/// Matches keys whose lowercased name contains both `api` and `key`, or
/// `secret`, or both `token` and `auth`.
fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_lowercase();
    (lowered.contains("api") && lowered.contains("key"))
        || lowered.contains("secret")
        || (lowered.contains("token") && lowered.contains("auth"))
}

/// Strip sensitive keys from a configuration bag. Values of surviving keys
/// are unchanged.
pub fn sanitize_config_bag(bag: &Map<String, Value>) -> Map<String, Value> {
    bag.iter()
        .filter(|(key, _)| !is_sensitive_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_budgets() {
        let config = DriverConfig::default();
        assert_eq!(config.max_iterations, 30);
        assert_eq!(config.max_depth, 1);
        assert_eq!(config.depth, 0);
        assert!(!config.persistent);
    }

    #[test]
    fn sensitive_key_patterns() {
        assert!(is_sensitive_key("api_key"));
        assert!(is_sensitive_key("OPENAI_API_KEY"));
        assert!(is_sensitive_key("client_secret"));
        assert!(is_sensitive_key("AUTH_TOKEN"));
        assert!(is_sensitive_key("token_authority"));
        assert!(!is_sensitive_key("api_version"));
        assert!(!is_sensitive_key("keyboard"));
        assert!(!is_sensitive_key("token_count"));
        assert!(!is_sensitive_key("image"));
    }

    #[test]
    fn sanitize_keeps_values_unchanged() {
        let mut bag = Map::new();
        bag.insert("image".to_string(), json!("x"));
        bag.insert("api_key".to_string(), json!("k"));
        bag.insert("AUTH_TOKEN".to_string(), json!("t"));
        bag.insert("note".to_string(), json!("ok"));

        let sanitized = sanitize_config_bag(&bag);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized["image"], json!("x"));
        assert_eq!(sanitized["note"], json!("ok"));
        assert!(!sanitized.contains_key("api_key"));
        assert!(!sanitized.contains_key("AUTH_TOKEN"));
    }
}
