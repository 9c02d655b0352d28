//! Server configuration.

use serde::{Deserialize, Serialize};
use tracing::Level;

use cityforge_webhooks::{NewEndpoint, WebhookConfig};

/// Overrides `[webhooks].enabled`.
pub const ENV_WEBHOOKS_ENABLED: &str = "CITYFORGE_WEBHOOKS_ENABLED";
/// Overrides `[webhooks].email_fallback`.
pub const ENV_EMAIL_FALLBACK: &str = "CITYFORGE_WEBHOOKS_EMAIL_FALLBACK";
/// Overrides `[webhooks].environment`.
pub const ENV_ENVIRONMENT: &str = "CITYFORGE_ENVIRONMENT";

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Log level.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Everything read from the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub webhooks: WebhookConfig,
    /// Endpoints registered at startup.
    pub endpoints: Vec<NewEndpoint>,
}

/// Loads configuration from a TOML file and applies environment overrides.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path, e)))?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Resolves a [`load_config`] result, never failing.
///
/// A configuration error is logged and replaced by the defaults, in which
/// delivery is disabled. Call after the subscriber is installed.
pub fn config_or_default(path: &str, loaded: Result<AppConfig, ConfigError>) -> AppConfig {
    match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path, error = %e, "invalid configuration; webhook delivery disabled");
            AppConfig::default()
        }
    }
}

/// Log level for the subscriber, read before the configuration is resolved.
///
/// Falls back to `INFO` for a missing, invalid or unreadable configuration.
pub fn log_level(loaded: &Result<AppConfig, ConfigError>) -> Level {
    loaded
        .as_ref()
        .ok()
        .and_then(|config| config.server.log_level.parse().ok())
        .unwrap_or(Level::INFO)
}

/// Parses the TOML document.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Applies overrides from `lookup` (the process environment in production).
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(ENV_WEBHOOKS_ENABLED) {
        config.webhooks.enabled = parse_bool(ENV_WEBHOOKS_ENABLED, &value)?;
    }
    if let Some(value) = lookup(ENV_EMAIL_FALLBACK) {
        config.webhooks.email_fallback = parse_bool(ENV_EMAIL_FALLBACK, &value)?;
    }
    if let Some(value) = lookup(ENV_ENVIRONMENT) {
        config.webhooks.environment = value;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityforge_events::EventType;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[server]
log_level = "debug"

[webhooks]
enabled = true
environment = "staging"
retry_sweep_interval_secs = 5

[[endpoints]]
name = "crm"
url = "https://crm.example.com/hooks"
secret = "whsec_123"
subscribed_event_types = ["user.registered", "support_ticket.created"]

[endpoints.custom_headers]
X-Tenant = "cityforge"

[endpoints.retry_policy]
max_retries = 5
base_delay_seconds = 30
exponential_backoff = true
"#;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert!(!config.webhooks.enabled);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_config(SAMPLE).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert!(config.webhooks.enabled);
        assert_eq!(config.webhooks.environment, "staging");
        assert_eq!(config.webhooks.retry_sweep_interval_secs, 5);

        let endpoint = &config.endpoints[0];
        assert_eq!(endpoint.name, "crm");
        assert!(endpoint.enabled);
        assert!(endpoint.subscribed_event_types.contains(&EventType::SupportTicketCreated));
        assert_eq!(endpoint.custom_headers.get("X-Tenant").map(String::as_str), Some("cityforge"));
        assert_eq!(endpoint.retry_policy.unwrap().max_retries, 5);
        assert_eq!(endpoint.timeout_seconds, 30);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse_config("[webhooks"), Err(ConfigError::ParseError(_))));
        assert!(matches!(
            parse_config("[webhooks]\nenabled = \"sometimes\""),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_WEBHOOKS_ENABLED, "false"),
            (ENV_EMAIL_FALLBACK, "1"),
            (ENV_ENVIRONMENT, "production"),
        ]
        .into_iter()
        .collect();

        let mut config = parse_config(SAMPLE).unwrap();
        apply_env_overrides(&mut config, |key| env.get(key).map(|v| v.to_string())).unwrap();

        assert!(!config.webhooks.enabled);
        assert!(config.webhooks.email_fallback);
        assert_eq!(config.webhooks.environment, "production");
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = AppConfig::default();
        let result = apply_env_overrides(&mut config, |key| {
            (key == ENV_WEBHOOKS_ENABLED).then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_file_falls_back_to_disabled() {
        let loaded = load_config("/nonexistent/cityforge.toml");
        assert!(matches!(loaded, Err(ConfigError::IoError(_))));
        assert_eq!(log_level(&loaded), Level::INFO);

        let config = config_or_default("/nonexistent/cityforge.toml", loaded);
        assert!(!config.webhooks.enabled);
    }

    #[test]
    fn test_log_level_from_config() {
        let loaded = parse_config(SAMPLE);
        assert_eq!(log_level(&loaded), Level::DEBUG);

        let loaded = parse_config("[server]\nlog_level = \"chatty\"");
        assert_eq!(log_level(&loaded), Level::INFO);
    }
}
