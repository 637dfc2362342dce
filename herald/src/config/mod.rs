//! Engine configuration.
//!
//! Loaded from an optional JSON file named by `HERALD_CONFIG`, then overridden
//! from the environment (`.env` is read first via `dotenvy`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::broker::BrokerConfig;
use crate::notification::dispatcher::DispatcherConfig;
use crate::notification::providers::{EmailConfig, PushConfig, SmsConfig};
use crate::notification::retry::RetryConfig;
use crate::{Error, Result};

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "HERALD_CONFIG";

/// Preference gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// TTL of cached preference rows. Zero disables caching.
    pub preference_cache_ttl_secs: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            preference_cache_ttl_secs: 30,
        }
    }
}

impl GateConfig {
    pub fn preference_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.preference_cache_ttl_secs)
    }
}

/// Provider options, one section per channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub push: PushConfig,
}

impl ProvidersConfig {
    fn set_mock_mode(&mut self, enabled: bool) {
        self.email.mock_mode = enabled;
        self.sms.mock_mode = enabled;
        self.push.mock_mode = enabled;
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_url: String,
    /// Directory for rotated log files; console only when unset.
    pub log_dir: Option<PathBuf>,
    pub retry: RetryConfig,
    pub gate: GateConfig,
    pub dispatcher: DispatcherConfig,
    pub broker: BrokerConfig,
    pub providers: ProvidersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:herald.db?mode=rwc".to_string(),
            log_dir: None,
            retry: RetryConfig::default(),
            gate: GateConfig::default(),
            dispatcher: DispatcherConfig::default(),
            broker: BrokerConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("Invalid value for {}: {}", name, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::config(format!("Invalid boolean for {}: {}", name, other))),
    }
}

impl EngineConfig {
    /// Load from `HERALD_CONFIG` (if set) and the environment, then validate.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("Invalid config {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Apply environment overrides read through `get`.
    pub fn apply_env<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("AMQP_URL") {
            self.broker.url = v;
        }
        if let Some(v) = var("HERALD_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = var("HERALD_WORKERS") {
            self.dispatcher.workers = parse_var("HERALD_WORKERS", &v)?;
        }
        if let Some(v) = var("HERALD_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_var("HERALD_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("HERALD_PREFERENCE_CACHE_TTL_SECS") {
            self.gate.preference_cache_ttl_secs =
                parse_var("HERALD_PREFERENCE_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = var("HERALD_MOCK_PROVIDERS") {
            self.providers.set_mock_mode(parse_bool("HERALD_MOCK_PROVIDERS", &v)?);
        }

        let email = &mut self.providers.email;
        if let Some(v) = var("SMTP_HOST") {
            email.smtp_host = v;
        }
        if let Some(v) = var("SMTP_PORT") {
            email.smtp_port = parse_var("SMTP_PORT", &v)?;
        }
        if let Some(v) = var("SMTP_USERNAME") {
            email.smtp_username = Some(v);
        }
        if let Some(v) = var("SMTP_PASSWORD") {
            email.smtp_password = Some(v);
        }
        if let Some(v) = var("SMTP_FROM") {
            email.from_address = v;
        }

        let sms = &mut self.providers.sms;
        if let Some(v) = var("SMS_API_URL") {
            sms.api_url = v;
        }
        if let Some(v) = var("SMS_API_KEY") {
            sms.api_key = Some(v);
        }
        if let Some(v) = var("SMS_SENDER_ID") {
            sms.sender_id = v;
        }
        if let Some(v) = var("SMS_STATUS_URL") {
            sms.status_url = Some(v);
        }

        let push = &mut self.providers.push;
        if let Some(v) = var("PUSH_API_URL") {
            push.api_url = v;
        }
        if let Some(v) = var("PUSH_SERVER_KEY") {
            push.server_key = Some(v);
        }
        if let Some(v) = var("PUSH_APP_ID") {
            push.app_id = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database_url must not be empty"));
        }
        if self.dispatcher.workers == 0 {
            return Err(Error::config("dispatcher.workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.max_delay_secs == 0 {
            return Err(Error::config("retry.max_delay_secs must be positive"));
        }
        let bases = [
            ("throttled_base_ms", self.retry.throttled_base_ms),
            ("timeout_base_ms", self.retry.timeout_base_ms),
            ("server_error_base_ms", self.retry.server_error_base_ms),
            ("network_base_ms", self.retry.network_base_ms),
        ];
        if let Some((name, _)) = bases.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::config(format!("retry.{} must be positive", name)));
        }
        if self.retry.status_poll_secs == 0 {
            return Err(Error::config("retry.status_poll_secs must be positive"));
        }
        if self.broker.prefetch == 0 {
            return Err(Error::config("broker.prefetch must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.gate.preference_cache_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env(env(&[
                ("DATABASE_URL", "sqlite::memory:"),
                ("AMQP_URL", "amqp://mq:5672/%2f"),
                ("HERALD_WORKERS", "8"),
                ("HERALD_MAX_ATTEMPTS", "5"),
                ("HERALD_MOCK_PROVIDERS", "true"),
                ("SMTP_HOST", "smtp.example.com"),
                ("SMTP_PORT", "2525"),
                ("SMS_API_KEY", "secret"),
                ("PUSH_APP_ID", "app"),
                ("SMTP_USERNAME", "  "),
            ]))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.broker.url, "amqp://mq:5672/%2f");
        assert_eq!(config.dispatcher.workers, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.providers.email.mock_mode && config.providers.push.mock_mode);
        assert_eq!(config.providers.email.smtp_port, 2525);
        assert_eq!(config.providers.email.smtp_username, None);
        assert_eq!(config.providers.sms.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(env(&[("HERALD_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let mut config = EngineConfig::default();
        config.dispatcher.workers = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.timeout_base_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.json");
        std::fs::write(&path, r#"{"retry": {"max_attempts": 4}, "dispatcher": {"workers": 2}}"#)
            .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.timeout_base_ms, 5_000);
        assert_eq!(config.dispatcher.workers, 2);
        assert_eq!(config.broker.dispatch_queue, "notification.dispatch");
    }
}
