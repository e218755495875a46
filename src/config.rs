//! Server settings, loaded once at start-up and shared by reference.

use crate::ticket::types::ExpirationPolicy;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Smallest accepted random part of a ticket id (128 bits).
pub const MIN_TICKET_ENTROPY_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Unknown ticket store backend: {0}")]
    UnknownStore(String),

    #[error("Ticket entropy must be at least 16 bytes, got {0}")]
    WeakEntropy(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub store: StoreBackend,
    pub redis_url: String,
    /// JSON user table for the built-in authenticator.
    pub users_path: Option<String>,
    /// User attributes copied into the session at login.
    pub extra_attributes: Vec<String>,
    pub expiration: ExpirationPolicy,
    pub proxy_callback_timeout: Duration,
    pub require_https_callback: bool,
    pub ticket_entropy_bytes: usize,
    pub secure_cookie: bool,
    pub purge_interval: Duration,
    pub enable_timing_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            store: StoreBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            users_path: None,
            extra_attributes: Vec::new(),
            expiration: ExpirationPolicy::default(),
            proxy_callback_timeout: Duration::from_secs(5),
            require_https_callback: true,
            ticket_entropy_bytes: 32,
            secure_cookie: true,
            purge_interval: Duration::from_secs(60),
            enable_timing_logs: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();

        let store = match lookup("CAS_STORE").as_deref() {
            None | Some("memory") => StoreBackend::Memory,
            Some("redis") => StoreBackend::Redis,
            Some(other) => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        let mut expiration = defaults.expiration;
        if let Some(lifetime) = parse_lifetime(&lookup, "CAS_LOGIN_TICKET_TTL")? {
            expiration.login_ticket_lifetime = lifetime;
        }
        if let Some(lifetime) = parse_lifetime(&lookup, "CAS_SERVICE_TICKET_TTL")? {
            expiration.service_ticket_lifetime = lifetime;
        }
        if let Some(lifetime) = parse_lifetime(&lookup, "CAS_TGT_MAX_LIFETIME")? {
            expiration.tgt_max_lifetime = Some(lifetime);
        }

        let ticket_entropy_bytes = parse_opt(&lookup, "CAS_TICKET_ENTROPY_BYTES")?
            .unwrap_or(defaults.ticket_entropy_bytes);
        if ticket_entropy_bytes < MIN_TICKET_ENTROPY_BYTES {
            return Err(ConfigError::WeakEntropy(ticket_entropy_bytes));
        }

        Ok(Settings {
            port: parse_opt(&lookup, "PORT")?.unwrap_or(defaults.port),
            store,
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            users_path: lookup("CAS_USERS_PATH"),
            extra_attributes: lookup("CAS_EXTRA_ATTRIBUTES")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            expiration,
            proxy_callback_timeout: parse_opt(&lookup, "CAS_PROXY_CALLBACK_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.proxy_callback_timeout),
            require_https_callback: parse_opt(&lookup, "CAS_REQUIRE_HTTPS_CALLBACK")?
                .unwrap_or(defaults.require_https_callback),
            ticket_entropy_bytes,
            secure_cookie: parse_opt(&lookup, "CAS_SECURE_COOKIE")?
                .unwrap_or(defaults.secure_cookie),
            purge_interval: parse_opt(&lookup, "CAS_PURGE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.purge_interval),
            enable_timing_logs: lookup("ENABLE_TIMING_LOGS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
    }
}

/// A positive number of seconds.
fn parse_lifetime<F>(lookup: &F, key: &str) -> Result<Option<chrono::Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(secs) = parse_opt::<i64, F>(lookup, key)? else {
        return Ok(None);
    };
    Some(secs)
        .filter(|secs| *secs > 0)
        .and_then(chrono::Duration::try_seconds)
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            value: secs.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings_from(&[]).unwrap();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.store, StoreBackend::Memory);
        assert_eq!(settings.ticket_entropy_bytes, 32);
        assert!(settings.require_https_callback);
        assert!(settings.expiration.tgt_max_lifetime.is_none());
    }

    #[test]
    fn test_overrides() {
        let settings = settings_from(&[
            ("PORT", "9443"),
            ("CAS_STORE", "redis"),
            ("CAS_EXTRA_ATTRIBUTES", "email, full_name,"),
            ("CAS_TGT_MAX_LIFETIME", "3600"),
            ("CAS_PROXY_CALLBACK_TIMEOUT_MS", "250"),
        ])
        .unwrap();
        assert_eq!(settings.port, 9443);
        assert_eq!(settings.store, StoreBackend::Redis);
        assert_eq!(settings.extra_attributes, vec!["email", "full_name"]);
        assert_eq!(
            settings.expiration.tgt_max_lifetime,
            Some(chrono::Duration::seconds(3600))
        );
        assert_eq!(settings.proxy_callback_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            settings_from(&[("PORT", "eighty")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            settings_from(&[("CAS_STORE", "postgres")]),
            Err(ConfigError::UnknownStore(_))
        ));
        assert!(matches!(
            settings_from(&[("CAS_TICKET_ENTROPY_BYTES", "8")]),
            Err(ConfigError::WeakEntropy(8))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_lifetimes() {
        for (key, value) in [
            ("CAS_LOGIN_TICKET_TTL", "0"),
            ("CAS_SERVICE_TICKET_TTL", "-30"),
            ("CAS_TGT_MAX_LIFETIME", "9223372036854775807"),
        ] {
            assert!(
                matches!(
                    settings_from(&[(key, value)]),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{}={}",
                key,
                value
            );
        }

        let settings = settings_from(&[("CAS_SERVICE_TICKET_TTL", "45")]).unwrap();
        assert_eq!(
            settings.expiration.service_ticket_lifetime,
            chrono::Duration::seconds(45)
        );
    }
}
