//! Configuration management using environment variables
//!
//! # Contract values
//!
//! `IDENTITY_SESSION_DOMAIN` is part of the session identity contract
//! (`<lowercased-address>@<domain>`). It must match the domain the identity
//! provider uses when it binds sessions, otherwise every recovered session
//! fails reconciliation and is signed out.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;

/// Default application name rendered into login challenges
pub const DEFAULT_APP_NAME: &str = "Community Reports";

/// Default synthetic identity domain
pub const DEFAULT_SESSION_DOMAIN: &str = "wallet.local";

/// Default cache key for the last authenticated wallet address
pub const DEFAULT_CACHE_KEY: &str = "wallet_identity:last_address";

/// Which identity provider the agent talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    /// Remote provider at `provider_url`
    Http,
    /// In-process provider verifying challenges itself
    Local,
}

impl std::str::FromStr for ProviderMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(ProviderMode::Http),
            "local" => Ok(ProviderMode::Local),
            other => Err(format!("expected 'http' or 'local', got '{}'", other)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Identity core configuration
    pub identity: IdentityConfig,

    /// Redis configuration
    pub redis: RedisConfig,
}

/// Identity core configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Application name embedded in challenge text
    pub app_name: String,

    /// Fixed domain suffix of synthetic session identities
    pub session_domain: String,

    /// Remote or in-process identity provider
    pub provider_mode: ProviderMode,

    /// Base URL of the remote identity provider
    pub provider_url: String,

    /// Base URL of the profile service
    pub profile_url: String,

    /// Maximum accepted challenge age in seconds (in-process provider)
    pub challenge_max_age_secs: u64,

    /// Lifetime of sessions issued by the in-process provider
    pub session_ttl_secs: u64,

    /// Redis key holding the last authenticated wallet address
    pub cache_key: String,

    /// TTL of the cached wallet address in seconds
    pub cache_ttl_secs: u64,

    /// Timeout for outbound HTTP calls in seconds
    pub http_timeout_secs: u64,
}

/// Redis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis host
    pub host: String,

    /// Redis port
    pub port: u16,

    /// Redis password (optional)
    pub password: Option<String>,

    /// Direct Redis URL (takes precedence over host/port/password)
    /// Supports both `redis://` and `rediss://` (TLS) schemes
    pub url: Option<String>,
}

impl RedisConfig {
    /// Build a Redis connection URL
    ///
    /// If `url` is set (from REDIS_URL env var), uses that directly.
    /// Otherwise, builds URL from host/port/password components.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        if let Some(password) = &self.password {
            format!("redis://:{}@{}:{}", password, self.host, self.port)
        } else {
            format!("redis://{}:{}", self.host, self.port)
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        tracing::debug!(
            app_name = %config.identity.app_name,
            session_domain = %config.identity.session_domain,
            provider_mode = ?config.identity.provider_mode,
            provider_url = %config.identity.provider_url,
            "Loaded identity configuration"
        );
        Ok(config)
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// `from_env` delegates here; tests pass a map instead of mutating the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider_url = lookup("IDENTITY_PROVIDER_URL")
            .unwrap_or_else(|| "http://localhost:8080".to_string());

        let identity = IdentityConfig {
            app_name: lookup("IDENTITY_APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            session_domain: lookup("IDENTITY_SESSION_DOMAIN")
                .unwrap_or_else(|| DEFAULT_SESSION_DOMAIN.to_string()),
            profile_url: lookup("PROFILE_SERVICE_URL").unwrap_or_else(|| provider_url.clone()),
            provider_mode: parse_or(&lookup, "IDENTITY_PROVIDER", ProviderMode::Http)?,
            provider_url,
            challenge_max_age_secs: parse_or(&lookup, "CHALLENGE_MAX_AGE_SECS", 300)?,
            session_ttl_secs: parse_or(&lookup, "SESSION_TTL_SECS", 3600)?,
            cache_key: lookup("SESSION_CACHE_KEY").unwrap_or_else(|| DEFAULT_CACHE_KEY.to_string()),
            cache_ttl_secs: parse_or(&lookup, "SESSION_CACHE_TTL_SECS", 30 * 24 * 3600)?,
            http_timeout_secs: parse_or(&lookup, "HTTP_TIMEOUT_SECS", 30)?,
        };
        identity.validate()?;

        let redis = RedisConfig {
            host: lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&lookup, "REDIS_PORT", 6379)?,
            password: lookup("REDIS_PASSWORD"),
            // REDIS_URL takes precedence - supports TLS (rediss://)
            url: lookup("REDIS_URL"),
        };

        Ok(Self { identity, redis })
    }
}

impl IdentityConfig {
    /// Reject values that would break the challenge or identity contracts
    pub fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::config("IDENTITY_APP_NAME must not be empty"));
        }

        let domain = self.session_domain.trim();
        if domain.is_empty() {
            return Err(Error::config("IDENTITY_SESSION_DOMAIN must not be empty"));
        }
        if domain.contains('@') || domain.chars().any(char::is_whitespace) {
            return Err(Error::config(format!(
                "IDENTITY_SESSION_DOMAIN must be a bare domain, got '{}'",
                self.session_domain
            )));
        }

        if self.challenge_max_age_secs == 0 {
            return Err(Error::config("CHALLENGE_MAX_AGE_SECS must be greater than zero"));
        }

        if self.session_ttl_secs == 0 {
            return Err(Error::config("SESSION_TTL_SECS must be greater than zero"));
        }

        if self.cache_key.is_empty() {
            return Err(Error::config("SESSION_CACHE_KEY must not be empty"));
        }

        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.identity.app_name, DEFAULT_APP_NAME);
        assert_eq!(config.identity.session_domain, DEFAULT_SESSION_DOMAIN);
        assert_eq!(config.identity.provider_mode, ProviderMode::Http);
        assert_eq!(config.identity.challenge_max_age_secs, 300);
        assert_eq!(config.identity.session_ttl_secs, 3600);
        assert_eq!(config.identity.cache_key, DEFAULT_CACHE_KEY);
        assert_eq!(config.identity.profile_url, config.identity.provider_url);
        assert_eq!(config.redis.connection_url(), "redis://localhost:6379");
    }

    #[test]
    fn test_profile_url_override() {
        let config = load(&[
            ("IDENTITY_PROVIDER_URL", "https://id.example.com"),
            ("PROFILE_SERVICE_URL", "https://profiles.example.com"),
        ])
        .unwrap();

        assert_eq!(config.identity.provider_url, "https://id.example.com");
        assert_eq!(config.identity.profile_url, "https://profiles.example.com");
    }

    #[test]
    fn test_local_provider_mode() {
        let config = load(&[
            ("IDENTITY_PROVIDER", "Local"),
            ("CHALLENGE_MAX_AGE_SECS", "120"),
            ("SESSION_TTL_SECS", "600"),
        ])
        .unwrap();

        assert_eq!(config.identity.provider_mode, ProviderMode::Local);
        assert_eq!(config.identity.challenge_max_age_secs, 120);
        assert_eq!(config.identity.session_ttl_secs, 600);
    }

    #[test]
    fn test_unknown_provider_mode_rejected() {
        let result = load(&[("IDENTITY_PROVIDER", "ldap")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let result = load(&[("CHALLENGE_MAX_AGE_SECS", "five minutes")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_session_domain_with_at_sign_rejected() {
        let result = load(&[("IDENTITY_SESSION_DOMAIN", "user@wallet.local")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_challenge_age_rejected() {
        let result = load(&[("CHALLENGE_MAX_AGE_SECS", "0")]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_redis_connection_url_with_password() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("secret".to_string()),
            url: None,
        };

        assert_eq!(config.connection_url(), "redis://:secret@localhost:6379");
    }

    #[test]
    fn test_redis_connection_url_with_direct_url() {
        let config = RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            password: Some("ignored".to_string()),
            url: Some("rediss://:authtoken@redis.example.com:6379".to_string()),
        };

        // Direct URL takes precedence over host/port/password
        assert_eq!(
            config.connection_url(),
            "rediss://:authtoken@redis.example.com:6379"
        );
    }
}
