//! Application configuration management

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for generating URLs)
    pub host: Option<String>,

    /// Server port
    pub port: u16,

    /// JWT secret for token signing and verification
    pub jwt_secret: String,

    /// Lifetime of tokens issued on sign-up
    pub token_ttl_secs: i64,

    /// Largest key set handed to one batch fetch
    pub loader_max_batch_size: usize,

    /// How long a loader collects keys before dispatching
    pub loader_batch_delay: Duration,

    /// TTL of the process-wide users cache
    pub user_cache_ttl: Duration,

    /// Entry bound of the process-wide users cache
    pub user_cache_max_entries: usize,

    /// Delivery queue capacity for subscriptions that don't choose one
    pub subscription_queue_capacity: usize,

    /// Queries and mutations are cancelled after this long
    pub request_timeout: Duration,

    /// Insert demo users, posts and comments on startup
    pub seed_demo_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            port: 3001,
            jwt_secret: dev_secret(),
            token_ttl_secs: 86_400,
            loader_max_batch_size: 100,
            loader_batch_delay: Duration::from_millis(1),
            user_cache_ttl: Duration::from_secs(30),
            user_cache_max_entries: 10_000,
            subscription_queue_capacity: 64,
            request_timeout: Duration::from_secs(30),
            seed_demo_data: true,
        }
    }
}

/// In production JWT_SECRET should be set explicitly; tokens signed with this
/// one die with the process.
fn dev_secret() -> String {
    format!("dev-secret-{}", uuid::Uuid::new_v4())
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let jwt_secret = match env::var("JWT_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => secret.trim().to_string(),
            _ => {
                tracing::warn!("JWT_SECRET not set, using a random development secret");
                defaults.jwt_secret
            }
        };

        let loader_max_batch_size: usize = parse_var("LOADER_MAX_BATCH_SIZE", defaults.loader_max_batch_size)?;
        if loader_max_batch_size == 0 {
            anyhow::bail!("LOADER_MAX_BATCH_SIZE must be at least 1");
        }

        Ok(Self {
            host: env::var("HOST").ok(),

            port: parse_var("PORT", defaults.port)?,

            jwt_secret,

            token_ttl_secs: parse_var("TOKEN_TTL_SECS", defaults.token_ttl_secs)?,

            loader_max_batch_size,

            loader_batch_delay: Duration::from_millis(parse_var("LOADER_BATCH_DELAY_MS", 1u64)?),

            user_cache_ttl: Duration::from_secs(parse_var("USER_CACHE_TTL_SECS", 30u64)?),

            user_cache_max_entries: parse_var("USER_CACHE_MAX_ENTRIES", defaults.user_cache_max_entries)?,

            subscription_queue_capacity: parse_var(
                "SUBSCRIPTION_QUEUE_CAPACITY",
                defaults.subscription_queue_capacity,
            )?,

            request_timeout: Duration::from_secs(parse_var("REQUEST_TIMEOUT_SECS", 30u64)?),

            seed_demo_data: env::var("SEED_DEMO_DATA")
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.seed_demo_data),
        })
    }

    /// Base URL for log messages
    pub fn public_url(&self) -> String {
        match &self.host {
            Some(host) => format!("http://{}:{}", host, self.port),
            None => format!("http://localhost:{}", self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag(" 1 "));
        assert!(parse_flag("YES"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }

    #[test]
    fn test_parse_var_reports_name() {
        // SAFETY: no other test reads this variable
        unsafe { env::set_var("POSTGRAPH_TEST_PORT", "not-a-port") };
        let err = parse_var::<u16>("POSTGRAPH_TEST_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("POSTGRAPH_TEST_PORT"));
        unsafe { env::remove_var("POSTGRAPH_TEST_PORT") };

        assert_eq!(parse_var::<u16>("POSTGRAPH_TEST_UNSET", 7).unwrap(), 7);
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 3001);
        assert_eq!(config.loader_max_batch_size, 100);
        assert!(config.jwt_secret.starts_with("dev-secret-"));
        assert_eq!(config.public_url(), "http://localhost:3001");
    }
}
