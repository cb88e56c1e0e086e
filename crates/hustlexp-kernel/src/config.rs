//! Kernel configuration from environment knobs.

use hustlexp_storage::RetryPolicy;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {message}")]
    Invalid {
        name: &'static str,
        message: String,
    },
}

/// Parsed process configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub database_url: String,
    pub payment_provider_key: String,
    /// 32-byte key, hex-encoded in the environment; required in production.
    pub session_encryption_key: Option<[u8; 32]>,
    /// Operator override: force SafeMode on or off at startup.
    pub safe_mode_override: Option<bool>,
    pub outbox_worker_count: usize,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Advisory-plane daily spend ceiling; informational only.
    pub ai_daily_budget_usd: Option<Decimal>,
    pub production: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            payment_provider_key: String::new(),
            session_encryption_key: None,
            safe_mode_override: None,
            outbox_worker_count: 2,
            retry_max_attempts: 5,
            retry_base_ms: 50,
            retry_max_ms: 2_000,
            ai_daily_budget_usd: None,
            production: false,
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let production = std::env::var("HUSTLEXP_ENV")
            .map(|value| value == "production")
            .unwrap_or(false);

        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let payment_provider_key = std::env::var("PAYMENT_PROVIDER_KEY")
            .map_err(|_| ConfigError::Missing("PAYMENT_PROVIDER_KEY"))?;

        let session_encryption_key = match std::env::var("SESSION_ENCRYPTION_KEY") {
            Ok(raw) => Some(parse_session_key(&raw)?),
            Err(_) if production => return Err(ConfigError::Missing("SESSION_ENCRYPTION_KEY")),
            Err(_) => None,
        };

        let safe_mode_override = match std::env::var("SAFE_MODE_OVERRIDE") {
            Ok(raw) => Some(parse_bool("SAFE_MODE_OVERRIDE", &raw)?),
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            payment_provider_key,
            session_encryption_key,
            safe_mode_override,
            outbox_worker_count: parse_or(
                "OUTBOX_WORKER_COUNT",
                defaults.outbox_worker_count,
            )?,
            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?,
            retry_base_ms: parse_or("RETRY_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: parse_or("RETRY_MAX_MS", defaults.retry_max_ms)?,
            ai_daily_budget_usd: match std::env::var("AI_DAILY_BUDGET_USD") {
                Ok(raw) => Some(raw.parse().map_err(|_| ConfigError::Invalid {
                    name: "AI_DAILY_BUDGET_USD",
                    message: format!("`{raw}` is not a decimal amount"),
                })?),
                Err(_) => None,
            },
            production,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_ms),
            Duration::from_millis(self.retry_max_ms),
        )
    }
}

fn parse_session_key(raw: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(raw).map_err(|_| ConfigError::Invalid {
        name: "SESSION_ENCRYPTION_KEY",
        message: "not valid hex".to_string(),
    })?;
    bytes.try_into().map_err(|_| ConfigError::Invalid {
        name: "SESSION_ENCRYPTION_KEY",
        message: "must decode to exactly 32 bytes".to_string(),
    })
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            message: format!("`{other}` is not a boolean"),
        }),
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            message: format!("`{raw}` failed to parse"),
        }),
        Err(_) => Ok(default),
    }
}
