use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use household_state_api::EngineConfig;
use household_state_core::UnknownKeyPolicy;
use household_state_ratelimit::{RateLimitPolicy, RateLimiterConfig, RemoteStoreConfig};

pub const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "household-state-service")]
#[command(about = "HTTP service for the household financial state engine")]
pub struct Args {
    #[arg(long, env = "HSK_DB", default_value = "./household_state.sqlite3")]
    pub db: PathBuf,
    #[arg(long, env = "HSK_BIND", default_value = "127.0.0.1:4020")]
    pub bind: SocketAddr,
    #[arg(long, env = "HSK_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Snapshots a free-plan household may persist.
    #[arg(long, env = "HSK_FREE_LIMIT", default_value_t = household_state_api::DEFAULT_FREE_SNAPSHOT_LIMIT)]
    pub free_limit: u64,
    /// Where keys outside the slot vocabulary are stored.
    #[arg(long, env = "HSK_UNKNOWN_KEYS", value_enum, default_value = "pass_through")]
    pub unknown_keys: UnknownKeyPolicy,

    #[arg(long, env = "HSK_RATE_WINDOW_SECS", default_value_t = 60)]
    pub rate_window_secs: u64,
    #[arg(long, env = "HSK_RATE_LIMIT_IP", default_value_t = 60)]
    pub rate_limit_ip: u64,
    #[arg(long, env = "HSK_RATE_LIMIT_HOUSEHOLD", default_value_t = 30)]
    pub rate_limit_household: u64,
    #[arg(long, env = "HSK_RATE_STORE_URL")]
    pub rate_store_url: Option<String>,
    #[arg(long, env = "HSK_RATE_STORE_TOKEN")]
    pub rate_store_token: Option<String>,
    #[arg(long, env = "HSK_RATE_STORE_TIMEOUT_MS", default_value_t = 500)]
    pub rate_store_timeout_ms: u64,
    #[arg(long, env = "HSK_RATE_FALLBACK_CAPACITY", default_value_t = household_state_ratelimit::DEFAULT_FALLBACK_CAPACITY)]
    pub rate_fallback_capacity: usize,

    #[arg(long = "allowed-origin", env = "HSK_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,
    #[arg(long, env = "HSK_ENFORCE_SAME_ORIGIN")]
    pub enforce_same_origin: bool,

    #[arg(long, env = "HSK_COOKIE_SECRET", hide_env_values = true)]
    pub cookie_secret: String,
    #[arg(long, env = "HSK_COOKIE_MAX_AGE_DAYS", default_value_t = 400)]
    pub cookie_max_age_days: u64,
    #[arg(long, env = "HSK_COOKIE_SECURE")]
    pub cookie_secure: bool,

    /// HS256 secret for bearer tokens; unset disables authentication.
    #[arg(long, env = "HSK_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    #[arg(long, env = "HSK_BILLING_URL")]
    pub billing_url: Option<String>,
    #[arg(long, env = "HSK_BILLING_TIMEOUT_MS", default_value_t = 3_000)]
    pub billing_timeout_ms: u64,
    #[arg(long, env = "HSK_LOGIN_URL")]
    pub login_url: Option<String>,
}

/// Pipeline settings shared by every route.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ip_policy: RateLimitPolicy,
    pub household_policy: RateLimitPolicy,
    pub allowed_origins: Vec<String>,
    pub enforce_same_origin: bool,
}

impl Args {
    /// # Errors
    /// Returns the first configuration problem found.
    pub fn validate(&self) -> Result<()> {
        if self.cookie_secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!("cookie secret must be at least {MIN_SECRET_LEN} bytes"));
        }
        if let Some(secret) = &self.jwt_secret {
            if secret.len() < MIN_SECRET_LEN {
                return Err(anyhow!("jwt secret must be at least {MIN_SECRET_LEN} bytes"));
            }
        }
        if self.rate_window_secs == 0 || self.rate_limit_ip == 0 || self.rate_limit_household == 0 {
            return Err(anyhow!("rate-limit window and limits must be positive"));
        }
        if self.rate_store_url.is_some() != self.rate_store_token.is_some() {
            return Err(anyhow!("rate store url and token must be configured together"));
        }
        Ok(())
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            free_limit: self.free_limit,
            unknown_keys: self.unknown_keys,
            login_url: self.login_url.clone(),
        }
    }

    #[must_use]
    pub fn limiter_config(&self) -> RateLimiterConfig {
        let remote = match (&self.rate_store_url, &self.rate_store_token) {
            (Some(url), Some(token)) => Some(RemoteStoreConfig {
                url: url.clone(),
                token: token.clone(),
                timeout: Duration::from_millis(self.rate_store_timeout_ms),
            }),
            _ => None,
        };
        RateLimiterConfig { remote, fallback_capacity: Some(self.rate_fallback_capacity) }
    }

    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        let window = Duration::from_secs(self.rate_window_secs);
        PipelineConfig {
            ip_policy: RateLimitPolicy::new(self.rate_limit_ip, window),
            household_policy: RateLimitPolicy::new(self.rate_limit_household, window),
            allowed_origins: self
                .allowed_origins
                .iter()
                .map(|origin| origin.trim().trim_end_matches('/').to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            enforce_same_origin: self.enforce_same_origin,
        }
    }

    #[must_use]
    pub fn cookie_max_age(&self) -> Duration {
        Duration::from_secs(self.cookie_max_age_days.saturating_mul(24 * 60 * 60))
    }
}
