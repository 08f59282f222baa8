//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{Result, TaskPayError};
use crate::models::Amount;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the mobile-money gateway (e.g. https://api.mpesa-provider.com)
    pub gateway_url: String,
    /// Optional bearer token sent with every gateway request
    pub gateway_api_key: Option<String>,
    /// Timeout applied to each gateway HTTP call
    pub gateway_timeout_secs: u64,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the client API server
    pub api_port: u16,
    pub policy: Policy,
}

/// Business rules shared by the timer, the payment issuer and the reconciler.
#[derive(Debug, Clone)]
pub struct Policy {
    pub minimum_withdrawal: Amount,
    pub activation_fee: Amount,
    pub welcome_bonus: Amount,
    /// How long a completed task stays locked before it can be started again.
    pub cooldown_secs: i64,
    /// Ceiling on how long a task may stay in progress before it is force-completed.
    pub max_task_window_secs: i64,
    pub poll_interval: Duration,
    /// Consecutive failed status queries before a transaction is abandoned.
    pub max_poll_failures: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            minimum_withdrawal: Amount::kes(1500),
            activation_fee: Amount::kes(300),
            welcome_bonus: Amount::kes(499),
            cooldown_secs: 24 * 60 * 60,
            max_task_window_secs: 60 * 60,
            poll_interval: Duration::from_secs(5),
            max_poll_failures: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            gateway_url: env_var("GATEWAY_URL").map_err(|_| {
                TaskPayError::Config("GATEWAY_URL environment variable is required".to_string())
            })?,
            gateway_api_key: env_var("GATEWAY_API_KEY").ok().filter(|k| !k.is_empty()),
            gateway_timeout_secs: parsed("GATEWAY_TIMEOUT_SECS", "30")?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./taskpay.db".to_string()),
            api_port: parsed("API_PORT", "3001")?,
            policy: Policy {
                minimum_withdrawal: Amount::kes(parsed("MIN_WITHDRAWAL_KES", "1500")?),
                activation_fee: Amount::kes(parsed("ACTIVATION_FEE_KES", "300")?),
                welcome_bonus: Amount::kes(parsed("WELCOME_BONUS_KES", "499")?),
                cooldown_secs: parsed("TASK_COOLDOWN_SECS", "86400")?,
                max_task_window_secs: parsed("MAX_TASK_WINDOW_SECS", "3600")?,
                poll_interval: Duration::from_secs(parsed("POLL_INTERVAL_SECS", "5")?),
                max_poll_failures: parsed("MAX_POLL_FAILURES", "10")?,
            },
        })
    }
}

fn parsed<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| TaskPayError::Config(format!("Invalid {key}")))
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| TaskPayError::Config(format!("Missing env var: {key}")))
}
