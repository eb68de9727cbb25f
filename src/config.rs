use config::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Unset means the in-memory store is used
    pub database_url: Option<String>,
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    pub lifecycle: LifecycleConfig,
    pub sweeps: SweepConfig,
    pub paypal: Option<PayPalConfig>,
    pub chain: ChainConfig,
}

/// Time limits and defaults applied by the intent state machine
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub intent_ttl: chrono::Duration,
    pub claim_ttl: chrono::Duration,
    pub withdrawal_delay: chrono::Duration,
    pub default_fee_rate: Decimal,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            intent_ttl: chrono::Duration::minutes(30),
            claim_ttl: chrono::Duration::minutes(30),
            withdrawal_delay: chrono::Duration::hours(24),
            default_fee_rate: dec!(0.5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub recovery_interval: Duration,
    pub expiry_interval: Duration,
    pub cancel_grace: chrono::Duration,
    pub stall_timeout: chrono::Duration,
    /// How many trailing history entries are searched for a cancellation marker
    pub cancellation_window: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            recovery_interval: Duration::from_secs(10),
            expiry_interval: Duration::from_secs(60),
            cancel_grace: chrono::Duration::seconds(15),
            stall_timeout: chrono::Duration::minutes(5),
            cancellation_window: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub return_url: String,
    pub cancel_url: String,
    /// Webhook id registered with PayPal; deliveries cannot be verified without it
    pub webhook_id: Option<String>,
    pub request_timeout: Duration,
}

/// How escrow status is read from the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainQueryStrategy {
    /// Ask the contract for the escrow record
    Direct,
    /// Simulate a withdraw and infer status from the revert reason
    DryRun,
}

impl FromStr for ChainQueryStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ChainQueryStrategy::Direct),
            "dry_run" | "dry-run" | "dryrun" => Ok(ChainQueryStrategy::DryRun),
            other => Err(ConfigError::Message(format!(
                "Unknown chain query strategy: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub rpc_url: Option<String>,
    pub contract_address: String,
    pub strategy: ChainQueryStrategy,
    pub cache_ttl: chrono::Duration,
    pub request_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let paypal = match (
            std::env::var("PAYPAL_CLIENT_ID").ok(),
            std::env::var("PAYPAL_CLIENT_SECRET").ok(),
        ) {
            (Some(client_id), Some(client_secret)) => {
                let app_url = std::env::var("APP_URL")
                    .unwrap_or_else(|_| "http://localhost:3030".to_string());
                Some(PayPalConfig {
                    client_id,
                    client_secret,
                    base_url: std::env::var("PAYPAL_BASE_URL")
                        .unwrap_or_else(|_| "https://api-m.sandbox.paypal.com".to_string()),
                    return_url: format!("{}/payment-success", app_url),
                    cancel_url: format!("{}/payment-cancel", app_url),
                    webhook_id: std::env::var("PAYPAL_WEBHOOK_ID").ok(),
                    request_timeout: Duration::from_secs(env_or("PAYPAL_TIMEOUT_SECS", 15)?),
                })
            }
            _ => None,
        };

        let defaults = SweepConfig::default();
        let sweeps = SweepConfig {
            recovery_interval: Duration::from_secs(env_or("RECOVERY_INTERVAL_SECS", 10)?),
            expiry_interval: Duration::from_secs(env_or("EXPIRY_INTERVAL_SECS", 60)?),
            cancel_grace: chrono::Duration::seconds(env_or("CANCEL_GRACE_SECS", 15)?),
            stall_timeout: chrono::Duration::seconds(env_or("STALL_TIMEOUT_SECS", 300)?),
            cancellation_window: env_or("CANCELLATION_WINDOW", defaults.cancellation_window)?,
        };

        let lifecycle = LifecycleConfig {
            intent_ttl: chrono::Duration::minutes(env_or("INTENT_TTL_MINUTES", 30)?),
            claim_ttl: chrono::Duration::minutes(env_or("CLAIM_TTL_MINUTES", 30)?),
            withdrawal_delay: chrono::Duration::hours(env_or("WITHDRAWAL_DELAY_HOURS", 24)?),
            default_fee_rate: env_or("DEFAULT_FEE_RATE", dec!(0.5))?,
        };

        let chain = ChainConfig {
            rpc_url: std::env::var("ESCROW_RPC_URL").ok(),
            contract_address: std::env::var("ESCROW_CONTRACT_ADDRESS").unwrap_or_default(),
            strategy: env_or("CHAIN_QUERY_STRATEGY", ChainQueryStrategy::Direct)?,
            cache_ttl: chrono::Duration::seconds(env_or("CHAIN_CACHE_TTL_SECS", 120)?),
            request_timeout: Duration::from_secs(env_or("CHAIN_TIMEOUT_SECS", 10)?),
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            lifecycle,
            sweeps,
            paypal,
            chain,
        })
    }
}

/// Read and parse an environment variable, falling back to `default` when unset
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Message(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}
