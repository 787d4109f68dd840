//! Market maker configuration

use bigdecimal::{BigDecimal, Zero};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{MarketMakerError, Result};

/// Environment variable holding extra comma separated private keys
pub const KEYS_ENV: &str = "MARKET_MAKER_KEYS";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMakerConfig {
    pub node: NodeConfig,

    /// Name of the trading account
    pub account: String,

    /// Core-asset amount held back for transaction fees
    #[serde(default)]
    pub fee_reserve: BigDecimal,

    /// How often every market is reconciled (seconds)
    #[serde(default = "default_update_interval")]
    pub update_interval_seconds: u64,

    /// Private keys (WIF) of the trading account
    #[serde(default)]
    pub keys: Vec<String>,

    #[serde(default)]
    pub markets: Vec<MarketConfig>,

    #[serde(default)]
    pub price_provider: PriceProviderConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node RPC endpoint for ledger reads
    pub url: String,

    /// Wallet RPC endpoint used to sign and broadcast
    pub wallet_url: String,

    /// Per-request timeout (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

/// Parameters of one market
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    pub base: String,
    pub quote: String,

    /// Spread of the innermost order pair (0.02 = 2%)
    pub spread: f64,

    /// Minimum relative price change that triggers an update
    pub threshold: f64,

    /// Order lifetime (seconds)
    pub expiration: u64,

    /// Maximum volume per side in base units
    pub amount: f64,

    /// Orders per side
    #[serde(default = "default_order_count")]
    pub orders: usize,

    /// Spread increment between consecutive order pairs
    #[serde(default)]
    pub spread_step: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceProviderConfig {
    /// External index; on-chain settlement feeds are used when absent
    #[serde(default)]
    pub index: Option<IndexConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub url: String,

    /// Tickers requested per bulk fetch
    #[serde(default = "default_bulk_size")]
    pub bulk_size: u32,

    /// Cache refresh interval (seconds)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_update_interval() -> u64 {
    3
}

fn default_timeout() -> u64 {
    30
}

fn default_order_count() -> usize {
    1
}

fn default_bulk_size() -> u32 {
    100
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

impl MarketConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_secs(self.expiration)
    }
}

impl IndexConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

impl MarketMakerConfig {
    /// Load from a TOML/JSON file with `MARKET_MAKER__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix("MARKET_MAKER").separator("__"))
            .build()?;

        let mut config: Self = settings.try_deserialize()?;

        if let Ok(keys) = std::env::var(KEYS_ENV) {
            config.keys.extend(
                keys.split(',').map(str::trim).filter(|k| !k.is_empty()).map(str::to_string),
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.node.timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            return Err(MarketMakerError::NoMarkets);
        }

        if self.account.trim().is_empty() {
            return Err(invalid("account must not be empty"));
        }

        if self.update_interval_seconds == 0 {
            return Err(invalid("update_interval_seconds must be positive"));
        }

        if self.fee_reserve < BigDecimal::zero() {
            return Err(invalid("fee_reserve must not be negative"));
        }

        for market in &self.markets {
            let name = format!("{}/{}", market.base, market.quote);
            if market.base == market.quote {
                return Err(invalid(format!("market {}: base and quote must differ", name)));
            }
            if market.orders == 0 {
                return Err(invalid(format!("market {}: orders must be at least 1", name)));
            }
            let non_negative = [
                ("spread", market.spread),
                ("threshold", market.threshold),
                ("amount", market.amount),
                ("spread_step", market.spread_step),
            ];
            for (field, value) in non_negative {
                if !value.is_finite() || value < 0.0 {
                    return Err(invalid(format!("market {}: {} must be non-negative", name, field)));
                }
            }
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            level => return Err(invalid(format!("invalid log level: {}", level))),
        }

        match self.logging.format.as_str() {
            "json" | "pretty" | "compact" => {}
            format => return Err(invalid(format!("invalid log format: {}", format))),
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> MarketMakerError {
    MarketMakerError::InvalidConfig(message.into())
}
