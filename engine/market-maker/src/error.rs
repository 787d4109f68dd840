//! Error types for the market maker

use thiserror::Error;

/// Result type for market maker operations
pub type Result<T> = std::result::Result<T, MarketMakerError>;

/// Errors that can occur while making a market
#[derive(Error, Debug)]
pub enum MarketMakerError {
    #[error("Asset {0} not found")]
    AssetNotFound(String),

    #[error("Unknown asset '{0}' in price index")]
    UnknownIndexSymbol(String),

    #[error("Account {0} not found")]
    AccountNotFound(String),

    #[error("No markets configured")]
    NoMarkets,

    #[error("Market maker for {0} is not initialized")]
    NotInitialized(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Price index error: {0}")]
    IndexApi(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}
