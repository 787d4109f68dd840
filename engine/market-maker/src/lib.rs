//! Market Maker
//!
//! Provides liquidity on a Graphene-style decentralized exchange by keeping a
//! ladder of limit orders on both sides of a reference price. Each configured
//! market is reconciled on its own timer: when the price moves past a
//! threshold, or the resting orders near expiry, the account's orders are
//! cancelled and replaced in one transaction.

pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod maker;
pub mod market;
pub mod models;
pub mod order_book;
pub mod price;
pub mod service;
pub mod signals;

pub use config::MarketMakerConfig;
pub use error::{MarketMakerError, Result};
pub use ledger::{InMemoryLedger, Ledger, RpcLedger, Wallet};
pub use logging::initialize_logging;
pub use maker::{reserve_fee, MarketMaker, MarketMakerHandle};
pub use market::Market;
pub use order_book::OrderBook;
pub use service::MarketMakerService;
pub use signals::shutdown_signal;
