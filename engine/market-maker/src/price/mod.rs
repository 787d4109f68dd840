//! Reference price acquisition.
//!
//! - **feed**: derives prices from on-chain settlement feeds
//! - **index**: derives prices from an external ticker index, cached and
//!   refreshed on an interval

pub mod feed;
pub mod index;

use crate::error::Result;
use crate::market::Market;
use crate::models::Price;

pub use feed::FeedPriceProviderFactory;
pub use index::{HttpIndexClient, IndexClient, IndexPriceProviderFactory};

/// Reports the current reference price of one market.
///
/// An invalid price (see [`Price::valid`]) means no actionable price is known.
#[async_trait::async_trait]
pub trait PriceProvider: Send + Sync {
    async fn get_price(&self) -> Price;
}

/// Creates a [`PriceProvider`] bound to a market
#[async_trait::async_trait]
pub trait PriceProviderFactory: Send + Sync {
    async fn get_provider(&self, market: &Market) -> Result<Box<dyn PriceProvider>>;
}
