use std::sync::Arc;
use tracing::warn;

use super::{PriceProvider, PriceProviderFactory};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::market::Market;
use crate::models::{Asset, AssetAmount, Price, CORE_ASSET};

/// Builds providers that read settlement feeds from the ledger
pub struct FeedPriceProviderFactory {
    ledger: Arc<dyn Ledger>,
}

impl FeedPriceProviderFactory {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

#[async_trait::async_trait]
impl PriceProviderFactory for FeedPriceProviderFactory {
    async fn get_provider(&self, market: &Market) -> Result<Box<dyn PriceProvider>> {
        Ok(Box::new(FeedPriceProvider { ledger: self.ledger.clone(), market: market.clone() }))
    }
}

/// Prices a market by crossing each side's price against the core asset
pub struct FeedPriceProvider {
    ledger: Arc<dyn Ledger>,
    market: Market,
}

/// One core unit per core unit; assets without a feed trade at parity
fn core_price() -> Price {
    Price { base: AssetAmount::new(CORE_ASSET, 1), quote: AssetAmount::new(CORE_ASSET, 1) }
}

impl FeedPriceProvider {
    /// Price of `asset` in core units, with the core asset as quote
    async fn asset_price(&self, asset: &Asset) -> Price {
        let price = match asset.bitasset_data_id {
            Some(data_id) => match self.ledger.get_bitasset_data(data_id).await {
                Ok(data) => data.current_feed.settlement_price,
                Err(e) => {
                    warn!("Failed to read settlement feed of {}: {}", asset.symbol, e);
                    return Price::invalid();
                }
            },
            None => core_price(),
        };

        if price.quote.asset != CORE_ASSET {
            return price.invert();
        }
        price
    }
}

#[async_trait::async_trait]
impl PriceProvider for FeedPriceProvider {
    async fn get_price(&self) -> Price {
        let base_price = self.asset_price(&self.market.base).await;
        let quote_price = self.asset_price(&self.market.quote).await;

        if !base_price.valid() || !quote_price.valid() {
            return Price::invalid();
        }

        let (base_amount, quote_amount) = cross(
            base_price.base.amount as u128 * quote_price.quote.amount as u128,
            base_price.quote.amount as u128 * quote_price.base.amount as u128,
        );
        self.market.new_price(base_amount, quote_amount)
    }
}

/// Reduce a ratio so both terms fit the ledger's share type.
///
/// The ratio is first reduced by its gcd; if a term is still too large both
/// terms are shifted right together, trading low-order precision for range.
fn cross(mut base: u128, mut quote: u128) -> (i64, i64) {
    let divisor = gcd(base, quote);
    if divisor > 1 {
        base /= divisor;
        quote /= divisor;
    }
    while base > i64::MAX as u128 || quote > i64::MAX as u128 {
        base >>= 1;
        quote >>= 1;
    }
    (base.max(1) as i64, quote.max(1) as i64)
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, LedgerCall};

    struct Setup {
        ledger: Arc<InMemoryLedger>,
        core: Asset,
        usd: Asset,
        cny: Asset,
    }

    fn setup() -> Setup {
        let ledger = Arc::new(InMemoryLedger::new());
        let core = ledger.add_asset("OTN", 5);
        let usd = ledger.add_asset("USD", 4);
        let cny = ledger.add_asset("CNY", 4);
        Setup { ledger, core, usd, cny }
    }

    async fn price_of(ledger: Arc<InMemoryLedger>, market: &Market) -> Price {
        let factory = FeedPriceProviderFactory::new(ledger);
        factory.get_provider(market).await.unwrap().get_price().await
    }

    #[tokio::test]
    async fn test_core_against_bitasset() {
        let s = setup();
        // 1 USD unit settles at 50 core units
        let usd = s
            .ledger
            .set_settlement_price(
                "USD",
                Price { base: AssetAmount::new(s.usd.id, 100), quote: AssetAmount::new(CORE_ASSET, 5_000) },
            )
            .unwrap();

        let market = Market::new(s.core.clone(), usd);
        let price = price_of(s.ledger.clone(), &market).await;

        assert!(price.valid());
        assert_eq!(price.base.asset, s.core.id);
        assert_eq!(price.quote.asset, s.usd.id);
        assert_eq!((price.base.amount, price.quote.amount), (50, 1));
    }

    #[tokio::test]
    async fn test_feed_quoted_in_bitasset_is_inverted() {
        let s = setup();
        let usd = s
            .ledger
            .set_settlement_price(
                "USD",
                Price { base: AssetAmount::new(CORE_ASSET, 5_000), quote: AssetAmount::new(s.usd.id, 100) },
            )
            .unwrap();

        let market = Market::new(s.core.clone(), usd);
        let price = price_of(s.ledger.clone(), &market).await;
        assert_eq!((price.base.amount, price.quote.amount), (50, 1));
    }

    #[tokio::test]
    async fn test_two_bitassets_cross_through_core() {
        let s = setup();
        let usd = s
            .ledger
            .set_settlement_price(
                "USD",
                Price { base: AssetAmount::new(s.usd.id, 1), quote: AssetAmount::new(CORE_ASSET, 70) },
            )
            .unwrap();
        let cny = s
            .ledger
            .set_settlement_price(
                "CNY",
                Price { base: AssetAmount::new(s.cny.id, 1), quote: AssetAmount::new(CORE_ASSET, 10) },
            )
            .unwrap();

        let market = Market::new(usd, cny);
        let price = price_of(s.ledger.clone(), &market).await;
        // 1 USD = 70 core = 7 CNY
        assert_eq!((price.base.amount, price.quote.amount), (1, 7));
        assert!((market.get_rate(&price).value() - 7.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_unreadable_feed_gives_invalid_price() {
        let s = setup();
        let usd = s
            .ledger
            .set_settlement_price(
                "USD",
                Price { base: AssetAmount::new(s.usd.id, 1), quote: AssetAmount::new(CORE_ASSET, 70) },
            )
            .unwrap();
        s.ledger.fail(LedgerCall::GetBitassetData);

        let market = Market::new(s.core.clone(), usd);
        let price = price_of(s.ledger.clone(), &market).await;
        assert!(!price.valid());
        assert!(market.get_rate(&price).is_zero());
    }

    #[tokio::test]
    async fn test_empty_feed_gives_invalid_price() {
        let s = setup();
        let usd = s
            .ledger
            .set_settlement_price(
                "USD",
                Price { base: AssetAmount::new(s.usd.id, 0), quote: AssetAmount::new(CORE_ASSET, 0) },
            )
            .unwrap();

        let market = Market::new(s.core.clone(), usd);
        assert!(!price_of(s.ledger.clone(), &market).await.valid());
    }

    #[test]
    fn test_cross_keeps_terms_in_range() {
        assert_eq!(cross(100, 250), (2, 5));
        let (base, quote) = cross(u128::from(u64::MAX) * 4, u128::from(u64::MAX) * 2 + 1);
        assert!(base > 0 && quote > 0);
        assert!((base as f64 / quote as f64 - 2.0).abs() < 1e-6);
    }
}
