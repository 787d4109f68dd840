//! External ticker index price provider.
//!
//! All providers created by one factory share a single ticker cache. The
//! cache is refreshed with one bulk request once the refresh interval has
//! elapsed; tracked symbols missing from the bulk response are fetched one by
//! one. Entries are replaced per symbol and never evicted.

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info};
use url::Url;

use super::{PriceProvider, PriceProviderFactory};
use crate::error::{MarketMakerError, Result};
use crate::market::Market;
use crate::models::Price;

/// Tickers are quoted in this currency so any two can be crossed
pub const CONVERT: &str = "BTC";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Known index symbol
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Listing {
    pub id: u64,
    pub name: String,
    pub symbol: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TickerQuote {
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ticker {
    pub id: u64,
    pub symbol: String,
    #[serde(default)]
    pub quotes: HashMap<String, TickerQuote>,
}

impl Ticker {
    /// Positive price in [`CONVERT`] units, if quoted
    pub fn convert_price(&self) -> Option<f64> {
        self.quotes.get(CONVERT).and_then(|q| q.price).filter(|p| *p > 0.0)
    }
}

/// Access to the external ticker index
#[async_trait::async_trait]
pub trait IndexClient: Send + Sync {
    async fn listings(&self) -> Result<Vec<Listing>>;

    /// Top `limit` tickers in one request
    async fn tickers(&self, limit: u32, convert: &str) -> Result<Vec<Ticker>>;

    async fn ticker(&self, id: u64, convert: &str) -> Result<Ticker>;
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

/// HTTP client for a CoinMarketCap v2 compatible index
pub struct HttpIndexClient {
    client: Client,
    base_url: Url,
}

impl HttpIndexClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(path)?;
        debug!("GET {}", url);

        let envelope: Envelope<T> =
            self.client.get(url).query(query).send().await?.error_for_status()?.json().await?;

        if let Some(message) = envelope.metadata.and_then(|m| m.error) {
            return Err(MarketMakerError::IndexApi(message));
        }
        envelope.data.ok_or_else(|| MarketMakerError::IndexApi(format!("empty response for {}", path)))
    }
}

#[async_trait::async_trait]
impl IndexClient for HttpIndexClient {
    async fn listings(&self) -> Result<Vec<Listing>> {
        self.get("v2/listings/", &[]).await
    }

    async fn tickers(&self, limit: u32, convert: &str) -> Result<Vec<Ticker>> {
        let tickers: HashMap<String, Ticker> = self
            .get("v2/ticker/", &[("limit", limit.to_string()), ("convert", convert.to_string())])
            .await?;
        Ok(tickers.into_values().collect())
    }

    async fn ticker(&self, id: u64, convert: &str) -> Result<Ticker> {
        self.get(&format!("v2/ticker/{}/", id), &[("convert", convert.to_string())]).await
    }
}

#[derive(Debug, Default)]
struct TickerCache {
    tracked: BTreeSet<String>,
    tickers: HashMap<String, Ticker>,
    last_updated: Option<Instant>,
}

struct IndexShared {
    client: Arc<dyn IndexClient>,
    bulk_size: u32,
    refresh_interval: Duration,
    listings: HashMap<String, Listing>,
    cache: Mutex<TickerCache>,
}

impl IndexShared {
    /// Cached ticker for `symbol`, refreshing the whole cache first if it is stale
    async fn get_or_refresh(&self, symbol: &str) -> Option<Ticker> {
        let mut cache = self.cache.lock().await;

        let stale = cache.last_updated.map_or(true, |at| at.elapsed() > self.refresh_interval);
        if stale {
            self.refresh(&mut cache).await;
            cache.last_updated = Some(Instant::now());
        }

        cache.tickers.get(symbol).cloned()
    }

    async fn refresh(&self, cache: &mut TickerCache) {
        let bulk = match self.client.tickers(self.bulk_size, CONVERT).await {
            Ok(bulk) => bulk,
            Err(e) => {
                error!(error = %e, "Failed to get tickers");
                return;
            }
        };

        let mut by_symbol: HashMap<String, Ticker> =
            bulk.into_iter().map(|t| (t.symbol.clone(), t)).collect();

        for symbol in &cache.tracked {
            let ticker = match by_symbol.remove(symbol) {
                Some(ticker) => Some(ticker),
                None => self.fetch_single(symbol).await,
            };
            if let Some(ticker) = ticker {
                cache.tickers.insert(symbol.clone(), ticker);
            }
        }
    }

    async fn fetch_single(&self, symbol: &str) -> Option<Ticker> {
        let listing = self.listings.get(symbol)?;
        info!(symbol = %symbol, "Fetching separate info");
        match self.client.ticker(listing.id, CONVERT).await {
            Ok(ticker) => Some(ticker),
            Err(e) => {
                error!(symbol = %symbol, error = %e, "Failed to get ticker");
                None
            }
        }
    }
}

/// Builds providers backed by one shared, interval-refreshed ticker cache
pub struct IndexPriceProviderFactory {
    shared: Arc<IndexShared>,
}

impl IndexPriceProviderFactory {
    /// Fetches the symbol listing once; fails if the index is unreachable
    pub async fn new(
        client: Arc<dyn IndexClient>,
        bulk_size: u32,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let listings: HashMap<String, Listing> =
            client.listings().await?.into_iter().map(|l| (l.symbol.clone(), l)).collect();
        info!("Loaded {} index listings", listings.len());

        Ok(Self {
            shared: Arc::new(IndexShared {
                client,
                bulk_size,
                refresh_interval,
                listings,
                cache: Mutex::new(TickerCache::default()),
            }),
        })
    }

    /// Symbols currently refreshed by the cache
    pub async fn tracked_symbols(&self) -> Vec<String> {
        self.shared.cache.lock().await.tracked.iter().cloned().collect()
    }
}

#[async_trait::async_trait]
impl PriceProviderFactory for IndexPriceProviderFactory {
    async fn get_provider(&self, market: &Market) -> Result<Box<dyn PriceProvider>> {
        for symbol in [&market.base.symbol, &market.quote.symbol] {
            if !self.shared.listings.contains_key(symbol) {
                return Err(MarketMakerError::UnknownIndexSymbol(symbol.clone()));
            }
        }

        {
            let mut cache = self.shared.cache.lock().await;
            // new symbols must not be served from a cache that never fetched them
            cache.last_updated = None;
            cache.tracked.insert(market.base.symbol.clone());
            cache.tracked.insert(market.quote.symbol.clone());
        }

        Ok(Box::new(IndexPriceProvider { shared: self.shared.clone(), market: market.clone() }))
    }
}

pub struct IndexPriceProvider {
    shared: Arc<IndexShared>,
    market: Market,
}

#[async_trait::async_trait]
impl PriceProvider for IndexPriceProvider {
    async fn get_price(&self) -> Price {
        let base = self.shared.get_or_refresh(&self.market.base.symbol).await;
        let quote = self.shared.get_or_refresh(&self.market.quote.symbol).await;

        let (Some(base_btc), Some(quote_btc)) = (
            base.as_ref().and_then(Ticker::convert_price),
            quote.as_ref().and_then(Ticker::convert_price),
        ) else {
            return Price::invalid();
        };

        let base_amount = 10f64.powi(self.market.base.precision as i32);
        let quote_amount =
            10f64.powi(self.market.quote.precision as i32) * base_btc / quote_btc;

        self.market.new_price(base_amount as i64, quote_amount.round() as i64)
    }
}
