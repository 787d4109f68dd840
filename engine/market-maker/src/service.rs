use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::MarketMakerConfig;
use crate::error::{MarketMakerError, Result};
use crate::ledger::{AssetCache, Ledger, Wallet};
use crate::maker::{MakerContext, MarketMaker, MarketMakerHandle};
use crate::price::{
    FeedPriceProviderFactory, HttpIndexClient, IndexPriceProviderFactory, PriceProviderFactory,
};

/// Runs one market maker per configured market
pub struct MarketMakerService {
    config: MarketMakerConfig,
    ledger: Arc<dyn Ledger>,
    handles: Vec<MarketMakerHandle>,
}

impl MarketMakerService {
    pub fn new(config: MarketMakerConfig, ledger: Arc<dyn Ledger>) -> Result<Self> {
        if config.markets.is_empty() {
            return Err(MarketMakerError::NoMarkets);
        }

        Ok(Self { config, ledger, handles: Vec::new() })
    }

    /// Start every market; returns how many are running.
    ///
    /// A market that fails to start is logged and skipped. Missing keys or
    /// an unreachable price index stop the whole service.
    pub async fn start(&mut self) -> Result<usize> {
        info!("Starting market maker service for account {}", self.config.account);

        let wallet = Wallet::new(self.config.account.clone(), self.config.keys.clone())?;
        let factory = self.price_provider_factory().await?;

        let context = MakerContext {
            ledger: self.ledger.clone(),
            assets: Arc::new(AssetCache::new(self.ledger.clone())),
            factory,
            wallet,
            balance_lock: Arc::new(Mutex::new(())),
            fee_reserve: self.config.fee_reserve.clone(),
            update_interval: self.config.update_interval(),
        };

        for market in &self.config.markets {
            let maker = MarketMaker::new(context.clone(), market.clone());
            let name = maker.name();

            match maker.start().await {
                Ok(handle) => {
                    info!(market = %name, "Market maker running");
                    self.handles.push(handle);
                }
                Err(e) => error!(market = %name, "Failed to start market maker: {}", e),
            }
        }

        info!("Started {} of {} markets", self.handles.len(), self.config.markets.len());
        Ok(self.handles.len())
    }

    /// Stop all makers and wait for their loops to finish
    pub async fn stop(&mut self) {
        info!("Stopping {} market makers", self.handles.len());

        for handle in &self.handles {
            handle.stop();
        }
        for handle in self.handles.drain(..) {
            handle.join().await;
        }

        info!("Market maker service stopped");
    }

    pub fn running(&self) -> usize {
        self.handles.len()
    }

    /// Display names of the running markets
    pub fn markets(&self) -> Vec<String> {
        self.handles.iter().map(|h| h.market().display_name()).collect()
    }

    async fn price_provider_factory(&self) -> Result<Arc<dyn PriceProviderFactory>> {
        match &self.config.price_provider.index {
            Some(index) => {
                info!("Using price index at {}", index.url);
                let client = HttpIndexClient::new(&index.url, self.config.request_timeout())?;
                let factory = IndexPriceProviderFactory::new(
                    Arc::new(client),
                    index.bulk_size,
                    index.refresh_interval(),
                )
                .await?;
                Ok(Arc::new(factory))
            }
            None => {
                info!("Using on-chain settlement feeds");
                Ok(Arc::new(FeedPriceProviderFactory::new(self.ledger.clone())))
            }
        }
    }
}
