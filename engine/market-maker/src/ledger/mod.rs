//! Ledger collaborator: account, balance and order-book reads plus
//! transaction broadcast.

pub mod memory;
pub mod rpc;

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MarketMakerError, Result};
use crate::models::{Account, Asset, AssetAmount, BitAssetData, LimitOrder, ObjectId, Operation};

pub use memory::{InMemoryLedger, LedgerCall};
pub use rpc::RpcLedger;

/// Read and broadcast access to the exchange ledger
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn get_account_by_name(&self, name: &str) -> Result<Option<Account>>;

    /// One entry per requested symbol, `None` for unknown symbols
    async fn lookup_asset_symbols(&self, symbols: &[String]) -> Result<Vec<Option<Asset>>>;

    async fn get_account_balances(
        &self,
        account: ObjectId,
        assets: &[ObjectId],
    ) -> Result<Vec<AssetAmount>>;

    /// Up to `limit` resting orders on the `base`/`quote` market, both sides
    async fn get_limit_orders(
        &self,
        base: ObjectId,
        quote: ObjectId,
        limit: u32,
    ) -> Result<Vec<LimitOrder>>;

    async fn get_bitasset_data(&self, id: ObjectId) -> Result<BitAssetData>;

    /// Sign `operations` with the wallet keys and broadcast them as one transaction
    async fn sign_and_broadcast(
        &self,
        wallet: &Wallet,
        fee_asset: ObjectId,
        operations: &[Operation],
    ) -> Result<()>;
}

/// Signing keys of the trading account
#[derive(Clone)]
pub struct Wallet {
    account: String,
    keys: Vec<String>,
}

impl Wallet {
    pub fn new(account: impl Into<String>, keys: Vec<String>) -> Result<Self> {
        let keys: Vec<String> =
            keys.into_iter().map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect();
        if keys.is_empty() {
            return Err(MarketMakerError::InvalidConfig("no private keys configured".to_string()));
        }
        Ok(Self { account: account.into(), keys })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("account", &self.account)
            .field("keys", &format_args!("<{} redacted>", self.keys.len()))
            .finish()
    }
}

/// Memoised symbol → asset lookups
pub struct AssetCache {
    ledger: Arc<dyn Ledger>,
    assets: DashMap<String, Asset>,
}

impl AssetCache {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger, assets: DashMap::new() }
    }

    pub async fn get_by_symbol(&self, symbol: &str) -> Result<Asset> {
        if let Some(asset) = self.assets.get(symbol) {
            return Ok(asset.clone());
        }

        let found = self
            .ledger
            .lookup_asset_symbols(&[symbol.to_string()])
            .await?
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| MarketMakerError::AssetNotFound(symbol.to_string()))?;

        debug!("Resolved asset {} as {}", symbol, found.id);
        self.assets.insert(symbol.to_string(), found.clone());
        Ok(found)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_requires_keys() {
        assert!(Wallet::new("maker", vec![]).is_err());
        assert!(Wallet::new("maker", vec!["  ".to_string()]).is_err());

        let wallet = Wallet::new("maker", vec!["5Kb8kLf9zgWQnogidDA76MzPL6TsZZY36hWXMssSzNydYXYB9KF".to_string()])
            .unwrap();
        assert_eq!(wallet.keys().len(), 1);
        assert_eq!(wallet.account(), "maker");
    }

    #[test]
    fn test_wallet_debug_redacts_keys() {
        let wallet = Wallet::new("maker", vec!["secret-key".to_string()]).unwrap();
        let printed = format!("{:?}", wallet);
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("redacted"));
    }

    #[tokio::test]
    async fn test_asset_cache_memoises_lookups() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.add_asset("BTC", 8);

        let cache = AssetCache::new(ledger.clone());
        let first = cache.get_by_symbol("BTC").await.unwrap();
        assert_eq!(ledger.call_count(LedgerCall::LookupAssets), 1);

        let second = cache.get_by_symbol("BTC").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.call_count(LedgerCall::LookupAssets), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_asset_cache_unknown_symbol() {
        let cache = AssetCache::new(Arc::new(InMemoryLedger::new()));
        let err = cache.get_by_symbol("NOPE").await.unwrap_err();
        assert!(matches!(err, MarketMakerError::AssetNotFound(symbol) if symbol == "NOPE"));
        assert!(cache.is_empty());
    }
}
