//! In-process ledger used by tests

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use super::{Ledger, Wallet};
use crate::error::{MarketMakerError, Result};
use crate::models::{
    Account, Asset, AssetAmount, BitAssetData, LimitOrder, ObjectId, Operation, Price, PriceFeed,
};

/// Ledger calls that can be counted or made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerCall {
    GetAccount,
    LookupAssets,
    GetBalances,
    GetLimitOrders,
    GetBitassetData,
    Broadcast,
}

#[derive(Debug, Clone, Default)]
struct State {
    accounts: HashMap<String, Account>,
    assets: HashMap<String, Asset>,
    balances: HashMap<(ObjectId, ObjectId), i64>,
    orders: Vec<LimitOrder>,
    bitassets: HashMap<ObjectId, BitAssetData>,
    next_order: u64,
}

/// Ledger kept entirely in memory.
///
/// Broadcast batches are applied atomically: either every operation in the
/// batch takes effect or none does.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
    broadcasts: Mutex<Vec<Vec<Operation>>>,
    failing: Mutex<HashSet<LedgerCall>>,
    calls: Mutex<HashMap<LedgerCall, usize>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, name: &str) -> Account {
        let mut state = self.state.lock();
        let account = Account {
            id: ObjectId::new(1, 2, 100 + state.accounts.len() as u64),
            name: name.to_string(),
        };
        state.accounts.insert(name.to_string(), account.clone());
        account
    }

    /// Register an asset; the first one registered becomes the core asset `1.3.0`
    pub fn add_asset(&self, symbol: &str, precision: u8) -> Asset {
        let mut state = self.state.lock();
        let asset = Asset {
            id: ObjectId::new(1, 3, state.assets.len() as u64),
            symbol: symbol.to_string(),
            precision,
            bitasset_data_id: None,
        };
        state.assets.insert(symbol.to_string(), asset.clone());
        asset
    }

    /// Attach a settlement feed to `symbol`, turning it into a market-pegged asset
    pub fn set_settlement_price(&self, symbol: &str, settlement_price: Price) -> Result<Asset> {
        let mut state = self.state.lock();
        let data_id = ObjectId::new(2, 4, state.bitassets.len() as u64);
        let asset = state
            .assets
            .get_mut(symbol)
            .ok_or_else(|| MarketMakerError::AssetNotFound(symbol.to_string()))?;
        let data_id = *asset.bitasset_data_id.get_or_insert(data_id);
        let asset = asset.clone();
        state.bitassets.insert(
            data_id,
            BitAssetData { id: data_id, current_feed: PriceFeed { settlement_price } },
        );
        Ok(asset)
    }

    pub fn set_balance(&self, account: ObjectId, asset: ObjectId, amount: i64) {
        self.state.lock().balances.insert((account, asset), amount);
    }

    pub fn balance(&self, account: ObjectId, asset: ObjectId) -> i64 {
        self.state.lock().balances.get(&(account, asset)).copied().unwrap_or(0)
    }

    /// Put a resting order on the book without touching balances
    pub fn place_order(&self, seller: ObjectId, sell: AssetAmount, receive: AssetAmount) -> LimitOrder {
        let mut state = self.state.lock();
        let order = new_order(&mut state, seller, sell, receive, chrono::Utc::now());
        state.orders.push(order.clone());
        order
    }

    pub fn orders(&self) -> Vec<LimitOrder> {
        self.state.lock().orders.clone()
    }

    /// Every batch applied so far, oldest first
    pub fn broadcasts(&self) -> Vec<Vec<Operation>> {
        self.broadcasts.lock().clone()
    }

    pub fn fail(&self, call: LedgerCall) {
        self.failing.lock().insert(call);
    }

    pub fn recover(&self, call: LedgerCall) {
        self.failing.lock().remove(&call);
    }

    pub fn call_count(&self, call: LedgerCall) -> usize {
        self.calls.lock().get(&call).copied().unwrap_or(0)
    }

    fn enter(&self, call: LedgerCall) -> Result<()> {
        *self.calls.lock().entry(call).or_default() += 1;
        if self.failing.lock().contains(&call) {
            return Err(MarketMakerError::Ledger(format!("{:?} unavailable", call)));
        }
        Ok(())
    }
}

fn new_order(
    state: &mut State,
    seller: ObjectId,
    sell: AssetAmount,
    receive: AssetAmount,
    expiration: chrono::DateTime<chrono::Utc>,
) -> LimitOrder {
    state.next_order += 1;
    LimitOrder {
        id: ObjectId::new(1, 7, state.next_order),
        expiration,
        seller,
        for_sale: sell.amount,
        sell_price: Price { base: sell, quote: receive },
        deferred_fee: 0,
    }
}

fn apply(state: &mut State, operation: &Operation) -> Result<()> {
    match operation {
        Operation::LimitOrderCancel(op) => {
            let index = state
                .orders
                .iter()
                .position(|o| o.id == op.order && o.seller == op.fee_paying_account)
                .ok_or_else(|| MarketMakerError::Ledger(format!("order {} not found", op.order)))?;
            let order = state.orders.remove(index);
            *state.balances.entry((order.seller, order.sell_price.base.asset)).or_default() +=
                order.for_sale;
        }
        Operation::LimitOrderCreate(op) => {
            if op.amount_to_sell.amount <= 0 || op.min_to_receive.amount <= 0 {
                return Err(MarketMakerError::Ledger("order amounts must be positive".to_string()));
            }
            let balance = state.balances.entry((op.seller, op.amount_to_sell.asset)).or_default();
            if *balance < op.amount_to_sell.amount {
                return Err(MarketMakerError::Ledger(format!(
                    "insufficient balance: required {}, available {}",
                    op.amount_to_sell.amount, balance
                )));
            }
            *balance -= op.amount_to_sell.amount;
            let order =
                new_order(state, op.seller, op.amount_to_sell, op.min_to_receive, op.expiration);
            state.orders.push(order);
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl Ledger for InMemoryLedger {
    async fn get_account_by_name(&self, name: &str) -> Result<Option<Account>> {
        self.enter(LedgerCall::GetAccount)?;
        Ok(self.state.lock().accounts.get(name).cloned())
    }

    async fn lookup_asset_symbols(&self, symbols: &[String]) -> Result<Vec<Option<Asset>>> {
        self.enter(LedgerCall::LookupAssets)?;
        let state = self.state.lock();
        Ok(symbols.iter().map(|s| state.assets.get(s).cloned()).collect())
    }

    async fn get_account_balances(
        &self,
        account: ObjectId,
        assets: &[ObjectId],
    ) -> Result<Vec<AssetAmount>> {
        self.enter(LedgerCall::GetBalances)?;
        let state = self.state.lock();
        Ok(assets
            .iter()
            .map(|asset| {
                AssetAmount::new(*asset, state.balances.get(&(account, *asset)).copied().unwrap_or(0))
            })
            .collect())
    }

    async fn get_limit_orders(
        &self,
        base: ObjectId,
        quote: ObjectId,
        limit: u32,
    ) -> Result<Vec<LimitOrder>> {
        self.enter(LedgerCall::GetLimitOrders)?;
        let state = self.state.lock();
        Ok(state
            .orders
            .iter()
            .filter(|o| {
                let pair = (o.sell_price.base.asset, o.sell_price.quote.asset);
                pair == (base, quote) || pair == (quote, base)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_bitasset_data(&self, id: ObjectId) -> Result<BitAssetData> {
        self.enter(LedgerCall::GetBitassetData)?;
        self.state
            .lock()
            .bitassets
            .get(&id)
            .cloned()
            .ok_or_else(|| MarketMakerError::Ledger(format!("object {} not found", id)))
    }

    async fn sign_and_broadcast(
        &self,
        wallet: &Wallet,
        _fee_asset: ObjectId,
        operations: &[Operation],
    ) -> Result<()> {
        self.enter(LedgerCall::Broadcast)?;
        let mut state = self.state.lock();
        if !state.accounts.contains_key(wallet.account()) {
            return Err(MarketMakerError::AccountNotFound(wallet.account().to_string()));
        }

        let mut next = state.clone();
        for operation in operations {
            apply(&mut next, operation)?;
        }
        *state = next;
        self.broadcasts.lock().push(operations.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LimitOrderCreateOperation, CORE_ASSET};

    fn wallet() -> Wallet {
        Wallet::new("maker", vec!["key".to_string()]).unwrap()
    }

    fn create(seller: ObjectId, sell: AssetAmount, receive: AssetAmount) -> Operation {
        Operation::LimitOrderCreate(LimitOrderCreateOperation {
            seller,
            amount_to_sell: sell,
            min_to_receive: receive,
            expiration: chrono::Utc::now(),
            fill_or_kill: false,
        })
    }

    #[tokio::test]
    async fn test_batch_applies_cancel_then_create() {
        let ledger = InMemoryLedger::new();
        let account = ledger.add_account("maker");
        let core = ledger.add_asset("OTN", 8);
        let btc = ledger.add_asset("BTC", 8);
        assert_eq!(core.id, CORE_ASSET);

        ledger.set_balance(account.id, core.id, 100);
        let resting = ledger.place_order(
            account.id,
            AssetAmount::new(core.id, 400),
            AssetAmount::new(btc.id, 4),
        );

        // needs the refund from the cancel to be affordable
        let ops = vec![
            Operation::cancel(&resting),
            create(account.id, AssetAmount::new(core.id, 450), AssetAmount::new(btc.id, 5)),
        ];
        ledger.sign_and_broadcast(&wallet(), CORE_ASSET, &ops).await.unwrap();

        assert_eq!(ledger.balance(account.id, core.id), 50);
        let orders = ledger.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].for_sale, 450);
        assert_eq!(ledger.broadcasts().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_state_untouched() {
        let ledger = InMemoryLedger::new();
        let account = ledger.add_account("maker");
        let core = ledger.add_asset("OTN", 8);
        let btc = ledger.add_asset("BTC", 8);
        ledger.set_balance(account.id, core.id, 100);
        let resting = ledger.place_order(
            account.id,
            AssetAmount::new(core.id, 10),
            AssetAmount::new(btc.id, 1),
        );

        let ops = vec![
            Operation::cancel(&resting),
            create(account.id, AssetAmount::new(core.id, 1_000), AssetAmount::new(btc.id, 5)),
        ];
        assert!(ledger.sign_and_broadcast(&wallet(), CORE_ASSET, &ops).await.is_err());

        assert_eq!(ledger.balance(account.id, core.id), 100);
        assert_eq!(ledger.orders(), vec![resting]);
        assert!(ledger.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = InMemoryLedger::new();
        ledger.add_account("maker");
        ledger.fail(LedgerCall::GetAccount);
        assert!(ledger.get_account_by_name("maker").await.is_err());

        ledger.recover(LedgerCall::GetAccount);
        assert!(ledger.get_account_by_name("maker").await.unwrap().is_some());
        assert_eq!(ledger.call_count(LedgerCall::GetAccount), 2);
    }

    #[tokio::test]
    async fn test_limit_orders_cover_both_sides() {
        let ledger = InMemoryLedger::new();
        let account = ledger.add_account("maker");
        let core = ledger.add_asset("OTN", 8);
        let btc = ledger.add_asset("BTC", 8);
        let eth = ledger.add_asset("ETH", 8);
        ledger.place_order(account.id, AssetAmount::new(core.id, 10), AssetAmount::new(btc.id, 1));
        ledger.place_order(account.id, AssetAmount::new(btc.id, 1), AssetAmount::new(core.id, 10));
        ledger.place_order(account.id, AssetAmount::new(eth.id, 1), AssetAmount::new(core.id, 10));

        let orders = ledger.get_limit_orders(core.id, btc.id, 50).await.unwrap();
        assert_eq!(orders.len(), 2);
        let limited = ledger.get_limit_orders(core.id, btc.id, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
