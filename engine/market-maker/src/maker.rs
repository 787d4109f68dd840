//! Per-market reconciliation loop.
//!
//! Each tick compares the reference price with the last one acted upon and,
//! when it moved past the threshold or the resting orders are about to
//! expire, replaces the account's orders on the market with a fresh ladder.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::MarketConfig;
use crate::error::{MarketMakerError, Result};
use crate::ledger::{AssetCache, Ledger, Wallet};
use crate::market::Market;
use crate::models::{
    pow10, Account, AssetAmount, LimitOrderCreateOperation, ObjectId, Operation, Price, Rate,
    CORE_ASSET,
};
use crate::order_book::{filter_by_seller, OrderBook};
use crate::price::{PriceProvider, PriceProviderFactory};

/// Resting orders read per order-book query
pub const ORDER_BOOK_DEPTH: u32 = 50;

/// Orders whose sell or receive amount does not exceed this are not placed
pub const ORDER_AMOUNT_THRESHOLD: i64 = 10;

/// Collaborators shared by every maker of a service
#[derive(Clone)]
pub struct MakerContext {
    pub ledger: Arc<dyn Ledger>,
    pub assets: Arc<AssetCache>,
    pub factory: Arc<dyn PriceProviderFactory>,
    pub wallet: Wallet,
    /// Held while balances are read and the replacement batch is broadcast
    pub balance_lock: Arc<Mutex<()>>,
    pub fee_reserve: BigDecimal,
    pub update_interval: Duration,
}

/// Subtract a fee given in real units from a balance in smallest units.
///
/// The fee is truncated to whole smallest units. The result is never
/// negative: a fee at or above the balance leaves nothing.
pub fn reserve_fee(balance: &BigDecimal, fee: &BigDecimal, precision: u8) -> BigDecimal {
    let fee = (fee * pow10(precision)).with_scale(0);
    if *balance > fee {
        balance - fee
    } else {
        BigDecimal::zero()
    }
}

/// Everything a tick needs once the maker is initialized
struct Session {
    account: ObjectId,
    market: Market,
    provider: Arc<dyn PriceProvider>,
}

pub struct MarketMaker {
    context: MakerContext,
    config: MarketConfig,
    account: Option<Account>,
    market: Option<Market>,
    provider: Option<Arc<dyn PriceProvider>>,
    base_balance: i64,
    quote_balance: i64,
    last_rate: Rate,
    last_update: Option<DateTime<Utc>>,
}

impl MarketMaker {
    pub fn new(context: MakerContext, config: MarketConfig) -> Self {
        Self {
            context,
            config,
            account: None,
            market: None,
            provider: None,
            base_balance: 0,
            quote_balance: 0,
            last_rate: Rate::zero(),
            last_update: None,
        }
    }

    /// Configured `BASE/QUOTE` symbols, available before initialization
    pub fn name(&self) -> String {
        format!("{}/{}", self.config.base, self.config.quote)
    }

    pub fn market(&self) -> Option<&Market> {
        self.market.as_ref()
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    /// Rate acted upon by the last completed update
    pub fn last_rate(&self) -> &Rate {
        &self.last_rate
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Resolve the account and both assets, read balances and bind a price provider
    pub async fn initialize(&mut self) -> Result<()> {
        let account_name = self.context.wallet.account().to_string();
        let account = self
            .context
            .ledger
            .get_account_by_name(&account_name)
            .await?
            .ok_or(MarketMakerError::AccountNotFound(account_name))?;

        let base = self.context.assets.get_by_symbol(&self.config.base).await?;
        let quote = self.context.assets.get_by_symbol(&self.config.quote).await?;
        let market = Market::new(base, quote);

        self.account = Some(account);
        self.market = Some(market.clone());
        self.update_balances().await?;

        let provider = self.context.factory.get_provider(&market).await?;
        self.provider = Some(Arc::from(provider));

        info!(market = %market.display_name(), "Market maker initialized");
        Ok(())
    }

    /// Initialize and spawn the tick loop
    pub async fn start(mut self) -> Result<MarketMakerHandle> {
        self.initialize().await?;
        let market = self.session()?.market;

        let (stop, mut stopped) = watch::channel(false);
        let period = self.context.update_interval;
        let span = info_span!("market_maker", base = %self.config.base, quote = %self.config.quote);

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!("Market maker started");

                loop {
                    tokio::select! {
                        _ = ticker.tick() => self.make_market(Utc::now()).await,
                        changed = stopped.changed() => {
                            if changed.is_err() || *stopped.borrow() {
                                break;
                            }
                        }
                    }
                }

                info!("Market maker stopped");
            }
            .instrument(span),
        );

        Ok(MarketMakerHandle { market, stop, task })
    }

    /// One reconciliation pass
    pub async fn make_market(&mut self, now: DateTime<Utc>) {
        let session = match self.session() {
            Ok(session) => session,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };
        let name = session.market.display_name();

        let price = session.provider.get_price().await;
        let rate = session.market.get_rate(&price);

        if rate.is_zero() {
            error!(market = %name, "Failed to get price, cancelling orders");
            if let Err(e) = self.cancel_orders().await {
                error!(market = %name, "Failed to cancel orders: {}", e);
            }
            return;
        }

        let value = rate.value();
        info!(market = %name, "Price: {:.8}, inverse: {:.8}", value, 1.0 / value);

        if !self.update_due(&rate, now) {
            debug!(market = %name, "Price change is within threshold, skipping update");
            return;
        }

        let own_orders = match self.load_order_book(&session).await {
            Ok(book) => book,
            Err(e) => {
                error!(market = %name, "Failed to load order book: {}", e);
                return;
            }
        };

        let balance_lock = Arc::clone(&self.context.balance_lock);
        let _guard = balance_lock.lock().await;

        if let Err(e) = self.update_balances().await {
            warn!(market = %name, "Failed to update balances, using last known: {}", e);
        }

        let mut operations: Vec<Operation> = own_orders.orders().map(Operation::cancel).collect();
        let cancels = operations.len();
        operations.extend(self.create_orders(&session, &price, &own_orders, now));

        if !operations.is_empty() {
            match self
                .context
                .ledger
                .sign_and_broadcast(&self.context.wallet, CORE_ASSET, &operations)
                .await
            {
                Ok(()) => info!(
                    market = %name,
                    cancelled = cancels,
                    created = operations.len() - cancels,
                    "Orders replaced"
                ),
                Err(e) => error!(
                    market = %name,
                    cancelled = cancels,
                    created = operations.len() - cancels,
                    "Failed to update market: {}",
                    e
                ),
            }
        }

        self.last_rate = rate;
        self.last_update = Some(now);
    }

    /// Cancel every resting order the account has on this market
    pub async fn cancel_orders(&self) -> Result<()> {
        let session = self.session()?;
        let own_orders = self.load_order_book(&session).await?;
        own_orders.log(&session.market);

        let operations: Vec<Operation> = own_orders.orders().map(Operation::cancel).collect();
        if operations.is_empty() {
            return Ok(());
        }

        self.context
            .ledger
            .sign_and_broadcast(&self.context.wallet, CORE_ASSET, &operations)
            .await?;
        info!(market = %session.market.display_name(), "Cancelled {} orders", operations.len());
        Ok(())
    }

    fn session(&self) -> Result<Session> {
        match (&self.account, &self.market, &self.provider) {
            (Some(account), Some(market), Some(provider)) => Ok(Session {
                account: account.id,
                market: market.clone(),
                provider: Arc::clone(provider),
            }),
            _ => Err(MarketMakerError::NotInitialized(self.name())),
        }
    }

    /// Skip unless the price moved past the threshold or half the order
    /// lifetime has passed since the last update
    fn update_due(&self, rate: &Rate, now: DateTime<Utc>) -> bool {
        let change = (&self.last_rate.0 - &rate.0).abs() / &rate.0;
        let threshold = to_decimal(self.config.threshold).unwrap_or_else(BigDecimal::zero);
        if change >= threshold {
            return true;
        }

        match self.last_update {
            Some(last) => expires_at(last, self.config.expiration() / 2) <= now,
            None => true,
        }
    }

    /// The account's own resting orders on this market
    async fn load_order_book(&self, session: &Session) -> Result<OrderBook> {
        let orders = self
            .context
            .ledger
            .get_limit_orders(session.market.base.id, session.market.quote.id, ORDER_BOOK_DEPTH)
            .await?;
        Ok(OrderBook::new(filter_by_seller(&orders, session.account), &session.market))
    }

    async fn update_balances(&mut self) -> Result<()> {
        let (account, market) = match (&self.account, &self.market) {
            (Some(account), Some(market)) => (account.id, market.clone()),
            _ => return Err(MarketMakerError::NotInitialized(self.name())),
        };

        let balances = self
            .context
            .ledger
            .get_account_balances(account, &[market.base.id, market.quote.id])
            .await?;

        for balance in balances {
            if balance.asset == market.base.id {
                self.base_balance = balance.amount;
            } else if balance.asset == market.quote.id {
                self.quote_balance = balance.amount;
            }
        }

        info!(
            market = %market.display_name(),
            "Balance base={} quote={}",
            market.base.real_amount(&AssetAmount::new(market.base.id, self.base_balance)),
            market.quote.real_amount(&AssetAmount::new(market.quote.id, self.quote_balance)),
        );
        Ok(())
    }

    /// Size the replacement ladder.
    ///
    /// Volumes are tracked in base units on both sides: the quote side is
    /// converted through the price before the per-side cap is applied.
    fn create_orders(
        &self,
        session: &Session,
        price: &Price,
        own_orders: &OrderBook,
        now: DateTime<Utc>,
    ) -> Vec<Operation> {
        let market = &session.market;
        let price = match market.normalize(price) {
            Some(price) if price.valid() => price,
            _ => return Vec::new(),
        };

        // base units per quote unit
        let units_rate = BigDecimal::from(price.base.amount) / BigDecimal::from(price.quote.amount);

        let mut base_available =
            BigDecimal::from(self.base_balance) + BigDecimal::from(own_orders.sell_amount());
        let mut quote_available =
            BigDecimal::from(self.quote_balance) + BigDecimal::from(own_orders.buy_amount());

        let fee = &self.context.fee_reserve;
        if !fee.is_zero() {
            if market.base.id == CORE_ASSET {
                base_available = reserve_fee(&base_available, fee, market.base.precision);
            }
            if market.quote.id == CORE_ASSET {
                quote_available = reserve_fee(&quote_available, fee, market.quote.precision);
            }
        }

        let quote_available = quote_available * &units_rate;
        let target = BigDecimal::from(market.base.amount(self.config.amount).amount);
        let base_limit = target.clone().min(base_available);
        let quote_limit = target.min(quote_available);

        let order_count = self.config.orders.max(1);
        let count = BigDecimal::from(order_count as u64);
        let sell_volume = base_limit / &count;
        let buy_volume = quote_limit / &count;

        info!(
            market = %market.display_name(),
            "Order volume: sell={} buy={}",
            units(&sell_volume),
            units(&buy_volume)
        );

        let expiration = expires_at(now, self.config.expiration());
        let mut spread = self.config.spread;
        let mut operations = Vec::with_capacity(order_count * 2);

        for _ in 0..order_count {
            let spread_value = to_decimal(1.0 + spread / 2.0).unwrap_or_else(|| BigDecimal::from(1));

            let sell_amount = units(&sell_volume);
            let receive_amount = units(&(&sell_volume / &units_rate * &spread_value));
            if sell_amount > ORDER_AMOUNT_THRESHOLD && receive_amount > ORDER_AMOUNT_THRESHOLD {
                debug!("Sell order: sell={} recv={}", sell_amount, receive_amount);
                operations.push(Operation::LimitOrderCreate(LimitOrderCreateOperation {
                    seller: session.account,
                    amount_to_sell: AssetAmount::new(market.base.id, sell_amount),
                    min_to_receive: AssetAmount::new(market.quote.id, receive_amount),
                    expiration,
                    fill_or_kill: false,
                }));
            }

            let sell_amount = units(&(&buy_volume / &units_rate / &spread_value));
            let receive_amount = units(&buy_volume);
            if sell_amount > ORDER_AMOUNT_THRESHOLD && receive_amount > ORDER_AMOUNT_THRESHOLD {
                debug!("Buy order: sell={} recv={}", sell_amount, receive_amount);
                operations.push(Operation::LimitOrderCreate(LimitOrderCreateOperation {
                    seller: session.account,
                    amount_to_sell: AssetAmount::new(market.quote.id, sell_amount),
                    min_to_receive: AssetAmount::new(market.base.id, receive_amount),
                    expiration,
                    fill_or_kill: false,
                }));
            }

            spread += self.config.spread_step;
        }

        operations
    }
}

/// Running maker; dropping it also stops the loop
pub struct MarketMakerHandle {
    market: Market,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MarketMakerHandle {
    pub fn market(&self) -> &Market {
        &self.market
    }

    /// Stop ticking; a tick already in progress runs to completion
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(market = %self.market.display_name(), "Market maker task failed: {}", e);
        }
    }
}

/// Decimal with the digits `value` prints as, so `0.02` stays exactly `0.02`
fn to_decimal(value: f64) -> Option<BigDecimal> {
    BigDecimal::from_str(&value.to_string()).ok()
}

/// Truncate to whole smallest units
fn units(value: &BigDecimal) -> i64 {
    value.with_scale(0).to_i64().unwrap_or(0)
}

fn expires_at(from: DateTime<Utc>, lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
