//! Snapshot of resting orders on one market

use tracing::info;

use crate::market::Market;
use crate::models::{LimitOrder, ObjectId};

/// Resting orders split by the asset they offer.
///
/// `sell` orders offer the market's base asset, `buy` orders offer the quote
/// asset. A book is rebuilt from the ledger on every tick and never mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    pub sell: Vec<LimitOrder>,
    pub buy: Vec<LimitOrder>,
}

impl OrderBook {
    /// Partition `orders`, which must all belong to `market`
    pub fn new(orders: Vec<LimitOrder>, market: &Market) -> Self {
        let (sell, buy): (Vec<_>, Vec<_>) = orders
            .into_iter()
            .partition(|order| order.sell_price.base.asset == market.base.id);
        Self { sell, buy }
    }

    pub fn orders(&self) -> impl Iterator<Item = &LimitOrder> {
        self.sell.iter().chain(self.buy.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.sell.is_empty() && self.buy.is_empty()
    }

    /// Base asset committed to resting sell orders
    pub fn sell_amount(&self) -> u64 {
        orders_amount(&self.sell)
    }

    /// Quote asset committed to resting buy orders
    pub fn buy_amount(&self) -> u64 {
        orders_amount(&self.buy)
    }

    /// Only the orders placed by `seller`, keeping the side split
    pub fn filter_by_seller(&self, seller: ObjectId) -> OrderBook {
        OrderBook {
            sell: filter_by_seller(&self.sell, seller),
            buy: filter_by_seller(&self.buy, seller),
        }
    }

    pub fn log(&self, market: &Market) {
        let name = market.display_name();
        info!(market = %name, "SELL:");
        log_orders(&self.sell, market, false);
        info!(market = %name, "BUY:");
        log_orders(&self.buy, market, true);
    }
}

pub fn filter_by_seller(orders: &[LimitOrder], seller: ObjectId) -> Vec<LimitOrder> {
    orders.iter().filter(|order| order.seller == seller).cloned().collect()
}

fn orders_amount(orders: &[LimitOrder]) -> u64 {
    orders.iter().map(|order| order.for_sale.max(0) as u64).sum()
}

fn log_orders(orders: &[LimitOrder], market: &Market, inverse: bool) {
    for order in orders {
        let mut price = market.get_rate(&order.sell_price).value();
        if inverse && price != 0.0 {
            price = 1.0 / price;
        }
        info!("{:.6}: {} (fee: {})", price, order.for_sale, order.deferred_fee);
    }
}
