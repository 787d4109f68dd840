use crate::models::{Asset, AssetAmount, Price, Rate};

/// Trading pair; prices are expressed as quote per base
#[derive(Debug, Clone, PartialEq)]
pub struct Market {
    pub base: Asset,
    pub quote: Asset,
}

impl Market {
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    pub fn display_name(&self) -> String {
        format!("{}/{}", self.base.symbol, self.quote.symbol)
    }

    pub fn new_price(&self, base_amount: i64, quote_amount: i64) -> Price {
        Price {
            base: AssetAmount::new(self.base.id, base_amount),
            quote: AssetAmount::new(self.quote.id, quote_amount),
        }
    }

    /// Rate of `price` in this market's quote/base terms.
    ///
    /// Prices on the reversed pair are accepted with precisions swapped;
    /// anything else (including invalid prices) yields a zero rate.
    pub fn get_rate(&self, price: &Price) -> Rate {
        if price.valid() {
            if price.base.asset == self.base.id && price.quote.asset == self.quote.id {
                return price.rate(self.base.precision, self.quote.precision);
            }

            if price.base.asset == self.quote.id && price.quote.asset == self.base.id {
                return price.rate(self.quote.precision, self.base.precision);
            }
        }

        Rate::zero()
    }

    /// Orient `price` as base/quote; `None` if it belongs to another pair
    pub fn normalize(&self, price: &Price) -> Option<Price> {
        if price.base.asset == self.base.id && price.quote.asset == self.quote.id {
            Some(*price)
        } else if price.base.asset == self.quote.id && price.quote.asset == self.base.id {
            Some(price.invert())
        } else {
            None
        }
    }
}
