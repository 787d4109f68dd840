use bigdecimal::{BigDecimal, FromPrimitive, ToPrimitive, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MarketMakerError;

/// Core asset of the chain; pays all transaction fees
pub const CORE_ASSET: ObjectId = ObjectId::new(1, 3, 0);

/// Graphene object id (`space.type.instance`, e.g. `1.3.0`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId {
    pub space: u8,
    pub kind: u8,
    pub instance: u64,
}

impl ObjectId {
    pub const fn new(space: u8, kind: u8, instance: u64) -> Self {
        Self { space, kind, instance }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.space, self.kind, self.instance)
    }
}

impl FromStr for ObjectId {
    type Err = MarketMakerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MarketMakerError::InvalidObjectId(s.to_string());
        let mut parts = s.split('.');
        let space = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let kind = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let instance = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { space, kind, instance })
    }
}

impl TryFrom<String> for ObjectId {
    type Error = MarketMakerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.to_string()
    }
}

/// Asset descriptor as registered on chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: ObjectId,
    pub symbol: String,
    pub precision: u8,
    /// Set for market-pegged assets that carry a settlement feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitasset_data_id: Option<ObjectId>,
}

impl Asset {
    /// Convert a real-unit value into this asset's smallest units (truncated)
    pub fn amount(&self, value: f64) -> AssetAmount {
        let units = BigDecimal::from_f64(value)
            .map(|v| v * pow10(self.precision))
            .and_then(|v| v.with_scale(0).to_i64())
            .unwrap_or(0);
        AssetAmount::new(self.id, units)
    }

    /// Convert an amount in smallest units into real units
    pub fn real_amount(&self, amount: &AssetAmount) -> f64 {
        (BigDecimal::from(amount.amount) / pow10(self.precision)).to_f64().unwrap_or(0.0)
    }
}

/// Integer amount of an asset in its smallest denomination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetAmount {
    #[serde(deserialize_with = "deserialize_share")]
    pub amount: i64,
    #[serde(rename = "asset_id")]
    pub asset: ObjectId,
}

impl AssetAmount {
    pub fn new(asset: ObjectId, amount: i64) -> Self {
        Self { amount, asset }
    }
}

/// Ratio of two asset amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub base: AssetAmount,
    pub quote: AssetAmount,
}

impl Price {
    /// The invalid price, returned when no price could be determined
    pub fn invalid() -> Self {
        Self { base: AssetAmount::new(CORE_ASSET, 0), quote: AssetAmount::new(CORE_ASSET, 0) }
    }

    pub fn valid(&self) -> bool {
        self.base.amount > 0 && self.quote.amount > 0
    }

    pub fn invert(&self) -> Self {
        Self { base: self.quote, quote: self.base }
    }

    /// Quote per base in real units, given both assets' precisions
    pub fn rate(&self, base_precision: u8, quote_precision: u8) -> Rate {
        if !self.valid() {
            return Rate::zero();
        }
        let quote = BigDecimal::from(self.quote.amount) * pow10(base_precision);
        let base = BigDecimal::from(self.base.amount) * pow10(quote_precision);
        Rate(quote / base)
    }
}

/// Decimal exchange rate; zero means "no actionable price"
#[derive(Debug, Clone, PartialEq)]
pub struct Rate(pub BigDecimal);

impl Rate {
    pub fn zero() -> Self {
        Rate(BigDecimal::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn value(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: ObjectId,
    pub name: String,
}

/// Resting order on the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub id: ObjectId,
    #[serde(with = "chain_time")]
    pub expiration: DateTime<Utc>,
    pub seller: ObjectId,
    #[serde(deserialize_with = "deserialize_share")]
    pub for_sale: i64,
    pub sell_price: Price,
    #[serde(default, deserialize_with = "deserialize_share")]
    pub deferred_fee: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceFeed {
    pub settlement_price: Price,
}

/// Settlement data of a market-pegged asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitAssetData {
    pub id: ObjectId,
    pub current_feed: PriceFeed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderCreateOperation {
    pub seller: ObjectId,
    pub amount_to_sell: AssetAmount,
    pub min_to_receive: AssetAmount,
    pub expiration: DateTime<Utc>,
    pub fill_or_kill: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LimitOrderCancelOperation {
    pub order: ObjectId,
    pub fee_paying_account: ObjectId,
}

/// Operation submitted to the ledger as part of a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    LimitOrderCreate(LimitOrderCreateOperation),
    LimitOrderCancel(LimitOrderCancelOperation),
}

impl Operation {
    pub fn cancel(order: &LimitOrder) -> Self {
        Operation::LimitOrderCancel(LimitOrderCancelOperation {
            order: order.id,
            fee_paying_account: order.seller,
        })
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Operation::LimitOrderCancel(_))
    }

    /// `[tag, body]` pair as expected by the wallet API; fees are filled in by the wallet
    pub fn to_wire(&self) -> serde_json::Value {
        let zero_fee = serde_json::json!({ "amount": 0, "asset_id": CORE_ASSET });
        match self {
            Operation::LimitOrderCreate(op) => serde_json::json!([
                1,
                {
                    "fee": zero_fee,
                    "seller": op.seller,
                    "amount_to_sell": op.amount_to_sell,
                    "min_to_receive": op.min_to_receive,
                    "expiration": chain_time::format(&op.expiration),
                    "fill_or_kill": op.fill_or_kill,
                    "extensions": [],
                }
            ]),
            Operation::LimitOrderCancel(op) => serde_json::json!([
                2,
                {
                    "fee": zero_fee,
                    "fee_paying_account": op.fee_paying_account,
                    "order": op.order,
                    "extensions": [],
                }
            ]),
        }
    }
}

/// `10^precision` as a decimal
pub(crate) fn pow10(precision: u8) -> BigDecimal {
    BigDecimal::new(1.into(), -i64::from(precision))
}

/// Share amounts are int64 on chain and may be encoded as JSON strings
fn deserialize_share<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Share {
        Number(i64),
        Text(String),
    }

    match Share::deserialize(deserializer)? {
        Share::Number(n) => Ok(n),
        Share::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Chain timestamps carry no offset and are always UTC
pub(crate) mod chain_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn format(time: &DateTime<Utc>) -> String {
        time.format(FORMAT).to_string()
    }

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(time))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_round_trip() {
        let id: ObjectId = "1.7.110".parse().unwrap();
        assert_eq!(id, ObjectId::new(1, 7, 110));
        assert_eq!(id.to_string(), "1.7.110");

        assert!("1.7".parse::<ObjectId>().is_err());
        assert!("1.7.x".parse::<ObjectId>().is_err());
        assert!("1.7.1.2".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_price_validity() {
        let a = ObjectId::new(1, 3, 0);
        let b = ObjectId::new(1, 3, 1);
        assert!(Price { base: AssetAmount::new(a, 1), quote: AssetAmount::new(b, 2) }.valid());
        assert!(!Price { base: AssetAmount::new(a, 0), quote: AssetAmount::new(b, 2) }.valid());
        assert!(!Price { base: AssetAmount::new(a, 5), quote: AssetAmount::new(b, -1) }.valid());
        assert!(!Price::invalid().valid());
    }

    #[test]
    fn test_rate_uses_precisions() {
        let a = ObjectId::new(1, 3, 0);
        let b = ObjectId::new(1, 3, 1);
        // 1.00000 base (precision 5) for 0.00000002 quote (precision 8)
        let price = Price { base: AssetAmount::new(a, 100_000), quote: AssetAmount::new(b, 2) };
        let rate = price.rate(5, 8);
        assert!((rate.value() - 0.000_000_02).abs() < 1e-18);
        assert!(Price::invalid().rate(5, 8).is_zero());
    }

    #[test]
    fn test_asset_amount_conversion() {
        let asset = Asset {
            id: ObjectId::new(1, 3, 2),
            symbol: "BTC".to_string(),
            precision: 8,
            bitasset_data_id: None,
        };
        assert_eq!(asset.amount(1.5).amount, 150_000_000);
        assert_eq!(asset.real_amount(&AssetAmount::new(asset.id, 25_000_000)), 0.25);
    }

    #[test]
    fn test_limit_order_deserializes_string_amounts() {
        let json = r#"{
            "id": "1.7.110",
            "expiration": "2030-01-01T00:00:00",
            "seller": "1.2.17",
            "for_sale": "1000000000000",
            "sell_price": {
                "base": {"amount": "1000000000000", "asset_id": "1.3.0"},
                "quote": {"amount": 297936749, "asset_id": "1.3.2"}
            },
            "deferred_fee": 2000000000
        }"#;
        let order: LimitOrder = serde_json::from_str(json).unwrap();
        assert_eq!(order.for_sale, 1_000_000_000_000);
        assert_eq!(order.sell_price.quote.amount, 297_936_749);
        assert_eq!(order.seller, ObjectId::new(1, 2, 17));
    }

    #[test]
    fn test_operation_wire_format() {
        let op = Operation::LimitOrderCancel(LimitOrderCancelOperation {
            order: ObjectId::new(1, 7, 5),
            fee_paying_account: ObjectId::new(1, 2, 17),
        });
        let wire = op.to_wire();
        assert_eq!(wire[0], 2);
        assert_eq!(wire[1]["order"], "1.7.5");
        assert_eq!(wire[1]["fee"]["asset_id"], "1.3.0");
    }

    #[test]
    fn test_pow10() {
        assert_eq!(pow10(0), BigDecimal::from(1));
        assert_eq!(pow10(8), BigDecimal::from(100_000_000));
        assert_eq!((BigDecimal::from(3) * pow10(5)).with_scale(0).to_i64(), Some(300_000));
    }
}
