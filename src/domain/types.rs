use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side a trailing position will execute when it closes.
    pub fn inverse(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            _ => anyhow::bail!("Invalid order side: {}. Must be 'buy' or 'sell'", s),
        }
    }
}

/// A configured pair with the wire aliases the exchange knows it by.
/// Resolved once at startup; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairInfo {
    /// Logical pair id used in configuration and state (e.g. "XBTEUR")
    pub id: String,
    /// Primary symbol for price/OHLC queries (e.g. "XXBTZEUR")
    pub primary: String,
    /// Websocket/display name (e.g. "XBT/EUR")
    pub ws_name: String,
    /// Base asset code (e.g. "XXBT")
    pub base: String,
    /// Quote asset code (e.g. "ZEUR")
    pub quote: String,
}

/// An executed (closed) exchange order as reported by the closed-orders query.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub pair: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub volume: Decimal,
    pub cost: Decimal,
    pub close_time: i64,
}

/// The single (price, ATR) observation every position sees within one tick.
/// `atr` is `None` when the ATR source returned no usable data; strategies
/// substitute their floor in that case.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketSample {
    pub price: Decimal,
    pub atr: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_inverse() {
        assert_eq!(OrderSide::Buy.inverse(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.inverse(), OrderSide::Buy);
    }

    #[test]
    fn test_side_parse_roundtrip() {
        assert_eq!("buy".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("SELL".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!("hold".parse::<OrderSide>().is_err());
    }

    #[test]
    fn test_side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Sell).unwrap(), "\"sell\"");
    }
}
