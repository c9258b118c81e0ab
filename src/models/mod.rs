use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Free amount per asset symbol, as reported by the exchange
pub type Balances = HashMap<String, f64>;

/// One price level of an order book: (price, quantity)
pub type PriceLevel = (f64, f64);

/// Order book snapshot, each side sorted best-price-first by the data source
///
/// A side missing from the payload deserializes as empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OrderBook {
    #[serde(default)]
    pub bids: Vec<PriceLevel>,
    #[serde(default)]
    pub asks: Vec<PriceLevel>,
}

impl OrderBook {
    pub fn levels(&self, side: BookSide) -> &[PriceLevel] {
        match side {
            BookSide::Bids => &self.bids,
            BookSide::Asks => &self.asks,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bids,
    Asks,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bids => write!(f, "bids"),
            BookSide::Asks => write!(f, "asks"),
        }
    }
}

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Intended directional exposure. Only `Long` is exercised today.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionDirection {
    #[default]
    None,
    Long,
    Short,
}

/// Closed trade as reported by the exchange
///
/// Every field is optional on the wire; the execution validator decides which
/// ones are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    /// UTC timestamp, `%Y-%m-%dT%H:%M:%S.%3fZ`
    pub datetime: Option<String>,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub price: Option<f64>,
    pub amount: Option<f64>,
}

/// Raw open order returned by the exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenOrder {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub amount: f64,
    pub price: Option<f64>,
}

/// Snapshot of an open order held by the position manager
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub quantity: f64,
    pub price: Option<f64>,
}

impl From<OpenOrder> for Order {
    fn from(o: OpenOrder) -> Self {
        Self {
            order_id: o.id,
            client_order_id: o.client_order_id,
            quantity: o.amount,
            price: o.price,
        }
    }
}

/// Exchange acknowledgement of a submitted order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderAck {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: f64,
}

/// Filter passed when listing open orders
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderFilter {
    /// Only conditional (stop) orders
    pub stop: bool,
}

/// Extra flags for order cancellation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelParams {
    pub client_order_id: Option<String>,
    pub stop: bool,
}
