//! Trading capability consumed by the position manager
//!
//! Implementations wrap a real venue connector or a simulation. Every call may
//! be slow and may fail; the core never retries them except for the fill poll.

pub mod paper;

pub use paper::{PaperExchange, PaperExchangeConfig};

use async_trait::async_trait;

use crate::models::{
    Balances, CancelParams, OpenOrder, OrderAck, OrderBook, OrderFilter, OrderSide, TradeRecord,
};
use crate::Result;

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    /// Free amount per asset
    async fn fetch_balance(&self) -> Result<Balances>;

    async fn create_market_buy_order(&self, symbol: &str, amount: f64) -> Result<OrderAck>;

    async fn create_market_sell_order(&self, symbol: &str, amount: f64) -> Result<OrderAck>;

    async fn create_stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
    ) -> Result<OrderAck>;

    async fn fetch_open_orders(&self, symbol: &str, filter: OrderFilter) -> Result<Vec<OpenOrder>>;

    /// Returns whether the venue confirmed the cancellation
    async fn cancel_order(&self, order_id: &str, symbol: &str, params: CancelParams)
        -> Result<bool>;

    /// Closed orders, oldest first
    async fn fetch_closed_orders(&self, symbol: &str) -> Result<Vec<TradeRecord>>;
}
