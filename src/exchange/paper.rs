//! In-memory exchange with instant simulated fills.
//!
//! - Market orders fill completely at the best ask/bid
//! - Stop orders rest as open orders until cancelled or triggered by
//!   [`PaperExchange::set_prices`]
//! - One symbol, no fees, no partial fills

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::Exchange;
use crate::error::Error;
use crate::execution::validator::format_trade_datetime;
use crate::models::{
    Balances, CancelParams, OpenOrder, OrderAck, OrderBook, OrderFilter, OrderSide, TradeRecord,
};
use crate::Result;

#[derive(Debug, Clone)]
pub struct PaperExchangeConfig {
    pub base_asset: String,
    pub quote_asset: String,
    pub bid: f64,
    pub ask: f64,
    pub quote_balance: f64,
    pub base_balance: f64,
    /// When false, fills happen but never show up in closed orders
    pub report_fills: bool,
}

impl Default for PaperExchangeConfig {
    fn default() -> Self {
        Self {
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            bid: 99.9,
            ask: 100.0,
            quote_balance: 10_000.0,
            base_balance: 0.0,
            report_fills: true,
        }
    }
}

#[derive(Debug)]
struct StopOrder {
    order: OpenOrder,
    stop_price: f64,
}

#[derive(Debug)]
struct PaperState {
    bid: f64,
    ask: f64,
    balances: Balances,
    stops: Vec<StopOrder>,
    closed: Vec<TradeRecord>,
}

pub struct PaperExchange {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    report_fills: bool,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(config: PaperExchangeConfig) -> Self {
        let mut balances = Balances::new();
        balances.insert(config.quote_asset.clone(), config.quote_balance);
        balances.insert(config.base_asset.clone(), config.base_balance);

        Self {
            symbol: format!("{}/{}", config.base_asset, config.quote_asset),
            base_asset: config.base_asset,
            quote_asset: config.quote_asset,
            report_fills: config.report_fills,
            state: Mutex::new(PaperState {
                bid: config.bid,
                ask: config.ask,
                balances,
                stops: Vec::new(),
                closed: Vec::new(),
            }),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Move the market; stop orders at or above the new bid are filled
    pub fn set_prices(&self, bid: f64, ask: f64) -> Result<usize> {
        let mut state = self.lock()?;
        state.bid = bid;
        state.ask = ask;

        let (triggered, resting): (Vec<StopOrder>, Vec<StopOrder>) =
            state.stops.drain(..).partition(|s| s.stop_price >= bid);
        state.stops = resting;

        for stop in &triggered {
            let amount = stop.order.amount.min(self.free(&state, &self.base_asset));
            tracing::info!(
                id = %stop.order.id,
                stop_price = stop.stop_price,
                bid,
                amount,
                "Paper stop order triggered"
            );
            self.fill(&mut state, OrderSide::Sell, amount, bid);
        }

        Ok(triggered.len())
    }

    pub fn balances(&self) -> Result<Balances> {
        Ok(self.lock()?.balances.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>> {
        self.state
            .lock()
            .map_err(|e| Error::Exchange(format!("paper exchange state poisoned: {}", e)))
    }

    fn check_symbol(&self, symbol: &str) -> Result<()> {
        if symbol != self.symbol {
            return Err(Error::Exchange(format!(
                "unknown symbol {} (paper exchange trades {})",
                symbol, self.symbol
            )));
        }
        Ok(())
    }

    fn free(&self, state: &PaperState, asset: &str) -> f64 {
        state.balances.get(asset).copied().unwrap_or(0.0)
    }

    fn fill(&self, state: &mut PaperState, side: OrderSide, amount: f64, price: f64) {
        let notional = amount * price;
        let (base_delta, quote_delta) = match side {
            OrderSide::Buy => (amount, -notional),
            OrderSide::Sell => (-amount, notional),
        };
        *state.balances.entry(self.base_asset.clone()).or_insert(0.0) += base_delta;
        *state.balances.entry(self.quote_asset.clone()).or_insert(0.0) += quote_delta;

        if self.report_fills {
            state.closed.push(TradeRecord {
                datetime: Some(format_trade_datetime(Utc::now())),
                symbol: Some(self.symbol.clone()),
                side: Some(side.as_str().to_string()),
                price: Some(price),
                amount: Some(amount),
            });
        }
    }

    fn market_order(&self, symbol: &str, side: OrderSide, amount: f64) -> Result<OrderAck> {
        self.check_symbol(symbol)?;
        let mut state = self.lock()?;

        let price = match side {
            OrderSide::Buy => state.ask,
            OrderSide::Sell => state.bid,
        };
        let (asset, needed) = match side {
            OrderSide::Buy => (&self.quote_asset, amount * price),
            OrderSide::Sell => (&self.base_asset, amount),
        };
        let available = self.free(&state, asset);
        // Tolerate float dust when spending the whole balance
        if needed > available * (1.0 + 1e-9) {
            return Err(Error::Exchange(format!(
                "insufficient {}: need {}, have {}",
                asset, needed, available
            )));
        }

        self.fill(&mut state, side, amount, price);
        tracing::debug!(%side, amount, price, "Paper market order filled");

        Ok(OrderAck {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            amount,
        })
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook> {
        self.check_symbol(symbol)?;
        let state = self.lock()?;
        let mut book = OrderBook {
            bids: vec![(state.bid, 1.0)],
            asks: vec![(state.ask, 1.0)],
        };
        book.bids.truncate(depth);
        book.asks.truncate(depth);
        Ok(book)
    }

    async fn fetch_balance(&self) -> Result<Balances> {
        self.balances()
    }

    async fn create_market_buy_order(&self, symbol: &str, amount: f64) -> Result<OrderAck> {
        self.market_order(symbol, OrderSide::Buy, amount)
    }

    async fn create_market_sell_order(&self, symbol: &str, amount: f64) -> Result<OrderAck> {
        self.market_order(symbol, OrderSide::Sell, amount)
    }

    async fn create_stop_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: f64,
        stop_price: f64,
    ) -> Result<OrderAck> {
        self.check_symbol(symbol)?;
        if side != OrderSide::Sell {
            return Err(Error::Exchange(
                "paper exchange only supports sell stops".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let order = OpenOrder {
            id: id.clone(),
            client_order_id: format!("paper-{}", id),
            symbol: symbol.to_string(),
            amount,
            price: Some(stop_price),
        };
        self.lock()?.stops.push(StopOrder { order, stop_price });

        Ok(OrderAck {
            id,
            symbol: symbol.to_string(),
            side,
            amount,
        })
    }

    // Only stop orders ever rest on the paper book, so the filter is moot
    async fn fetch_open_orders(&self, symbol: &str, _filter: OrderFilter) -> Result<Vec<OpenOrder>> {
        self.check_symbol(symbol)?;
        Ok(self.lock()?.stops.iter().map(|s| s.order.clone()).collect())
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &str,
        params: CancelParams,
    ) -> Result<bool> {
        self.check_symbol(symbol)?;
        let mut state = self.lock()?;
        let before = state.stops.len();
        state.stops.retain(|s| s.order.id != order_id);
        let cancelled = state.stops.len() < before;
        tracing::debug!(%order_id, ?params, cancelled, "Paper cancel");
        Ok(cancelled)
    }

    async fn fetch_closed_orders(&self, symbol: &str) -> Result<Vec<TradeRecord>> {
        self.check_symbol(symbol)?;
        Ok(self.lock()?.closed.clone())
    }
}
