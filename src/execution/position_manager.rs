use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::execution::price::{best_ask, size_from_balance_and_price};
use crate::execution::validator::ExecutionValidator;
use crate::models::{
    Balances, CancelParams, OpenOrder, Order, OrderAck, OrderFilter, OrderSide, PositionDirection,
    TradeRecord,
};
use crate::risk::StopPriceStrategy;

/// Lifecycle of the single managed position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Idle,
    Opening,
    Open,
    Closing,
    /// Entry could not be verified; flattening before returning to Idle
    RollingBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollbackReason {
    /// No acceptable fill was reported within the retry budget
    ExecutionUnverified { attempts: u32 },
    /// Caller aborted or the deadline passed while waiting for the fill
    Cancelled,
}

/// Result of an entry attempt
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// Trading disabled; nothing was submitted
    DryRun { spend: f64, ask: f64, amount: f64 },
    Opened {
        entry_price: f64,
        allocated: f64,
        profit_target: f64,
        stop_price: Option<f64>,
    },
    /// Entry was flattened and the manager is Idle again
    RolledBack { reason: RollbackReason },
}

enum FillPoll {
    Confirmed(TradeRecord),
    Exhausted(u32),
    Cancelled,
}

/// Opens, protects and closes one long position on one symbol
pub struct PositionManager<E: Exchange + ?Sized> {
    exchange: Arc<E>,
    config: ManagerConfig,
    symbol: String,
    strategy: StopPriceStrategy,
    validator: ExecutionValidator,
    state: PositionState,
    direction: PositionDirection,
    stop_price: Option<f64>,
    last_trade_price: Option<f64>,
    profit_target_price: Option<f64>,
    allocated_amount: Option<f64>,
}

impl<E: Exchange + ?Sized> PositionManager<E> {
    pub fn new(exchange: Arc<E>, config: ManagerConfig, strategy: StopPriceStrategy) -> Self {
        let symbol = config.symbol();
        tracing::info!(
            %symbol,
            max_quote_position = config.max_quote_position,
            gain_target_pct = config.gain_target_pct,
            trading = config.trading,
            disable_stop_loss = config.disable_stop_loss,
            "PositionManager initialized"
        );

        Self {
            exchange,
            validator: ExecutionValidator::new(config.execution_tolerance),
            config,
            symbol,
            strategy,
            state: PositionState::Idle,
            direction: PositionDirection::None,
            stop_price: None,
            last_trade_price: None,
            profit_target_price: None,
            allocated_amount: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> PositionState {
        self.state
    }

    pub fn direction(&self) -> PositionDirection {
        self.direction
    }

    pub fn current_stop_price(&self) -> Option<f64> {
        self.stop_price
    }

    pub fn last_trade_price(&self) -> Option<f64> {
        self.last_trade_price
    }

    pub fn profit_target_price(&self) -> Option<f64> {
        self.profit_target_price
    }

    pub fn allocated_amount(&self) -> Option<f64> {
        self.allocated_amount
    }

    pub fn strategy(&self) -> &StopPriceStrategy {
        &self.strategy
    }

    /// Mutable strategy access, for feeding the rolling averages
    pub fn strategy_mut(&mut self) -> &mut StopPriceStrategy {
        &mut self.strategy
    }

    /// Explicit position tracking, independent of stop orders
    ///
    /// Fills made by the exchange itself (a triggered stop) are only observed
    /// after [`Self::sync_position`].
    pub fn is_position_open(&self) -> bool {
        self.state == PositionState::Open
    }

    /// Open a long position, waiting for the fill without a deadline
    pub async fn open_long_position(&mut self) -> Result<OpenOutcome> {
        self.open_long_position_until(&CancellationToken::new()).await
    }

    /// Open a long position, giving up on the fill after `timeout`
    ///
    /// Hitting the deadline rolls the entry back like an unverified fill.
    pub async fn open_long_position_within(&mut self, timeout: Duration) -> Result<OpenOutcome> {
        let token = CancellationToken::new();
        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let outcome = self.open_long_position_until(&token).await;
        timer.abort();
        outcome
    }

    /// Open a long position; `cancel` aborts the wait for the fill
    pub async fn open_long_position_until(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<OpenOutcome> {
        if self.state != PositionState::Idle {
            return Err(Error::NotIdle(self.state));
        }
        tracing::info!(symbol = %self.symbol, "Opening long position");

        if !self.config.disable_stop_loss {
            self.strategy.ensure_ready()?;
        }

        let free_capital = self.fetch_free_capital().await?;
        let spend = self.config.max_quote_position.min(free_capital);
        let book = self
            .exchange
            .fetch_order_book(&self.symbol, self.config.orderbook_depth)
            .await?;
        let ask = best_ask(&book)?;
        let amount = size_from_balance_and_price(spend, ask)?;

        tracing::info!(
            spend,
            free_capital,
            max_quote_position = self.config.max_quote_position,
            ask,
            amount,
            "Submit market buy"
        );

        if !self.config.trading {
            tracing::info!("Trading flag disabled, not submitting");
            return Ok(OpenOutcome::DryRun { spend, ask, amount });
        }

        self.state = PositionState::Opening;
        let ack = match self
            .exchange
            .create_market_buy_order(&self.symbol, amount)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.state = PositionState::Idle;
                return Err(e);
            }
        };
        let submitted_at = Utc::now();
        tracing::info!(order_id = %ack.id, %submitted_at, "Buy order submitted");

        match self.confirm_entry(submitted_at, cancel).await {
            Ok(OpenOutcome::RolledBack { reason }) => {
                self.rollback().await?;
                Ok(OpenOutcome::RolledBack { reason })
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(error = %e, "Entry failed after buy submission, flattening");
                if let Err(rollback_err) = self.rollback().await {
                    tracing::error!(error = %rollback_err, "Rollback failed, position may be unmanaged");
                }
                Err(e)
            }
        }
    }

    /// Verify the fill and protect it
    ///
    /// `RolledBack` only reports the verdict; the caller performs the rollback.
    async fn confirm_entry(
        &mut self,
        submitted_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<OpenOutcome> {
        let allocated = self.fetch_allocated_position().await?;
        tracing::info!(allocated, asset = %self.config.base_asset, "Allocated position");

        let trade = match self.poll_for_fill(submitted_at, cancel).await? {
            FillPoll::Confirmed(trade) => trade,
            FillPoll::Exhausted(attempts) => {
                tracing::error!(attempts, "Last trade invalid, closing positions");
                return Ok(OpenOutcome::RolledBack {
                    reason: RollbackReason::ExecutionUnverified { attempts },
                });
            }
            FillPoll::Cancelled => {
                tracing::warn!("Fill wait cancelled, closing positions");
                return Ok(OpenOutcome::RolledBack {
                    reason: RollbackReason::Cancelled,
                });
            }
        };

        let entry_price = trade
            .price
            .ok_or_else(|| Error::Exchange("validated trade has no price".to_string()))?;
        let profit_target = entry_price + (self.config.gain_target_pct / 100.0) * entry_price;
        tracing::info!(
            price = entry_price,
            amount = ?trade.amount,
            profit_target,
            gain_target_pct = self.config.gain_target_pct,
            "Last trade confirmed"
        );

        self.last_trade_price = Some(entry_price);
        self.profit_target_price = Some(profit_target);
        self.allocated_amount = Some(allocated);
        self.direction = PositionDirection::Long;
        self.state = PositionState::Open;

        let stop_price = if self.config.disable_stop_loss {
            tracing::info!("Skipping stop loss, disabled");
            None
        } else {
            let stop_price = self.strategy.compute_stop_price(entry_price)?;
            self.submit_stop_order(stop_price).await?;
            Some(stop_price)
        };

        Ok(OpenOutcome::Opened {
            entry_price,
            allocated,
            profit_target,
            stop_price,
        })
    }

    async fn poll_for_fill(
        &self,
        submitted_at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<FillPoll> {
        let max_checks = self.config.max_trade_checks;

        for attempt in 1..=max_checks {
            let last_trade = self.fetch_last_trade().await?;
            if self
                .validator
                .is_valid_buy_execution(last_trade.as_ref(), submitted_at, &self.symbol)
            {
                if let Some(trade) = last_trade {
                    tracing::debug!(attempt, "Fill confirmed");
                    return Ok(FillPoll::Confirmed(trade));
                }
            }

            if attempt == max_checks {
                break;
            }
            tracing::debug!(attempt, max_checks, "Fill not confirmed yet, retrying");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(FillPoll::Cancelled),
                _ = tokio::time::sleep(self.config.trade_check_delay) => {}
            }
        }

        Ok(FillPoll::Exhausted(max_checks))
    }

    /// Cancel protection and flatten whatever was allocated
    ///
    /// The flatten is attempted even when the stop cleanup fails. If the sell
    /// itself fails the manager reports an unprotected `Open` long so the caller
    /// can retry [`Self::close_position`]. Returns the first error encountered.
    async fn rollback(&mut self) -> Result<()> {
        self.state = PositionState::RollingBack;

        let cleanup = self.close_stop_order().await;
        if let Err(e) = &cleanup {
            tracing::error!(error = %e, "Stop cleanup failed during rollback, flattening anyway");
        }

        let flatten = self.exit_position().await;
        self.stop_price = None;
        self.last_trade_price = None;
        self.profit_target_price = None;

        if let Err(e) = &flatten {
            tracing::error!(error = %e, "Flatten failed, long position left open without a stop");
            self.state = PositionState::Open;
            self.direction = PositionDirection::Long;
        }

        cleanup?;
        flatten?;
        Ok(())
    }

    /// Place a stop-market sell for the allocated amount
    ///
    /// `stop_price` is recorded only once the exchange acknowledges the order.
    pub async fn submit_stop_order(&mut self, stop_price: f64) -> Result<()> {
        if self.config.disable_stop_loss {
            tracing::info!("Skipping stop loss, disabled");
            return Ok(());
        }
        let amount = self.allocated_amount.ok_or(Error::NoAllocatedPosition)?;

        tracing::info!(symbol = %self.symbol, amount, stop_price, "Submit stop loss");
        let ack = self
            .exchange
            .create_stop_market_order(&self.symbol, OrderSide::Sell, amount, stop_price)
            .await?;
        self.stop_price = Some(stop_price);
        tracing::info!(order_id = %ack.id, "Stop loss order placed");
        Ok(())
    }

    /// Cancel-then-replace the stop order; returns false when the price is unchanged
    ///
    /// Not atomic: the position is unprotected between the cancel and the new order.
    pub async fn update_stop_order_price(&mut self, price: f64) -> Result<bool> {
        tracing::info!(price, current = ?self.stop_price, "Cancel/replace stop order");
        if self.stop_price == Some(price) {
            tracing::info!("No price change, not updating");
            return Ok(false);
        }

        self.close_stop_order().await?;
        self.submit_stop_order(price).await?;
        Ok(true)
    }

    /// Market-sell the full allocated amount
    pub async fn exit_position(&mut self) -> Result<OrderAck> {
        let previous = self.state;
        if previous != PositionState::RollingBack {
            self.state = PositionState::Closing;
        }

        let result = self.submit_exit().await;
        match &result {
            Ok(_) => {
                self.state = PositionState::Idle;
                self.direction = PositionDirection::None;
                self.allocated_amount = None;
            }
            Err(_) => self.state = previous,
        }
        result
    }

    async fn submit_exit(&self) -> Result<OrderAck> {
        tracing::info!(symbol = %self.symbol, "Exit position");
        let amount = self.fetch_allocated_position().await?;
        tracing::info!(amount, "Submit market sell");
        let ack = self
            .exchange
            .create_market_sell_order(&self.symbol, amount)
            .await?;
        tracing::info!(order_id = %ack.id, "Exit order submitted");
        Ok(ack)
    }

    /// Cancel every open stop order for the symbol, best effort
    ///
    /// Returns how many cancellations the exchange confirmed.
    pub async fn close_stop_order(&mut self) -> Result<usize> {
        tracing::info!(symbol = %self.symbol, "Close stop order");
        let stop_orders = self.fetch_stop_orders().await?;
        if stop_orders.is_empty() {
            tracing::warn!("Stop order does not exist");
            self.stop_price = None;
            return Ok(0);
        }

        let mut cancelled = 0;
        for order in stop_orders {
            let params = CancelParams {
                client_order_id: Some(order.client_order_id.clone()),
                stop: true,
            };
            match self
                .exchange
                .cancel_order(&order.order_id, &self.symbol, params)
                .await
            {
                Ok(true) => {
                    tracing::info!(order_id = %order.order_id, "Stop order cancelled");
                    cancelled += 1;
                }
                Ok(false) => {
                    tracing::warn!(order_id = %order.order_id, "Stop order cancel not confirmed");
                }
                Err(e) => {
                    tracing::warn!(order_id = %order.order_id, error = %e, "Stop order cancel failed");
                }
            }
        }

        self.stop_price = None;
        Ok(cancelled)
    }

    /// Close on request: drop protection, then flatten
    pub async fn close_position(&mut self) -> Result<OrderAck> {
        self.close_stop_order().await?;
        let ack = self.exit_position().await?;
        self.last_trade_price = None;
        self.profit_target_price = None;
        Ok(ack)
    }

    /// Catch up with fills the exchange made on its own, such as a triggered stop
    ///
    /// Returns true when the open position turned out to be flat and the
    /// manager went back to Idle.
    pub async fn sync_position(&mut self) -> Result<bool> {
        if self.state != PositionState::Open {
            return Ok(false);
        }
        let allocated = self.fetch_allocated_position().await?;
        if allocated > 0.0 {
            return Ok(false);
        }

        tracing::warn!(symbol = %self.symbol, "Position flattened outside the manager, resetting");
        self.close_stop_order().await?;
        self.state = PositionState::Idle;
        self.direction = PositionDirection::None;
        self.allocated_amount = None;
        self.last_trade_price = None;
        self.profit_target_price = None;
        Ok(true)
    }

    /// True iff a stop order is resting for the symbol
    ///
    /// Reports false for an open position with stop loss disabled; see
    /// [`Self::is_position_open`] for explicit tracking.
    pub async fn has_active_position(&self) -> Result<bool> {
        Ok(!self.fetch_stop_orders().await?.is_empty())
    }

    pub async fn fetch_last_trade(&self) -> Result<Option<TradeRecord>> {
        tracing::debug!("Fetch last trade");
        let trades = self.exchange.fetch_closed_orders(&self.symbol).await?;
        Ok(trades.into_iter().last())
    }

    async fn fetch_open_orders(&self, filter: OrderFilter) -> Result<Vec<OpenOrder>> {
        let orders = self
            .exchange
            .fetch_open_orders(&self.symbol, filter)
            .await?;
        Ok(orders
            .into_iter()
            .filter(|o| o.symbol == self.symbol)
            .collect())
    }

    pub async fn fetch_stop_orders(&self) -> Result<Vec<Order>> {
        tracing::debug!("Fetch stop orders");
        let orders = self.fetch_open_orders(OrderFilter { stop: true }).await?;
        Ok(orders.into_iter().map(Order::from).collect())
    }

    pub async fn fetch_free_capital(&self) -> Result<f64> {
        self.fetch_free(&self.config.quote_asset).await
    }

    pub async fn fetch_allocated_position(&self) -> Result<f64> {
        self.fetch_free(&self.config.base_asset).await
    }

    async fn fetch_free(&self, asset: &str) -> Result<f64> {
        let balances = self.exchange.fetch_balance().await?;
        balances
            .get(asset)
            .copied()
            .ok_or_else(|| Error::MissingBalance(asset.to_string()))
    }

    /// [`Self::compare_balances`] with the configured threshold
    pub fn balances_match(&self, b1: &Balances, b2: &Balances) -> bool {
        Self::compare_balances(b1, b2, self.config.balance_difference_threshold)
    }

    /// True iff every asset present in both maps differs by at most `threshold`
    ///
    /// Assets present in only one map are ignored.
    pub fn compare_balances(b1: &Balances, b2: &Balances, threshold: f64) -> bool {
        b1.iter().all(|(asset, a)| match b2.get(asset) {
            Some(b) => (a.abs() - b.abs()).abs() <= threshold,
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::validator::format_trade_datetime;
    use crate::execution::RollingWindow;
    use crate::models::OrderBook;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    const SYMBOL: &str = "BTC/USDT";

    #[derive(Default)]
    struct Calls {
        buys: u32,
        sells: Vec<f64>,
        stop_submits: Vec<(f64, f64)>,
        cancels: Vec<String>,
        stop_fetches: u32,
        closed_fetches: u32,
    }

    struct MockState {
        balances: Balances,
        book: OrderBook,
        /// Append a matching buy fill when a market buy arrives
        report_fill: bool,
        closed: Vec<TradeRecord>,
        stops: Vec<OpenOrder>,
        failing_cancels: HashSet<String>,
        fail_open_orders: bool,
        fail_stop_submits: bool,
        fail_sells: bool,
        calls: Calls,
    }

    struct MockExchange {
        state: Mutex<MockState>,
    }

    impl MockExchange {
        fn new(report_fill: bool) -> Self {
            let mut balances = Balances::new();
            balances.insert("USDT".to_string(), 1000.0);
            balances.insert("BTC".to_string(), 0.0);
            Self {
                state: Mutex::new(MockState {
                    balances,
                    book: OrderBook {
                        bids: vec![(99.0, 1.0)],
                        asks: vec![(100.0, 1.0)],
                    },
                    report_fill,
                    closed: Vec::new(),
                    stops: Vec::new(),
                    failing_cancels: HashSet::new(),
                    fail_open_orders: false,
                    fail_stop_submits: false,
                    fail_sells: false,
                    calls: Calls::default(),
                }),
            }
        }

        fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
            f(&mut self.state.lock().unwrap())
        }

        fn add_stop(&self, id: &str, symbol: &str) {
            self.with(|s| {
                s.stops.push(OpenOrder {
                    id: id.to_string(),
                    client_order_id: format!("c-{}", id),
                    symbol: symbol.to_string(),
                    amount: 1.0,
                    price: Some(90.0),
                })
            });
        }

        fn mutating_calls(&self) -> usize {
            self.with(|s| {
                s.calls.buys as usize
                    + s.calls.sells.len()
                    + s.calls.stop_submits.len()
                    + s.calls.cancels.len()
            })
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn fetch_order_book(&self, _symbol: &str, _depth: usize) -> Result<OrderBook> {
            Ok(self.with(|s| s.book.clone()))
        }

        async fn fetch_balance(&self) -> Result<Balances> {
            Ok(self.with(|s| s.balances.clone()))
        }

        async fn create_market_buy_order(&self, symbol: &str, amount: f64) -> Result<OrderAck> {
            self.with(|s| {
                s.calls.buys += 1;
                *s.balances.get_mut("BTC").unwrap() += amount;
                if s.report_fill {
                    s.closed.push(TradeRecord {
                        datetime: Some(format_trade_datetime(Utc::now())),
                        symbol: Some(symbol.to_string()),
                        side: Some("buy".to_string()),
                        price: Some(100.0),
                        amount: Some(amount),
                    });
                }
            });
            Ok(OrderAck {
                id: "buy-1".to_string(),
                symbol: symbol.to_string(),
                side: OrderSide::Buy,
                amount,
            })
        }

        async fn create_market_sell_order(&self, symbol: &str, amount: f64) -> Result<OrderAck> {
            self.with(|s| {
                if s.fail_sells {
                    return Err(Error::Exchange("sell rejected".to_string()));
                }
                s.calls.sells.push(amount);
                *s.balances.get_mut("BTC").unwrap() -= amount;
                Ok(())
            })?;
            Ok(OrderAck {
                id: "sell-1".to_string(),
                symbol: symbol.to_string(),
                side: OrderSide::Sell,
                amount,
            })
        }

        async fn create_stop_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            amount: f64,
            stop_price: f64,
        ) -> Result<OrderAck> {
            let id = self.with(|s| {
                if s.fail_stop_submits {
                    return Err(Error::Exchange("stop rejected".to_string()));
                }
                s.calls.stop_submits.push((amount, stop_price));
                let id = format!("stop-{}", s.calls.stop_submits.len());
                s.stops.push(OpenOrder {
                    id: id.clone(),
                    client_order_id: format!("c-{}", id),
                    symbol: symbol.to_string(),
                    amount,
                    price: Some(stop_price),
                });
                Ok(id)
            })?;
            Ok(OrderAck {
                id,
                symbol: symbol.to_string(),
                side,
                amount,
            })
        }

        async fn fetch_open_orders(
            &self,
            _symbol: &str,
            _filter: OrderFilter,
        ) -> Result<Vec<OpenOrder>> {
            self.with(|s| {
                s.calls.stop_fetches += 1;
                if s.fail_open_orders {
                    return Err(Error::Exchange("open orders timeout".to_string()));
                }
                Ok(s.stops.clone())
            })
        }

        async fn cancel_order(
            &self,
            order_id: &str,
            _symbol: &str,
            params: CancelParams,
        ) -> Result<bool> {
            assert!(params.stop);
            self.with(|s| {
                s.calls.cancels.push(order_id.to_string());
                if s.failing_cancels.contains(order_id) {
                    return Err(Error::Exchange("cancel rejected".to_string()));
                }
                s.stops.retain(|o| o.id != order_id);
                Ok(true)
            })
        }

        async fn fetch_closed_orders(&self, _symbol: &str) -> Result<Vec<TradeRecord>> {
            Ok(self.with(|s| {
                s.calls.closed_fetches += 1;
                s.closed.clone()
            }))
        }
    }

    fn config(trading: bool) -> ManagerConfig {
        ManagerConfig {
            trading,
            max_quote_position: 500.0,
            gain_target_pct: 2.0,
            max_trade_checks: 3,
            trade_check_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn manager(
        exchange: &Arc<MockExchange>,
        config: ManagerConfig,
    ) -> PositionManager<MockExchange> {
        PositionManager::new(
            exchange.clone(),
            config,
            StopPriceStrategy::percentage_below(5.0),
        )
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(false));

        let outcome = pm.open_long_position().await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::DryRun {
                spend: 500.0,
                ask: 100.0,
                amount: 5.0
            }
        );
        assert_eq!(exchange.mutating_calls(), 0);
        assert_eq!(pm.state(), PositionState::Idle);
        assert!(pm.current_stop_price().is_none());
    }

    #[tokio::test]
    async fn test_spend_capped_by_free_capital() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.with(|s| *s.balances.get_mut("USDT").unwrap() = 200.0);
        let mut pm = manager(&exchange, config(false));

        let outcome = pm.open_long_position().await.unwrap();
        assert!(matches!(outcome, OpenOutcome::DryRun { spend, amount, .. } if spend == 200.0 && amount == 2.0));
    }

    #[tokio::test]
    async fn test_open_with_valid_fill_places_stop() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));

        let outcome = pm.open_long_position().await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::Opened {
                entry_price: 100.0,
                allocated: 5.0,
                profit_target: 102.0,
                stop_price: Some(95.0),
            }
        );
        assert_eq!(pm.state(), PositionState::Open);
        assert!(pm.is_position_open());
        assert_eq!(pm.direction(), PositionDirection::Long);
        assert_eq!(pm.last_trade_price(), Some(100.0));
        assert_eq!(pm.profit_target_price(), Some(102.0));
        assert_eq!(pm.current_stop_price(), Some(95.0));
        assert_eq!(pm.allocated_amount(), Some(5.0));
        exchange.with(|s| {
            assert_eq!(s.calls.buys, 1);
            assert_eq!(s.calls.stop_submits, vec![(5.0, 95.0)]);
            assert!(s.calls.sells.is_empty());
        });
        assert!(pm.has_active_position().await.unwrap());
    }

    #[tokio::test]
    async fn test_unverified_fill_rolls_back() {
        let exchange = Arc::new(MockExchange::new(false));
        let mut pm = manager(&exchange, config(true));

        let outcome = pm.open_long_position().await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::RolledBack {
                reason: RollbackReason::ExecutionUnverified { attempts: 3 }
            }
        );
        assert_eq!(pm.state(), PositionState::Idle);
        assert!(pm.current_stop_price().is_none());
        assert!(pm.last_trade_price().is_none());
        exchange.with(|s| {
            assert_eq!(s.calls.closed_fetches, 3);
            // One stop lookup by the rollback, no stop existed so nothing to cancel
            assert_eq!(s.calls.stop_fetches, 1);
            assert!(s.calls.cancels.is_empty());
            assert_eq!(s.calls.sells, vec![5.0]);
            assert!(s.calls.stop_submits.is_empty());
        });
    }

    #[tokio::test]
    async fn test_rollback_flattens_when_stop_lookup_fails() {
        let exchange = Arc::new(MockExchange::new(false));
        exchange.with(|s| s.fail_open_orders = true);
        let mut pm = manager(&exchange, config(true));

        let result = pm.open_long_position().await;

        assert!(matches!(result, Err(Error::Exchange(msg)) if msg == "open orders timeout"));
        assert_eq!(pm.state(), PositionState::Idle);
        assert_eq!(pm.direction(), PositionDirection::None);
        exchange.with(|s| {
            assert_eq!(s.calls.sells, vec![5.0]);
            assert_eq!(s.balances["BTC"], 0.0);
        });

        // Manager is usable again once the exchange recovers
        exchange.with(|s| {
            s.fail_open_orders = false;
            s.report_fill = true;
        });
        assert!(matches!(
            pm.open_long_position().await,
            Ok(OpenOutcome::Opened { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_flatten_reports_open_position() {
        let exchange = Arc::new(MockExchange::new(false));
        exchange.with(|s| s.fail_sells = true);
        let mut pm = manager(&exchange, config(true));

        let result = pm.open_long_position().await;

        assert!(matches!(result, Err(Error::Exchange(msg)) if msg == "sell rejected"));
        assert_eq!(pm.state(), PositionState::Open);
        assert_eq!(pm.direction(), PositionDirection::Long);
        assert!(pm.current_stop_price().is_none());

        exchange.with(|s| s.fail_sells = false);
        assert_ok!(pm.close_position().await);
        assert_eq!(pm.state(), PositionState::Idle);
        exchange.with(|s| assert_eq!(s.balances["BTC"], 0.0));
    }

    #[tokio::test]
    async fn test_rejected_entry_stop_flattens() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.with(|s| s.fail_stop_submits = true);
        let mut pm = manager(&exchange, config(true));

        let result = pm.open_long_position().await;

        assert!(matches!(result, Err(Error::Exchange(msg)) if msg == "stop rejected"));
        assert_eq!(pm.state(), PositionState::Idle);
        assert!(pm.current_stop_price().is_none());
        exchange.with(|s| assert_eq!(s.calls.sells, vec![5.0]));
    }

    #[tokio::test]
    async fn test_wrong_side_fill_is_not_accepted() {
        let exchange = Arc::new(MockExchange::new(false));
        exchange.with(|s| {
            s.closed.push(TradeRecord {
                datetime: Some(format_trade_datetime(Utc::now())),
                symbol: Some(SYMBOL.to_string()),
                side: Some("sell".to_string()),
                price: Some(100.0),
                amount: Some(5.0),
            })
        });
        let mut pm = manager(&exchange, config(true));

        let outcome = pm.open_long_position().await.unwrap();
        assert!(matches!(outcome, OpenOutcome::RolledBack { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_wait_rolls_back() {
        let exchange = Arc::new(MockExchange::new(false));
        let mut cfg = config(true);
        cfg.max_trade_checks = 10;
        cfg.trade_check_delay = Duration::from_secs(3600);
        let mut pm = manager(&exchange, cfg);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = pm.open_long_position_until(&cancel).await.unwrap();

        assert_eq!(
            outcome,
            OpenOutcome::RolledBack {
                reason: RollbackReason::Cancelled
            }
        );
        assert_eq!(pm.state(), PositionState::Idle);
        exchange.with(|s| {
            assert_eq!(s.calls.closed_fetches, 1);
            assert_eq!(s.calls.sells.len(), 1);
        });
    }

    #[tokio::test]
    async fn test_deadline_rolls_back() {
        let exchange = Arc::new(MockExchange::new(false));
        let mut cfg = config(true);
        cfg.max_trade_checks = 1000;
        cfg.trade_check_delay = Duration::from_millis(20);
        let mut pm = manager(&exchange, cfg);

        let outcome = pm
            .open_long_position_within(Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            OpenOutcome::RolledBack {
                reason: RollbackReason::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn test_disabled_stop_loss_keeps_position_unprotected() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut cfg = config(true);
        cfg.disable_stop_loss = true;
        let mut pm = manager(&exchange, cfg);

        let outcome = pm.open_long_position().await.unwrap();

        assert!(matches!(outcome, OpenOutcome::Opened { stop_price: None, .. }));
        assert!(pm.is_position_open());
        assert!(!pm.has_active_position().await.unwrap());
        exchange.with(|s| assert!(s.calls.stop_submits.is_empty()));
    }

    #[tokio::test]
    async fn test_empty_average_window_fails_before_buying() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = PositionManager::new(
            exchange.clone(),
            config(true),
            StopPriceStrategy::rolling_average_floor(RollingWindow::new(10), 5.0, 100),
        );

        let result = pm.open_long_position().await;
        assert!(matches!(result, Err(Error::EmptyAverageWindow)));
        assert_eq!(exchange.mutating_calls(), 0);

        pm.strategy_mut().record_average(97.0);
        let outcome = pm.open_long_position().await.unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened { stop_price: Some(p), .. } if p == 97.0));
    }

    #[tokio::test]
    async fn test_missing_asks_propagates() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.with(|s| s.book.asks.clear());
        let mut pm = manager(&exchange, config(true));

        let result = pm.open_long_position().await;
        assert!(matches!(result, Err(Error::OrderbookMissingOrders(_))));
        assert_eq!(pm.state(), PositionState::Idle);
        assert_eq!(exchange.mutating_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_quote_balance() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.with(|s| {
            s.balances.remove("USDT");
        });
        let mut pm = manager(&exchange, config(true));

        let result = pm.open_long_position().await;
        assert!(matches!(result, Err(Error::MissingBalance(asset)) if asset == "USDT"));
    }

    #[tokio::test]
    async fn test_open_requires_idle() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        assert_ok!(pm.open_long_position().await);

        let result = pm.open_long_position().await;
        assert!(matches!(result, Err(Error::NotIdle(PositionState::Open))));
    }

    #[tokio::test]
    async fn test_update_stop_same_price_is_noop() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        pm.open_long_position().await.unwrap();

        assert!(pm.update_stop_order_price(97.0).await.unwrap());
        assert!(!pm.update_stop_order_price(97.0).await.unwrap());

        assert_eq!(pm.current_stop_price(), Some(97.0));
        exchange.with(|s| {
            // Entry stop, then a single replacement
            assert_eq!(s.calls.stop_submits, vec![(5.0, 95.0), (5.0, 97.0)]);
            assert_eq!(s.calls.cancels, vec!["stop-1".to_string()]);
            assert_eq!(s.stops.len(), 1);
        });
    }

    #[tokio::test]
    async fn test_failed_stop_replace_can_be_retried() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        pm.open_long_position().await.unwrap();

        exchange.with(|s| s.fail_stop_submits = true);
        assert_err!(pm.update_stop_order_price(98.0).await);
        assert!(pm.current_stop_price().is_none());
        assert!(!pm.has_active_position().await.unwrap());

        exchange.with(|s| s.fail_stop_submits = false);
        assert!(pm.update_stop_order_price(98.0).await.unwrap());
        assert_eq!(pm.current_stop_price(), Some(98.0));
        let stops = pm.fetch_stop_orders().await.unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].price, Some(98.0));
    }

    #[tokio::test]
    async fn test_sync_position_after_exchange_side_exit() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        pm.open_long_position().await.unwrap();

        // Still holding: nothing to do
        assert!(!pm.sync_position().await.unwrap());
        assert!(pm.is_position_open());

        // Stop fired on the exchange
        exchange.with(|s| {
            s.stops.clear();
            *s.balances.get_mut("BTC").unwrap() = 0.0;
        });
        assert!(pm.sync_position().await.unwrap());
        assert_eq!(pm.state(), PositionState::Idle);
        assert_eq!(pm.direction(), PositionDirection::None);
        assert!(pm.profit_target_price().is_none());
        assert!(pm.allocated_amount().is_none());
        exchange.with(|s| assert!(s.calls.sells.is_empty()));
    }

    #[tokio::test]
    async fn test_submit_stop_without_allocation_fails() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        assert_err!(pm.submit_stop_order(90.0).await);
        assert!(pm.current_stop_price().is_none());
    }

    #[tokio::test]
    async fn test_close_stop_order_without_orders() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));

        assert_eq!(pm.close_stop_order().await.unwrap(), 0);
        exchange.with(|s| assert!(s.calls.cancels.is_empty()));
    }

    #[tokio::test]
    async fn test_close_stop_order_is_best_effort() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.add_stop("a", SYMBOL);
        exchange.add_stop("b", SYMBOL);
        exchange.add_stop("c", SYMBOL);
        exchange.with(|s| {
            s.failing_cancels.insert("b".to_string());
        });
        let mut pm = manager(&exchange, config(true));

        let cancelled = pm.close_stop_order().await.unwrap();

        assert_eq!(cancelled, 2);
        exchange.with(|s| {
            assert_eq!(s.calls.cancels, vec!["a", "b", "c"]);
            assert_eq!(s.stops.len(), 1);
        });
    }

    #[tokio::test]
    async fn test_stop_orders_filtered_by_symbol() {
        let exchange = Arc::new(MockExchange::new(true));
        exchange.add_stop("other", "ETH/USDT");
        let pm = manager(&exchange, config(true));

        assert!(pm.fetch_stop_orders().await.unwrap().is_empty());
        assert!(!pm.has_active_position().await.unwrap());

        exchange.add_stop("mine", SYMBOL);
        let stops = pm.fetch_stop_orders().await.unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].order_id, "mine");
        assert_eq!(stops[0].client_order_id, "c-mine");
        assert!(pm.has_active_position().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_position_flattens() {
        let exchange = Arc::new(MockExchange::new(true));
        let mut pm = manager(&exchange, config(true));
        pm.open_long_position().await.unwrap();

        let ack = pm.close_position().await.unwrap();

        assert_eq!(ack.amount, 5.0);
        assert_eq!(pm.state(), PositionState::Idle);
        assert_eq!(pm.direction(), PositionDirection::None);
        assert!(pm.current_stop_price().is_none());
        assert!(pm.allocated_amount().is_none());
        assert!(!pm.has_active_position().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_last_trade() {
        let exchange = Arc::new(MockExchange::new(true));
        let pm = manager(&exchange, config(true));
        assert!(pm.fetch_last_trade().await.unwrap().is_none());

        for price in [1.0, 2.0] {
            exchange.with(|s| {
                s.closed.push(TradeRecord {
                    price: Some(price),
                    ..Default::default()
                })
            });
        }
        let last = pm.fetch_last_trade().await.unwrap().unwrap();
        assert_eq!(last.price, Some(2.0));
    }

    fn balances(entries: &[(&str, f64)]) -> Balances {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_compare_balances_ignores_one_sided_assets() {
        let b1 = balances(&[("BTC", 1.0), ("ETH", 2.0)]);
        let b2 = balances(&[("BTC", 1.05)]);

        assert!(PositionManager::<MockExchange>::compare_balances(&b1, &b2, 0.1));
        assert!(!PositionManager::<MockExchange>::compare_balances(&b1, &b2, 0.01));
    }

    #[test]
    fn test_compare_balances_uses_absolute_values() {
        let b1 = balances(&[("BTC", -1.0)]);
        let b2 = balances(&[("BTC", 1.0)]);
        assert!(PositionManager::<MockExchange>::compare_balances(&b1, &b2, 0.0));
    }

    #[test]
    fn test_balances_match_uses_configured_threshold() {
        let exchange = Arc::new(MockExchange::new(true));
        let pm = manager(&exchange, config(true));
        let b1 = balances(&[("USDT", 100.0)]);
        assert!(pm.balances_match(&b1, &balances(&[("USDT", 100.05)])));
        assert!(!pm.balances_match(&b1, &balances(&[("USDT", 100.5)])));
    }
}
