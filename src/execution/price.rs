use crate::error::{Error, Result};
use crate::models::{BookSide, OrderBook};

/// Best price on one side of the book
///
/// The book is trusted to be sorted best-first, so this is the first level.
pub fn extract_side(orderbook: &OrderBook, side: BookSide) -> Result<f64> {
    tracing::debug!(%side, "Extracting best price from order book");
    orderbook
        .levels(side)
        .first()
        .map(|(price, _)| *price)
        .ok_or(Error::OrderbookMissingOrders(side))
}

pub fn best_bid(orderbook: &OrderBook) -> Result<f64> {
    extract_side(orderbook, BookSide::Bids)
}

pub fn best_ask(orderbook: &OrderBook) -> Result<f64> {
    extract_side(orderbook, BookSide::Asks)
}

/// Quantity of base asset that `balance` of quote asset buys at `price`
pub fn size_from_balance_and_price(balance: f64, price: f64) -> Result<f64> {
    if price <= 0.0 || !price.is_finite() {
        return Err(Error::NonPositivePrice(price));
    }
    Ok(balance / price)
}
