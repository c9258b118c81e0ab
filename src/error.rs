use thiserror::Error;

use crate::execution::PositionState;
use crate::models::BookSide;

/// Errors surfaced by the position-management core
#[derive(Debug, Error)]
pub enum Error {
    /// Requested side of the order book is absent or has no levels
    #[error("order book has no {0} levels")]
    OrderbookMissingOrders(BookSide),

    /// Rolling-average stop requested before any average was recorded
    #[error("rolling average window is empty, cannot derive a stop price")]
    EmptyAverageWindow,

    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),

    #[error("exchange did not report a balance for {0}")]
    MissingBalance(String),

    /// Stop order requested while no base amount is allocated
    #[error("no allocated position to protect")]
    NoAllocatedPosition,

    #[error("position manager is {0:?}, expected Idle")]
    NotIdle(PositionState),

    #[error("exchange error: {0}")]
    Exchange(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Settings(#[from] ::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
