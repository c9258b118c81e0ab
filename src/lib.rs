// Core modules
pub mod config;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod risk;

// Re-export commonly used types
pub use error::{Error, Result};
pub use exchange::Exchange;
pub use execution::{OpenOutcome, PositionManager, PositionState, RollingWindow};
pub use models::*;
pub use risk::StopPriceStrategy;
