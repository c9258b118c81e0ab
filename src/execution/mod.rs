// Position lifecycle and the pieces it consults synchronously
pub mod position_manager;
pub mod price;
pub mod rolling_window;
pub mod validator;

pub use position_manager::{OpenOutcome, PositionManager, PositionState, RollbackReason};
pub use price::{best_ask, best_bid, extract_side, size_from_balance_and_price};
pub use rolling_window::RollingWindow;
pub use validator::{ExecutionRejection, ExecutionValidator, TradeField};
