// Risk management module
pub mod stop_price;

pub use stop_price::StopPriceStrategy;
