// Technical indicators feeding the rolling-average stop strategy

pub mod moving_average;

pub use moving_average::{calculate_ema, calculate_sma, next_ema, slope, smoothing_factor, Point};
