/// Calculate Simple Moving Average (SMA) over the last `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA)
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    // Start with SMA
    let initial_sma = calculate_sma(&prices[0..period], period)?;

    let mut ema = initial_sma;
    for price in &prices[period..] {
        ema = next_ema(*price, Some(ema), period);
    }

    Some(ema)
}

/// EMA weighting for the newest price
pub fn smoothing_factor(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

/// One incremental EMA step; the first price seeds the average
pub fn next_ema(price: f64, previous: Option<f64>, period: usize) -> f64 {
    match previous {
        None => price,
        Some(prev) => {
            let k = smoothing_factor(period);
            price * k + prev * (1.0 - k)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// dy/dx between two points, `None` when they share an x coordinate
pub fn slope(current: Point, previous: Point) -> Option<f64> {
    let dx = current.x - previous.x;
    if dx == 0.0 {
        return None;
    }
    Some((current.y - previous.y) / dx)
}
