use crate::error::{Error, Result};
use crate::execution::RollingWindow;
use crate::indicators::next_ema;

/// How the protective stop price is derived from a reference price
#[derive(Debug, Clone)]
pub enum StopPriceStrategy {
    /// Fixed percentage below the reference price
    PercentageBelow { stop_loss_pct: f64 },

    /// Trailing average, floored by a hard max-loss percentage
    RollingAverageFloor {
        averages: RollingWindow<f64>,
        max_loss_pct: f64,
        ema_period: usize,
    },
}

impl StopPriceStrategy {
    pub fn percentage_below(stop_loss_pct: f64) -> Self {
        tracing::info!(stop_loss_pct, "Percentage stop strategy initialized");
        Self::PercentageBelow { stop_loss_pct }
    }

    pub fn rolling_average_floor(
        averages: RollingWindow<f64>,
        max_loss_pct: f64,
        ema_period: usize,
    ) -> Self {
        tracing::info!(
            capacity = averages.capacity(),
            samples = averages.len(),
            max_loss_pct,
            ema_period,
            "Rolling average floor stop strategy initialized"
        );
        Self::RollingAverageFloor {
            averages,
            max_loss_pct,
            ema_period,
        }
    }

    pub fn compute_stop_price(&self, reference_price: f64) -> Result<f64> {
        match self {
            Self::PercentageBelow { stop_loss_pct } => {
                Ok(reference_price - (stop_loss_pct / 100.0) * reference_price)
            }
            Self::RollingAverageFloor {
                averages,
                max_loss_pct,
                ..
            } => {
                let average = *averages.most_recent().ok_or(Error::EmptyAverageWindow)?;
                let floor = reference_price * (1.0 - max_loss_pct / 100.0);
                Ok(average.max(floor))
            }
        }
    }

    /// Fails when the strategy cannot produce a stop price yet
    pub fn ensure_ready(&self) -> Result<()> {
        match self {
            Self::PercentageBelow { .. } => Ok(()),
            Self::RollingAverageFloor { averages, .. } if averages.is_empty() => {
                Err(Error::EmptyAverageWindow)
            }
            Self::RollingAverageFloor { .. } => Ok(()),
        }
    }

    /// Push a precomputed average into the window
    ///
    /// No-op for strategies without a window.
    pub fn record_average(&mut self, value: f64) {
        if let Self::RollingAverageFloor { averages, .. } = self {
            averages.push(value);
        }
    }

    /// Advance the EMA with a new price and record the result
    pub fn record_price(&mut self, price: f64) -> Option<f64> {
        match self {
            Self::PercentageBelow { .. } => None,
            Self::RollingAverageFloor {
                averages,
                ema_period,
                ..
            } => {
                let ema = next_ema(price, averages.most_recent().copied(), *ema_period);
                averages.push(ema);
                Some(ema)
            }
        }
    }

    pub fn averages(&self) -> Option<&RollingWindow<f64>> {
        match self {
            Self::PercentageBelow { .. } => None,
            Self::RollingAverageFloor { averages, .. } => Some(averages),
        }
    }
}
