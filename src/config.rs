//! Layered settings: built-in defaults, optional TOML file, then
//! `STOPGUARD__SECTION__KEY` environment variables.

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::execution::RollingWindow;
use crate::risk::StopPriceStrategy;

const DEFAULTS: &str = r#"
[position]
base_asset = "BTC"
quote_asset = "USDT"
max_quote_position = 100.0
gain_target_pct = 1.0
trading = false
disable_stop_loss = false
balance_difference_threshold = 0.1

[stop]
strategy = "percentage"
stop_loss_pct = 5.0
max_loss_pct = 5.0
window_capacity = 100
ema_period = 100

[polling]
orderbook_depth = 20
max_trade_checks = 10
trade_check_delay_ms = 1000
execution_tolerance_secs = 10
"#;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub position: PositionSettings,
    pub stop: StopSettings,
    pub polling: PollingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionSettings {
    pub base_asset: String,
    pub quote_asset: String,
    /// Max spend per entry, in quote currency
    pub max_quote_position: f64,
    pub gain_target_pct: f64,
    /// When false, entries stop right before the market buy
    pub trading: bool,
    pub disable_stop_loss: bool,
    pub balance_difference_threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopStrategyKind {
    Percentage,
    RollingAverageFloor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopSettings {
    pub strategy: StopStrategyKind,
    pub stop_loss_pct: f64,
    pub max_loss_pct: f64,
    pub window_capacity: usize,
    pub ema_period: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    pub orderbook_depth: usize,
    pub max_trade_checks: u32,
    pub trade_check_delay_ms: u64,
    pub execution_tolerance_secs: i64,
}

/// Runtime parameters of a [`crate::execution::PositionManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub base_asset: String,
    pub quote_asset: String,
    pub max_quote_position: f64,
    pub gain_target_pct: f64,
    pub trading: bool,
    pub disable_stop_loss: bool,
    pub orderbook_depth: usize,
    pub max_trade_checks: u32,
    pub trade_check_delay: Duration,
    pub execution_tolerance: chrono::TimeDelta,
    pub balance_difference_threshold: f64,
}

impl ManagerConfig {
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base_asset, self.quote_asset)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_asset: "BTC".to_string(),
            quote_asset: "USDT".to_string(),
            max_quote_position: 100.0,
            gain_target_pct: 1.0,
            trading: false,
            disable_stop_loss: false,
            orderbook_depth: 20,
            max_trade_checks: 10,
            trade_check_delay: Duration::from_secs(1),
            execution_tolerance: chrono::TimeDelta::seconds(10),
            balance_difference_threshold: 0.1,
        }
    }
}

impl Settings {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            Config::builder().add_source(File::from_str(DEFAULTS, FileFormat::Toml));
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix("STOPGUARD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with a TOML snippet (no environment)
    pub fn from_toml_str(overrides: &str) -> Result<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::from_str(overrides, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.position.max_quote_position <= 0.0 {
            return Err(Error::Config(
                "position.max_quote_position must be positive".to_string(),
            ));
        }
        let percentages = [
            ("position.gain_target_pct", self.position.gain_target_pct),
            ("stop.stop_loss_pct", self.stop.stop_loss_pct),
            ("stop.max_loss_pct", self.stop.max_loss_pct),
        ];
        for (name, value) in percentages {
            if value < 0.0 {
                return Err(Error::Config(format!("{} must not be negative", name)));
            }
        }
        if self.stop.window_capacity == 0 {
            return Err(Error::Config(
                "stop.window_capacity must be positive".to_string(),
            ));
        }
        if self.polling.execution_tolerance_secs < 0 {
            return Err(Error::Config(
                "polling.execution_tolerance_secs must not be negative".to_string(),
            ));
        }
        if self.polling.max_trade_checks == 0 {
            return Err(Error::Config(
                "polling.max_trade_checks must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            base_asset: self.position.base_asset.clone(),
            quote_asset: self.position.quote_asset.clone(),
            max_quote_position: self.position.max_quote_position,
            gain_target_pct: self.position.gain_target_pct,
            trading: self.position.trading,
            disable_stop_loss: self.position.disable_stop_loss,
            orderbook_depth: self.polling.orderbook_depth,
            max_trade_checks: self.polling.max_trade_checks,
            trade_check_delay: Duration::from_millis(self.polling.trade_check_delay_ms),
            execution_tolerance: chrono::TimeDelta::seconds(
                self.polling.execution_tolerance_secs,
            ),
            balance_difference_threshold: self.position.balance_difference_threshold,
        }
    }

    /// Build the configured strategy; the average window starts empty
    pub fn stop_strategy(&self) -> Result<StopPriceStrategy> {
        match self.stop.strategy {
            StopStrategyKind::Percentage => {
                Ok(StopPriceStrategy::percentage_below(self.stop.stop_loss_pct))
            }
            StopStrategyKind::RollingAverageFloor => Ok(StopPriceStrategy::rolling_average_floor(
                RollingWindow::try_new(self.stop.window_capacity)?,
                self.stop.max_loss_pct,
                self.stop.ema_period,
            )),
        }
    }
}
