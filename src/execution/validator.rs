use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use std::fmt;

use crate::models::{OrderSide, TradeRecord};

/// Timestamp layout used by the exchange for trade reports
pub const TRADE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Max gap between order submission and the reported fill
pub const DEFAULT_EXECUTION_TOLERANCE_SECS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeField {
    Datetime,
    Symbol,
    Side,
    Price,
}

impl fmt::Display for TradeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TradeField::Datetime => "datetime",
            TradeField::Symbol => "symbol",
            TradeField::Side => "side",
            TradeField::Price => "price",
        };
        f.write_str(name)
    }
}

/// Why a reported fill was not accepted
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionRejection {
    NoTrade,
    MissingField(TradeField),
    UnparseableTimestamp(String),
    Stale { delta: TimeDelta },
    SymbolMismatch { expected: String, actual: String },
    SideMismatch { expected: String, actual: String },
}

impl fmt::Display for ExecutionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionRejection::NoTrade => write!(f, "no trade reported"),
            ExecutionRejection::MissingField(field) => write!(f, "missing {}", field),
            ExecutionRejection::UnparseableTimestamp(raw) => {
                write!(f, "unparseable datetime {:?}", raw)
            }
            ExecutionRejection::Stale { delta } => {
                write!(f, "fill reported {}ms after submission", delta.num_milliseconds())
            }
            ExecutionRejection::SymbolMismatch { expected, actual } => {
                write!(f, "symbol {} (expected {})", actual, expected)
            }
            ExecutionRejection::SideMismatch { expected, actual } => {
                write!(f, "side {} (expected {})", actual, expected)
            }
        }
    }
}

/// Decides whether a reported trade fill can be trusted
#[derive(Debug, Clone)]
pub struct ExecutionValidator {
    tolerance: TimeDelta,
}

impl Default for ExecutionValidator {
    fn default() -> Self {
        Self::new(TimeDelta::seconds(DEFAULT_EXECUTION_TOLERANCE_SECS))
    }
}

impl ExecutionValidator {
    pub fn new(tolerance: TimeDelta) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }

    /// Check a fill against the expected symbol and side
    ///
    /// Only fills dated more than the tolerance *after* submission are
    /// rejected on timing; earlier fills always pass that check.
    pub fn check(
        &self,
        trade: Option<&TradeRecord>,
        submitted_at: DateTime<Utc>,
        symbol: &str,
        side: &str,
    ) -> Result<(), ExecutionRejection> {
        let trade = trade.ok_or(ExecutionRejection::NoTrade)?;

        let raw_dt = trade
            .datetime
            .as_deref()
            .ok_or(ExecutionRejection::MissingField(TradeField::Datetime))?;
        let trade_dt = parse_trade_datetime(raw_dt)
            .ok_or_else(|| ExecutionRejection::UnparseableTimestamp(raw_dt.to_string()))?;
        let delta = trade_dt - submitted_at;
        if delta > self.tolerance {
            return Err(ExecutionRejection::Stale { delta });
        }

        let trade_symbol = trade
            .symbol
            .as_deref()
            .ok_or(ExecutionRejection::MissingField(TradeField::Symbol))?;
        if !trade_symbol.eq_ignore_ascii_case(symbol) {
            return Err(ExecutionRejection::SymbolMismatch {
                expected: symbol.to_string(),
                actual: trade_symbol.to_string(),
            });
        }

        let trade_side = trade
            .side
            .as_deref()
            .ok_or(ExecutionRejection::MissingField(TradeField::Side))?;
        if !trade_side.eq_ignore_ascii_case(side) {
            return Err(ExecutionRejection::SideMismatch {
                expected: side.to_string(),
                actual: trade_side.to_string(),
            });
        }

        if trade.price.is_none() {
            return Err(ExecutionRejection::MissingField(TradeField::Price));
        }

        Ok(())
    }

    pub fn is_valid_execution(
        &self,
        trade: Option<&TradeRecord>,
        submitted_at: DateTime<Utc>,
        symbol: &str,
        side: &str,
    ) -> bool {
        match self.check(trade, submitted_at, symbol, side) {
            Ok(()) => true,
            Err(rejection) => {
                tracing::error!(%symbol, %side, reason = %rejection, "Last trade invalid");
                false
            }
        }
    }

    pub fn is_valid_buy_execution(
        &self,
        trade: Option<&TradeRecord>,
        submitted_at: DateTime<Utc>,
        symbol: &str,
    ) -> bool {
        self.is_valid_execution(trade, submitted_at, symbol, OrderSide::Buy.as_str())
    }
}

fn parse_trade_datetime(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TRADE_DATETIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Render a UTC timestamp the way trade reports carry it
pub fn format_trade_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
