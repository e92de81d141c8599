use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One minute in milliseconds
pub const MINUTE_MS: i64 = 60_000;

/// OHLCV candle with aggressor-split volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket-aligned open time (ms since epoch)
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(rename = "buyVolume", alias = "vBuy", alias = "buy_volume")]
    pub buy_volume: f64,
    #[serde(rename = "sellVolume", alias = "vSell", alias = "sell_volume")]
    pub sell_volume: f64,
}

impl Candle {
    /// Per-bar volume delta (buy - sell)
    pub fn delta(&self) -> f64 {
        self.buy_volume - self.sell_volume
    }

    pub fn total_volume(&self) -> f64 {
        self.buy_volume + self.sell_volume
    }

    /// Bullish bars include dojis (open <= close)
    pub fn is_bullish(&self) -> bool {
        self.open <= self.close
    }

    /// Checks the OHLC envelope and volume sign
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        prices.iter().all(|p| p.is_finite())
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.buy_volume >= 0.0
            && self.sell_volume >= 0.0
    }
}

/// Candle folded from finer candles, carrying intra-bucket CVD extremes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCandle {
    #[serde(flatten)]
    pub candle: Candle,
    /// Cumulative delta carried into the bucket (0 unless anchored)
    #[serde(rename = "openVolumeDelta")]
    pub open_volume_delta: f64,
    #[serde(rename = "maxVolumeDelta")]
    pub max_volume_delta: f64,
    #[serde(rename = "minVolumeDelta")]
    pub min_volume_delta: f64,
    #[serde(rename = "closeVolumeDelta")]
    pub close_volume_delta: f64,
    /// Number of finer candles folded into this bucket
    pub constituents: usize,
}

/// Position side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Direction of a CVD zero-cross
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Bullish,
    Bearish,
}

impl SignalDirection {
    pub fn side(self) -> Side {
        match self {
            SignalDirection::Bullish => Side::Long,
            SignalDirection::Bearish => Side::Short,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            SignalDirection::Bullish => SignalDirection::Bearish,
            SignalDirection::Bearish => SignalDirection::Bullish,
        }
    }
}

impl std::fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalDirection::Bullish => write!(f, "BULLISH"),
            SignalDirection::Bearish => write!(f, "BEARISH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "STOP_LOSS"),
            ExitReason::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// Open position, owned by the state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub side: Side,
    pub entry_price: f64,
    /// Base-asset units
    pub size: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub entry_time: i64,
    /// Gap that confirmed the entry
    pub source_fvg: crate::trading_core::FvgInfo,
}

/// Closed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub side: Side,
    pub size: f64,
    pub entry_time: i64,
    pub entry_price: f64,
    pub exit_time: i64,
    pub exit_price: f64,
    pub pnl: f64,
    pub exit_reason: ExitReason,
    pub resulting_capital: f64,
}

/// Strategy phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyPhase {
    /// Waiting for a CVD zero-cross
    WaitingForSignal,
    /// Direction known, waiting for a confirming gap
    WaitingForFvg,
    /// Gap confirmed, sizing the entry (resolved within the same bar)
    EnterPosition,
    /// Position open, monitoring stop and target
    EntryTaken,
}

impl std::fmt::Display for StrategyPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyPhase::WaitingForSignal => write!(f, "WAITING_SIGNAL"),
            StrategyPhase::WaitingForFvg => write!(f, "WAITING_FVG"),
            StrategyPhase::EnterPosition => write!(f, "ENTER"),
            StrategyPhase::EntryTaken => write!(f, "IN_TRADE"),
        }
    }
}

/// Rolling view of the strategy after a processed bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub phase: StrategyPhase,
    pub capital: f64,
    #[serde(rename = "openPosition")]
    pub open_position: Option<Position>,
    pub pending_direction: Option<Side>,
    /// Timestamp of the last processed chart bar
    pub last_bar_time: Option<i64>,
    pub halted: bool,
    /// Running CVD of the current anchor period
    pub cumulative_delta: f64,
    /// Last closed anchor-period bar
    pub period_summary: Option<AggregatedCandle>,
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_deserializes_legacy_field_names() {
        let json = r#"{"timestamp":60000,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"vBuy":3.0,"vSell":1.0}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(candle.buy_volume, 3.0);
        assert_eq!(candle.delta(), 2.0);
        assert!(candle.is_well_formed());
    }

    #[test]
    fn test_malformed_candle() {
        let candle = Candle {
            timestamp: 0,
            open: 10.0,
            high: 9.0,
            low: 8.0,
            close: 9.5,
            buy_volume: 1.0,
            sell_volume: 1.0,
        };
        assert!(!candle.is_well_formed());
    }

    #[test]
    fn test_signal_direction_maps_to_side() {
        assert_eq!(SignalDirection::Bullish.side(), Side::Long);
        assert_eq!(SignalDirection::Bearish.opposite(), SignalDirection::Bullish);
    }
}
