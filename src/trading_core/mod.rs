//! Trading Core - strategy logic shared by backtest replay and live polling
//!
//! This module contains the core strategy components:
//! - Multi-timeframe candle aggregation
//! - ATR/SMA primitives
//! - Cumulative volume delta and zero-cross signals
//! - Fair Value Gap detection and lifecycle
//! - Risk sizing
//! - Trade state machine
//! - Engine orchestration and result summary

pub mod aggregator;
pub mod indicators;
pub mod volume_delta;
pub mod fvg;
pub mod risk;
pub mod state_machine;
pub mod engine;

// Re-export commonly used types
pub use aggregator::{aggregate, aggregate_anchored, CandleAggregator};
pub use indicators::{atr, sma, true_range, Atr, Sma};
pub use volume_delta::{
    compute_volume_delta, detect_signals, VolumeDeltaPoint, VolumeDeltaSignal, VolumeDeltaTracker,
};
pub use fvg::{FvgDetector, FvgInfo, FvgUpdate};
pub use risk::{check_exit, EntryPlan, RiskSizer};
pub use state_machine::{StrategyEvent, TradeStateMachine};
pub use engine::{BatchReport, StrategyEngine, TradingSummary};
