//! Backtest replay
//!
//! Feeds a historical candle series through the engine in one tight loop,
//! closing the final partial chart bar at the end.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::error::StrategyError;
use crate::storage::{load_candles, TradeLogger};
use crate::trading_core::{StrategyEngine, TradingSummary};
use crate::types::{ms_to_datetime, Candle, StrategySnapshot, Trade};

/// Everything a backtest produced
#[derive(Debug)]
pub struct BacktestReport {
    pub summary: TradingSummary,
    pub trades: Vec<Trade>,
    pub snapshot: StrategySnapshot,
    pub candles_processed: usize,
    pub candles_skipped: usize,
    pub chart_bars: usize,
    /// Set when the circuit breaker stopped the run
    pub halted_by: Option<StrategyError>,
}

/// Run a backtest over `candles`, optionally appending trades to a CSV log
pub fn run_backtest(
    config: StrategyConfig,
    candles: &[Candle],
    trade_log: Option<&Path>,
) -> Result<BacktestReport> {
    info!("=== BACKTEST ===");
    info!(
        "Chart TF: {}m | Anchor: {}m | Capital: {:.2}",
        config.chart_tf, config.anchor_period, config.initial_capital
    );
    if let (Some(first), Some(last)) = (candles.first(), candles.last()) {
        info!(
            "Replaying {} candles: {} -> {}",
            candles.len(),
            ms_to_datetime(first.timestamp),
            ms_to_datetime(last.timestamp)
        );
    }

    let mut engine = StrategyEngine::new(config).context("Invalid strategy configuration")?;
    let mut report = engine.process_batch(candles);

    let mut halted_by = report.fatal.take();
    if halted_by.is_none() {
        match engine.flush() {
            Ok(events) => report.events.extend(events),
            Err(err) if err.is_fatal() => halted_by = Some(err),
            Err(err) => warn!("Final bar not processed: {}", err),
        }
    }
    if let Some(err) = &halted_by {
        warn!("Backtest halted: {}", err);
    }

    let trades = engine.trades().to_vec();
    if let Some(path) = trade_log {
        let mut logger = TradeLogger::new(path)?;
        for trade in &trades {
            logger.log_trade(trade)?;
        }
        info!("Logged {} trades to {:?}", trades.len(), path);
    }

    info!(
        "Processed {} candles into {} chart bars ({} skipped)",
        report.processed,
        engine.chart_bars(),
        report.skipped
    );

    Ok(BacktestReport {
        summary: engine.summary(),
        trades,
        snapshot: engine.snapshot(),
        candles_processed: report.processed,
        candles_skipped: report.skipped,
        chart_bars: engine.chart_bars(),
        halted_by,
    })
}

/// Load a candle file and backtest it
pub fn run_backtest_file(
    config: StrategyConfig,
    path: &Path,
    trade_log: Option<&Path>,
) -> Result<BacktestReport> {
    info!("Loading candles from {:?}...", path);
    let candles = load_candles(path)?;
    info!("Loaded {} candles", candles.len());
    run_backtest(config, &candles, trade_log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskTier;
    use crate::synthetic::{generate_candles, SyntheticConfig};

    fn reference_config() -> StrategyConfig {
        StrategyConfig {
            chart_tf: 3,
            anchor_period: 15,
            atr_len: 10,
            atr_len_cvds: 50,
            dynamic_rr: 0.57,
            sl_multiplier: RiskTier::Normal,
            risk_per_trade: 10.0,
            initial_capital: 10_000.0,
            ..StrategyConfig::default()
        }
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let candles = generate_candles(&SyntheticConfig::default()).unwrap();

        let first = run_backtest(reference_config(), &candles, None).unwrap();
        let second = run_backtest(reference_config(), &candles, None).unwrap();

        assert_eq!(first.trades, second.trades);
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.snapshot, second.snapshot);
        assert_eq!(first.candles_processed, 1000);
        // 1000 minutes into 3m buckets, the last one closed by flush
        assert_eq!(first.chart_bars, 334);
    }

    #[test]
    fn test_capital_accounting() {
        let candles = generate_candles(&SyntheticConfig {
            count: 3000,
            seed: 11,
            ..SyntheticConfig::default()
        })
        .unwrap();
        let report = run_backtest(reference_config(), &candles, None).unwrap();

        let pnl: f64 = report.trades.iter().map(|t| t.pnl).sum();
        assert!((report.snapshot.capital - (10_000.0 + pnl)).abs() < 1e-6);
        assert_eq!(report.summary.total_trades as usize, report.trades.len());
        for trade in &report.trades {
            assert!(trade.exit_time > trade.entry_time);
            assert!(trade.size > 0.0);
        }
        for pair in report.trades.windows(2) {
            assert!(pair[1].entry_time >= pair[0].exit_time);
        }
    }

    #[test]
    fn test_invalid_config_fails_before_replay() {
        let config = StrategyConfig {
            dynamic_rr: 0.0,
            ..StrategyConfig::default()
        };
        assert!(run_backtest(config, &[], None).is_err());
    }

    #[test]
    fn test_trade_log_written() {
        let candles = generate_candles(&SyntheticConfig {
            count: 3000,
            seed: 11,
            ..SyntheticConfig::default()
        })
        .unwrap();
        let path = std::env::temp_dir()
            .join(format!("cvd-fvg-trades-{}.csv", uuid::Uuid::new_v4()));
        let report = run_backtest(reference_config(), &candles, Some(&path)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        // Header is written with the first trade
        let expected = if report.trades.is_empty() {
            0
        } else {
            report.trades.len() + 1
        };
        assert_eq!(contents.lines().count(), expected);
    }
}
