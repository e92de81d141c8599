//! Multi-timeframe strategy engine
//!
//! Takes raw lower-timeframe candles, folds them into chart and anchor
//! timeframe bars and drives the trade state machine with each closed chart
//! bar. Shared by backtest replay and live polling.

use serde::Serialize;
use tracing::{debug, warn};

use super::aggregator::CandleAggregator;
use super::state_machine::{StrategyEvent, TradeStateMachine};
use crate::config::StrategyConfig;
use crate::error::{StrategyError, StrategyResult};
use crate::types::{AggregatedCandle, Candle, StrategySnapshot, Trade};

/// Outcome of feeding a batch of raw candles
#[derive(Debug, Default)]
pub struct BatchReport {
    pub events: Vec<StrategyEvent>,
    /// Raw candles accepted
    pub processed: usize,
    /// Raw candles skipped as duplicate, out of order or malformed
    pub skipped: usize,
    /// Fatal error that stopped the batch
    pub fatal: Option<StrategyError>,
}

pub struct StrategyEngine {
    config: StrategyConfig,
    chart: CandleAggregator,
    anchor: CandleAggregator,
    machine: TradeStateMachine,
    /// Last raw candle timestamp accepted
    watermark: Option<i64>,
    last_period: Option<AggregatedCandle>,
    chart_bars: usize,
}

impl StrategyEngine {
    pub fn new(config: StrategyConfig) -> StrategyResult<Self> {
        let machine = TradeStateMachine::new(&config)?;
        let chart = CandleAggregator::new(i64::from(config.chart_tf))?
            .with_delta_anchor(i64::from(config.anchor_period))?;
        let anchor = CandleAggregator::new(i64::from(config.anchor_period))?;
        Ok(Self {
            config,
            chart,
            anchor,
            machine,
            watermark: None,
            last_period: None,
            chart_bars: 0,
        })
    }

    /// Feed one raw candle. Returns the events of the chart bar it closed,
    /// if any.
    pub fn process_candle(&mut self, candle: &Candle) -> StrategyResult<Vec<StrategyEvent>> {
        if self.machine.is_halted() {
            return Err(StrategyError::Halted);
        }
        if let Some(watermark) = self.watermark {
            if candle.timestamp <= watermark {
                return Err(StrategyError::OutOfOrderCandle {
                    timestamp: candle.timestamp,
                    watermark,
                });
            }
        }
        if !candle.is_well_formed() {
            return Err(StrategyError::MalformedCandle {
                timestamp: candle.timestamp,
            });
        }
        self.watermark = Some(candle.timestamp);

        if let Some(period) = self.anchor.push(candle) {
            debug!(
                "Anchor period {} closed | CVD {:.2} (hi {:.2}, lo {:.2})",
                period.candle.timestamp,
                period.close_volume_delta,
                period.max_volume_delta,
                period.min_volume_delta
            );
            self.last_period = Some(period);
        }

        match self.chart.push(candle) {
            Some(bar) => self.on_chart_bar(&bar),
            None => Ok(Vec::new()),
        }
    }

    fn on_chart_bar(&mut self, bar: &AggregatedCandle) -> StrategyResult<Vec<StrategyEvent>> {
        self.chart_bars += 1;
        debug!(
            "Chart bar {} | O {:.2} H {:.2} L {:.2} C {:.2} | CVD open {:.2} close {:.2}",
            bar.candle.timestamp,
            bar.candle.open,
            bar.candle.high,
            bar.candle.low,
            bar.candle.close,
            bar.open_volume_delta,
            bar.close_volume_delta
        );
        self.machine.on_bar(&bar.candle)
    }

    /// Feed candles in order. Recoverable errors skip the candle; a fatal
    /// error stops the batch and is reported in `fatal`.
    pub fn process_batch(&mut self, candles: &[Candle]) -> BatchReport {
        let mut report = BatchReport::default();
        for candle in candles {
            match self.process_candle(candle) {
                Ok(events) => {
                    report.processed += 1;
                    report.events.extend(events);
                }
                Err(err) if err.is_fatal() => {
                    report.fatal = Some(err);
                    break;
                }
                Err(StrategyError::OutOfOrderCandle { timestamp, watermark }) => {
                    debug!("Skipping candle at {} (watermark {})", timestamp, watermark);
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!("Candle at {} not processed: {}", candle.timestamp, err);
                    report.skipped += 1;
                }
            }
        }
        report
    }

    /// Close the partially built chart bar and process it (end of history)
    pub fn flush(&mut self) -> StrategyResult<Vec<StrategyEvent>> {
        if let Some(period) = self.anchor.flush() {
            self.last_period = Some(period);
        }
        match self.chart.flush() {
            Some(bar) if !self.machine.is_halted() => self.on_chart_bar(&bar),
            _ => Ok(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            period_summary: self.last_period,
            ..self.machine.snapshot()
        }
    }

    pub fn trades(&self) -> &[Trade] {
        self.machine.trades()
    }

    pub fn summary(&self) -> TradingSummary {
        TradingSummary::from_trades(self.machine.trades(), self.config.initial_capital)
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn chart_bars(&self) -> usize {
        self.chart_bars
    }

    pub fn is_halted(&self) -> bool {
        self.machine.is_halted()
    }
}

/// Summary of trading results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradingSummary {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Largest peak-to-trough capital drop
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub return_percent: f64,
}

impl TradingSummary {
    pub fn from_trades(trades: &[Trade], initial_capital: f64) -> Self {
        let mut wins = 0u32;
        let mut losses = 0u32;
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;
        let mut win_streak = 0u32;
        let mut loss_streak = 0u32;
        let mut max_consecutive_wins = 0u32;
        let mut max_consecutive_losses = 0u32;

        let mut capital = initial_capital;
        let mut peak = initial_capital;
        let mut max_drawdown = 0.0f64;
        let mut max_drawdown_percent = 0.0f64;

        for trade in trades {
            if trade.pnl > 0.0 {
                wins += 1;
                gross_profit += trade.pnl;
                win_streak += 1;
                loss_streak = 0;
                max_consecutive_wins = max_consecutive_wins.max(win_streak);
            } else {
                losses += 1;
                gross_loss += trade.pnl.abs();
                loss_streak += 1;
                win_streak = 0;
                max_consecutive_losses = max_consecutive_losses.max(loss_streak);
            }

            capital += trade.pnl;
            peak = peak.max(capital);
            let drawdown = peak - capital;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
                max_drawdown_percent = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
            }
        }

        let total = trades.len() as u32;
        let win_rate = if total > 0 {
            wins as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let avg_win = if wins > 0 { gross_profit / wins as f64 } else { 0.0 };
        let avg_loss = if losses > 0 {
            -(gross_loss / losses as f64)
        } else {
            0.0
        };
        let final_capital = trades
            .last()
            .map(|t| t.resulting_capital)
            .unwrap_or(initial_capital);
        let return_percent = if initial_capital > 0.0 {
            (final_capital - initial_capital) / initial_capital * 100.0
        } else {
            0.0
        };

        Self {
            total_trades: total,
            wins,
            losses,
            win_rate,
            gross_profit,
            gross_loss,
            profit_factor,
            avg_win,
            avg_loss,
            max_drawdown,
            max_drawdown_percent,
            max_consecutive_wins,
            max_consecutive_losses,
            initial_capital,
            final_capital,
            return_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side, StrategyPhase, MINUTE_MS};
    use uuid::Uuid;

    fn minute(i: i64, price: f64, buy: f64, sell: f64) -> Candle {
        Candle {
            timestamp: i * MINUTE_MS,
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price + 0.25,
            buy_volume: buy,
            sell_volume: sell,
        }
    }

    fn trade(pnl: f64, capital: f64) -> Trade {
        Trade {
            id: Uuid::new_v4(),
            side: Side::Long,
            size: 1.0,
            entry_time: 0,
            entry_price: 100.0,
            exit_time: MINUTE_MS,
            exit_price: 100.0 + pnl,
            pnl,
            exit_reason: if pnl > 0.0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
            resulting_capital: capital,
        }
    }

    #[test]
    fn test_chart_bars_close_on_boundary() {
        let mut engine = StrategyEngine::new(StrategyConfig::default()).unwrap();
        for i in 0..7 {
            engine.process_candle(&minute(i, 100.0, 2.0, 1.0)).unwrap();
        }
        // 3m buckets [0,3) and [3,6) closed, [6,9) still open
        assert_eq!(engine.chart_bars(), 2);
        assert_eq!(engine.snapshot().last_bar_time, Some(3 * MINUTE_MS));

        engine.flush().unwrap();
        assert_eq!(engine.chart_bars(), 3);
    }

    #[test]
    fn test_duplicate_candle_skipped() {
        let mut engine = StrategyEngine::new(StrategyConfig::default()).unwrap();
        let candles: Vec<Candle> = (0..10).map(|i| minute(i, 100.0, 2.0, 1.0)).collect();
        engine.process_batch(&candles);
        let before = engine.snapshot();

        let report = engine.process_batch(&[candles[9], candles[4]]);
        assert_eq!(report.processed, 0);
        assert_eq!(report.skipped, 2);
        assert!(report.fatal.is_none());
        assert_eq!(engine.snapshot(), before);
        assert_eq!(engine.watermark(), Some(9 * MINUTE_MS));
    }

    #[test]
    fn test_malformed_candle_skipped() {
        let mut engine = StrategyEngine::new(StrategyConfig::default()).unwrap();
        let mut candles: Vec<Candle> = (0..16).map(|i| minute(i, 100.0, 3.0, 1.0)).collect();
        candles[4].close = f64::NAN;

        let report = engine.process_batch(&candles);
        assert_eq!(report.processed, 15);
        assert_eq!(report.skipped, 1);
        assert!(report.fatal.is_none());

        // The bucket holding the bad candle still closes
        assert_eq!(engine.chart_bars(), 5);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.last_bar_time, Some(12 * MINUTE_MS));
        assert_eq!(snapshot.cumulative_delta, 28.0);

        let period = snapshot.period_summary.unwrap();
        assert_eq!(period.constituents, 14);
        assert_eq!(period.close_volume_delta, 28.0);
        assert!(period.candle.close.is_finite());
    }

    #[test]
    fn test_period_summary_in_snapshot() {
        let mut engine = StrategyEngine::new(StrategyConfig::default()).unwrap();
        let candles: Vec<Candle> = (0..16).map(|i| minute(i, 100.0, 3.0, 1.0)).collect();
        engine.process_batch(&candles);

        let snapshot = engine.snapshot();
        let period = snapshot.period_summary.unwrap();
        assert_eq!(period.candle.timestamp, 0);
        assert_eq!(period.constituents, 15);
        assert_eq!(period.close_volume_delta, 30.0);
        assert_eq!(snapshot.phase, StrategyPhase::WaitingForFvg);
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = StrategyConfig {
            chart_tf: 15,
            anchor_period: 15,
            ..StrategyConfig::default()
        };
        assert!(matches!(
            StrategyEngine::new(config),
            Err(StrategyError::Configuration(_))
        ));
    }

    #[test]
    fn test_summary_statistics() {
        let trades = vec![
            trade(100.0, 10_100.0),
            trade(50.0, 10_150.0),
            trade(-200.0, 9_950.0),
            trade(-30.0, 9_920.0),
            trade(-20.0, 9_900.0),
            trade(80.0, 9_980.0),
        ];
        let s = TradingSummary::from_trades(&trades, 10_000.0);
        assert_eq!(s.total_trades, 6);
        assert_eq!(s.wins, 3);
        assert_eq!(s.losses, 3);
        assert!((s.win_rate - 50.0).abs() < 1e-9);
        assert!((s.profit_factor - 230.0 / 250.0).abs() < 1e-9);
        assert_eq!(s.max_consecutive_wins, 2);
        assert_eq!(s.max_consecutive_losses, 3);
        assert!((s.max_drawdown - 250.0).abs() < 1e-9);
        assert!((s.final_capital - 9_980.0).abs() < 1e-9);
        assert!((s.return_percent + 0.2).abs() < 1e-9);
        assert!((s.avg_loss + 250.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary() {
        let s = TradingSummary::from_trades(&[], 10_000.0);
        assert_eq!(s.total_trades, 0);
        assert_eq!(s.profit_factor, 0.0);
        assert_eq!(s.final_capital, 10_000.0);
        assert_eq!(s.return_percent, 0.0);
    }
}
