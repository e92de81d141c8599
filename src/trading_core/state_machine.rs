//! Trade lifecycle state machine
//!
//! State transitions:
//! ```text
//! WAITING_SIGNAL --[CVD zero-cross]--> WAITING_FVG
//! WAITING_FVG --[gap in signal direction]--> ENTER --[sized]--> IN_TRADE
//! WAITING_FVG --[opposite zero-cross]--> WAITING_SIGNAL (aborted)
//! ENTER --[unusable stop/size]--> WAITING_FVG
//! IN_TRADE --[stop or target hit]--> WAITING_SIGNAL
//! ```
//!
//! Every chart bar feeds the CVD tracker, the gap detector and the risk ATR,
//! whatever the phase, so indicator state never depends on trade state.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::fvg::{FvgDetector, FvgInfo};
use super::indicators::Atr;
use super::risk::{check_exit, RiskSizer};
use super::volume_delta::{VolumeDeltaSignal, VolumeDeltaTracker};
use crate::config::StrategyConfig;
use crate::error::{StrategyError, StrategyResult};
use crate::types::{Candle, Position, SignalDirection, StrategyPhase, StrategySnapshot, Trade};

/// Something that happened while processing a bar
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    /// CVD zero-cross adopted as the pending direction
    Signal(VolumeDeltaSignal),
    /// Pending direction dropped on an opposite zero-cross
    SignalAborted {
        pending: SignalDirection,
        signal: VolumeDeltaSignal,
    },
    FvgFormed(FvgInfo),
    FvgInvalidated(FvgInfo),
    /// Confirmed entry that could not be sized
    EntryRejected { reason: String },
    PositionOpened(Position),
    PositionClosed(Trade),
}

pub struct TradeStateMachine {
    sizer: RiskSizer,
    capital_limit: f64,
    tracker: VolumeDeltaTracker,
    detector: FvgDetector,
    risk_atr: Atr,

    phase: StrategyPhase,
    pending: Option<SignalDirection>,
    position: Option<Position>,
    capital: f64,
    trades: Vec<Trade>,
    halted: bool,
    last_bar_time: Option<i64>,
    bars_processed: usize,
    entries: u64,
}

impl TradeStateMachine {
    pub fn new(config: &StrategyConfig) -> StrategyResult<Self> {
        config.validate()?;
        Ok(Self {
            sizer: RiskSizer::new(config),
            capital_limit: config.capital_limit(),
            tracker: VolumeDeltaTracker::new(i64::from(config.anchor_period))?,
            detector: FvgDetector::new(config),
            risk_atr: Atr::new(config.atr_len_cvds),
            phase: StrategyPhase::WaitingForSignal,
            pending: None,
            position: None,
            capital: config.initial_capital,
            trades: Vec::new(),
            halted: false,
            last_bar_time: None,
            bars_processed: 0,
            entries: 0,
        })
    }

    /// Process one closed chart bar.
    ///
    /// Stale bars are rejected with `OutOfOrderCandle` before any state
    /// changes. Tripping the circuit breaker records the closing trade and
    /// then returns `CapitalLimitExceeded`; every later bar gets `Halted`.
    pub fn on_bar(&mut self, bar: &Candle) -> StrategyResult<Vec<StrategyEvent>> {
        if self.halted {
            return Err(StrategyError::Halted);
        }
        if let Some(watermark) = self.last_bar_time {
            if bar.timestamp <= watermark {
                return Err(StrategyError::OutOfOrderCandle {
                    timestamp: bar.timestamp,
                    watermark,
                });
            }
        }
        if !bar.is_well_formed() {
            warn!("Skipping malformed bar at {}: {:?}", bar.timestamp, bar);
            return Ok(Vec::new());
        }

        let (point, signal) = self.tracker.update(bar)?;
        let fvg = self.detector.update(bar);
        let risk_atr = self.risk_atr.update(bar);
        self.last_bar_time = Some(bar.timestamp);
        self.bars_processed += 1;

        debug!(
            "Bar {} | close {:.2} | CVD {:.2} | phase {}",
            bar.timestamp, bar.close, point.last_volume, self.phase
        );

        let mut events: Vec<StrategyEvent> = fvg
            .invalidated
            .iter()
            .cloned()
            .map(StrategyEvent::FvgInvalidated)
            .collect();
        if let Some(gap) = &fvg.formed {
            events.push(StrategyEvent::FvgFormed(gap.clone()));
        }

        if self.phase == StrategyPhase::EntryTaken {
            // Positions are monitored from the bar after entry
            if let Some(trade) = self.monitor_position(bar) {
                events.push(StrategyEvent::PositionClosed(trade));
                self.check_circuit_breaker()?;
            }
            return Ok(events);
        }

        let mut fresh_signal = false;
        if self.phase == StrategyPhase::WaitingForSignal {
            if let Some(signal) = signal {
                info!(
                    "SIGNAL: CVD {} @ {} | delta {:.2}",
                    signal.direction, signal.timestamp, signal.triggering_delta
                );
                self.pending = Some(signal.direction);
                self.phase = StrategyPhase::WaitingForFvg;
                fresh_signal = true;
                events.push(StrategyEvent::Signal(signal));
            }
        }

        if self.phase == StrategyPhase::WaitingForFvg {
            let pending = match self.pending {
                Some(direction) => direction,
                None => {
                    self.phase = StrategyPhase::WaitingForSignal;
                    return Ok(events);
                }
            };

            let confirming = fvg.formed.filter(|gap| gap.direction() == pending);
            if let Some(gap) = confirming {
                self.phase = StrategyPhase::EnterPosition;
                match self.enter(bar, pending, gap, risk_atr) {
                    Ok(position) => events.push(StrategyEvent::PositionOpened(position)),
                    Err(err) => events.push(StrategyEvent::EntryRejected {
                        reason: err.to_string(),
                    }),
                }
            } else if let Some(signal) =
                signal.filter(|s| !fresh_signal && s.direction != pending)
            {
                info!("ABORT: {} setup cancelled by {} CVD cross", pending, signal.direction);
                self.pending = None;
                self.phase = StrategyPhase::WaitingForSignal;
                events.push(StrategyEvent::SignalAborted { pending, signal });
            }
        }

        Ok(events)
    }

    fn enter(
        &mut self,
        bar: &Candle,
        direction: SignalDirection,
        gap: FvgInfo,
        atr: f64,
    ) -> StrategyResult<Position> {
        let side = direction.side();
        if let Err(err) = self.risk_atr.ready_value() {
            debug!("Sizing at {} before the risk ATR is ready: {}", bar.timestamp, err);
        }
        let plan = match self.sizer.plan(side, bar.close, atr, self.capital) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("Entry rejected at {}: {}", bar.timestamp, err);
                self.phase = StrategyPhase::WaitingForFvg;
                return Err(err);
            }
        };

        self.entries += 1;
        // Ids depend only on the input series
        let id = Uuid::from_u64_pair(bar.timestamp as u64, self.entries);
        let position = Position {
            id,
            side,
            entry_price: plan.entry_price,
            size: plan.size,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
            entry_time: bar.timestamp,
            source_fvg: gap,
        };

        info!(
            "ENTRY: {} @ {:.2} | Size: {:.4} | Stop: {:.2} | Target: {:.2}",
            side, position.entry_price, position.size, position.stop_loss, position.take_profit
        );

        self.position = Some(position.clone());
        self.pending = None;
        self.phase = StrategyPhase::EntryTaken;
        Ok(position)
    }

    fn monitor_position(&mut self, bar: &Candle) -> Option<Trade> {
        let position = self.position.as_ref()?;
        let (reason, exit_price) = check_exit(position, bar.high, bar.low)?;

        let pnl = self.sizer.realize(position, exit_price, self.capital);
        self.capital += pnl;

        let trade = Trade {
            id: position.id,
            side: position.side,
            size: position.size,
            entry_time: position.entry_time,
            entry_price: position.entry_price,
            exit_time: bar.timestamp,
            exit_price,
            pnl,
            exit_reason: reason,
            resulting_capital: self.capital,
        };

        info!(
            "EXIT {}: {} @ {:.2} | P&L: {:+.2} | Capital: {:.2}",
            reason, trade.side, exit_price, pnl, self.capital
        );

        self.position = None;
        self.phase = StrategyPhase::WaitingForSignal;
        self.trades.push(trade.clone());
        Some(trade)
    }

    fn check_circuit_breaker(&mut self) -> StrategyResult<()> {
        if self.capital > self.capital_limit {
            self.halted = true;
            warn!(
                "CIRCUIT BREAKER: capital {:.2} exceeded limit {:.2}, halting",
                self.capital, self.capital_limit
            );
            return Err(StrategyError::CapitalLimitExceeded {
                capital: self.capital,
                limit: self.capital_limit,
            });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        StrategySnapshot {
            phase: self.phase,
            capital: self.capital,
            open_position: self.position.clone(),
            pending_direction: self.pending.map(SignalDirection::side),
            last_bar_time: self.last_bar_time,
            halted: self.halted,
            cumulative_delta: self.tracker.cumulative(),
            period_summary: None,
        }
    }

    pub fn phase(&self) -> StrategyPhase {
        self.phase
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    /// Closed trades in exit order
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn last_bar_time(&self) -> Option<i64> {
        self.last_bar_time
    }

    pub fn bars_processed(&self) -> usize {
        self.bars_processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BarsType, FvgSensitivity, RiskTier};
    use crate::types::{ExitReason, Side, MINUTE_MS};

    fn config() -> StrategyConfig {
        StrategyConfig {
            anchor_period: 1440,
            atr_len: 3,
            atr_len_cvds: 3,
            fvg_sensitivity: FvgSensitivity::All,
            sl_multiplier: RiskTier::Lowest,
            bars_type: BarsType::All,
            allow_gaps: true,
            ..StrategyConfig::default()
        }
    }

    fn bar(i: i64, open: f64, high: f64, low: f64, close: f64, buy: f64, sell: f64) -> Candle {
        Candle {
            timestamp: i * MINUTE_MS,
            open,
            high,
            low,
            close,
            buy_volume: buy,
            sell_volume: sell,
        }
    }

    /// Ten flat bars with zero CVD, a bullish cross on bar 10, a bullish gap
    /// on bar 11, then three quiet bars
    fn setup_bars() -> Vec<Candle> {
        let mut bars: Vec<Candle> = (0..10)
            .map(|i| bar(i, 100.0, 101.0, 99.0, 100.5, 1.0, 1.0))
            .collect();
        bars.push(bar(10, 100.5, 104.0, 100.0, 103.5, 6.0, 1.0));
        bars.push(bar(11, 103.5, 106.0, 102.0, 105.5, 1.0, 1.0));
        for i in 12..15 {
            bars.push(bar(i, 105.5, 106.5, 104.5, 105.0, 1.0, 1.0));
        }
        bars
    }

    #[test]
    fn test_scripted_stop_loss_trade() {
        let mut sm = TradeStateMachine::new(&config()).unwrap();
        let bars = setup_bars();

        for (i, b) in bars.iter().enumerate() {
            let events = sm.on_bar(b).unwrap();
            match i {
                10 => {
                    assert!(events.iter().any(|e| matches!(e, StrategyEvent::Signal(s) if s.direction == SignalDirection::Bullish)));
                    assert_eq!(sm.phase(), StrategyPhase::WaitingForFvg);
                }
                11 => {
                    assert!(events.iter().any(|e| matches!(e, StrategyEvent::PositionOpened(_))));
                    assert_eq!(sm.phase(), StrategyPhase::EntryTaken);
                }
                12..=14 => assert_eq!(sm.phase(), StrategyPhase::EntryTaken),
                _ => assert_eq!(sm.phase(), StrategyPhase::WaitingForSignal),
            }
        }

        let position = sm.position().cloned().unwrap();
        assert_eq!(position.side, Side::Long);
        assert_eq!(position.entry_price, 105.5);
        assert_eq!(position.entry_time, 11 * MINUTE_MS);
        assert!(position.source_fvg.is_bullish);

        let capital_before = sm.capital();
        let events = sm.on_bar(&bar(15, 105.0, 105.5, 90.0, 92.0, 1.0, 1.0)).unwrap();
        assert!(events.iter().any(|e| matches!(e, StrategyEvent::PositionClosed(_))));

        assert_eq!(sm.trades().len(), 1);
        let trade = &sm.trades()[0];
        assert_eq!(trade.side, Side::Long);
        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_price, position.stop_loss);
        assert_eq!(trade.exit_time, 15 * MINUTE_MS);
        assert_eq!(trade.id, position.id);

        let expected = position.size * (position.stop_loss - position.entry_price);
        assert!((sm.capital() - capital_before - expected).abs() < 1e-9);
        assert_eq!(trade.resulting_capital, sm.capital());
        assert!(sm.position().is_none());
        assert_eq!(sm.phase(), StrategyPhase::WaitingForSignal);
    }

    #[test]
    fn test_entry_bar_is_not_monitored() {
        let mut sm = TradeStateMachine::new(&config()).unwrap();
        let mut bars = setup_bars();
        bars.truncate(11);
        // Entry bar's own high already reaches the target
        bars.push(bar(11, 103.5, 120.0, 102.0, 105.5, 1.0, 1.0));
        for b in &bars {
            sm.on_bar(b).unwrap();
        }
        let position = sm.position().cloned().unwrap();
        assert!(position.take_profit <= 120.0);
        assert!(sm.trades().is_empty());
        assert_eq!(sm.phase(), StrategyPhase::EntryTaken);
    }

    #[test]
    fn test_duplicate_bar_does_not_change_state() {
        let mut sm = TradeStateMachine::new(&config()).unwrap();
        let bars = setup_bars();
        for b in &bars[..=10] {
            sm.on_bar(b).unwrap();
        }
        let before = sm.snapshot();

        let err = sm.on_bar(&bars[10]).unwrap_err();
        assert!(matches!(err, StrategyError::OutOfOrderCandle { .. }));
        assert!(!err.is_fatal());
        assert_eq!(sm.snapshot(), before);
        assert_eq!(sm.bars_processed(), 11);
    }

    #[test]
    fn test_opposite_signal_aborts_setup() {
        let mut sm = TradeStateMachine::new(&config()).unwrap();
        let bars = setup_bars();
        for b in &bars[..=10] {
            sm.on_bar(b).unwrap();
        }
        assert_eq!(sm.phase(), StrategyPhase::WaitingForFvg);

        // CVD 5 -> -3, no gap
        let events = sm.on_bar(&bar(11, 103.5, 104.0, 100.5, 101.0, 1.0, 9.0)).unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, StrategyEvent::SignalAborted { pending: SignalDirection::Bullish, .. })));
        assert_eq!(sm.phase(), StrategyPhase::WaitingForSignal);
        assert!(sm.snapshot().pending_direction.is_none());
        assert!(sm.trades().is_empty());
    }

    #[test]
    fn test_unsizable_entry_keeps_waiting() {
        // Risk ATR never warms up, so the stop distance stays 0
        let cfg = StrategyConfig {
            atr_len_cvds: 500,
            ..config()
        };
        let mut sm = TradeStateMachine::new(&cfg).unwrap();
        let mut rejected = false;
        for b in &setup_bars()[..=11] {
            let events = sm.on_bar(b).unwrap();
            rejected |= events
                .iter()
                .any(|e| matches!(e, StrategyEvent::EntryRejected { .. }));
        }
        assert!(rejected);
        assert_eq!(sm.phase(), StrategyPhase::WaitingForFvg);
        assert_eq!(sm.snapshot().pending_direction, Some(Side::Long));
        assert!(sm.position().is_none());
    }

    #[test]
    fn test_circuit_breaker_halts() {
        let cfg = StrategyConfig {
            risk_per_trade: 100.0,
            capital_growth_limit: 1.001,
            ..config()
        };
        let mut sm = TradeStateMachine::new(&cfg).unwrap();
        for b in &setup_bars() {
            sm.on_bar(b).unwrap();
        }

        // Target hit
        let err = sm
            .on_bar(&bar(15, 105.0, 120.0, 104.8, 119.0, 1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, StrategyError::CapitalLimitExceeded { .. }));
        assert!(err.is_fatal());
        assert_eq!(sm.trades().len(), 1);
        assert_eq!(sm.trades()[0].exit_reason, ExitReason::TakeProfit);
        assert!(sm.is_halted());

        let next = bar(16, 119.0, 120.0, 118.0, 119.5, 1.0, 1.0);
        assert_eq!(sm.on_bar(&next), Err(StrategyError::Halted));
        assert_eq!(sm.last_bar_time(), Some(15 * MINUTE_MS));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = StrategyConfig {
            anchor_period: 3,
            ..config()
        };
        assert!(matches!(
            TradeStateMachine::new(&cfg),
            Err(StrategyError::Configuration(_))
        ));
    }
}
