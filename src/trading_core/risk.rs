//! ATR-based stop placement and position sizing

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::error::{StrategyError, StrategyResult};
use crate::types::{ExitReason, Position, Side};

/// Levels and size for a prospective entry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntryPlan {
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub sl_distance: f64,
    /// Base-asset units
    pub size: f64,
}

#[derive(Debug, Clone)]
pub struct RiskSizer {
    sl_multiplier: f64,
    reward_ratio: f64,
    risk_fraction: f64,
    max_position_fraction: f64,
    max_profit_fraction: f64,
}

impl RiskSizer {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            sl_multiplier: config.sl_multiplier.multiplier(),
            reward_ratio: config.dynamic_rr,
            risk_fraction: config.risk_fraction(),
            max_position_fraction: config.max_position_fraction(),
            max_profit_fraction: config.max_profit_fraction(),
        }
    }

    /// Stop, target and size for an entry at `entry_price`
    pub fn plan(
        &self,
        side: Side,
        entry_price: f64,
        atr: f64,
        capital: f64,
    ) -> StrategyResult<EntryPlan> {
        let sl_distance = atr * self.sl_multiplier;
        if !(sl_distance.is_finite() && sl_distance > 0.0) {
            return Err(StrategyError::InvalidEntry {
                reason: format!("stop distance {} (atr {})", sl_distance, atr),
            });
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Err(StrategyError::InvalidEntry {
                reason: format!("entry price {}", entry_price),
            });
        }

        let stop_loss = match side {
            Side::Long => entry_price - sl_distance,
            Side::Short => entry_price + sl_distance,
        };
        let reward = (entry_price - stop_loss).abs() * self.reward_ratio;
        let take_profit = match side {
            Side::Long => entry_price + reward,
            Side::Short => entry_price - reward,
        };

        let by_risk = (capital * self.risk_fraction / sl_distance) / entry_price;
        let by_value = capital * self.max_position_fraction / entry_price;
        let size = by_risk.min(by_value);
        if !(size.is_finite() && size > 0.0) {
            return Err(StrategyError::InvalidEntry {
                reason: format!("position size {} (capital {:.2})", size, capital),
            });
        }

        Ok(EntryPlan {
            side,
            entry_price,
            stop_loss,
            take_profit,
            sl_distance,
            size,
        })
    }

    /// Realized P&L of closing `position` at `exit_price`, profit capped at a
    /// share of `capital`
    pub fn realize(&self, position: &Position, exit_price: f64, capital: f64) -> f64 {
        let raw = match position.side {
            Side::Long => position.size * (exit_price - position.entry_price),
            Side::Short => position.size * (position.entry_price - exit_price),
        };
        raw.min(capital * self.max_profit_fraction)
    }
}

/// Exit triggered by a bar's range, stop first on ties.
/// Returns the reason and the level that filled.
pub fn check_exit(position: &Position, high: f64, low: f64) -> Option<(ExitReason, f64)> {
    let (stop_hit, target_hit) = match position.side {
        Side::Long => (low <= position.stop_loss, high >= position.take_profit),
        Side::Short => (high >= position.stop_loss, low <= position.take_profit),
    };
    if stop_hit {
        Some((ExitReason::StopLoss, position.stop_loss))
    } else if target_hit {
        Some((ExitReason::TakeProfit, position.take_profit))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::FvgInfo;
    use uuid::Uuid;

    fn sizer() -> RiskSizer {
        RiskSizer::new(&StrategyConfig::default())
    }

    fn position(side: Side, entry: f64, sl: f64, tp: f64, size: f64) -> Position {
        Position {
            id: Uuid::new_v4(),
            side,
            entry_price: entry,
            size,
            stop_loss: sl,
            take_profit: tp,
            entry_time: 0,
            source_fvg: FvgInfo {
                top: entry,
                bottom: entry - 1.0,
                is_bullish: side == Side::Long,
                formed_at_index: 0,
                formed_at_time: 0,
                last_touched_index: 0,
                end_index: None,
                end_time: None,
                size_abs: 1.0,
                is_invalidated: false,
                total_volume: 0.0,
            },
        }
    }

    #[test]
    fn test_long_plan() {
        // Normal tier 6.5, rr 0.57, risk 10%, max position 100%
        let plan = sizer().plan(Side::Long, 100.0, 2.0, 10_000.0).unwrap();
        assert!((plan.sl_distance - 13.0).abs() < 1e-9);
        assert!((plan.stop_loss - 87.0).abs() < 1e-9);
        assert!((plan.take_profit - (100.0 + 13.0 * 0.57)).abs() < 1e-9);
        // Risk bound: (10000 * 0.1 / 13) / 100 = 0.769..; value bound: 100
        assert!((plan.size - 1000.0 / 13.0 / 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_plan_mirrors() {
        let plan = sizer().plan(Side::Short, 100.0, 2.0, 10_000.0).unwrap();
        assert!((plan.stop_loss - 113.0).abs() < 1e-9);
        assert!(plan.take_profit < 100.0);
    }

    #[test]
    fn test_size_capped_by_position_value() {
        let config = StrategyConfig {
            risk_per_trade: 50.0,
            max_position_size_percent: 10.0,
            ..StrategyConfig::default()
        };
        let plan = RiskSizer::new(&config).plan(Side::Long, 100.0, 0.01, 10_000.0).unwrap();
        assert!((plan.size - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unusable_entry() {
        let err = sizer().plan(Side::Long, 100.0, 0.0, 10_000.0).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidEntry { .. }));
        assert!(!err.is_fatal());

        assert!(sizer().plan(Side::Long, 100.0, f64::NAN, 10_000.0).is_err());
        assert!(sizer().plan(Side::Long, 100.0, 2.0, 0.0).is_err());
    }

    #[test]
    fn test_stop_wins_tie() {
        let pos = position(Side::Long, 100.0, 95.0, 103.0, 1.0);
        assert_eq!(check_exit(&pos, 104.0, 94.0), Some((ExitReason::StopLoss, 95.0)));
        assert_eq!(check_exit(&pos, 103.0, 96.0), Some((ExitReason::TakeProfit, 103.0)));
        assert_eq!(check_exit(&pos, 102.0, 96.0), None);

        let short = position(Side::Short, 100.0, 105.0, 97.0, 1.0);
        assert_eq!(check_exit(&short, 105.0, 96.0), Some((ExitReason::StopLoss, 105.0)));
        assert_eq!(check_exit(&short, 101.0, 97.0), Some((ExitReason::TakeProfit, 97.0)));
    }

    #[test]
    fn test_profit_cap() {
        let config = StrategyConfig {
            max_profit_percent_per_trade: 1.0,
            ..StrategyConfig::default()
        };
        let sizer = RiskSizer::new(&config);
        let pos = position(Side::Long, 100.0, 90.0, 200.0, 10.0);
        // Raw profit 1000, capped at 1% of 10000
        assert!((sizer.realize(&pos, 200.0, 10_000.0) - 100.0).abs() < 1e-9);
        // Losses are not capped
        assert!((sizer.realize(&pos, 90.0, 10_000.0) + 100.0).abs() < 1e-9);

        let short = position(Side::Short, 100.0, 110.0, 95.0, 2.0);
        assert!((sizer.realize(&short, 95.0, 10_000.0) - 10.0).abs() < 1e-9);
    }
}
