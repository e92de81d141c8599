//! Cumulative volume delta with anchor-period resets
//!
//! The running CVD restarts at 0 on the first bar of every calendar-aligned
//! anchor period. Signals fire on zero-crosses: the tracker remembers the sign
//! of the last non-zero cumulative value, so a value that only touches zero
//! never fires.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StrategyError, StrategyResult};
use crate::types::{Candle, SignalDirection, MINUTE_MS};

/// CVD state after one bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeDeltaPoint {
    pub timestamp: i64,
    /// CVD before this bar (0 on the first bar of a period)
    pub open_volume: f64,
    /// Highest CVD seen in the period so far
    pub hi_volume: f64,
    /// Lowest CVD seen in the period so far
    pub lo_volume: f64,
    /// CVD after this bar
    pub last_volume: f64,
    /// True if this bar opened a new anchor period
    pub period_start: bool,
}

/// Zero-cross event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeDeltaSignal {
    pub timestamp: i64,
    pub direction: SignalDirection,
    /// Cumulative delta that crossed zero
    pub triggering_delta: f64,
}

#[derive(Debug, Clone)]
pub struct VolumeDeltaTracker {
    anchor_ms: i64,
    period: Option<i64>,
    cumulative: f64,
    hi: f64,
    lo: f64,
    /// Sign of the last non-zero CVD in this period (0 = none yet)
    last_sign: i8,
    last_timestamp: Option<i64>,
    last_signal: Option<VolumeDeltaSignal>,
}

fn sign_of(value: f64) -> i8 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

impl VolumeDeltaTracker {
    pub fn new(anchor_minutes: i64) -> StrategyResult<Self> {
        if anchor_minutes <= 0 {
            return Err(StrategyError::Configuration(format!(
                "CVD anchor period must be positive, got {}m",
                anchor_minutes
            )));
        }
        Ok(Self {
            anchor_ms: anchor_minutes * MINUTE_MS,
            period: None,
            cumulative: 0.0,
            hi: 0.0,
            lo: 0.0,
            last_sign: 0,
            last_timestamp: None,
            last_signal: None,
        })
    }

    /// Feed the next bar. Bars at or before the last one seen are rejected
    /// without touching state.
    pub fn update(
        &mut self,
        candle: &Candle,
    ) -> StrategyResult<(VolumeDeltaPoint, Option<VolumeDeltaSignal>)> {
        if let Some(watermark) = self.last_timestamp {
            if candle.timestamp <= watermark {
                return Err(StrategyError::OutOfOrderCandle {
                    timestamp: candle.timestamp,
                    watermark,
                });
            }
        }

        let period = candle.timestamp.div_euclid(self.anchor_ms);
        let first_bar = self.period.is_none();
        let period_start = self.period != Some(period);

        if period_start {
            self.period = Some(period);
            self.cumulative = 0.0;
            self.hi = 0.0;
            self.lo = 0.0;
            self.last_sign = 0;
        }

        // A series that starts mid-period has no clean origin to cross from
        let can_signal = !first_bar || candle.timestamp.rem_euclid(self.anchor_ms) == 0;

        let open_volume = self.cumulative;
        self.cumulative += candle.delta();
        self.hi = self.hi.max(self.cumulative);
        self.lo = self.lo.min(self.cumulative);
        self.last_timestamp = Some(candle.timestamp);

        let sign = sign_of(self.cumulative);
        let direction = match (sign, self.last_sign) {
            (1, prev) if prev <= 0 => Some(SignalDirection::Bullish),
            (-1, prev) if prev >= 0 => Some(SignalDirection::Bearish),
            _ => None,
        };
        if sign != 0 {
            self.last_sign = sign;
        }

        let signal = direction.filter(|_| can_signal).map(|direction| VolumeDeltaSignal {
            timestamp: candle.timestamp,
            direction,
            triggering_delta: self.cumulative,
        });

        if let Some(s) = &signal {
            debug!(
                "CVD {} cross at {}: {:.2} -> {:.2}",
                s.direction, s.timestamp, open_volume, self.cumulative
            );
            self.last_signal = Some(*s);
        }

        let point = VolumeDeltaPoint {
            timestamp: candle.timestamp,
            open_volume,
            hi_volume: self.hi,
            lo_volume: self.lo,
            last_volume: self.cumulative,
            period_start,
        };
        Ok((point, signal))
    }

    /// Current cumulative delta
    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    pub fn last_signal(&self) -> Option<VolumeDeltaSignal> {
        self.last_signal
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }
}

/// CVD points for a whole series, one per accepted bar
pub fn compute_volume_delta(
    candles: &[Candle],
    anchor_minutes: i64,
) -> StrategyResult<Vec<VolumeDeltaPoint>> {
    let mut tracker = VolumeDeltaTracker::new(anchor_minutes)?;
    Ok(candles
        .iter()
        .filter_map(|c| tracker.update(c).ok())
        .map(|(point, _)| point)
        .collect())
}

/// Zero-cross signals for a whole series
pub fn detect_signals(
    candles: &[Candle],
    anchor_minutes: i64,
) -> StrategyResult<Vec<VolumeDeltaSignal>> {
    let mut tracker = VolumeDeltaTracker::new(anchor_minutes)?;
    Ok(candles
        .iter()
        .filter_map(|c| tracker.update(c).ok())
        .filter_map(|(_, signal)| signal)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bars one minute apart starting at `start_minute`, with the given deltas
    fn bars(start_minute: i64, deltas: &[f64]) -> Vec<Candle> {
        deltas
            .iter()
            .enumerate()
            .map(|(i, &d)| Candle {
                timestamp: (start_minute + i as i64) * MINUTE_MS,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                buy_volume: d.max(0.0),
                sell_volume: (-d).max(0.0),
            })
            .collect()
    }

    #[test]
    fn test_touching_zero_does_not_fire() {
        // CVD: 1, 0, 1
        let signals = detect_signals(&bars(0, &[1.0, -1.0, 1.0]), 1440).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, SignalDirection::Bullish);
        assert_eq!(signals[0].timestamp, 0);
    }

    #[test]
    fn test_single_fire_per_transition() {
        // CVD: 2, 3, 1, -1, -4, 0, 2, 5
        let deltas = [2.0, 1.0, -2.0, -2.0, -3.0, 4.0, 2.0, 3.0];
        let signals = detect_signals(&bars(0, &deltas), 1440).unwrap();
        let kinds: Vec<(i64, SignalDirection)> = signals
            .iter()
            .map(|s| (s.timestamp / MINUTE_MS, s.direction))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (0, SignalDirection::Bullish),
                (3, SignalDirection::Bearish),
                (6, SignalDirection::Bullish),
            ]
        );
        assert_eq!(signals[1].triggering_delta, -1.0);
    }

    #[test]
    fn test_first_bar_mid_period_is_not_signal_origin() {
        // Starts 5 minutes into a 15m period
        let signals = detect_signals(&bars(5, &[3.0, 1.0, -5.0]), 15).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, SignalDirection::Bearish);
        assert_eq!(signals[0].timestamp, 7 * MINUTE_MS);
    }

    #[test]
    fn test_first_bar_on_boundary_can_signal() {
        let signals = detect_signals(&bars(15, &[-2.0]), 15).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, SignalDirection::Bearish);
    }

    #[test]
    fn test_anchor_reset() {
        // 3m anchor: deltas +1 each bar
        let points = compute_volume_delta(&bars(0, &[1.0; 7]), 3).unwrap();
        let last: Vec<f64> = points.iter().map(|p| p.last_volume).collect();
        assert_eq!(last, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 1.0]);

        assert!(points[3].period_start);
        assert!(!points[4].period_start);
        assert_eq!(points[3].open_volume, 0.0);
        assert_eq!(points[4].open_volume, 1.0);

        // Each reset from zero origin fires again
        let signals = detect_signals(&bars(0, &[1.0; 7]), 3).unwrap();
        assert_eq!(signals.len(), 3);
    }

    #[test]
    fn test_hi_lo_track_period_extremes() {
        let points = compute_volume_delta(&bars(0, &[2.0, -5.0, 1.0]), 60).unwrap();
        assert_eq!(points[2].hi_volume, 2.0);
        assert_eq!(points[2].lo_volume, -3.0);
        assert_eq!(points[2].last_volume, -2.0);
    }

    #[test]
    fn test_duplicate_bar_rejected_without_state_change() {
        let series = bars(0, &[1.0, 2.0]);
        let mut tracker = VolumeDeltaTracker::new(60).unwrap();
        tracker.update(&series[0]).unwrap();
        tracker.update(&series[1]).unwrap();

        let err = tracker.update(&series[1]).unwrap_err();
        assert!(matches!(err, StrategyError::OutOfOrderCandle { .. }));
        assert_eq!(tracker.cumulative(), 3.0);
    }

    #[test]
    fn test_rejects_non_positive_anchor() {
        assert!(VolumeDeltaTracker::new(0).is_err());
    }
}
