//! ATR and SMA primitives
//!
//! Both return a 0.0 sentinel until enough history has been seen; callers
//! treat 0.0 as "not ready" rather than failing the bar.

use std::collections::VecDeque;

use crate::error::{StrategyError, StrategyResult};
use crate::types::Candle;

/// True range of a bar given the previous close (H-L for the first bar)
pub fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    match prev_close {
        Some(pc) => (candle.high - candle.low)
            .max((candle.high - pc).abs())
            .max((candle.low - pc).abs()),
        None => candle.high - candle.low,
    }
}

/// Streaming ATR with Wilder (RMA) smoothing, seeded by the SMA of the first
/// `period` true ranges.
#[derive(Debug, Clone)]
pub struct Atr {
    period: usize,
    prev_close: Option<f64>,
    count: usize,
    seed_sum: f64,
    value: f64,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            count: 0,
            seed_sum: 0.0,
            value: 0.0,
        }
    }

    /// Feed the next bar; returns the current ATR (0.0 while warming up)
    pub fn update(&mut self, candle: &Candle) -> f64 {
        let tr = true_range(candle, self.prev_close);
        self.prev_close = Some(candle.close);
        self.count += 1;

        if self.count < self.period {
            self.seed_sum += tr;
        } else if self.count == self.period {
            self.seed_sum += tr;
            self.value = self.seed_sum / self.period as f64;
        } else {
            let alpha = 1.0 / self.period as f64;
            self.value = alpha * tr + (1.0 - alpha) * self.value;
        }

        self.value()
    }

    /// Current value, 0.0 until `period` bars have been seen
    pub fn value(&self) -> f64 {
        if self.is_ready() {
            self.value
        } else {
            0.0
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.period
    }

    /// Current value, or `InsufficientData` while warming up
    pub fn ready_value(&self) -> StrategyResult<f64> {
        if self.is_ready() {
            Ok(self.value)
        } else {
            Err(StrategyError::InsufficientData {
                indicator: "ATR",
                required: self.period,
                available: self.count,
            })
        }
    }

    /// Bars seen so far
    pub fn count(&self) -> usize {
        self.count
    }
}

/// ATR over a whole series, equal to the last value of the streaming form
pub fn atr(candles: &[Candle], period: usize) -> f64 {
    let mut indicator = Atr::new(period);
    for candle in candles {
        indicator.update(candle);
    }
    indicator.value()
}

/// Rolling simple moving average
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            window: VecDeque::with_capacity(period + 1),
            sum: 0.0,
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.value()
    }

    pub fn value(&self) -> f64 {
        if self.window.len() < self.period {
            0.0
        } else {
            self.sum / self.period as f64
        }
    }

    pub fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }
}

/// SMA of the last `period` values (0.0 if fewer)
pub fn sma(values: &[f64], period: usize) -> f64 {
    if period == 0 || values.len() < period {
        return 0.0;
    }
    values[values.len() - period..].iter().sum::<f64>() / period as f64
}
