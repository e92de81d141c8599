//! Fair Value Gap detection and lifecycle
//!
//! A gap forms on a 3-bar window when the newest bar's extreme does not
//! overlap the oldest bar's opposite extreme. Accepted gaps are tracked until
//! they are filled through (invalidated), go stale, or are pushed out by
//! newer gaps of the same direction.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::indicators::{Atr, Sma};
use crate::config::{
    BarsType, EndMethod, FilterMethod, FvgSensitivity, StartZoneFrom, StrategyConfig,
};
use crate::types::{Candle, SignalDirection};

/// Tracked gap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FvgInfo {
    pub top: f64,
    pub bottom: f64,
    pub is_bullish: bool,
    pub formed_at_index: usize,
    pub formed_at_time: i64,
    pub last_touched_index: usize,
    pub end_index: Option<usize>,
    pub end_time: Option<i64>,
    pub size_abs: f64,
    pub is_invalidated: bool,
    /// Buy + sell volume of the three window bars
    pub total_volume: f64,
}

impl FvgInfo {
    pub fn direction(&self) -> SignalDirection {
        if self.is_bullish {
            SignalDirection::Bullish
        } else {
            SignalDirection::Bearish
        }
    }

    fn touched_by(&self, bar: &Candle) -> bool {
        if self.is_bullish {
            bar.low <= self.top
        } else {
            bar.high >= self.bottom
        }
    }

    fn filled_by(&self, bar: &Candle, method: EndMethod) -> bool {
        match (self.is_bullish, method) {
            (true, EndMethod::Close) => bar.close < self.bottom,
            (true, EndMethod::Wick) => bar.low < self.bottom,
            (false, EndMethod::Close) => bar.close > self.top,
            (false, EndMethod::Wick) => bar.high > self.top,
        }
    }
}

/// Result of feeding one bar to the detector
#[derive(Debug, Clone, Default)]
pub struct FvgUpdate {
    /// Gap formed by the window ending at this bar
    pub formed: Option<FvgInfo>,
    /// Gaps filled through on this bar
    pub invalidated: Vec<FvgInfo>,
    /// Filter ATR after this bar (0.0 while warming up)
    pub atr: f64,
}

#[derive(Debug, Clone)]
pub struct FvgDetector {
    sensitivity: FvgSensitivity,
    end_method: EndMethod,
    filter_method: FilterMethod,
    bars_type: BarsType,
    start_zone_from: StartZoneFrom,
    allow_gaps: bool,
    volume_threshold: f64,
    delete_untouched_after: usize,
    max_per_direction: usize,

    atr: Atr,
    short_volume: Sma,
    long_volume: Sma,
    window: VecDeque<Candle>,
    /// Bars seen so far; the current bar's index is `bars - 1`
    bars: usize,
    /// Oldest first
    active: Vec<FvgInfo>,
}

impl FvgDetector {
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            sensitivity: config.fvg_sensitivity,
            end_method: config.end_method,
            filter_method: config.filter_method,
            bars_type: config.bars_type,
            start_zone_from: config.start_zone_from,
            allow_gaps: config.allow_gaps,
            volume_threshold: config.volume_threshold_percent / 100.0,
            delete_untouched_after: config.delete_untouched_after_x_bars,
            max_per_direction: config.show_last_x_fvgs.max(1),
            atr: Atr::new(config.atr_len),
            short_volume: Sma::new(5),
            long_volume: Sma::new(15),
            window: VecDeque::with_capacity(3),
            bars: 0,
            active: Vec::new(),
        }
    }

    /// Check a chronological `[older, mid, newer]` window against the gap
    /// rules. `index` is the bar index of `newer`.
    pub fn detect(&self, window: &[Candle; 3], atr: f64, index: usize) -> Option<FvgInfo> {
        let [older, mid, newer] = window;

        let (is_bullish, top, bottom) = if newer.low > older.high && mid.close > older.high {
            (true, newer.low, older.high)
        } else if newer.high < older.low && mid.close < older.low {
            (false, older.low, newer.high)
        } else {
            return None;
        };
        let size = top - bottom;

        if self.bars_type == BarsType::SameType {
            let bullish = window.iter().filter(|c| c.is_bullish()).count();
            if bullish != 0 && bullish != 3 {
                return None;
            }
        }

        if !self.allow_gaps {
            let max_co_diff = (mid.open - older.close)
                .abs()
                .max((newer.open - mid.close).abs());
            if max_co_diff > atr {
                return None;
            }
        }

        if self.filter_method == FilterMethod::VolumeThreshold && !self.volume_expanding() {
            return None;
        }

        if !(size > self.sensitivity.threshold(atr)) {
            return None;
        }

        let (formed_at_index, formed_at_time) = match self.start_zone_from {
            StartZoneFrom::FirstBar => (index.saturating_sub(2), older.timestamp),
            StartZoneFrom::LastBar => (index, newer.timestamp),
        };

        Some(FvgInfo {
            top,
            bottom,
            is_bullish,
            formed_at_index,
            formed_at_time,
            last_touched_index: index,
            end_index: None,
            end_time: None,
            size_abs: size,
            is_invalidated: false,
            total_volume: window.iter().map(Candle::total_volume).sum(),
        })
    }

    fn volume_expanding(&self) -> bool {
        self.long_volume.is_ready()
            && self.short_volume.value() > self.long_volume.value() * self.volume_threshold
    }

    /// Feed the next chart bar
    pub fn update(&mut self, candle: &Candle) -> FvgUpdate {
        // Gaps invalidated on the previous bar leave now
        self.active.retain(|g| g.end_index.is_none());

        let index = self.bars;
        self.bars += 1;
        let atr = self.atr.update(candle);
        self.short_volume.update(candle.total_volume());
        self.long_volume.update(candle.total_volume());

        self.window.push_back(*candle);
        if self.window.len() > 3 {
            self.window.pop_front();
        }

        let mut update = FvgUpdate {
            atr,
            ..FvgUpdate::default()
        };

        for gap in self.active.iter_mut() {
            if gap.touched_by(candle) {
                gap.last_touched_index = index;
            }
            if gap.end_index.is_none() && gap.filled_by(candle, self.end_method) {
                gap.end_index = Some(index);
                gap.end_time = Some(candle.timestamp);
                gap.is_invalidated = true;
                debug!(
                    "FVG {} [{:.2}, {:.2}] invalidated at bar {}",
                    gap.direction(),
                    gap.bottom,
                    gap.top,
                    index
                );
                update.invalidated.push(gap.clone());
            }
        }

        if self.window.len() == 3 {
            match self.atr.ready_value() {
                Ok(atr) => {
                    let window = [self.window[0], self.window[1], self.window[2]];
                    if let Some(gap) = self.detect(&window, atr, index) {
                        debug!(
                            "FVG {} formed at bar {}: [{:.2}, {:.2}] size {:.2} (atr {:.2})",
                            gap.direction(),
                            index,
                            gap.bottom,
                            gap.top,
                            gap.size_abs,
                            atr
                        );
                        self.active.push(gap.clone());
                        update.formed = Some(gap);
                    }
                }
                Err(err) => debug!("FVG detection skipped at bar {}: {}", index, err),
            }
        }

        self.evict(index);
        update
    }

    fn evict(&mut self, index: usize) {
        let limit = self.delete_untouched_after;
        self.active.retain(|g| {
            g.end_index.is_some() || index.saturating_sub(g.last_touched_index) <= limit
        });

        for bullish in [true, false] {
            let live = self
                .active
                .iter()
                .filter(|g| g.is_bullish == bullish && g.end_index.is_none())
                .count();
            let mut excess = live.saturating_sub(self.max_per_direction);
            // Oldest first, so the first matches are the ones to drop
            self.active.retain(|g| {
                if excess > 0 && g.is_bullish == bullish && g.end_index.is_none() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Gaps currently tracked, oldest first
    pub fn active(&self) -> &[FvgInfo] {
        &self.active
    }
}
