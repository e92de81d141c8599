//! Strategy configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::error::{StrategyError, StrategyResult};

/// Raw form of a tier setting: either a preset name or a number
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TierValue {
    Name(String),
    Value(f64),
}

fn parse_custom(value: f64, what: &str) -> Result<f64, String> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(format!("{} must be a positive number, got {}", what, value))
    }
}

/// FVG size filter preset.
///
/// The preset value divides the ATR: a gap qualifies when
/// `size > atr / value`, so `All` is the most permissive and `Low` the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TierValue", into = "TierValue")]
pub enum FvgSensitivity {
    All,
    Extreme,
    High,
    Normal,
    Low,
    Custom(f64),
}

impl FvgSensitivity {
    pub fn value(&self) -> f64 {
        match self {
            Self::All => 100.0,
            Self::Extreme => 6.0,
            Self::High => 2.0,
            Self::Normal => 1.5,
            Self::Low => 1.0,
            Self::Custom(v) => *v,
        }
    }

    /// Minimum gap size (exclusive) for a given ATR
    pub fn threshold(&self, atr: f64) -> f64 {
        atr / self.value()
    }
}

impl FromStr for FvgSensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "extreme" => Ok(Self::Extreme),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => other
                .parse::<f64>()
                .map_err(|_| format!("unknown FVG sensitivity '{}'", s))
                .and_then(|v| parse_custom(v, "FVG sensitivity"))
                .map(Self::Custom),
        }
    }
}

impl TryFrom<TierValue> for FvgSensitivity {
    type Error = String;

    fn try_from(raw: TierValue) -> Result<Self, Self::Error> {
        match raw {
            TierValue::Name(name) => name.parse(),
            TierValue::Value(v) => parse_custom(v, "FVG sensitivity").map(Self::Custom),
        }
    }
}

impl From<FvgSensitivity> for TierValue {
    fn from(s: FvgSensitivity) -> Self {
        match s {
            FvgSensitivity::All => TierValue::Name("All".to_string()),
            FvgSensitivity::Extreme => TierValue::Name("Extreme".to_string()),
            FvgSensitivity::High => TierValue::Name("High".to_string()),
            FvgSensitivity::Normal => TierValue::Name("Normal".to_string()),
            FvgSensitivity::Low => TierValue::Name("Low".to_string()),
            FvgSensitivity::Custom(v) => TierValue::Value(v),
        }
    }
}

/// Stop-loss distance in ATRs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TierValue", into = "TierValue")]
pub enum RiskTier {
    Highest,
    High,
    Normal,
    Low,
    Lowest,
    Custom(f64),
}

impl RiskTier {
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Highest => 10.0,
            Self::High => 8.5,
            Self::Normal => 6.5,
            Self::Low => 5.0,
            Self::Lowest => 3.0,
            Self::Custom(v) => *v,
        }
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "highest" => Ok(Self::Highest),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            "lowest" => Ok(Self::Lowest),
            other => other
                .parse::<f64>()
                .map_err(|_| format!("unknown risk tier '{}'", s))
                .and_then(|v| parse_custom(v, "SL multiplier"))
                .map(Self::Custom),
        }
    }
}

impl TryFrom<TierValue> for RiskTier {
    type Error = String;

    fn try_from(raw: TierValue) -> Result<Self, Self::Error> {
        match raw {
            TierValue::Name(name) => name.parse(),
            TierValue::Value(v) => parse_custom(v, "SL multiplier").map(Self::Custom),
        }
    }
}

impl From<RiskTier> for TierValue {
    fn from(t: RiskTier) -> Self {
        match t {
            RiskTier::Highest => TierValue::Name("Highest".to_string()),
            RiskTier::High => TierValue::Name("High".to_string()),
            RiskTier::Normal => TierValue::Name("Normal".to_string()),
            RiskTier::Low => TierValue::Name("Low".to_string()),
            RiskTier::Lowest => TierValue::Name("Lowest".to_string()),
            RiskTier::Custom(v) => TierValue::Value(v),
        }
    }
}

/// Price used to decide that a gap has been filled through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EndMethod {
    Wick,
    #[default]
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterMethod {
    #[default]
    AverageRange,
    VolumeThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BarsType {
    #[default]
    SameType,
    All,
}

/// Which bar of the 3-bar window anchors a new gap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StartZoneFrom {
    FirstBar,
    #[default]
    LastBar,
}

/// Full strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyConfig {
    /// Chart timeframe in minutes (entries are decided here)
    #[serde(rename = "chartTF")]
    pub chart_tf: u32,
    /// CVD reset period in minutes
    pub anchor_period: u32,
    /// Granularity of the raw input candles in minutes
    pub lower_timeframe: u32,
    /// ATR length for the FVG size filter
    pub atr_len: usize,
    /// ATR length for stop distance sizing
    #[serde(rename = "atrLenCVDS")]
    pub atr_len_cvds: usize,
    pub fvg_sensitivity: FvgSensitivity,
    #[serde(alias = "riskAmount")]
    pub sl_multiplier: RiskTier,
    /// Reward-to-risk ratio for the take profit
    #[serde(rename = "dynamicRR")]
    pub dynamic_rr: f64,
    /// Percent of capital risked per trade
    pub risk_per_trade: f64,
    /// Max position value as percent of capital
    pub max_position_size_percent: f64,
    /// Max realized profit per trade as percent of capital
    pub max_profit_percent_per_trade: f64,
    /// Halt once capital exceeds initial capital times this factor
    pub capital_growth_limit: f64,
    #[serde(rename = "deleteUntouchedAfterXBars")]
    pub delete_untouched_after_x_bars: usize,
    #[serde(rename = "showLastXFVGs")]
    pub show_last_x_fvgs: usize,
    pub end_method: EndMethod,
    pub filter_method: FilterMethod,
    pub bars_type: BarsType,
    pub start_zone_from: StartZoneFrom,
    /// Skip the open/close continuity check on the 3-bar window
    pub allow_gaps: bool,
    /// Volume threshold filter: SMA5 must exceed SMA15 times this percent
    pub volume_threshold_percent: f64,
    pub initial_capital: f64,
    /// Live mode polling interval
    pub poll_interval_secs: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            chart_tf: 3,
            anchor_period: 15,
            lower_timeframe: 1,
            atr_len: 10,
            atr_len_cvds: 50,
            fvg_sensitivity: FvgSensitivity::Extreme,
            sl_multiplier: RiskTier::Normal,
            dynamic_rr: 0.57,
            risk_per_trade: 10.0,
            max_position_size_percent: 100.0,
            max_profit_percent_per_trade: 100.0,
            capital_growth_limit: 100.0,
            delete_untouched_after_x_bars: 200,
            show_last_x_fvgs: 2,
            end_method: EndMethod::Close,
            filter_method: FilterMethod::AverageRange,
            bars_type: BarsType::SameType,
            start_zone_from: StartZoneFrom::LastBar,
            allow_gaps: false,
            volume_threshold_percent: 50.0,
            initial_capital: 10_000.0,
            poll_interval_secs: 10,
        }
    }
}

impl StrategyConfig {
    /// Load from a JSON file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Fail-fast startup validation
    pub fn validate(&self) -> StrategyResult<()> {
        let err = |msg: String| Err(StrategyError::Configuration(msg));

        if self.lower_timeframe == 0 || self.chart_tf == 0 || self.anchor_period == 0 {
            return err("timeframes must be positive".to_string());
        }
        if self.anchor_period <= self.chart_tf {
            return err(format!(
                "anchorPeriod ({}m) must be greater than chartTF ({}m)",
                self.anchor_period, self.chart_tf
            ));
        }
        if self.anchor_period % self.chart_tf != 0 {
            return err(format!(
                "anchorPeriod ({}m) must be a multiple of chartTF ({}m)",
                self.anchor_period, self.chart_tf
            ));
        }
        if self.chart_tf < self.lower_timeframe {
            return err(format!(
                "chartTF ({}m) must be >= lowerTimeframe ({}m)",
                self.chart_tf, self.lower_timeframe
            ));
        }
        if self.atr_len == 0 || self.atr_len_cvds == 0 {
            return err("ATR lengths must be positive".to_string());
        }
        if !(self.dynamic_rr.is_finite() && self.dynamic_rr > 0.0) {
            return err(format!("dynamicRR must be > 0, got {}", self.dynamic_rr));
        }
        let percents = [
            ("riskPerTrade", self.risk_per_trade),
            ("maxPositionSizePercent", self.max_position_size_percent),
            ("maxProfitPercentPerTrade", self.max_profit_percent_per_trade),
            ("volumeThresholdPercent", self.volume_threshold_percent),
        ];
        for (name, value) in percents {
            if !(value.is_finite() && value > 0.0) {
                return err(format!("{} must be > 0, got {}", name, value));
            }
        }
        if !(self.capital_growth_limit.is_finite() && self.capital_growth_limit > 1.0) {
            return err(format!(
                "capitalGrowthLimit must be > 1, got {}",
                self.capital_growth_limit
            ));
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return err(format!("initialCapital must be > 0, got {}", self.initial_capital));
        }
        if self.show_last_x_fvgs == 0 {
            return err("showLastXFVGs must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn risk_fraction(&self) -> f64 {
        self.risk_per_trade / 100.0
    }

    pub fn max_position_fraction(&self) -> f64 {
        self.max_position_size_percent / 100.0
    }

    pub fn max_profit_fraction(&self) -> f64 {
        self.max_profit_percent_per_trade / 100.0
    }

    /// Capital level that trips the circuit breaker
    pub fn capital_limit(&self) -> f64 {
        self.initial_capital * self.capital_growth_limit
    }
}
