//! Strategy error types.

use thiserror::Error;

/// Errors raised by the strategy core.
///
/// Only configuration errors and the capital circuit breaker stop a run;
/// everything else is absorbed by the caller after logging.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    /// Invalid configuration, detected before any candle is processed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Not enough history for an indicator
    #[error("insufficient data for {indicator}: need {required}, have {available}")]
    InsufficientData {
        indicator: &'static str,
        required: usize,
        available: usize,
    },

    /// Entry sizing produced an unusable stop distance or position size
    #[error("invalid entry: {reason}")]
    InvalidEntry { reason: String },

    /// Capital grew past the configured growth limit
    #[error("capital limit exceeded: capital {capital:.2} > limit {limit:.2}")]
    CapitalLimitExceeded { capital: f64, limit: f64 },

    /// Candle at or before the last processed timestamp
    #[error("out-of-order candle at {timestamp} (watermark {watermark})")]
    OutOfOrderCandle { timestamp: i64, watermark: i64 },

    /// Candle with a broken OHLC envelope, non-finite price or negative volume
    #[error("malformed candle at {timestamp}")]
    MalformedCandle { timestamp: i64 },

    /// The run was halted by the circuit breaker
    #[error("strategy halted")]
    Halted,
}

impl StrategyError {
    /// Returns true if this error terminates the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrategyError::Configuration(_)
                | StrategyError::CapitalLimitExceeded { .. }
                | StrategyError::Halted
        )
    }
}

pub type StrategyResult<T> = std::result::Result<T, StrategyError>;
