// Library crate - exports the strategy core and its collaborators

pub mod types;
pub mod error;
pub mod config;
pub mod trading_core;
pub mod storage;
pub mod synthetic;
pub mod replay;
pub mod live;

// Re-export commonly used types
pub use types::*;
pub use error::{StrategyError, StrategyResult};
pub use config::StrategyConfig;
pub use trading_core::{StrategyEngine, TradingSummary};
