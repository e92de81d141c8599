//! Live polling mode
//!
//! Re-reads a candle file on a fixed interval and feeds only candles newer
//! than the engine's watermark. The engine sits behind an `RwLock`; each tick
//! holds the write lock for its whole batch so readers only ever see state
//! between ticks. Shutdown is checked between ticks.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::StrategyError;
use crate::storage::{load_candles, TradeLogger};
use crate::trading_core::{StrategyEngine, StrategyEvent};

pub type SharedEngine = Arc<RwLock<StrategyEngine>>;

/// Result of one polling tick
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Candles newer than the watermark at the start of the tick
    pub new_candles: usize,
    pub events: Vec<StrategyEvent>,
    pub fatal: Option<StrategyError>,
}

/// Why the polling loop stopped
#[derive(Debug, Clone, PartialEq)]
pub enum LiveExit {
    Shutdown,
    Halted(StrategyError),
}

async fn read_source(source: &Path) -> Result<Vec<crate::types::Candle>> {
    let path = source.to_path_buf();
    tokio::task::spawn_blocking(move || load_candles(&path))
        .await
        .context("Candle loader task failed")?
}

/// Load the source once and process whatever is new
pub async fn poll_once(
    engine: &SharedEngine,
    source: &Path,
    logger: Option<&mut TradeLogger>,
) -> Result<TickOutcome> {
    let candles = read_source(source).await?;

    let mut engine = engine.write().await;
    let watermark = engine.watermark();
    let fresh: Vec<_> = candles
        .into_iter()
        .filter(|c| watermark.map_or(true, |w| c.timestamp > w))
        .collect();

    if fresh.is_empty() {
        debug!("No new candles (watermark {:?})", watermark);
        return Ok(TickOutcome::default());
    }

    let trades_before = engine.trades().len();
    let report = engine.process_batch(&fresh);

    if let Some(logger) = logger {
        for trade in &engine.trades()[trades_before..] {
            if let Err(e) = logger.log_trade(trade) {
                warn!("Failed to log trade {}: {}", trade.id, e);
            }
        }
    }

    let snapshot = engine.snapshot();
    info!(
        "Tick: {} new candles | phase {} | capital {:.2} | position {}",
        fresh.len(),
        snapshot.phase,
        snapshot.capital,
        if snapshot.open_position.is_some() { "OPEN" } else { "FLAT" }
    );

    Ok(TickOutcome {
        new_candles: fresh.len(),
        events: report.events,
        fatal: report.fatal,
    })
}

/// Poll `source` every `interval` until shutdown or a fatal strategy error.
/// Errors within a tick are logged and the loop carries on.
pub async fn run_live(
    engine: SharedEngine,
    source: PathBuf,
    interval: Duration,
    trade_log: Option<PathBuf>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<LiveExit> {
    info!("=== LIVE POLLING ===");
    info!("Source: {:?} | Interval: {:?}", source, interval);

    let mut logger = match trade_log {
        Some(path) => match TradeLogger::new(&path) {
            Ok(logger) => {
                info!("Trade logger initialized - logging to {:?}", path);
                Some(logger)
            }
            Err(e) => {
                warn!("Failed to create trade logger: {} - trades will not be logged to CSV", e);
                None
            }
        },
        None => None,
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            info!("Shutdown requested");
            return Ok(LiveExit::Shutdown);
        }

        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Shutdown requested");
                    return Ok(LiveExit::Shutdown);
                }
                continue;
            }
        }

        match poll_once(&engine, &source, logger.as_mut()).await {
            Ok(outcome) => {
                if let Some(err) = outcome.fatal {
                    error!("Strategy halted: {}", err);
                    return Ok(LiveExit::Halted(err));
                }
            }
            Err(e) => warn!("Tick failed: {:#}", e),
        }
    }
}
