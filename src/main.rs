use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cvd_fvg_engine::config::{FvgSensitivity, RiskTier, StrategyConfig};
use cvd_fvg_engine::live::{run_live, LiveExit};
use cvd_fvg_engine::replay::{run_backtest_file, BacktestReport};
use cvd_fvg_engine::storage::{load_candles, save_aggregated, save_candles};
use cvd_fvg_engine::synthetic::{generate_candles, SyntheticConfig};
use cvd_fvg_engine::trading_core::{aggregate, aggregate_anchored, StrategyEngine};
use cvd_fvg_engine::types::ms_to_datetime;

#[derive(Parser, Debug)]
#[command(name = "cvd-fvg")]
#[command(about = "CVD + Fair Value Gap strategy engine: backtest and live polling")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Strategy settings shared by backtest and live
#[derive(ClapArgs, Debug)]
struct StrategyArgs {
    /// JSON strategy config; flags below override it
    #[arg(short, long, env = "CVD_FVG_CONFIG")]
    config: Option<PathBuf>,

    /// Chart timeframe in minutes
    #[arg(long)]
    chart_tf: Option<u32>,

    /// CVD anchor period in minutes
    #[arg(long)]
    anchor_period: Option<u32>,

    /// FVG sensitivity tier (All, Extreme, High, Normal, Low) or divisor
    #[arg(long)]
    fvg_sensitivity: Option<FvgSensitivity>,

    /// Stop-loss tier (Highest, High, Normal, Low, Lowest) or ATR multiple
    #[arg(long)]
    sl_multiplier: Option<RiskTier>,

    /// Reward-to-risk ratio
    #[arg(long)]
    dynamic_rr: Option<f64>,

    /// Percent of capital risked per trade
    #[arg(long)]
    risk_per_trade: Option<f64>,

    /// Starting capital
    #[arg(long, env = "CVD_FVG_CAPITAL")]
    initial_capital: Option<f64>,
}

impl StrategyArgs {
    fn resolve(&self) -> Result<StrategyConfig> {
        let mut config = match &self.config {
            Some(path) => StrategyConfig::from_file(path)?,
            None => StrategyConfig::default(),
        };
        if let Some(v) = self.chart_tf {
            config.chart_tf = v;
        }
        if let Some(v) = self.anchor_period {
            config.anchor_period = v;
        }
        if let Some(v) = self.fvg_sensitivity {
            config.fvg_sensitivity = v;
        }
        if let Some(v) = self.sl_multiplier {
            config.sl_multiplier = v;
        }
        if let Some(v) = self.dynamic_rr {
            config.dynamic_rr = v;
        }
        if let Some(v) = self.risk_per_trade {
            config.risk_per_trade = v;
        }
        if let Some(v) = self.initial_capital {
            config.initial_capital = v;
        }
        config.validate().context("Invalid strategy configuration")?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a candle file through the strategy
    Backtest {
        /// Candle file (.json, .json.zst, .csv, .csv.zst)
        #[arg(short, long)]
        data: PathBuf,

        /// Append closed trades to this CSV
        #[arg(short, long)]
        trade_log: Option<PathBuf>,

        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Poll a candle file and trade new candles as they arrive
    Live {
        /// Candle file rewritten by the market-data collector
        #[arg(short, long, env = "CVD_FVG_SOURCE")]
        data: PathBuf,

        /// Polling interval in seconds (defaults to the config value)
        #[arg(short, long)]
        interval: Option<u64>,

        /// Append closed trades to this CSV
        #[arg(short, long, default_value = "trades.csv")]
        trade_log: PathBuf,

        #[command(flatten)]
        strategy: StrategyArgs,
    },

    /// Aggregate a candle file into a coarser timeframe
    Aggregate {
        #[arg(short, long)]
        data: PathBuf,

        /// Target timeframe in minutes
        #[arg(short, long)]
        minutes: i64,

        /// Carry CVD across buckets, resetting every N minutes
        #[arg(short, long)]
        anchor: Option<i64>,

        /// Output file (.json, .json.zst, .csv, .csv.zst)
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Write a seeded synthetic 1-minute candle file
    Generate {
        #[arg(short, long)]
        out: PathBuf,

        #[arg(short, long, default_value = "1000")]
        count: usize,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        #[arg(long, default_value = "30000.0")]
        start_price: f64,

        /// Per-minute return standard deviation
        #[arg(long, default_value = "0.0015")]
        volatility: f64,
    },
}

fn print_report(report: &BacktestReport) {
    let summary = &report.summary;

    println!("\n═══════════════════════════════════════════════════════════");
    println!("                   BACKTEST RESULTS                        ");
    println!("═══════════════════════════════════════════════════════════\n");

    println!(
        "Candles Processed: {} ({} skipped)",
        report.candles_processed, report.candles_skipped
    );
    println!("Chart Bars:        {}", report.chart_bars);
    println!("Total Trades:      {}", summary.total_trades);
    println!("Wins:              {} ({:.1}%)", summary.wins, summary.win_rate);
    println!("Losses:            {}", summary.losses);
    println!("Max Win Streak:    {}", summary.max_consecutive_wins);
    println!("Max Loss Streak:   {}", summary.max_consecutive_losses);
    println!();
    println!("Profit Factor:     {:.2}", summary.profit_factor);
    println!("Gross Profit:      {:.2}", summary.gross_profit);
    println!("Gross Loss:        {:.2}", summary.gross_loss);
    println!("Avg Win:           {:.2}", summary.avg_win);
    println!("Avg Loss:          {:.2}", summary.avg_loss);
    println!();
    println!("Initial Capital:   {:.2}", summary.initial_capital);
    println!("Final Capital:     {:.2}", summary.final_capital);
    println!("Return:            {:+.2}%", summary.return_percent);
    println!(
        "Max Drawdown:      {:.2} ({:.2}%)",
        summary.max_drawdown, summary.max_drawdown_percent
    );

    if let Some(err) = &report.halted_by {
        println!();
        println!("─── Halted ───");
        println!("{}", err);
    }

    if !report.trades.is_empty() {
        println!();
        println!("─── Trades ───");
        for trade in &report.trades {
            println!(
                "{} -> {} | {:5} | {:.2} -> {:.2} | {:11} | P&L {:+.2} | Capital {:.2}",
                ms_to_datetime(trade.entry_time).format("%Y-%m-%d %H:%M"),
                ms_to_datetime(trade.exit_time).format("%Y-%m-%d %H:%M"),
                trade.side.to_string(),
                trade.entry_price,
                trade.exit_price,
                trade.exit_reason.to_string(),
                trade.pnl,
                trade.resulting_capital
            );
        }
    }

    println!("\n═══════════════════════════════════════════════════════════\n");
}

async fn run_live_command(
    data: PathBuf,
    interval: Option<u64>,
    trade_log: PathBuf,
    config: StrategyConfig,
) -> Result<()> {
    let interval = Duration::from_secs(interval.unwrap_or(config.poll_interval_secs).max(1));
    let engine = Arc::new(RwLock::new(StrategyEngine::new(config)?));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping after the current tick");
            let _ = shutdown_tx.send(true);
        }
    });

    let exit = run_live(engine.clone(), data, interval, Some(trade_log), shutdown_rx).await?;

    let engine = engine.read().await;
    let summary = engine.summary();
    info!(
        "Live session ended | trades {} | win rate {:.1}% | capital {:.2}",
        summary.total_trades, summary.win_rate, summary.final_capital
    );
    if let LiveExit::Halted(err) = exit {
        warn!("Stopped by strategy: {}", err);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose {
        "cvd_fvg_engine=debug,cvd_fvg=debug"
    } else {
        "cvd_fvg_engine=info,cvd_fvg=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Backtest { data, trade_log, strategy } => {
            let config = strategy.resolve()?;
            let report = run_backtest_file(config, &data, trade_log.as_deref())?;
            print_report(&report);
        }
        Commands::Live { data, interval, trade_log, strategy } => {
            let config = strategy.resolve()?;
            run_live_command(data, interval, trade_log, config).await?;
        }
        Commands::Aggregate { data, minutes, anchor, out } => {
            let candles = load_candles(&data)?;
            let aggregated = match anchor {
                Some(anchor) => aggregate_anchored(&candles, minutes, anchor)?,
                None => aggregate(&candles, minutes)?,
            };
            info!(
                "Aggregated {} candles into {} {}m bars",
                candles.len(),
                aggregated.len(),
                minutes
            );
            save_aggregated(&out, &aggregated)?;
        }
        Commands::Generate { out, count, seed, start_price, volatility } => {
            let config = SyntheticConfig {
                count,
                seed,
                start_price,
                volatility,
                ..SyntheticConfig::default()
            };
            let candles = generate_candles(&config)?;
            save_candles(&out, &candles)?;
        }
    }

    Ok(())
}
