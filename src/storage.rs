//! Candle files and trade log
//!
//! Candle files are JSON arrays (`.json`), zstd-compressed JSON
//! (`.json.zst`) or CSV with a header row (`.csv`, `.csv.zst`). Column and
//! field names follow the candle record: `timestamp, open, high, low, close,
//! buyVolume, sellVolume`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::types::{ms_to_datetime, AggregatedCandle, Candle, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Json,
    JsonZst,
    Csv,
    CsvZst,
}

fn format_of(path: &Path) -> Result<FileFormat> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.ends_with(".json.zst") {
        Ok(FileFormat::JsonZst)
    } else if name.ends_with(".csv.zst") {
        Ok(FileFormat::CsvZst)
    } else if name.ends_with(".json") {
        Ok(FileFormat::Json)
    } else if name.ends_with(".csv") {
        Ok(FileFormat::Csv)
    } else {
        bail!("Unsupported candle file {:?} (expected .json, .json.zst, .csv or .csv.zst)", path)
    }
}

fn read_csv<R: Read>(reader: R) -> Result<Vec<Candle>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut candles = Vec::new();
    for result in csv_reader.deserialize() {
        let candle: Candle = result.with_context(|| "Failed to parse CSV row")?;
        candles.push(candle);
    }
    Ok(candles)
}

/// Load candles, sorted ascending with duplicate timestamps and malformed
/// rows dropped
pub fn load_candles(path: &Path) -> Result<Vec<Candle>> {
    let format = format_of(path)?;
    let file = File::open(path).with_context(|| format!("Failed to open file: {:?}", path))?;

    let raw: Vec<Candle> = match format {
        FileFormat::Json => serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse JSON candles: {:?}", path))?,
        FileFormat::JsonZst => {
            let compressed = std::fs::read(path)?;
            let json = zstd::decode_all(&compressed[..])
                .with_context(|| format!("Failed to decompress: {:?}", path))?;
            serde_json::from_slice(&json)
                .with_context(|| format!("Failed to parse JSON candles: {:?}", path))?
        }
        FileFormat::Csv => read_csv(BufReader::new(file))?,
        FileFormat::CsvZst => {
            let decoder = zstd::stream::Decoder::new(file)
                .with_context(|| format!("Failed to create zstd decoder for: {:?}", path))?;
            read_csv(BufReader::new(decoder))?
        }
    };

    let total = raw.len();
    let mut candles: Vec<Candle> = raw.into_iter().filter(Candle::is_well_formed).collect();
    let malformed = total - candles.len();
    if malformed > 0 {
        warn!("Dropped {} malformed candles from {:?}", malformed, path);
    }

    candles.sort_by_key(|c| c.timestamp);
    let before = candles.len();
    candles.dedup_by_key(|c| c.timestamp);
    if candles.len() < before {
        warn!("Dropped {} duplicate-timestamp candles from {:?}", before - candles.len(), path);
    }

    debug!("Loaded {} candles from {:?}", candles.len(), path);
    Ok(candles)
}

/// Flat CSV row for aggregated candles
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    buy_volume: f64,
    sell_volume: f64,
    open_volume_delta: f64,
    max_volume_delta: f64,
    min_volume_delta: f64,
    close_volume_delta: f64,
    constituents: usize,
}

impl From<&AggregatedCandle> for AggregatedRow {
    fn from(a: &AggregatedCandle) -> Self {
        Self {
            timestamp: a.candle.timestamp,
            open: a.candle.open,
            high: a.candle.high,
            low: a.candle.low,
            close: a.candle.close,
            buy_volume: a.candle.buy_volume,
            sell_volume: a.candle.sell_volume,
            open_volume_delta: a.open_volume_delta,
            max_volume_delta: a.max_volume_delta,
            min_volume_delta: a.min_volume_delta,
            close_volume_delta: a.close_volume_delta,
            constituents: a.constituents,
        }
    }
}

fn write_records<T: Serialize, S: Serialize>(
    path: &Path,
    records: &[T],
    to_row: impl Fn(&T) -> S,
) -> Result<()> {
    let format = format_of(path)?;
    let file = File::create(path).with_context(|| format!("Failed to create file: {:?}", path))?;

    match format {
        FileFormat::Json => {
            serde_json::to_writer(BufWriter::new(file), records)?;
        }
        FileFormat::JsonZst => {
            let json = serde_json::to_vec(records)?;
            let compressed = zstd::encode_all(&json[..], 3)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&compressed)?;
            writer.flush()?;
        }
        FileFormat::Csv => {
            let mut writer = csv::Writer::from_writer(BufWriter::new(file));
            for record in records {
                writer.serialize(to_row(record))?;
            }
            writer.flush()?;
        }
        FileFormat::CsvZst => {
            let encoder = zstd::stream::Encoder::new(file, 3)?.auto_finish();
            let mut writer = csv::Writer::from_writer(encoder);
            for record in records {
                writer.serialize(to_row(record))?;
            }
            writer.flush()?;
        }
    }

    info!("Wrote {} records to {:?}", records.len(), path);
    Ok(())
}

pub fn save_candles(path: &Path, candles: &[Candle]) -> Result<()> {
    write_records(path, candles, |c| *c)
}

pub fn save_aggregated(path: &Path, candles: &[AggregatedCandle]) -> Result<()> {
    write_records(path, candles, |c| AggregatedRow::from(c))
}

#[derive(Debug, Serialize, Deserialize)]
struct TradeRow {
    id: String,
    side: String,
    size: f64,
    entry_time: String,
    entry_price: f64,
    exit_time: String,
    exit_price: f64,
    pnl: f64,
    exit_reason: String,
    resulting_capital: f64,
}

impl From<&Trade> for TradeRow {
    fn from(t: &Trade) -> Self {
        Self {
            id: t.id.to_string(),
            side: t.side.to_string(),
            size: t.size,
            entry_time: ms_to_datetime(t.entry_time).to_rfc3339(),
            entry_price: t.entry_price,
            exit_time: ms_to_datetime(t.exit_time).to_rfc3339(),
            exit_price: t.exit_price,
            pnl: t.pnl,
            exit_reason: t.exit_reason.to_string(),
            resulting_capital: t.resulting_capital,
        }
    }
}

/// Appends closed trades to a CSV file, writing the header once
pub struct TradeLogger {
    writer: csv::Writer<File>,
}

impl TradeLogger {
    pub fn new(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open trade log: {:?}", path))?;
        let is_empty = file.metadata()?.len() == 0;

        let writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);
        Ok(Self { writer })
    }

    pub fn log_trade(&mut self, trade: &Trade) -> Result<()> {
        self.writer.serialize(TradeRow::from(trade))?;
        self.writer.flush()?;
        Ok(())
    }
}
