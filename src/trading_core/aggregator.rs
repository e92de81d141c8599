//! Multi-timeframe candle aggregation
//!
//! Folds finer candles into calendar-aligned buckets
//! (`floor(ts / granularity) * granularity`). A bucket is emitted only when a
//! candle from a later bucket arrives, or on `flush()`.

use tracing::debug;

use crate::error::{StrategyError, StrategyResult};
use crate::types::{AggregatedCandle, Candle, MINUTE_MS};

/// Bucket being built
#[derive(Debug, Clone)]
struct BucketBuilder {
    start: i64,
    last_ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    buy_volume: f64,
    sell_volume: f64,
    open_delta: f64,
    running_delta: f64,
    max_delta: f64,
    min_delta: f64,
    constituents: usize,
}

impl BucketBuilder {
    fn new(start: i64, candle: &Candle, open_delta: f64) -> Self {
        let mut bucket = Self {
            start,
            last_ts: candle.timestamp,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            buy_volume: 0.0,
            sell_volume: 0.0,
            open_delta,
            running_delta: open_delta,
            max_delta: open_delta,
            min_delta: open_delta,
            constituents: 0,
        };
        bucket.fold(candle);
        bucket
    }

    fn add(&mut self, candle: &Candle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.last_ts = candle.timestamp;
        self.fold(candle);
    }

    fn fold(&mut self, candle: &Candle) {
        self.buy_volume += candle.buy_volume;
        self.sell_volume += candle.sell_volume;
        self.running_delta += candle.delta();
        self.max_delta = self.max_delta.max(self.running_delta);
        self.min_delta = self.min_delta.min(self.running_delta);
        self.constituents += 1;
    }

    fn to_candle(&self) -> AggregatedCandle {
        AggregatedCandle {
            candle: Candle {
                timestamp: self.start,
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
                buy_volume: self.buy_volume,
                sell_volume: self.sell_volume,
            },
            open_volume_delta: self.open_delta,
            max_volume_delta: self.max_delta,
            min_volume_delta: self.min_delta,
            close_volume_delta: self.running_delta,
            constituents: self.constituents,
        }
    }
}

/// Streaming aggregator for one target timeframe.
///
/// Without a delta anchor the intra-bucket CVD restarts at 0 every bucket.
/// With an anchor the CVD carries over between buckets and restarts at 0
/// when a bucket opens in a new anchor period.
#[derive(Debug, Clone)]
pub struct CandleAggregator {
    granularity_ms: i64,
    anchor_ms: Option<i64>,
    current: Option<BucketBuilder>,
    /// CVD at the close of the last emitted bucket, with its bucket start
    carry: Option<(i64, f64)>,
}

impl CandleAggregator {
    pub fn new(granularity_minutes: i64) -> StrategyResult<Self> {
        if granularity_minutes <= 0 {
            return Err(StrategyError::Configuration(format!(
                "aggregation granularity must be positive, got {}m",
                granularity_minutes
            )));
        }
        Ok(Self {
            granularity_ms: granularity_minutes * MINUTE_MS,
            anchor_ms: None,
            current: None,
            carry: None,
        })
    }

    /// Carry CVD across buckets, resetting at `anchor_minutes` boundaries
    pub fn with_delta_anchor(mut self, anchor_minutes: i64) -> StrategyResult<Self> {
        if anchor_minutes <= 0 {
            return Err(StrategyError::Configuration(format!(
                "CVD anchor period must be positive, got {}m",
                anchor_minutes
            )));
        }
        self.anchor_ms = Some(anchor_minutes * MINUTE_MS);
        Ok(self)
    }

    pub fn bucket_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.granularity_ms) * self.granularity_ms
    }

    /// CVD a new bucket starting at `start` opens with
    fn opening_delta(&self, start: i64) -> f64 {
        let (Some(anchor), Some((prev_start, prev_delta))) = (self.anchor_ms, self.carry) else {
            return 0.0;
        };
        if prev_start.div_euclid(anchor) == start.div_euclid(anchor) {
            prev_delta
        } else {
            0.0
        }
    }

    /// Feed the next finer candle; returns the bucket it closed, if any
    pub fn push(&mut self, candle: &Candle) -> Option<AggregatedCandle> {
        let start = self.bucket_start(candle.timestamp);

        match &mut self.current {
            Some(bucket) if start == bucket.start => {
                if candle.timestamp <= bucket.last_ts {
                    debug!("Aggregator skipping stale candle at {}", candle.timestamp);
                    return None;
                }
                bucket.add(candle);
                None
            }
            Some(bucket) if start < bucket.start => {
                debug!("Aggregator skipping candle from closed bucket at {}", candle.timestamp);
                None
            }
            _ => {
                let closed = self.take_current();
                let open_delta = self.opening_delta(start);
                self.current = Some(BucketBuilder::new(start, candle, open_delta));
                closed
            }
        }
    }

    /// Emit the partially built bucket (end of input)
    pub fn flush(&mut self) -> Option<AggregatedCandle> {
        self.take_current()
    }

    /// Bucket currently being built, without closing it
    pub fn peek(&self) -> Option<AggregatedCandle> {
        self.current.as_ref().map(BucketBuilder::to_candle)
    }

    fn take_current(&mut self) -> Option<AggregatedCandle> {
        let bucket = self.current.take()?;
        self.carry = Some((bucket.start, bucket.running_delta));
        Some(bucket.to_candle())
    }
}

fn sorted_unique(source: &[Candle]) -> Vec<Candle> {
    let mut candles = source.to_vec();
    if !candles.windows(2).all(|w| w[0].timestamp < w[1].timestamp) {
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
    }
    candles
}

/// Aggregate a candle series into `target_minutes` buckets
pub fn aggregate(source: &[Candle], target_minutes: i64) -> StrategyResult<Vec<AggregatedCandle>> {
    let aggregator = CandleAggregator::new(target_minutes)?;
    Ok(run(aggregator, source))
}

/// Aggregate with CVD carried across buckets within each anchor period
pub fn aggregate_anchored(
    source: &[Candle],
    target_minutes: i64,
    anchor_minutes: i64,
) -> StrategyResult<Vec<AggregatedCandle>> {
    let aggregator = CandleAggregator::new(target_minutes)?.with_delta_anchor(anchor_minutes)?;
    Ok(run(aggregator, source))
}

fn run(mut aggregator: CandleAggregator, source: &[Candle]) -> Vec<AggregatedCandle> {
    let candles = sorted_unique(source);
    let mut out: Vec<AggregatedCandle> =
        candles.iter().filter_map(|c| aggregator.push(c)).collect();
    out.extend(aggregator.flush());
    out
}
