//! Moving-average crossover strategy.
//!
//! The strategy only decides; it never holds positions. The caller passes
//! the current position side with every bar and executes the returned
//! signals in order.

use chrono::{DateTime, FixedOffset};
use ta::indicators::{ExponentialMovingAverage, SimpleMovingAverage};
use ta::{Next, Reset};
use tracing::debug;

use crate::error::{Error, Result};
use crate::frame::Record;
use crate::value::Value;

/// One OHLCV bar
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub datetime: DateTime<FixedOffset>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// True when open, high, low and close are all equal
    pub fn is_single_price(&self) -> bool {
        self.open == self.high && self.high == self.low && self.low == self.close
    }

    /// Build a bar from a saved record.
    ///
    /// Returns `Ok(None)` when a price is null or not finite (undefined
    /// prices are saved as null).
    pub fn from_record(record: &Record) -> Result<Option<Bar>> {
        let timestamp = record
            .timestamp()
            .ok_or_else(|| Error::InvalidInput("record has no timestamp".to_string()))?;
        let datetime = parse_timestamp(timestamp)?;

        let mut prices = [0.0; 4];
        for (slot, field) in prices.iter_mut().zip(["open", "high", "low", "close"]) {
            match record.get(field) {
                Some(Value::Null) => return Ok(None),
                Some(value) => match value.as_f64() {
                    Some(price) if price.is_finite() => *slot = price,
                    Some(_) => return Ok(None),
                    None => {
                        return Err(Error::InvalidInput(format!(
                            "field `{}` is not numeric at {}",
                            field, timestamp
                        )))
                    }
                },
                None => {
                    return Err(Error::InvalidInput(format!(
                        "record at {} has no `{}` field",
                        timestamp, field
                    )))
                }
            }
        }

        let volume = record.get("volume").and_then(Value::as_f64).unwrap_or(0.0);
        let [open, high, low, close] = prices;
        Ok(Some(Bar {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }))
    }
}

/// Parse a record timestamp (canonical form or RFC 3339)
pub fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map_err(|e| Error::InvalidInput(format!("bad timestamp `{}`: {}", s, e)))
}

/// Convert records to bars, dropping bars with undefined prices
pub fn bars_from_records(records: &[Record]) -> Result<Vec<Bar>> {
    let mut bars = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for record in records {
        match Bar::from_record(record)? {
            Some(bar) => bars.push(bar),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "dropped bars with undefined prices");
    }
    Ok(bars)
}

/// Moving average flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaKind {
    Simple,
    Exponential,
}

/// Net position direction as seen by the strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Flat,
    Long,
    Short,
}

/// Order intent produced by the strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    CloseAll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaCrossConfig {
    pub kind: MaKind,
    pub fast_period: usize,
    pub slow_period: usize,
    pub trade_size: f64,
    pub close_positions_on_stop: bool,
}

impl MaCrossConfig {
    /// Simple moving average cross
    pub fn sma(fast_period: usize, slow_period: usize) -> Self {
        Self {
            kind: MaKind::Simple,
            fast_period,
            slow_period,
            trade_size: 1.0,
            close_positions_on_stop: true,
        }
    }

    /// Exponential moving average cross
    pub fn ema(fast_period: usize, slow_period: usize) -> Self {
        Self {
            kind: MaKind::Exponential,
            ..Self::sma(fast_period, slow_period)
        }
    }

    pub fn with_trade_size(mut self, trade_size: f64) -> Self {
        self.trade_size = trade_size;
        self
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            MaKind::Simple => "MACross",
            MaKind::Exponential => "EMACross",
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fast_period == 0 {
            return Err(Error::Strategy("fast_period must be positive".to_string()));
        }
        if self.fast_period >= self.slow_period {
            return Err(Error::Strategy(format!(
                "fast_period={} must be less than slow_period={}",
                self.fast_period, self.slow_period
            )));
        }
        if !(self.trade_size.is_finite() && self.trade_size > 0.0) {
            return Err(Error::Strategy(format!(
                "trade_size={} must be positive",
                self.trade_size
            )));
        }
        Ok(())
    }
}

enum MovingAverage {
    Simple(SimpleMovingAverage),
    Exponential(ExponentialMovingAverage),
}

impl MovingAverage {
    fn new(kind: MaKind, period: usize) -> Result<Self> {
        let ma = match kind {
            MaKind::Simple => SimpleMovingAverage::new(period).map(MovingAverage::Simple),
            MaKind::Exponential => ExponentialMovingAverage::new(period).map(MovingAverage::Exponential),
        };
        ma.map_err(|e| Error::Strategy(format!("invalid period {}: {:?}", period, e)))
    }

    fn next(&mut self, value: f64) -> f64 {
        match self {
            MovingAverage::Simple(ma) => ma.next(value),
            MovingAverage::Exponential(ma) => ma.next(value),
        }
    }

    fn reset(&mut self) {
        match self {
            MovingAverage::Simple(ma) => ma.reset(),
            MovingAverage::Exponential(ma) => ma.reset(),
        }
    }
}

/// Fast/slow moving average crossover
pub struct MaCross {
    config: MaCrossConfig,
    fast: MovingAverage,
    slow: MovingAverage,
    fast_value: f64,
    slow_value: f64,
    bars_seen: usize,
}

impl MaCross {
    pub fn new(config: MaCrossConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fast: MovingAverage::new(config.kind, config.fast_period)?,
            slow: MovingAverage::new(config.kind, config.slow_period)?,
            config,
            fast_value: f64::NAN,
            slow_value: f64::NAN,
            bars_seen: 0,
        })
    }

    pub fn config(&self) -> &MaCrossConfig {
        &self.config
    }

    /// Both averages have seen a full window
    pub fn indicators_initialized(&self) -> bool {
        self.bars_seen >= self.config.slow_period
    }

    pub fn fast_value(&self) -> Option<f64> {
        (self.bars_seen > 0).then_some(self.fast_value)
    }

    pub fn slow_value(&self) -> Option<f64> {
        (self.bars_seen > 0).then_some(self.slow_value)
    }

    /// Update the averages with `bar` and decide what to do
    pub fn on_bar(&mut self, bar: &Bar, position: PositionSide) -> Vec<Signal> {
        self.fast_value = self.fast.next(bar.close);
        self.slow_value = self.slow.next(bar.close);
        self.bars_seen += 1;

        if !self.indicators_initialized() {
            debug!("Waiting for indicators to warm up [{}]", self.bars_seen);
            return Vec::new();
        }

        if bar.is_single_price() {
            debug!(datetime = %bar.datetime, "Bar OHLC is single price; implies no market information");
            return Vec::new();
        }

        if self.fast_value >= self.slow_value {
            match position {
                PositionSide::Flat => vec![Signal::Buy],
                PositionSide::Short => vec![Signal::CloseAll, Signal::Buy],
                PositionSide::Long => Vec::new(),
            }
        } else {
            match position {
                PositionSide::Flat => vec![Signal::Sell],
                PositionSide::Long => vec![Signal::CloseAll, Signal::Sell],
                PositionSide::Short => Vec::new(),
            }
        }
    }

    /// Signals to emit when the run ends
    pub fn on_stop(&self, position: PositionSide) -> Vec<Signal> {
        if self.config.close_positions_on_stop && position != PositionSide::Flat {
            vec![Signal::CloseAll]
        } else {
            Vec::new()
        }
    }

    pub fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.fast_value = f64::NAN;
        self.slow_value = f64::NAN;
        self.bars_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{records_from_value, to_records, Frame};
    use polars::prelude::{Column, DataFrame, DataType, NamedFrom, Series, TimeUnit};
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, close: f64) -> Bar {
        Bar {
            datetime: Utc.with_ymd_and_hms(2024, 1, 2, 14, minute, 0).unwrap().fixed_offset(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(MaCrossConfig::sma(10, 20).validate().is_ok());
        assert!(matches!(MaCrossConfig::sma(20, 20).validate(), Err(Error::Strategy(_))));
        assert!(matches!(MaCrossConfig::ema(0, 5).validate(), Err(Error::Strategy(_))));
        assert!(matches!(
            MaCrossConfig::ema(2, 5).with_trade_size(0.0).validate(),
            Err(Error::Strategy(_))
        ));
        assert!(MaCross::new(MaCrossConfig::sma(30, 20)).is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(MaCrossConfig::sma(1, 2).name(), "MACross");
        assert_eq!(MaCrossConfig::ema(1, 2).name(), "EMACross");
    }

    #[test]
    fn test_warm_up_emits_nothing() {
        let mut strategy = MaCross::new(MaCrossConfig::sma(2, 3)).unwrap();
        assert!(strategy.on_bar(&bar(0, 100.0), PositionSide::Flat).is_empty());
        assert!(strategy.on_bar(&bar(1, 101.0), PositionSide::Flat).is_empty());
        assert!(!strategy.indicators_initialized());

        let signals = strategy.on_bar(&bar(2, 102.0), PositionSide::Flat);
        assert!(strategy.indicators_initialized());
        assert_eq!(signals, vec![Signal::Buy]);
    }

    #[test]
    fn test_uptrend_signals() {
        let warmed = || {
            let mut s = MaCross::new(MaCrossConfig::sma(2, 3)).unwrap();
            s.on_bar(&bar(0, 100.0), PositionSide::Flat);
            s.on_bar(&bar(1, 101.0), PositionSide::Flat);
            s
        };
        let up = bar(2, 105.0);

        assert_eq!(warmed().on_bar(&up, PositionSide::Flat), vec![Signal::Buy]);
        assert_eq!(
            warmed().on_bar(&up, PositionSide::Short),
            vec![Signal::CloseAll, Signal::Buy]
        );
        assert!(warmed().on_bar(&up, PositionSide::Long).is_empty());

        let mut strategy = warmed();
        strategy.on_bar(&up, PositionSide::Flat);
        assert_eq!(strategy.fast_value(), Some(103.0));
        assert_eq!(strategy.slow_value(), Some(102.0));
    }

    #[test]
    fn test_downtrend_signals() {
        let fresh = |position| {
            let mut s = MaCross::new(MaCrossConfig::ema(2, 3)).unwrap();
            s.on_bar(&bar(0, 110.0), PositionSide::Flat);
            s.on_bar(&bar(1, 105.0), PositionSide::Flat);
            s.on_bar(&bar(2, 95.0), position)
        };
        assert_eq!(fresh(PositionSide::Flat), vec![Signal::Sell]);
        assert_eq!(fresh(PositionSide::Long), vec![Signal::CloseAll, Signal::Sell]);
        assert!(fresh(PositionSide::Short).is_empty());
    }

    #[test]
    fn test_single_price_bar_is_skipped() {
        let mut strategy = MaCross::new(MaCrossConfig::sma(1, 2)).unwrap();
        strategy.on_bar(&bar(0, 100.0), PositionSide::Flat);

        let mut flat = bar(1, 101.0);
        flat.high = 101.0;
        flat.low = 101.0;
        assert!(flat.is_single_price());
        assert!(strategy.on_bar(&flat, PositionSide::Flat).is_empty());
    }

    #[test]
    fn test_on_stop_and_reset() {
        let mut strategy = MaCross::new(MaCrossConfig::sma(1, 2)).unwrap();
        assert_eq!(strategy.on_stop(PositionSide::Long), vec![Signal::CloseAll]);
        assert!(strategy.on_stop(PositionSide::Flat).is_empty());

        strategy.on_bar(&bar(0, 100.0), PositionSide::Flat);
        strategy.on_bar(&bar(1, 100.0), PositionSide::Flat);
        assert!(strategy.indicators_initialized());
        strategy.reset();
        assert!(!strategy.indicators_initialized());
        assert_eq!(strategy.fast_value(), None);

        let mut keep = MaCrossConfig::sma(1, 2);
        keep.close_positions_on_stop = false;
        let strategy = MaCross::new(keep).unwrap();
        assert!(strategy.on_stop(PositionSide::Short).is_empty());
    }

    #[test]
    fn test_bars_from_records() {
        let index = Series::new("ts_event".into(), [1_704_150_000_000_000_000i64, 1_704_150_060_000_000_000])
            .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
            .unwrap();
        let df = DataFrame::new(vec![
            index.into(),
            Column::new("open".into(), [Some(4818.0), None]),
            Column::new("high".into(), [4819.5, 4819.75]),
            Column::new("low".into(), [4815.75, 4818.0]),
            Column::new("close".into(), [4818.75, 4819.75]),
            Column::new("volume".into(), [1483i64, 783]),
        ])
        .unwrap();
        let frame = Frame::new(df, "ts_event").unwrap();

        let bars = bars_from_records(&to_records(&frame).unwrap()).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 4818.75);
        assert_eq!(bars[0].volume, 1483.0);
        assert_eq!(bars[0].datetime.timestamp(), 1_704_150_000);
    }

    #[test]
    fn test_bar_from_record_errors() {
        let text = r#"[{"timestamp": "yesterday", "open": 1, "high": 1, "low": 1, "close": 1}]"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let records = records_from_value(value).unwrap();
        assert!(matches!(Bar::from_record(&records[0]), Err(Error::InvalidInput(_))));

        let text = r#"[{"timestamp": "2024-01-01T23:00:00Z", "open": 1, "high": 1, "low": 1}]"#;
        let value: Value = serde_json::from_str(text).unwrap();
        let records = records_from_value(value).unwrap();
        assert!(matches!(Bar::from_record(&records[0]), Err(Error::InvalidInput(_))));
    }
}
