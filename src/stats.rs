//! Statistics over saved price data and return series.

use std::fmt;

use crate::error::{Error, Result};
use crate::frame::Record;
use crate::value::Value;

/// Summary of one saved price-data file
#[derive(Debug, Clone, PartialEq)]
pub struct PriceDataStats {
    pub count: usize,
    pub start: Option<String>,
    pub end: Option<String>,
    pub symbols: Vec<String>,
    pub first_close: Option<f64>,
    pub last_close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub total_volume: f64,
}

impl fmt::Display for PriceDataStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opt_str = |v: &Option<String>| v.clone().unwrap_or_else(|| "None".to_string());
        let opt_num = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_else(|| "None".to_string());

        writeln!(f, "  Count: {}", self.count)?;
        writeln!(f, "  Start: {}", opt_str(&self.start))?;
        writeln!(f, "  End: {}", opt_str(&self.end))?;
        if self.symbols.is_empty() {
            writeln!(f, "  Symbols: []")?;
        } else {
            writeln!(f, "  Symbols: {}", self.symbols.join(", "))?;
        }
        writeln!(f, "  First close: {}", opt_num(self.first_close))?;
        writeln!(f, "  Last close: {}", opt_num(self.last_close))?;
        writeln!(f, "  High: {}", opt_num(self.high))?;
        writeln!(f, "  Low: {}", opt_num(self.low))?;
        write!(f, "  Total volume: {}", self.total_volume)
    }
}

/// Finite numeric field of a record
fn finite_field(record: &Record, field: &str) -> Option<f64> {
    record
        .get(field)
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
}

/// Summarize records in file order; missing or null prices are skipped
pub fn summarize(records: &[Record]) -> Result<PriceDataStats> {
    let mut symbols: Vec<String> = Vec::new();
    let mut high: Option<f64> = None;
    let mut low: Option<f64> = None;
    let mut first_close = None;
    let mut last_close = None;
    let mut total_volume = 0.0;

    for (i, record) in records.iter().enumerate() {
        if record.timestamp().is_none() {
            return Err(Error::InvalidInput(format!("record {} has no timestamp", i)));
        }

        if let Some(symbol) = record.get("symbol").and_then(Value::as_str) {
            if !symbols.iter().any(|s| s == symbol) {
                symbols.push(symbol.to_string());
            }
        }

        if let Some(close) = finite_field(record, "close") {
            first_close.get_or_insert(close);
            last_close = Some(close);
        }
        if let Some(h) = finite_field(record, "high") {
            high = Some(high.map_or(h, |cur| cur.max(h)));
        }
        if let Some(l) = finite_field(record, "low") {
            low = Some(low.map_or(l, |cur| cur.min(l)));
        }
        total_volume += finite_field(record, "volume").unwrap_or(0.0);
    }

    Ok(PriceDataStats {
        count: records.len(),
        start: records.first().and_then(|r| r.timestamp()).map(str::to_string),
        end: records.last().and_then(|r| r.timestamp()).map(str::to_string),
        symbols,
        first_close,
        last_close,
        high,
        low,
        total_volume,
    })
}

/// Calculate maximum drawdown from a series of balance values
pub fn calculate_max_drawdown(balances: &[f64]) -> (f64, f64) {
    let mut max_balance = 0.0;
    let mut max_drawdown = 0.0;
    let mut max_drawdown_percent = 0.0;

    for &balance in balances {
        if balance > max_balance {
            max_balance = balance;
        }

        let drawdown = max_balance - balance;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
            if max_balance > 0.0 {
                max_drawdown_percent = (drawdown / max_balance) * 100.0;
            }
        }
    }

    (max_drawdown, max_drawdown_percent)
}

/// Calculate period returns from balance series
pub fn calculate_returns(balances: &[f64]) -> Vec<f64> {
    balances
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Arithmetic mean; NaN for an empty series
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation; NaN with fewer than two values
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Annualized Sharpe ratio; NaN when it is undefined
pub fn calculate_sharpe_ratio(returns: &[f64], risk_free: f64, annual_days: u32) -> f64 {
    let std_return = sample_std(returns);
    if !std_return.is_finite() || std_return == 0.0 {
        return f64::NAN;
    }

    let daily_risk_free = risk_free / annual_days as f64;
    let excess_return = mean(returns) - daily_risk_free;

    excess_return / std_return * (annual_days as f64).sqrt()
}
