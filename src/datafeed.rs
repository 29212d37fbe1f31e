//! Datafeed module for fetching historical market data.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use polars::prelude::{Column, DataFrame, DataType, NamedFrom, Series, TimeUnit};
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::setting::Settings;

/// Databento sentinel for an undefined fixed-point price
pub const UNDEF_PRICE: i64 = i64::MAX;

/// Scale of Databento fixed-point prices (1e-9 units)
const PRICE_SCALE: u32 = 9;

/// Index column name of OHLCV frames
pub const INDEX_NAME: &str = "ts_event";

/// Date range query against a historical dataset
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRequest {
    pub dataset: String,
    pub schema: String,
    pub symbols: Vec<String>,
    pub stype_in: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub limit: Option<u64>,
}

impl RangeRequest {
    /// One-minute OHLCV bars of the front E-mini S&P contract
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            dataset: "GLBX.MDP3".to_string(),
            schema: "ohlcv-1m".to_string(),
            symbols: vec!["ES.v.0".to_string()],
            stype_in: "continuous".to_string(),
            start,
            end,
            limit: Some(1),
        }
    }

    /// Apply the `datafeed.*` settings over the defaults
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        if let Some(dataset) = settings.get_string("datafeed.dataset") {
            self.dataset = dataset;
        }
        if let Some(schema) = settings.get_string("datafeed.schema") {
            self.schema = schema;
        }
        if let Some(symbols) = settings.get_string("datafeed.symbols") {
            self.symbols = symbols.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(stype_in) = settings.get_string("datafeed.stype_in") {
            self.stype_in = stype_in;
        }
        self
    }

    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    fn start_param(&self) -> String {
        format!("{}T00:00:00", self.start.format("%Y-%m-%d"))
    }

    fn end_param(&self) -> String {
        format!("{}T00:00:00", self.end.format("%Y-%m-%d"))
    }

    /// Query string parameters for the `timeseries.get_range` endpoint
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("dataset", self.dataset.clone()),
            ("schema", self.schema.clone()),
            ("symbols", self.symbols.join(",")),
            ("stype_in", self.stype_in.clone()),
            ("start", self.start_param()),
            ("end", self.end_param()),
            ("encoding", "json".to_string()),
            ("map_symbols", "true".to_string()),
        ];
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

/// Abstract datafeed trait for connecting to different data sources
#[async_trait]
pub trait BaseDatafeed: Send + Sync {
    /// Query a date range and return it as a time-indexed frame
    async fn query_range(&self, req: &RangeRequest) -> Result<Frame>;
}

/// Datafeed used when nothing is configured
#[derive(Debug, Default)]
pub struct EmptyDatafeed;

impl EmptyDatafeed {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BaseDatafeed for EmptyDatafeed {
    async fn query_range(&self, _req: &RangeRequest) -> Result<Frame> {
        Err(Error::Datafeed(
            "no datafeed configured; set DATABENTO_API_KEY".to_string(),
        ))
    }
}

/// Databento historical HTTP API client
pub struct DatabentoDatafeed {
    client: Client,
    api_key: String,
    host: String,
}

impl DatabentoDatafeed {
    pub const DEFAULT_HOST: &'static str = "https://hist.databento.com";

    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::Config("Missing Databento API key".to_string()));
        }

        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            api_key,
            host: Self::DEFAULT_HOST.to_string(),
        })
    }

    /// Client configured from settings (`DATABENTO_API_KEY`, `datafeed.host`)
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let feed = Self::new(settings.databento_api_key())?;
        Ok(match settings.get_string("datafeed.host") {
            Some(host) => feed.with_host(host),
            None => feed,
        })
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into().trim_end_matches('/').to_string();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl BaseDatafeed for DatabentoDatafeed {
    async fn query_range(&self, req: &RangeRequest) -> Result<Frame> {
        let url = format!("{}/v0/timeseries.get_range", self.host);
        info!(
            dataset = %req.dataset,
            schema = %req.schema,
            symbols = %req.symbols.join(","),
            start = %req.start,
            end = %req.end,
            "querying databento range"
        );

        let body = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Some(""))
            .query(&req.query_params())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let frame = parse_ohlcv_json(&body)?;
        debug!(rows = frame.height(), "parsed databento response");
        Ok(frame)
    }
}

/// Datafeed selected by the settings: Databento when an API key is set
pub fn get_datafeed(settings: &Settings) -> Result<Box<dyn BaseDatafeed>> {
    if settings.databento_api_key().trim().is_empty() {
        warn!("DATABENTO_API_KEY is not set, using empty datafeed");
        return Ok(Box::new(EmptyDatafeed::new()));
    }
    Ok(Box::new(DatabentoDatafeed::from_settings(settings)?))
}

/// Integer field that Databento may encode as a JSON string or number
fn int_field(value: &serde_json::Value, name: &str, line: usize) -> Result<i64> {
    let field = value
        .get(name)
        .ok_or_else(|| Error::Datafeed(format!("line {}: missing field `{}`", line, name)))?;
    let parsed = match field {
        serde_json::Value::String(s) => s.parse::<i64>().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        Error::Datafeed(format!("line {}: field `{}` is not an integer: {}", line, name, field))
    })
}

/// Fixed-point price to float; the undefined sentinel becomes NaN
pub fn price_from_fixed(raw: i64) -> f64 {
    if raw == UNDEF_PRICE {
        return f64::NAN;
    }
    Decimal::new(raw, PRICE_SCALE).to_f64().unwrap_or(f64::NAN)
}

/// Parse newline-delimited OHLCV records into a frame indexed by `ts_event`
pub fn parse_ohlcv_json(body: &str) -> Result<Frame> {
    let mut ts_event = Vec::new();
    let mut rtype = Vec::new();
    let mut publisher_id = Vec::new();
    let mut instrument_id = Vec::new();
    let mut open = Vec::new();
    let mut high = Vec::new();
    let mut low = Vec::new();
    let mut close = Vec::new();
    let mut volume = Vec::new();
    let mut symbol: Vec<Option<String>> = Vec::new();

    for (n, line) in body.lines().enumerate() {
        let line_no = n + 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| Error::Datafeed(format!("line {}: {}", line_no, e)))?;
        let header = record
            .get("hd")
            .ok_or_else(|| Error::Datafeed(format!("line {}: missing record header", line_no)))?;

        ts_event.push(int_field(header, "ts_event", line_no)?);
        rtype.push(int_field(header, "rtype", line_no)?);
        publisher_id.push(int_field(header, "publisher_id", line_no)?);
        instrument_id.push(int_field(header, "instrument_id", line_no)?);

        open.push(price_from_fixed(int_field(&record, "open", line_no)?));
        high.push(price_from_fixed(int_field(&record, "high", line_no)?));
        low.push(price_from_fixed(int_field(&record, "low", line_no)?));
        close.push(price_from_fixed(int_field(&record, "close", line_no)?));
        volume.push(int_field(&record, "volume", line_no)?);
        symbol.push(record.get("symbol").and_then(|s| s.as_str()).map(str::to_string));
    }

    let index = Series::new(INDEX_NAME.into(), ts_event)
        .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))?;

    let df = DataFrame::new(vec![
        index.into(),
        Column::new("rtype".into(), rtype),
        Column::new("publisher_id".into(), publisher_id),
        Column::new("instrument_id".into(), instrument_id),
        Column::new("open".into(), open),
        Column::new("high".into(), high),
        Column::new("low".into(), low),
        Column::new("close".into(), close),
        Column::new("volume".into(), volume),
        Column::new("symbol".into(), symbol),
    ])?;

    Frame::new(df, INDEX_NAME)
}
