//! bt_cli - market data persistence and backtest utilities
//!
//! This crate provides:
//!
//! - Conversion of time-indexed polars dataframes into flat JSON records
//! - JSON persistence with NaN sanitization, sorted keys and atomic writes
//! - A Databento historical datafeed
//! - Moving-average crossover backtests and PDF reports
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use bt_cli::{save_data, to_records, records_to_value, Frame};
//! use polars::prelude::DataFrame;
//! use std::path::Path;
//!
//! fn persist(df: DataFrame) -> bt_cli::Result<()> {
//!     let frame = Frame::new(df, "ts_event")?;
//!     let records = to_records(&frame)?;
//!     save_data(&records_to_value(records), Path::new("prices.json"))
//! }
//! ```

pub mod backtest;
pub mod datafeed;
pub mod error;
pub mod frame;
pub mod logger;
pub mod persist;
pub mod report;
pub mod setting;
pub mod stats;
pub mod strategy;
pub mod value;

// Re-export commonly used types
pub use backtest::{BacktestConfig, BacktestEngine, BacktestResult};
pub use datafeed::{BaseDatafeed, DatabentoDatafeed, EmptyDatafeed, RangeRequest};
pub use error::{Error, Result};
pub use frame::{
    records_from_value, records_to_value, to_records, Frame, IndexValue, Record, Row,
    TabularSource, TIMESTAMP_FIELD,
};
pub use logger::init_logger;
pub use persist::{latest_file, load_data, sanitize, save_data, to_json_string, write_atomic};
pub use report::BacktestReportGenerator;
pub use setting::{Environment, SettingValue, Settings};
pub use strategy::{Bar, MaCross, MaCrossConfig, MaKind, PositionSide, Signal};
pub use value::{Map, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
