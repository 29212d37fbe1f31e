//! Time-indexed tabular data and its conversion into flat records.
//!
//! Tables are polars [`DataFrame`]s. The row index is one of the frame's
//! columns: either named explicitly through [`Frame`], or the first datetime
//! column when a bare `DataFrame` is converted.

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use polars::prelude::{AnyValue, Column, DataFrame, DataType, TimeUnit};

use crate::error::{Error, Result};
use crate::value::{Map, Value};

/// Field injected into every record for the row index
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Row index value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexValue {
    Timestamp(DateTime<FixedOffset>),
    Date(NaiveDate),
    Int(i64),
    Label(String),
}

impl IndexValue {
    /// Canonical, locale-independent string form.
    ///
    /// Timestamps render as `2024-01-01 23:00:00+00:00`. Fractional seconds
    /// appear only when non-zero: six digits, or nine when the value carries
    /// sub-microsecond precision.
    pub fn to_canonical_string(&self) -> String {
        match self {
            IndexValue::Timestamp(dt) => {
                let nanos = dt.nanosecond() % 1_000_000_000;
                let pattern = if nanos == 0 {
                    "%Y-%m-%d %H:%M:%S%:z"
                } else if nanos % 1_000 == 0 {
                    "%Y-%m-%d %H:%M:%S%.6f%:z"
                } else {
                    "%Y-%m-%d %H:%M:%S%.9f%:z"
                };
                dt.format(pattern).to_string()
            }
            IndexValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Label(s) => s.clone(),
        }
    }

    /// Index value of a polars cell; `None` for nulls and non-index types
    pub fn from_any_value(value: &AnyValue<'_>) -> Option<Self> {
        match value {
            AnyValue::Datetime(v, unit, _) | AnyValue::DatetimeOwned(v, unit, _) => {
                epoch_nanos(*v, *unit).map(|ns| IndexValue::from(DateTime::from_timestamp_nanos(ns)))
            }
            AnyValue::Date(days) => DateTime::from_timestamp(i64::from(*days) * 86_400, 0)
                .map(|dt| IndexValue::Date(dt.date_naive())),
            AnyValue::Int8(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::Int16(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::Int32(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::Int64(v) => Some(IndexValue::Int(*v)),
            AnyValue::UInt8(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::UInt16(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::UInt32(v) => Some(IndexValue::Int(i64::from(*v))),
            AnyValue::UInt64(v) => i64::try_from(*v).ok().map(IndexValue::Int),
            AnyValue::String(s) => Some(IndexValue::Label((*s).to_string())),
            AnyValue::StringOwned(s) => Some(IndexValue::Label(s.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl<Tz: chrono::TimeZone> From<DateTime<Tz>> for IndexValue {
    fn from(dt: DateTime<Tz>) -> Self {
        IndexValue::Timestamp(dt.fixed_offset())
    }
}

impl From<NaiveDate> for IndexValue {
    fn from(d: NaiveDate) -> Self {
        IndexValue::Date(d)
    }
}

fn epoch_nanos(value: i64, unit: TimeUnit) -> Option<i64> {
    match unit {
        TimeUnit::Nanoseconds => Some(value),
        TimeUnit::Microseconds => value.checked_mul(1_000),
        TimeUnit::Milliseconds => value.checked_mul(1_000_000),
    }
}

/// Scalar cell of a polars column
fn cell_value(value: AnyValue<'_>) -> Value {
    match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(b),
        AnyValue::Int8(v) => Value::Int(i64::from(v)),
        AnyValue::Int16(v) => Value::Int(i64::from(v)),
        AnyValue::Int32(v) => Value::Int(i64::from(v)),
        AnyValue::Int64(v) => Value::Int(v),
        AnyValue::UInt8(v) => Value::Int(i64::from(v)),
        AnyValue::UInt16(v) => Value::Int(i64::from(v)),
        AnyValue::UInt32(v) => Value::Int(i64::from(v)),
        AnyValue::UInt64(v) => i64::try_from(v)
            .map(Value::Int)
            .unwrap_or(Value::Float(v as f64)),
        AnyValue::Float32(v) => Value::Float(f64::from(v)),
        AnyValue::Float64(v) => Value::Float(v),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        other => match IndexValue::from_any_value(&other) {
            Some(index) => Value::String(index.to_canonical_string()),
            None => Value::String(other.to_string()),
        },
    }
}

/// One row of a [`TabularSource`]: the index value (if any) and the cells
pub type Row = (Option<IndexValue>, Vec<Value>);

/// Adapter contract for anything that can be flattened into records
pub trait TabularSource {
    /// Column names in a stable order, excluding the index
    fn column_names(&self) -> Vec<&str>;

    /// Iterate rows in their original order
    fn rows(&self) -> Box<dyn Iterator<Item = Result<Row>> + '_>;
}

fn frame_rows<'a>(
    df: &'a DataFrame,
    index: Option<&'a Column>,
) -> Box<dyn Iterator<Item = Result<Row>> + 'a> {
    let cells: Vec<&Column> = df
        .get_columns()
        .iter()
        .filter(|c| index.map_or(true, |idx| c.name() != idx.name()))
        .collect();

    Box::new((0..df.height()).map(move |i| {
        let index_value = match index {
            Some(column) => IndexValue::from_any_value(&column.get(i)?),
            None => None,
        };
        let values = cells
            .iter()
            .map(|c| c.get(i).map(cell_value))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((index_value, values))
    }))
}

/// A bare frame is indexed by its first datetime column
impl TabularSource for DataFrame {
    fn column_names(&self) -> Vec<&str> {
        let index = datetime_index(self).map(|c| c.name().as_str());
        self.get_columns()
            .iter()
            .map(|c| c.name().as_str())
            .filter(|name| Some(*name) != index)
            .collect()
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Result<Row>> + '_> {
        frame_rows(self, datetime_index(self))
    }
}

fn datetime_index(df: &DataFrame) -> Option<&Column> {
    df.get_columns()
        .iter()
        .find(|c| matches!(c.dtype(), DataType::Datetime(_, _)))
}

/// A [`DataFrame`] with a named index column holding unique, non-null values
#[derive(Debug, Clone)]
pub struct Frame {
    df: DataFrame,
    index_name: String,
}

impl Frame {
    pub fn new(df: DataFrame, index_name: impl Into<String>) -> Result<Self> {
        let index_name = index_name.into();
        let index = df.column(&index_name).map_err(|_| {
            Error::InvalidInput(format!("index column `{}` not found", index_name))
        })?;

        let dtype = index.dtype();
        let supported = dtype.is_integer()
            || matches!(dtype, DataType::Datetime(_, _) | DataType::Date | DataType::String);
        if !supported {
            return Err(Error::InvalidInput(format!(
                "index column `{}` has unsupported type {}",
                index_name, dtype
            )));
        }
        if index.null_count() > 0 {
            return Err(Error::InvalidInput(format!(
                "index column `{}` has {} null values",
                index_name,
                index.null_count()
            )));
        }
        if index.as_materialized_series().n_unique()? != index.len() {
            return Err(Error::InvalidInput(format!(
                "index column `{}` has duplicate values",
                index_name
            )));
        }

        Ok(Self { df, index_name })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn data(&self) -> &DataFrame {
        &self.df
    }

    pub fn into_inner(self) -> DataFrame {
        self.df
    }

    /// Number of rows
    pub fn height(&self) -> usize {
        self.df.height()
    }

    pub fn is_empty(&self) -> bool {
        self.df.height() == 0
    }

    fn index(&self) -> Option<&Column> {
        self.df.column(&self.index_name).ok()
    }
}

impl TabularSource for Frame {
    fn column_names(&self) -> Vec<&str> {
        self.df
            .get_columns()
            .iter()
            .map(|c| c.name().as_str())
            .filter(|name| *name != self.index_name)
            .collect()
    }

    fn rows(&self) -> Box<dyn Iterator<Item = Result<Row>> + '_> {
        frame_rows(&self.df, self.index())
    }
}

/// One flattened row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record(Map);

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The injected index string
    pub fn timestamp(&self) -> Option<&str> {
        self.get(TIMESTAMP_FIELD).and_then(Value::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Map {
        self.0
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                if !matches!(map.get(TIMESTAMP_FIELD), Some(Value::String(_))) {
                    return Err(Error::InvalidInput(format!(
                        "record has no string `{}` field",
                        TIMESTAMP_FIELD
                    )));
                }
                Ok(Record(map))
            }
            other => Err(Error::InvalidInput(format!(
                "expected a record object, found {}",
                other
            ))),
        }
    }
}

/// Flatten a tabular source into records, one per row, in row order
pub fn to_records<S: TabularSource + ?Sized>(source: &S) -> Result<Vec<Record>> {
    let names = source.column_names();
    if names.iter().any(|name| *name == TIMESTAMP_FIELD) {
        return Err(Error::InvalidInput(format!(
            "column `{}` collides with the injected index field",
            TIMESTAMP_FIELD
        )));
    }

    let mut records = Vec::new();
    for (position, row) in source.rows().enumerate() {
        let (index, cells) = row?;
        let index = index.ok_or_else(|| {
            Error::InvalidInput(format!("row {} has no index value", position))
        })?;
        if cells.len() != names.len() {
            return Err(Error::InvalidInput(format!(
                "row {} has {} values for {} columns",
                position,
                cells.len(),
                names.len()
            )));
        }

        let mut map = Map::new();
        for (name, cell) in names.iter().zip(cells) {
            map.insert((*name).to_string(), cell);
        }
        map.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(index.to_canonical_string()),
        );
        records.push(Record(map));
    }

    Ok(records)
}

/// Records as a JSON-ready array document
pub fn records_to_value(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::from).collect())
}

/// Read records back from an array document
pub fn records_from_value(value: Value) -> Result<Vec<Record>> {
    match value {
        Value::Array(items) => items.into_iter().map(Record::try_from).collect(),
        other => Err(Error::InvalidInput(format!(
            "expected an array of records, found {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use polars::prelude::{NamedFrom, Series};

    const T0: i64 = 1_704_150_000_000_000_000;
    const MINUTE: i64 = 60_000_000_000;

    fn ts(h: u32, m: u32) -> IndexValue {
        IndexValue::from(Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap())
    }

    fn datetime_column(name: &str, nanos: &[i64]) -> Column {
        Series::new(name.into(), nanos)
            .cast(&DataType::Datetime(TimeUnit::Nanoseconds, None))
            .unwrap()
            .into()
    }

    fn ohlcv_frame() -> Frame {
        let df = DataFrame::new(vec![
            datetime_column("ts_event", &[T0, T0 + MINUTE]),
            Column::new("rtype".into(), [33i64, 33]),
            Column::new("publisher_id".into(), [1i64, 1]),
            Column::new("instrument_id".into(), [17077i64, 17077]),
            Column::new("open".into(), [4818.0, 4818.75]),
            Column::new("high".into(), [4819.5, 4819.75]),
            Column::new("low".into(), [4815.75, 4818.0]),
            Column::new("close".into(), [4818.75, 4819.75]),
            Column::new("volume".into(), [1483i64, 783]),
            Column::new("symbol".into(), ["ES.v.0", "ES.v.0"]),
        ])
        .unwrap();
        Frame::new(df, "ts_event").unwrap()
    }

    #[test]
    fn test_canonical_timestamp() {
        assert_eq!(ts(23, 0).to_canonical_string(), "2024-01-01 23:00:00+00:00");

        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert_eq!(IndexValue::from(date).to_canonical_string(), "2024-01-02");
        assert_eq!(IndexValue::Int(-4).to_canonical_string(), "-4");
    }

    #[test]
    fn test_canonical_fractional_seconds() {
        let millis = IndexValue::from(DateTime::from_timestamp_nanos(T0 + 123_000_000));
        assert_eq!(millis.to_canonical_string(), "2024-01-01 23:00:00.123000+00:00");

        let micros = IndexValue::from(DateTime::from_timestamp_nanos(T0 + 5_000));
        assert_eq!(micros.to_canonical_string(), "2024-01-01 23:00:00.000005+00:00");

        let nanos = IndexValue::from(DateTime::from_timestamp_nanos(T0 + 1));
        assert_eq!(nanos.to_canonical_string(), "2024-01-01 23:00:00.000000001+00:00");
    }

    #[test]
    fn test_index_from_any_value() {
        let ms = AnyValue::Datetime(1_704_150_000_000, TimeUnit::Milliseconds, None);
        assert_eq!(IndexValue::from_any_value(&ms), Some(ts(23, 0)));

        let date = AnyValue::Date(19_724);
        assert_eq!(
            IndexValue::from_any_value(&date),
            Some(IndexValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()))
        );
        assert_eq!(IndexValue::from_any_value(&AnyValue::Null), None);
    }

    #[test]
    fn test_to_records_ohlcv() {
        let records = to_records(&ohlcv_frame()).unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.timestamp(), Some("2024-01-01 23:00:00+00:00"));
        assert_eq!(first.get("close"), Some(&Value::Float(4818.75)));
        assert_eq!(first.get("high"), Some(&Value::Float(4819.5)));
        assert_eq!(first.get("instrument_id"), Some(&Value::Int(17077)));
        assert_eq!(first.get("volume"), Some(&Value::Int(1483)));
        assert_eq!(first.get("symbol"), Some(&Value::from("ES.v.0")));
        assert_eq!(first.get("ts_event"), None);
        assert_eq!(first.len(), 10);

        let second = &records[1];
        assert_eq!(second.timestamp(), Some("2024-01-01 23:01:00+00:00"));
        assert_eq!(second.get("open"), Some(&Value::Float(4818.75)));
        assert_eq!(second.get("volume"), Some(&Value::Int(783)));
    }

    #[test]
    fn test_bare_dataframe_uses_datetime_column() {
        let df = DataFrame::new(vec![
            Column::new("close".into(), [1.5, 2.5]),
            datetime_column("ts_event", &[T0, T0 + MINUTE]),
        ])
        .unwrap();

        assert_eq!(TabularSource::column_names(&df), vec!["close"]);
        let records = to_records(&df).unwrap();
        assert_eq!(records[1].timestamp(), Some("2024-01-01 23:01:00+00:00"));
        assert_eq!(records[1].get("close"), Some(&Value::Float(2.5)));
    }

    #[test]
    fn test_bare_dataframe_without_datetime_column() {
        let df = DataFrame::new(vec![Column::new("close".into(), [1.0])]).unwrap();
        assert!(matches!(to_records(&df), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_to_records_preserves_unsorted_order() {
        let df = DataFrame::new(vec![
            datetime_column("ts", &[T0 + 5 * MINUTE, T0 + MINUTE, T0 + 3 * MINUTE]),
            Column::new("close".into(), [3.0, 1.0, 2.0]),
        ])
        .unwrap();
        let frame = Frame::new(df, "ts").unwrap();

        let records = to_records(&frame).unwrap();
        let closes: Vec<f64> = records
            .iter()
            .map(|r| r.get("close").and_then(Value::as_f64).unwrap())
            .collect();
        assert_eq!(closes, vec![3.0, 1.0, 2.0]);
        assert_eq!(records[0].timestamp(), Some("2024-01-01 23:05:00+00:00"));
    }

    #[test]
    fn test_to_records_keeps_missing_values() {
        let df = DataFrame::new(vec![
            datetime_column("ts", &[T0]),
            Column::new("close".into(), [f64::NAN]),
            Column::new("note".into(), [None::<&str>]),
            Column::new("active".into(), [true]),
        ])
        .unwrap();

        let records = to_records(&Frame::new(df, "ts").unwrap()).unwrap();
        assert!(records[0].get("close").and_then(Value::as_f64).unwrap().is_nan());
        assert_eq!(records[0].get("note"), Some(&Value::Null));
        assert_eq!(records[0].get("active"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_to_records_empty_frame() {
        let df = DataFrame::new(vec![
            datetime_column("ts", &[]),
            Column::new("close".into(), Vec::<f64>::new()),
        ])
        .unwrap();
        let frame = Frame::new(df, "ts").unwrap();
        assert!(frame.is_empty());
        assert!(to_records(&frame).unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_column_collides() {
        let df = DataFrame::new(vec![
            datetime_column("ts", &[T0]),
            Column::new(TIMESTAMP_FIELD.into(), [1i64]),
        ])
        .unwrap();
        let frame = Frame::new(df, "ts").unwrap();
        assert!(matches!(to_records(&frame), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_frame_index_checks() {
        let df = DataFrame::new(vec![
            datetime_column("ts", &[T0, T0]),
            Column::new("close".into(), [1.0, 2.0]),
        ])
        .unwrap();
        assert!(matches!(Frame::new(df.clone(), "ts"), Err(Error::InvalidInput(_))));
        assert!(matches!(Frame::new(df.clone(), "missing"), Err(Error::InvalidInput(_))));
        assert!(matches!(Frame::new(df, "close"), Err(Error::InvalidInput(_))));

        let with_null = DataFrame::new(vec![Column::new("id".into(), [Some(1i64), None])]).unwrap();
        assert!(matches!(Frame::new(with_null, "id"), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_integer_index() {
        let df = DataFrame::new(vec![
            Column::new("id".into(), [7i64, 3]),
            Column::new("close".into(), [1.0, 2.0]),
        ])
        .unwrap();
        let records = to_records(&Frame::new(df, "id").unwrap()).unwrap();
        assert_eq!(records[0].timestamp(), Some("7"));
        assert_eq!(records[1].timestamp(), Some("3"));
    }

    struct RaggedSource {
        index: IndexValue,
        cells: Vec<Value>,
    }

    impl TabularSource for RaggedSource {
        fn column_names(&self) -> Vec<&str> {
            vec!["open", "close"]
        }

        fn rows(&self) -> Box<dyn Iterator<Item = Result<Row>> + '_> {
            let row: Row = (Some(self.index.clone()), self.cells.clone());
            Box::new(std::iter::once(Ok(row)))
        }
    }

    struct UnindexedSource {
        cells: Vec<Value>,
    }

    impl TabularSource for UnindexedSource {
        fn column_names(&self) -> Vec<&str> {
            vec!["close"]
        }

        fn rows(&self) -> Box<dyn Iterator<Item = Result<Row>> + '_> {
            Box::new(std::iter::once(Ok((None, self.cells.clone()))))
        }
    }

    #[test]
    fn test_source_with_inconsistent_row() {
        let source = RaggedSource {
            index: ts(0, 0),
            cells: vec![Value::Float(1.0)],
        };
        assert!(matches!(to_records(&source), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_source_without_index() {
        let source = UnindexedSource {
            cells: vec![Value::Float(1.0)],
        };
        assert!(matches!(to_records(&source), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_records_value_round_trip() {
        let records = to_records(&ohlcv_frame()).unwrap();
        let value = records_to_value(records.clone());
        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(records_from_value(value).unwrap(), records);
    }

    #[test]
    fn test_records_from_value_rejects_bad_shapes() {
        assert!(records_from_value(Value::Int(1)).is_err());
        assert!(records_from_value(Value::Array(vec![Value::Int(1)])).is_err());

        let mut map = Map::new();
        map.insert("close".to_string(), Value::Float(1.0));
        assert!(records_from_value(Value::Array(vec![Value::Object(map)])).is_err());
    }
}
