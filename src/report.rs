//! Backtest report rendering.
//!
//! Turns a saved backtest result document into a PDF report with a title,
//! an introduction, a gridded metadata table, one PnL table per currency and
//! a returns table. The same content can also be rendered as Markdown.

use chrono::{DateTime, Utc};
use printpdf::{
    BuiltinFont, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference,
    Point,
};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};
use crate::persist::write_atomic;
use crate::value::{Map, Value};

/// Formats backtest result documents
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktestReportGenerator;

impl BacktestReportGenerator {
    /// Elapsed values above this are nanoseconds
    pub const NANOSECONDS: f64 = 1e10;
    /// Elapsed values above this (and not nanoseconds) are milliseconds
    pub const MILLISECONDS: f64 = 1e3;

    pub fn new() -> Self {
        Self
    }

    /// Nanoseconds since the epoch as a UTC datetime
    pub fn ns_to_dt(ns: &Value) -> Option<DateTime<Utc>> {
        match ns {
            Value::Int(i) => Some(DateTime::from_timestamp_nanos(*i)),
            other => {
                let secs = numeric(other)? / 1e9;
                if !secs.is_finite() {
                    return None;
                }
                let whole = secs.floor();
                let mut micros = ((secs - whole) * 1e6).round() as u32;
                let mut whole = whole as i64;
                if micros >= 1_000_000 {
                    whole += 1;
                    micros -= 1_000_000;
                }
                DateTime::from_timestamp(whole, micros * 1_000)
            }
        }
    }

    /// Human-readable duration, e.g. `1d 2h 3m 4s`.
    ///
    /// The unit is guessed from the magnitude: nanoseconds above
    /// [`Self::NANOSECONDS`], milliseconds above [`Self::MILLISECONDS`],
    /// seconds otherwise.
    pub fn pretty_duration(&self, elapsed: &Value) -> String {
        let e = match numeric(elapsed) {
            Some(e) if e.is_finite() => e,
            _ => return elapsed.to_string(),
        };

        let seconds = if e > Self::NANOSECONDS {
            e / 1e9
        } else if e > Self::MILLISECONDS {
            e / 1e3
        } else {
            e
        };

        let total_seconds = seconds.trunc() as i64;
        let days = total_seconds.div_euclid(86_400);
        let rem = total_seconds.rem_euclid(86_400);
        let (hours, rem) = (rem / 3600, rem % 3600);
        let (minutes, seconds) = (rem / 60, rem % 60);

        let mut parts = Vec::new();
        if days != 0 {
            parts.push(format!("{}d", days));
        }
        if hours != 0 {
            parts.push(format!("{}h", hours));
        }
        if minutes != 0 {
            parts.push(format!("{}m", minutes));
        }
        parts.push(format!("{}s", seconds));
        parts.join(" ")
    }

    /// Floats with six significant digits and thousands separators
    pub fn fmt_value(v: &Value) -> String {
        match v {
            Value::Float(f) => format_general(*f),
            other => other.to_string(),
        }
    }

    /// Metadata rows in display order
    pub fn build_meta_lines(&self, data: &Value) -> Vec<(String, String)> {
        let text = |key: &str| data.get(key).unwrap_or(&Value::Null).to_string();
        let datetime = |key: &str| {
            data.get(key)
                .and_then(Self::ns_to_dt)
                .map(isoformat)
                .unwrap_or_else(|| "N/A".to_string())
        };

        vec![
            ("Run ID".to_string(), text("run_id")),
            ("Trader ID".to_string(), text("trader_id")),
            ("Instance ID".to_string(), text("instance_id")),
            ("Machine ID".to_string(), text("machine_id")),
            ("Run Config ID".to_string(), text("run_config_id")),
            ("Run started (UTC)".to_string(), datetime("run_started")),
            ("Run finished (UTC)".to_string(), datetime("run_finished")),
            ("Backtest start (UTC)".to_string(), datetime("backtest_start")),
            ("Backtest end (UTC)".to_string(), datetime("backtest_end")),
            (
                "Elapsed (best-effort)".to_string(),
                self.pretty_duration(data.get("elapsed_time").unwrap_or(&Value::Null)),
            ),
            ("Iterations".to_string(), text("iterations")),
            ("Total Events".to_string(), text("total_events")),
            ("Total Orders".to_string(), text("total_orders")),
            ("Total Positions".to_string(), text("total_positions")),
        ]
    }

    fn intro(data: &Value) -> String {
        let text = |key: &str| data.get(key).unwrap_or(&Value::Null).to_string();
        format!(
            "This document summarizes the results of a backtest run (ID: {}). \
             The run was executed by trader '{}' on machine '{}' (instance {}). \
             Below you'll find high-level metadata, performance statistics and a \
             brief table of key PnL and returns metrics.",
            text("run_id"),
            text("trader_id"),
            text("machine_id"),
            text("instance_id"),
        )
    }

    /// Report tables in display order: metadata, PnL per currency, returns
    fn tables(&self, data: &Value) -> Result<Vec<Table>> {
        if data.as_object().is_none() {
            return Err(Error::InvalidInput("report data must be an object".to_string()));
        }

        let mut tables = vec![Table {
            heading: None,
            header: ("Field", "Value"),
            widths: (55.0, 95.0),
            rows: self.build_meta_lines(data),
        }];

        let empty = Map::new();
        let pnls = object_field(data, "stats_pnls")?.unwrap_or(&empty);
        for (currency, metrics) in pnls {
            let metrics = metrics.as_object().ok_or_else(|| {
                Error::InvalidInput(format!("stats_pnls.{} must be an object", currency))
            })?;
            tables.push(Table {
                heading: Some(format!("PnL Statistics ({})", currency)),
                header: ("Metric", "Value"),
                widths: (80.0, 70.0),
                rows: metric_rows(metrics),
            });
        }

        let returns = object_field(data, "stats_returns")?.unwrap_or(&empty);
        tables.push(Table {
            heading: Some("Returns Metrics".to_string()),
            header: ("Metric", "Value"),
            widths: (80.0, 70.0),
            rows: metric_rows(returns),
        });

        Ok(tables)
    }

    /// Render the report as a PDF document
    pub fn render_pdf(&self, data: &Value) -> Result<Vec<u8>> {
        let tables = self.tables(data)?;

        let mut canvas = PdfCanvas::new(TITLE)?;
        canvas.title(TITLE);
        canvas.paragraph(&Self::intro(data));
        for table in &tables {
            if let Some(heading) = &table.heading {
                canvas.heading(heading);
            }
            canvas.table(table);
        }
        canvas.finish()
    }

    /// Render the report as Markdown
    pub fn render_markdown(&self, data: &Value) -> Result<String> {
        let tables = self.tables(data)?;
        let mut out = String::new();

        // Writing to a String cannot fail
        let _ = writeln!(out, "# {}\n", TITLE);
        let _ = writeln!(out, "{}", Self::intro(data));
        for table in &tables {
            if let Some(heading) = &table.heading {
                let _ = writeln!(out, "\n## {}", heading);
            }
            out.push('\n');
            write_table(&mut out, table);
        }

        Ok(out)
    }

    /// Render and write the report to `file_path`.
    ///
    /// A `.md` path gets Markdown, anything else a PDF.
    pub fn generate(&self, data: &Value, file_path: &Path) -> Result<()> {
        let markdown = file_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("md"));

        let bytes = if markdown {
            self.render_markdown(data)?.into_bytes()
        } else {
            self.render_pdf(data)?
        };
        write_atomic(file_path, &bytes)?;
        info!(path = %file_path.display(), "Report written");
        Ok(())
    }
}

const TITLE: &str = "Backtest Report";

/// Two-column table
struct Table {
    heading: Option<String>,
    header: (&'static str, &'static str),
    /// Column widths in millimetres
    widths: (f32, f32),
    rows: Vec<(String, String)>,
}

// US letter with one-inch margins
const PAGE_WIDTH: f32 = 215.9;
const PAGE_HEIGHT: f32 = 279.4;
const MARGIN: f32 = 25.4;
const LAYER: &str = "Layer 1";

const TITLE_SIZE: f32 = 20.0;
const HEADING_SIZE: f32 = 14.0;
const BODY_SIZE: f32 = 10.0;
const CELL_SIZE: f32 = 9.0;
const ROW_HEIGHT: f32 = 6.5;
const CELL_PADDING: f32 = 2.0;

/// Millimetres per point
const PT: f32 = 0.3528;
/// Average Helvetica glyph width relative to the font size
const GLYPH_WIDTH: f32 = 0.5;

fn pdf_error(e: printpdf::Error) -> Error {
    Error::Report(e.to_string())
}

/// Characters of `size` pt text that fit in `width` mm
fn chars_fitting(width: f32, size: f32) -> usize {
    (width / (size * PT * GLYPH_WIDTH)).floor().max(1.0) as usize
}

/// Top-down writer over a multi-page PDF document
struct PdfCanvas {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    /// Current baseline, millimetres from the bottom of the page
    y: f32,
}

impl PdfCanvas {
    fn new(title: &str) -> Result<Self> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), LAYER);
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_error)?;
        let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_error)?;
        let layer = doc.get_page(page).get_layer(layer);

        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            y: PAGE_HEIGHT - MARGIN,
        })
    }

    /// Start a new page unless `height` mm still fit on this one
    fn reserve(&mut self, height: f32) {
        if self.y - height >= MARGIN {
            return;
        }
        let (page, layer) = self.doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), LAYER);
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = PAGE_HEIGHT - MARGIN;
    }

    fn text(&self, text: &str, size: f32, x: f32, y: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(text, size, Mm(x), Mm(y), font);
    }

    fn line(&self, from: (f32, f32), to: (f32, f32)) {
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(from.0), Mm(from.1)), false),
                (Point::new(Mm(to.0), Mm(to.1)), false),
            ],
            is_closed: false,
        });
    }

    fn title(&mut self, text: &str) {
        let height = TITLE_SIZE * PT;
        self.reserve(height);
        self.y -= height;
        self.text(text, TITLE_SIZE, MARGIN, self.y, true);
        self.y -= 6.0;
    }

    fn heading(&mut self, text: &str) {
        let height = HEADING_SIZE * PT + 4.0;
        // Keep the heading with at least the table header
        self.reserve(height + 2.0 * ROW_HEIGHT);
        self.y -= height;
        self.text(text, HEADING_SIZE, MARGIN, self.y, true);
        self.y -= 2.0;
    }

    fn paragraph(&mut self, text: &str) {
        let leading = BODY_SIZE * PT * 1.4;
        let width = chars_fitting(PAGE_WIDTH - 2.0 * MARGIN, BODY_SIZE);
        for line in wrap(text, width) {
            self.reserve(leading);
            self.y -= leading;
            self.text(&line, BODY_SIZE, MARGIN, self.y, false);
        }
        self.y -= 4.0;
    }

    fn table(&mut self, table: &Table) {
        let (w0, w1) = table.widths;
        let (x0, x1, x2) = (MARGIN, MARGIN + w0, MARGIN + w0 + w1);
        let header = (table.header.0.to_string(), table.header.1.to_string());

        for (i, (key, value)) in std::iter::once(&header).chain(&table.rows).enumerate() {
            self.reserve(ROW_HEIGHT);
            self.layer.set_outline_thickness(0.5);
            let top = self.y;
            let bottom = top - ROW_HEIGHT;

            self.line((x0, top), (x2, top));
            self.line((x0, bottom), (x2, bottom));
            for x in [x0, x1, x2] {
                self.line((x, top), (x, bottom));
            }

            let baseline = bottom + CELL_PADDING;
            let bold = i == 0;
            let key = truncate(key, chars_fitting(w0 - 2.0 * CELL_PADDING, CELL_SIZE));
            let value = truncate(value, chars_fitting(w1 - 2.0 * CELL_PADDING, CELL_SIZE));
            self.text(&key, CELL_SIZE, x0 + CELL_PADDING, baseline, bold);
            self.text(&value, CELL_SIZE, x1 + CELL_PADDING, baseline, bold);

            self.y = bottom;
        }
        self.y -= 4.0;
    }

    fn finish(self) -> Result<Vec<u8>> {
        self.doc.save_to_bytes().map_err(pdf_error)
    }
}

/// Greedy word wrap at `width` characters
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn object_field<'a>(data: &'a Value, key: &str) -> Result<Option<&'a Map>> {
    match data.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(Error::InvalidInput(format!("{} must be an object", key))),
    }
}

fn metric_rows(metrics: &Map) -> Vec<(String, String)> {
    metrics
        .iter()
        .map(|(k, v)| (k.clone(), BacktestReportGenerator::fmt_value(v)))
        .collect()
}

fn write_table(out: &mut String, table: &Table) {
    let _ = writeln!(out, "| {} | {} |", table.header.0, table.header.1);
    let _ = writeln!(out, "|---|---|");
    for (k, v) in &table.rows {
        let _ = writeln!(out, "| {} | {} |", escape_cell(k), escape_cell(v));
    }
}

fn escape_cell(s: &str) -> String {
    s.replace('|', "\\|")
}

/// ISO 8601 with microseconds only when present
fn isoformat(dt: DateTime<Utc>) -> String {
    if dt.timestamp_subsec_micros() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

/// General float format: six significant digits, scientific notation for
/// exponents below -4 or at least 6, comma-grouped integer part.
pub fn format_general(v: f64) -> String {
    const PRECISION: i32 = 6;

    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    // Exponent after rounding to the target precision
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (sci.clone(), 0),
    };

    if (-4..PRECISION).contains(&exp) {
        let fixed = format!("{:.*}", (PRECISION - 1 - exp) as usize, v);
        group_thousands(&strip_zeros(&fixed))
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", strip_zeros(&mantissa), sign, exp.abs())
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

fn group_thousands(s: &str) -> String {
    let (sign, rest) = match s.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", s),
    };
    let (int_part, frac_part) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    match frac_part {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}
