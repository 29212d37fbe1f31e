//! Bar replay backtester.
//!
//! Replays bars through a [`MaCross`] strategy with a single netting
//! position. Market orders fill at the bar close; PnL is realized when a
//! position is reduced or closed. Daily balances feed the return statistics.

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use std::env;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stats::{calculate_max_drawdown, calculate_returns, calculate_sharpe_ratio, mean, sample_std};
use crate::strategy::{Bar, MaCross, PositionSide, Signal};
use crate::value::{Map, Value};

/// Trading days used to annualize return statistics
pub const ANNUAL_DAYS: u32 = 252;

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    fn sign(&self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestConfig {
    pub trader_id: String,
    pub starting_balance: f64,
    pub currency: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            trader_id: "BACKTESTER-001".to_string(),
            starting_balance: 10_000.0,
            currency: "USD".to_string(),
        }
    }
}

/// Executed market order
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub datetime: DateTime<FixedOffset>,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
}

/// Position that has been flattened
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub side: PositionSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub opened: DateTime<FixedOffset>,
    pub closed: DateTime<FixedOffset>,
    pub realized_pnl: f64,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    /// Signed quantity, positive when long
    quantity: f64,
    entry_price: f64,
    opened: DateTime<FixedOffset>,
    peak_quantity: f64,
    realized_pnl: f64,
}

/// Netting account for one instrument
#[derive(Debug)]
struct Account {
    balance: f64,
    position: Option<OpenPosition>,
    fills: Vec<Fill>,
    closed: Vec<ClosedPosition>,
    positions_opened: usize,
}

impl Account {
    fn new(balance: f64) -> Self {
        Self {
            balance,
            position: None,
            fills: Vec::new(),
            closed: Vec::new(),
            positions_opened: 0,
        }
    }

    fn side(&self) -> PositionSide {
        match &self.position {
            Some(p) if p.quantity > 0.0 => PositionSide::Long,
            Some(p) if p.quantity < 0.0 => PositionSide::Short,
            _ => PositionSide::Flat,
        }
    }

    fn execute(&mut self, signal: Signal, trade_size: f64, bar: &Bar) {
        let order = match signal {
            Signal::Buy => Some((OrderSide::Buy, trade_size)),
            Signal::Sell => Some((OrderSide::Sell, trade_size)),
            Signal::CloseAll => self.position.as_ref().map(|p| {
                let side = if p.quantity > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
                (side, p.quantity.abs())
            }),
        };

        if let Some((side, quantity)) = order {
            self.fill(side, quantity, bar.close, bar.datetime);
        }
    }

    fn fill(&mut self, side: OrderSide, quantity: f64, price: f64, datetime: DateTime<FixedOffset>) {
        debug!(?side, quantity, price, %datetime, "order filled");
        self.fills.push(Fill {
            datetime,
            side,
            quantity,
            price,
        });

        let signed = side.sign() * quantity;
        let Some(mut position) = self.position.take() else {
            self.open(signed, price, datetime);
            return;
        };

        if position.quantity.signum() == signed.signum() {
            let total = position.quantity.abs() + quantity;
            position.entry_price =
                (position.entry_price * position.quantity.abs() + price * quantity) / total;
            position.quantity += signed;
            position.peak_quantity = position.peak_quantity.max(position.quantity.abs());
            self.position = Some(position);
            return;
        }

        let closing = quantity.min(position.quantity.abs());
        let pnl = closing * (price - position.entry_price) * position.quantity.signum();
        position.realized_pnl += pnl;
        self.balance += pnl;
        position.quantity += signed.signum() * closing;

        if position.quantity.abs() > f64::EPSILON {
            self.position = Some(position);
            return;
        }

        self.closed.push(ClosedPosition {
            side: if signed < 0.0 { PositionSide::Long } else { PositionSide::Short },
            quantity: position.peak_quantity,
            entry_price: position.entry_price,
            exit_price: price,
            opened: position.opened,
            closed: datetime,
            realized_pnl: position.realized_pnl,
        });

        let remainder = quantity - closing;
        if remainder > f64::EPSILON {
            self.open(side.sign() * remainder, price, datetime);
        }
    }

    fn open(&mut self, signed: f64, price: f64, datetime: DateTime<FixedOffset>) {
        self.positions_opened += 1;
        self.position = Some(OpenPosition {
            quantity: signed,
            entry_price: price,
            opened: datetime,
            peak_quantity: signed.abs(),
            realized_pnl: 0.0,
        });
    }
}

/// Runs a strategy over a bar series
pub struct BacktestEngine {
    config: BacktestConfig,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replay `bars` in order and collect the result
    pub fn run(&self, bars: &[Bar], strategy: &mut MaCross) -> Result<BacktestResult> {
        let (first, last) = match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::InvalidInput("no bars to backtest".to_string())),
        };

        let run_started = Utc::now();
        let trade_size = strategy.config().trade_size;
        info!(
            strategy = strategy.config().name(),
            bars = bars.len(),
            "Starting backtest"
        );

        let mut account = Account::new(self.config.starting_balance);
        let mut daily_balances: Vec<(NaiveDate, f64)> = Vec::new();
        let mut current_day = first.datetime.date_naive();

        for bar in bars {
            let day = bar.datetime.date_naive();
            if day != current_day {
                daily_balances.push((current_day, account.balance));
                current_day = day;
            }

            for signal in strategy.on_bar(bar, account.side()) {
                account.execute(signal, trade_size, bar);
            }
        }

        for signal in strategy.on_stop(account.side()) {
            account.execute(signal, trade_size, last);
        }
        daily_balances.push((current_day, account.balance));

        let run_finished = Utc::now();
        info!(
            orders = account.fills.len(),
            positions = account.positions_opened,
            balance = account.balance,
            "Backtest finished"
        );

        let config = strategy.config();
        Ok(BacktestResult {
            run_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            trader_id: self.config.trader_id.clone(),
            machine_id: machine_id(),
            run_config_id: format!(
                "{}-{}-{}-{}",
                config.name(),
                config.fast_period,
                config.slow_period,
                config.trade_size
            ),
            run_started,
            run_finished,
            backtest_start: first.datetime,
            backtest_end: last.datetime,
            iterations: bars.len(),
            currency: self.config.currency.clone(),
            starting_balance: self.config.starting_balance,
            ending_balance: account.balance,
            total_positions: account.positions_opened,
            fills: account.fills,
            positions: account.closed,
            daily_balances,
        })
    }
}

fn machine_id() -> String {
    env::var("HOSTNAME")
        .or_else(|_| env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Outcome of one backtest run
#[derive(Debug, Clone)]
pub struct BacktestResult {
    pub run_id: Uuid,
    pub instance_id: Uuid,
    pub trader_id: String,
    pub machine_id: String,
    pub run_config_id: String,
    pub run_started: DateTime<Utc>,
    pub run_finished: DateTime<Utc>,
    pub backtest_start: DateTime<FixedOffset>,
    pub backtest_end: DateTime<FixedOffset>,
    pub iterations: usize,
    pub currency: String,
    pub starting_balance: f64,
    pub ending_balance: f64,
    pub total_positions: usize,
    pub fills: Vec<Fill>,
    pub positions: Vec<ClosedPosition>,
    pub daily_balances: Vec<(NaiveDate, f64)>,
}

impl BacktestResult {
    pub fn total_orders(&self) -> usize {
        self.fills.len()
    }

    /// Bars plus fill events
    pub fn total_events(&self) -> usize {
        self.iterations + self.fills.len()
    }

    /// Wall-clock run time in seconds
    pub fn elapsed_time(&self) -> f64 {
        (self.run_finished - self.run_started)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Returns between consecutive daily balances, starting balance first
    pub fn daily_returns(&self) -> Vec<f64> {
        let balances: Vec<f64> = std::iter::once(self.starting_balance)
            .chain(self.daily_balances.iter().map(|(_, b)| *b))
            .collect();
        calculate_returns(&balances)
    }

    /// PnL statistics keyed by metric name
    pub fn stats_pnls(&self) -> Map {
        let pnls: Vec<f64> = self.positions.iter().map(|p| p.realized_pnl).collect();
        let winners: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losers: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();

        let total = self.ending_balance - self.starting_balance;
        let total_pct = if self.starting_balance != 0.0 {
            total / self.starting_balance * 100.0
        } else {
            f64::NAN
        };

        let win_rate = if pnls.is_empty() {
            f64::NAN
        } else {
            winners.len() as f64 / pnls.len() as f64
        };
        let avg_or_zero = |values: &[f64]| if values.is_empty() { 0.0 } else { mean(values) };
        let expectancy = win_rate * avg_or_zero(&winners) + (1.0 - win_rate) * avg_or_zero(&losers);

        let mut stats = Map::new();
        stats.insert("PnL (total)".into(), Value::Float(total));
        stats.insert("PnL% (total)".into(), Value::Float(total_pct));
        stats.insert("Max Winner".into(), Value::Float(fold_or_nan(&winners, f64::max)));
        stats.insert("Avg Winner".into(), Value::Float(mean(&winners)));
        stats.insert("Min Winner".into(), Value::Float(fold_or_nan(&winners, f64::min)));
        stats.insert("Max Loser".into(), Value::Float(fold_or_nan(&losers, f64::min)));
        stats.insert("Avg Loser".into(), Value::Float(mean(&losers)));
        stats.insert("Min Loser".into(), Value::Float(fold_or_nan(&losers, f64::max)));
        stats.insert("Win Rate".into(), Value::Float(win_rate));
        stats.insert("Expectancy".into(), Value::Float(expectancy));
        stats
    }

    /// Daily return statistics keyed by metric name
    pub fn stats_returns(&self) -> Map {
        let returns = self.daily_returns();
        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();

        let std = sample_std(&returns);
        let gross_loss: f64 = losses.iter().sum::<f64>().abs();
        let profit_factor = if gross_loss > 0.0 {
            wins.iter().sum::<f64>() / gross_loss
        } else {
            f64::NAN
        };
        let risk_return = if std.is_finite() && std != 0.0 {
            mean(&returns) / std
        } else {
            f64::NAN
        };

        let balances: Vec<f64> = std::iter::once(self.starting_balance)
            .chain(self.daily_balances.iter().map(|(_, b)| *b))
            .collect();
        let (_, max_drawdown_pct) = calculate_max_drawdown(&balances);

        let mut stats = Map::new();
        stats.insert(
            "Returns Volatility (252 days)".into(),
            Value::Float(std * (ANNUAL_DAYS as f64).sqrt()),
        );
        stats.insert("Average (Return)".into(), Value::Float(mean(&returns)));
        stats.insert("Average Loss (Return)".into(), Value::Float(mean(&losses)));
        stats.insert("Average Win (Return)".into(), Value::Float(mean(&wins)));
        stats.insert(
            "Sharpe Ratio (252 days)".into(),
            Value::Float(calculate_sharpe_ratio(&returns, 0.0, ANNUAL_DAYS)),
        );
        stats.insert("Profit Factor".into(), Value::Float(profit_factor));
        stats.insert("Risk Return Ratio".into(), Value::Float(risk_return));
        stats.insert("Max Drawdown (%)".into(), Value::Float(max_drawdown_pct));
        stats
    }

    /// Result document as saved to disk and read by the report
    pub fn to_document(&self) -> Value {
        let mut pnls = Map::new();
        pnls.insert(self.currency.clone(), Value::Object(self.stats_pnls()));

        let mut doc = Map::new();
        doc.insert("run_id".into(), Value::from(self.run_id.to_string()));
        doc.insert("trader_id".into(), Value::from(self.trader_id.as_str()));
        doc.insert("instance_id".into(), Value::from(self.instance_id.to_string()));
        doc.insert("machine_id".into(), Value::from(self.machine_id.as_str()));
        doc.insert("run_config_id".into(), Value::from(self.run_config_id.as_str()));
        doc.insert("run_started".into(), Value::from(self.run_started.timestamp_nanos_opt()));
        doc.insert("run_finished".into(), Value::from(self.run_finished.timestamp_nanos_opt()));
        doc.insert("backtest_start".into(), Value::from(self.backtest_start.timestamp_nanos_opt()));
        doc.insert("backtest_end".into(), Value::from(self.backtest_end.timestamp_nanos_opt()));
        doc.insert("elapsed_time".into(), Value::Float(self.elapsed_time()));
        doc.insert("iterations".into(), Value::from(self.iterations));
        doc.insert("total_events".into(), Value::from(self.total_events()));
        doc.insert("total_orders".into(), Value::from(self.total_orders()));
        doc.insert("total_positions".into(), Value::from(self.total_positions));
        doc.insert("stats_pnls".into(), Value::Object(pnls));
        doc.insert("stats_returns".into(), Value::Object(self.stats_returns()));
        Value::Object(doc)
    }
}

fn fold_or_nan(values: &[f64], f: fn(f64, f64) -> f64) -> f64 {
    values.iter().copied().reduce(f).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{load_data, save_data};
    use crate::strategy::MaCrossConfig;
    use chrono::{Duration, TimeZone};

    fn bars(closes: &[f64]) -> Vec<Bar> {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 0, 0).unwrap().fixed_offset();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                datetime: start + Duration::hours(i as i64 * 12),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 100.0,
            })
            .collect()
    }

    fn fill_at(account: &mut Account, side: OrderSide, quantity: f64, price: f64) {
        let dt = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap().fixed_offset();
        account.fill(side, quantity, price, dt);
    }

    #[test]
    fn test_account_netting() {
        let mut account = Account::new(1000.0);
        fill_at(&mut account, OrderSide::Buy, 1.0, 100.0);
        fill_at(&mut account, OrderSide::Buy, 1.0, 110.0);
        assert_eq!(account.side(), PositionSide::Long);

        // Flip: close 2 long at 120 then open 1 short
        fill_at(&mut account, OrderSide::Sell, 3.0, 120.0);
        assert_eq!(account.side(), PositionSide::Short);
        assert_eq!(account.balance, 1030.0);
        assert_eq!(account.closed.len(), 1);
        assert_eq!(account.closed[0].side, PositionSide::Long);
        assert_eq!(account.closed[0].quantity, 2.0);
        assert_eq!(account.closed[0].entry_price, 105.0);

        fill_at(&mut account, OrderSide::Buy, 1.0, 125.0);
        assert_eq!(account.side(), PositionSide::Flat);
        assert_eq!(account.balance, 1025.0);
        assert_eq!(account.closed[1].realized_pnl, -5.0);
        assert_eq!(account.positions_opened, 2);
    }

    #[test]
    fn test_run_rejects_empty_input() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let mut strategy = MaCross::new(MaCrossConfig::sma(1, 2)).unwrap();
        assert!(matches!(engine.run(&[], &mut strategy), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_run_trend_reversal() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let mut strategy = MaCross::new(MaCrossConfig::sma(1, 2)).unwrap();

        // Long at 101, reversed short at 90, closed at 85 on stop
        let result = engine
            .run(&bars(&[100.0, 101.0, 102.0, 90.0, 85.0]), &mut strategy)
            .unwrap();

        assert_eq!(result.iterations, 5);
        assert_eq!(result.positions.len(), 2);
        assert_eq!(result.positions[0].side, PositionSide::Long);
        assert_eq!(result.positions[0].realized_pnl, -11.0);
        assert_eq!(result.positions[1].side, PositionSide::Short);
        assert_eq!(result.positions[1].realized_pnl, 5.0);
        assert_eq!(result.ending_balance, 10_000.0 - 6.0);
        assert_eq!(result.total_positions, 2);
        assert_eq!(result.total_orders(), 4);
        assert_eq!(result.total_events(), 9);
        assert_eq!(result.daily_balances.len(), 3);
    }

    #[test]
    fn test_no_trades_gives_undefined_stats() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let mut strategy = MaCross::new(MaCrossConfig::ema(2, 3)).unwrap();
        let result = engine.run(&bars(&[100.0, 101.0]), &mut strategy).unwrap();

        let pnls = result.stats_pnls();
        assert_eq!(pnls["PnL (total)"], Value::Float(0.0));
        assert!(pnls["Win Rate"].as_f64().unwrap().is_nan());
        assert!(result.stats_returns()["Sharpe Ratio (252 days)"].as_f64().unwrap().is_nan());
    }

    #[test]
    fn test_document_shape() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let mut strategy = MaCross::new(MaCrossConfig::sma(1, 2)).unwrap();
        let result = engine
            .run(&bars(&[100.0, 101.0, 102.0, 90.0, 85.0]), &mut strategy)
            .unwrap();
        let doc = result.to_document();

        for key in [
            "run_id",
            "trader_id",
            "instance_id",
            "machine_id",
            "run_config_id",
            "run_started",
            "run_finished",
            "backtest_start",
            "backtest_end",
            "elapsed_time",
            "iterations",
            "total_events",
            "total_orders",
            "total_positions",
            "stats_returns",
        ] {
            assert!(doc.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(doc.get("trader_id").and_then(Value::as_str), Some("BACKTESTER-001"));
        assert_eq!(doc.get("run_config_id").and_then(Value::as_str), Some("MACross-1-2-1"));
        assert_eq!(
            doc.get("backtest_start").and_then(Value::as_i64),
            Some(1_704_204_000_000_000_000)
        );

        let usd = doc.get("stats_pnls").and_then(|p| p.get("USD")).unwrap();
        assert_eq!(usd.get("PnL (total)").and_then(Value::as_f64), Some(-6.0));
        assert_eq!(usd.get("Win Rate").and_then(Value::as_f64), Some(0.5));
        assert_eq!(usd.get("Max Winner").and_then(Value::as_f64), Some(5.0));
        assert_eq!(usd.get("Max Loser").and_then(Value::as_f64), Some(-11.0));
        assert_eq!(usd.get("Expectancy").and_then(Value::as_f64), Some(-3.0));
    }

    #[test]
    fn test_undefined_stats_saved_as_null() {
        let engine = BacktestEngine::new(BacktestConfig::default());
        let mut strategy = MaCross::new(MaCrossConfig::ema(2, 3)).unwrap();
        let doc = engine.run(&bars(&[100.0, 101.0]), &mut strategy).unwrap().to_document();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("result.json");
        save_data(&doc, &path).unwrap();

        let loaded = load_data(&path).unwrap();
        let usd = loaded.get("stats_pnls").and_then(|p| p.get("USD")).unwrap();
        assert_eq!(usd.get("Win Rate"), Some(&Value::Null));
        assert_eq!(usd.get("PnL (total)").and_then(Value::as_f64), Some(0.0));
        let returns = loaded.get("stats_returns").unwrap();
        assert_eq!(returns.get("Sharpe Ratio (252 days)"), Some(&Value::Null));
    }
}
