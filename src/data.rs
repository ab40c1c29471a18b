use crate::config::{alpha_vantage_api_key, fetch_retry_attempts, ALPHA_VANTAGE_KEY_VAR, HTTP_TIMEOUT_SECS};
use crate::error::DataError;
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Requests
// ──────────────────────────────────────────────────────────────────────────────

/// Sampling interval between two observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "1d",
            Self::Weekly => "1wk",
            Self::Monthly => "1mo",
            Self::Quarterly => "3mo",
        }
    }
}

impl FromStr for Interval {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1d" => Ok(Self::Daily),
            "1wk" => Ok(Self::Weekly),
            "1mo" => Ok(Self::Monthly),
            "3mo" => Ok(Self::Quarterly),
            other => Err(DataError::UnsupportedInterval {
                source_name: "request",
                interval: other.to_string(),
            }),
        }
    }
}

/// One history request: ticker over an inclusive date range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub ticker: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval: Interval,
}

impl FetchRequest {
    /// Upper-cases the ticker and clamps an end date in the future to today.
    pub fn new(ticker: &str, start: NaiveDate, end: NaiveDate, interval: Interval) -> Result<Self, DataError> {
        let today = Utc::now().date_naive();
        let end = end.min(today);
        if start >= end {
            return Err(DataError::InvalidDateRange { start, end });
        }
        Ok(Self {
            ticker: ticker.trim().to_uppercase(),
            start,
            end,
            interval,
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Series
// ──────────────────────────────────────────────────────────────────────────────

/// A bar as delivered by a source; any field may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub adj_close: Option<f64>,
    pub volume: Option<f64>,
}

/// Uncleaned history of one ticker.
#[derive(Clone, Debug, PartialEq)]
pub struct RawSeries {
    pub symbol: String,
    pub bars: Vec<RawBar>,
}

/// Represents a single cleaned candlestick data point (OHLCV).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: Option<f64>,
    pub volume: f64,
}

impl Candle {
    /// Adjusted close when the source provides it, close otherwise.
    pub fn price(&self) -> f64 {
        self.adj_close.unwrap_or(self.close)
    }
}

/// Holds cleaned historical data for a specific symbol.
#[derive(Clone, Debug, PartialEq)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

/// Descriptive statistics of one asset's price column over the fetched period.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssetSummary {
    pub symbol: String,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub min_price: f64,
    pub max_price: f64,
    pub mean_price: f64,
    pub std_price: f64,
}

impl StockData {
    /// `(date, price)` pairs using [`Candle::price`].
    pub fn prices(&self) -> Vec<(NaiveDate, f64)> {
        self.history.iter().map(|c| (c.date, c.price())).collect()
    }

    pub fn summary(&self) -> AssetSummary {
        let prices: Vec<f64> = self.history.iter().map(|c| c.price()).collect();
        let n = prices.len() as f64;
        let mean = if prices.is_empty() { 0.0 } else { prices.iter().sum::<f64>() / n };
        let std = if prices.len() < 2 {
            0.0
        } else {
            (prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        };

        AssetSummary {
            symbol: self.symbol.clone(),
            first_date: self.history.first().map(|c| c.date),
            last_date: self.history.last().map(|c| c.date),
            min_price: prices.iter().copied().fold(f64::INFINITY, f64::min),
            max_price: prices.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean_price: mean,
            std_price: std,
        }
    }

    /// Synthetic daily candles starting on 2024-01-01, for offline runs and tests.
    pub fn new_mock(symbol: &str, days: usize, rng: &mut impl Rng) -> Self {
        let mut history = Vec::with_capacity(days);
        let mut current_price: f64 = 100.0;
        let mut current_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();

        for _ in 0..days {
            let shock: f64 = StandardNormal.sample(rng);
            let change_pct = 0.0004 + 0.015 * shock;
            let open = current_price;
            let close = open * (1.0 + change_pct);
            let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.01));
            let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.01));
            let volume = rng.gen_range(1000.0..10000.0_f64).round();

            history.push(Candle {
                date: current_date,
                open,
                high,
                low,
                close,
                adj_close: Some(close),
                volume,
            });

            current_price = close;
            current_date += Duration::days(1);
        }

        Self {
            symbol: symbol.to_uppercase(),
            history,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Cleaning
// ──────────────────────────────────────────────────────────────────────────────

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

fn column_median(bars: &[RawBar], field: fn(&RawBar) -> Option<f64>) -> Option<f64> {
    let mut values: Vec<f64> = bars.iter().filter_map(field).filter(|v| v.is_finite()).collect();
    median(&mut values)
}

/// Sorts by date, drops repeated dates (first kept) and fills missing fields
/// with the column median.
///
/// Adjusted close stays absent when the source never delivered it; a missing
/// volume column becomes zero (indices have none). Any price column with no
/// values at all is an error.
pub fn clean(raw: RawSeries) -> Result<StockData, DataError> {
    let RawSeries { symbol, mut bars } = raw;
    if bars.is_empty() {
        return Err(DataError::EmptySeries { symbol, column: "rows" });
    }

    bars.sort_by_key(|b| b.date);
    let before = bars.len();
    bars.dedup_by_key(|b| b.date);
    if bars.len() < before {
        info!("{}: dropped {} duplicate rows", symbol, before - bars.len());
    }

    let required = |column: &'static str, field: fn(&RawBar) -> Option<f64>| {
        column_median(&bars, field).ok_or_else(|| DataError::EmptySeries {
            symbol: symbol.clone(),
            column,
        })
    };
    let open_med = required("open", |b| b.open)?;
    let high_med = required("high", |b| b.high)?;
    let low_med = required("low", |b| b.low)?;
    let close_med = required("close", |b| b.close)?;
    let adj_med = column_median(&bars, |b| b.adj_close);
    let volume_med = column_median(&bars, |b| b.volume).unwrap_or(0.0);

    let valid = |v: Option<f64>| v.filter(|x| x.is_finite());
    let history = bars
        .into_iter()
        .map(|b| Candle {
            date: b.date,
            open: valid(b.open).unwrap_or(open_med),
            high: valid(b.high).unwrap_or(high_med),
            low: valid(b.low).unwrap_or(low_med),
            close: valid(b.close).unwrap_or(close_med),
            adj_close: adj_med.map(|m| valid(b.adj_close).unwrap_or(m)),
            volume: valid(b.volume).unwrap_or(volume_med),
        })
        .collect();

    Ok(StockData { symbol, history })
}

fn filter_to_range(mut series: RawSeries, start: NaiveDate, end: NaiveDate) -> RawSeries {
    series.bars.retain(|b| b.date >= start && b.date <= end);
    series.bars.sort_by_key(|b| b.date);
    series
}

/// Aggregates ascending daily bars into calendar quarters labelled by quarter end.
pub fn resample_quarterly(bars: &[RawBar]) -> Vec<RawBar> {
    let mut quarters: BTreeMap<(i32, u32), Vec<&RawBar>> = BTreeMap::new();
    for bar in bars {
        let quarter = (bar.date.month() - 1) / 3;
        quarters.entry((bar.date.year(), quarter)).or_default().push(bar);
    }

    quarters
        .into_iter()
        .filter_map(|((year, quarter), group)| {
            let date = quarter_end(year, quarter)?;
            let max = |f: fn(&RawBar) -> Option<f64>| group.iter().filter_map(|b| f(b)).reduce(f64::max);
            let min = |f: fn(&RawBar) -> Option<f64>| group.iter().filter_map(|b| f(b)).reduce(f64::min);
            let volume: Vec<f64> = group.iter().filter_map(|b| b.volume).collect();
            Some(RawBar {
                date,
                open: group.iter().find_map(|b| b.open),
                high: max(|b| b.high),
                low: min(|b| b.low),
                close: group.iter().rev().find_map(|b| b.close),
                adj_close: group.iter().rev().find_map(|b| b.adj_close),
                volume: (!volume.is_empty()).then(|| volume.iter().sum()),
            })
        })
        .collect()
}

fn quarter_end(year: i32, quarter: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if quarter == 3 { (year + 1, 1) } else { (year, quarter * 3 + 4) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

// ──────────────────────────────────────────────────────────────────────────────
// Sources
// ──────────────────────────────────────────────────────────────────────────────

/// A provider of historical OHLCV bars.
pub trait MarketDataSource {
    fn name(&self) -> &'static str;

    fn fetch(&self, request: &FetchRequest) -> impl Future<Output = Result<RawSeries, DataError>> + Send;
}

async fn retry_sleep(attempt: usize) {
    let millis = (500_u64 * attempt as u64).min(2000);
    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
}

async fn get_with_retry(
    client: &reqwest::Client,
    url: &str,
    source_name: &'static str,
    symbol: &str,
) -> Result<String, DataError> {
    let attempts = fetch_retry_attempts();
    let mut last_err: Option<DataError> = None;

    for attempt in 1..=attempts {
        match client
            .get(url)
            .header("User-Agent", "Mozilla/5.0")
            .timeout(std::time::Duration::from_secs(HTTP_TIMEOUT_SECS))
            .send()
            .await
        {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                return Err(DataError::InvalidTicker(symbol.to_string()));
            }
            Ok(resp) => match resp.error_for_status() {
                Ok(ok_resp) => match ok_resp.text().await {
                    Ok(body) => return Ok(body),
                    Err(err) => last_err = Some(err.into()),
                },
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }

        if attempt < attempts {
            warn!("{} history fetch retry for {} ({}/{})", source_name, symbol, attempt, attempts);
            retry_sleep(attempt).await;
        }
    }

    Err(last_err.unwrap_or_else(|| DataError::Parse {
        source_name,
        message: format!("no response for {}", symbol),
    }))
}

fn unix_seconds(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

// ── Yahoo ───────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<YahooChartError>,
}

#[derive(Deserialize, Debug)]
struct YahooChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Debug)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

fn parse_yahoo_chart(symbol: &str, body: &str) -> Result<RawSeries, DataError> {
    let response: YahooChartResponse = serde_json::from_str(body)?;
    if let Some(err) = response.chart.error {
        if err.code.as_deref() == Some("Not Found") {
            return Err(DataError::InvalidTicker(symbol.to_string()));
        }
        return Err(DataError::Parse {
            source_name: "yahoo",
            message: err.description.unwrap_or_else(|| "unknown chart error".to_string()),
        });
    }

    let result = response
        .chart
        .result
        .and_then(|r| r.into_iter().next())
        .ok_or_else(|| DataError::InvalidTicker(symbol.to_string()))?;
    let quote = result.indicators.quote.into_iter().next().ok_or_else(|| DataError::Parse {
        source_name: "yahoo",
        message: format!("no quote block for {}", symbol),
    })?;
    let adj = result.indicators.adjclose.into_iter().next().map(|a| a.adjclose);

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();
    let bars = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, &ts)| {
            let date = Utc.timestamp_opt(ts, 0).single()?.date_naive();
            Some(RawBar {
                date,
                open: at(&quote.open, i),
                high: at(&quote.high, i),
                low: at(&quote.low, i),
                close: at(&quote.close, i),
                adj_close: adj.as_ref().and_then(|a| at(a, i)),
                volume: at(&quote.volume, i),
            })
        })
        .collect();

    Ok(RawSeries {
        symbol: symbol.to_string(),
        bars,
    })
}

/// Yahoo Finance chart API.
#[derive(Clone, Debug, Default)]
pub struct YahooSource {
    client: reqwest::Client,
}

impl YahooSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarketDataSource for YahooSource {
    fn name(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawSeries, DataError> {
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval={}&events=history",
            request.ticker,
            unix_seconds(request.start),
            unix_seconds(request.end + Duration::days(1)),
            request.interval.as_str()
        );
        let body = get_with_retry(&self.client, &url, self.name(), &request.ticker).await?;
        let series = parse_yahoo_chart(&request.ticker, &body)?;
        Ok(filter_to_range(series, request.start, request.end))
    }
}

// ── Stooq ───────────────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct StooqRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Open")]
    open: Option<f64>,
    #[serde(rename = "High")]
    high: Option<f64>,
    #[serde(rename = "Low")]
    low: Option<f64>,
    #[serde(rename = "Close")]
    close: Option<f64>,
    #[serde(rename = "Volume", default)]
    volume: Option<f64>,
}

/// Stooq lists US listings with a `.us` suffix; indices start with `^`.
fn stooq_symbol(ticker: &str) -> String {
    let lower = ticker.to_ascii_lowercase();
    if lower.contains('.') || lower.starts_with('^') {
        lower
    } else {
        format!("{}.us", lower)
    }
}

fn parse_stooq_csv(symbol: &str, body: &str) -> Result<RawSeries, DataError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.starts_with("No data") {
        return Err(DataError::InvalidTicker(symbol.to_string()));
    }

    let mut reader = csv::Reader::from_reader(trimmed.as_bytes());
    let bars = reader
        .deserialize::<StooqRow>()
        .map(|row| {
            row.map(|r| RawBar {
                date: r.date,
                open: r.open,
                high: r.high,
                low: r.low,
                close: r.close,
                adj_close: None,
                volume: r.volume,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawSeries {
        symbol: symbol.to_string(),
        bars,
    })
}

/// Stooq CSV download endpoint. Provides no adjusted close.
#[derive(Clone, Debug, Default)]
pub struct StooqSource {
    client: reqwest::Client,
}

impl StooqSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MarketDataSource for StooqSource {
    fn name(&self) -> &'static str {
        "stooq"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawSeries, DataError> {
        let interval = match request.interval {
            Interval::Daily => "d",
            Interval::Weekly => "w",
            Interval::Monthly => "m",
            Interval::Quarterly => "q",
        };
        let url = format!(
            "https://stooq.com/q/d/l/?s={}&d1={}&d2={}&i={}",
            stooq_symbol(&request.ticker),
            request.start.format("%Y%m%d"),
            request.end.format("%Y%m%d"),
            interval
        );
        let body = get_with_retry(&self.client, &url, self.name(), &request.ticker).await?;
        let series = parse_stooq_csv(&request.ticker, &body)?;
        Ok(filter_to_range(series, request.start, request.end))
    }
}

// ── Alpha Vantage ───────────────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct AlphaVantageBar {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

fn parse_alpha_vantage(symbol: &str, body: &str) -> Result<RawSeries, DataError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    if value.get("Error Message").is_some() {
        return Err(DataError::InvalidTicker(symbol.to_string()));
    }
    if let Some(note) = value.get("Note").or_else(|| value.get("Information")) {
        return Err(DataError::Parse {
            source_name: "alphavantage",
            message: note.as_str().unwrap_or("request rejected").to_string(),
        });
    }

    let series = value
        .as_object()
        .and_then(|obj| obj.iter().find(|(k, _)| k.contains("Time Series")))
        .map(|(_, v)| v.clone())
        .ok_or_else(|| DataError::Parse {
            source_name: "alphavantage",
            message: format!("no time series block for {}", symbol),
        })?;
    let rows: BTreeMap<NaiveDate, AlphaVantageBar> = serde_json::from_value(series)?;

    let num = |s: &str| s.trim().parse::<f64>().ok();
    let bars = rows
        .into_iter()
        .map(|(date, bar)| RawBar {
            date,
            open: num(&bar.open),
            high: num(&bar.high),
            low: num(&bar.low),
            close: num(&bar.close),
            adj_close: None,
            volume: num(&bar.volume),
        })
        .collect();

    Ok(RawSeries {
        symbol: symbol.to_string(),
        bars,
    })
}

/// Alpha Vantage time series. Quarterly bars are resampled from daily data.
#[derive(Clone, Debug)]
pub struct AlphaVantageSource {
    client: reqwest::Client,
    api_key: String,
}

impl AlphaVantageSource {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    pub fn from_env() -> Result<Self, DataError> {
        alpha_vantage_api_key()
            .map(Self::new)
            .ok_or(DataError::MissingApiKey(ALPHA_VANTAGE_KEY_VAR))
    }
}

impl MarketDataSource for AlphaVantageSource {
    fn name(&self) -> &'static str {
        "alphavantage"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawSeries, DataError> {
        let function = match request.interval {
            Interval::Daily | Interval::Quarterly => "TIME_SERIES_DAILY&outputsize=full",
            Interval::Weekly => "TIME_SERIES_WEEKLY",
            Interval::Monthly => "TIME_SERIES_MONTHLY",
        };
        let url = format!(
            "https://www.alphavantage.co/query?function={}&symbol={}&apikey={}",
            function, request.ticker, self.api_key
        );
        let body = get_with_retry(&self.client, &url, self.name(), &request.ticker).await?;
        let mut series = parse_alpha_vantage(&request.ticker, &body)?;
        if request.interval == Interval::Quarterly {
            series.bars = resample_quarterly(&series.bars);
        }
        Ok(filter_to_range(series, request.start, request.end))
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Dispatch
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceKind {
    Yahoo,
    Stooq,
    AlphaVantage,
}

impl FromStr for DataSourceKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yahoo" | "yfinance" => Ok(Self::Yahoo),
            "stooq" => Ok(Self::Stooq),
            "alphavantage" | "avantage" => Ok(Self::AlphaVantage),
            other => Err(DataError::UnknownSource(other.to_string())),
        }
    }
}

async fn fetch_clean<S: MarketDataSource>(source: &S, request: &FetchRequest) -> Result<StockData> {
    info!(
        "Fetching {} from {} ({} to {}, {})",
        request.ticker,
        source.name(),
        request.start,
        request.end,
        request.interval.as_str()
    );
    let raw = source
        .fetch(request)
        .await
        .with_context(|| format!("fetching {} from {}", request.ticker, source.name()))?;
    let data = clean(raw).with_context(|| format!("cleaning {}", request.ticker))?;
    info!("{}: {} clean observations", data.symbol, data.history.len());
    Ok(data)
}

async fn fetch_all<S: MarketDataSource>(source: &S, requests: &[FetchRequest]) -> Result<Vec<StockData>> {
    let mut out = Vec::with_capacity(requests.len());
    for request in requests {
        out.push(fetch_clean(source, request).await?);
    }
    Ok(out)
}

/// Fetches and cleans every ticker from one source. Fails on the first ticker
/// that cannot be fetched.
pub async fn fetch_portfolio(
    kind: DataSourceKind,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
    interval: Interval,
) -> Result<Vec<StockData>> {
    let requests = tickers
        .iter()
        .map(|t| FetchRequest::new(t, start, end, interval))
        .collect::<Result<Vec<_>, _>>()?;

    match kind {
        DataSourceKind::Yahoo => fetch_all(&YahooSource::new(), &requests).await,
        DataSourceKind::Stooq => fetch_all(&StooqSource::new(), &requests).await,
        DataSourceKind::AlphaVantage => fetch_all(&AlphaVantageSource::from_env()?, &requests).await,
    }
}
