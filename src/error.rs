use thiserror::Error;

/// Failures raised by the simulation core.
///
/// Every variant names the precondition that failed and the input that
/// violated it; nothing in the core substitutes defaults for bad input.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    #[error("insufficient data: {observations} aligned observations, at least {required} required")]
    InsufficientData { observations: usize, required: usize },

    #[error("portfolio has no assets")]
    EmptyPortfolio,

    #[error("covariance matrix is not positive definite (asset {asset}, pivot {pivot:e})")]
    NonPositiveDefiniteCovariance { asset: usize, pivot: f64 },

    #[error("invalid simulation config: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("invalid weight vector: {reason}")]
    InvalidWeightVector { reason: String },

    #[error("dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("asset {0} appears more than once in the portfolio")]
    DuplicateAsset(String),

    #[error("malformed return series for {symbol}: {reason}")]
    MalformedSeries { symbol: String, reason: String },

    #[error("simulation cancelled")]
    Cancelled,
}

/// Failures raised while acquiring or cleaning market data.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("ticker {0} not found at the data source")]
    InvalidTicker(String),

    #[error("interval {interval} is not supported by {source_name} (use 1d, 1wk, 1mo or 3mo)")]
    UnsupportedInterval {
        source_name: &'static str,
        interval: String,
    },

    #[error("start date {start} must be before end date {end}")]
    InvalidDateRange {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("{0} is not set")]
    MissingApiKey(&'static str),

    #[error("no usable {column} values for {symbol}")]
    EmptySeries { symbol: String, column: &'static str },

    #[error("unknown data source {0} (use yahoo, stooq or alphavantage)")]
    UnknownSource(String),

    #[error("unexpected response from {source_name}: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },

    #[error("unsupported export format {0} (use csv, json or excel)")]
    UnsupportedFormat(String),

    #[error("{rows} rows x {cols} columns does not fit in an xlsx worksheet")]
    SheetTooLarge { rows: usize, cols: usize },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
}
