use crate::data::StockData;
use crate::error::DataError;
use crate::report::SimulationReport;
use crate::simulation::PathMatrix;
use rust_xlsxwriter::Workbook;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Excel,
}

/// Worksheet bounds of the xlsx format.
const XLSX_MAX_ROWS: usize = 1_048_576;
const XLSX_MAX_COLS: usize = 16_384;

const PRICE_HEADER: [&str; 8] = ["Ticker", "Date", "Open", "High", "Low", "Close", "Adj Close", "Volume"];

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Excel => "xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            other => Err(DataError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Serialize)]
struct PriceRow<'a> {
    #[serde(rename = "Ticker")]
    ticker: &'a str,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
    #[serde(rename = "Adj Close")]
    adj_close: Option<f64>,
    #[serde(rename = "Volume")]
    volume: f64,
}

#[derive(Serialize)]
struct PathsDocument<'a> {
    horizon_days: usize,
    num_simulations: usize,
    paths: Vec<&'a [f64]>,
}

fn target(dir: &Path, stem: &str, format: ExportFormat) -> Result<PathBuf, DataError> {
    fs::create_dir_all(dir)?;
    Ok(dir.join(format!("{}.{}", stem, format.extension())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DataError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

fn check_sheet_size(rows: usize, cols: usize) -> Result<(), DataError> {
    if rows > XLSX_MAX_ROWS || cols > XLSX_MAX_COLS {
        return Err(DataError::SheetTooLarge { rows, cols });
    }
    Ok(())
}

fn write_prices_xlsx(path: &Path, rows: &[PriceRow]) -> Result<(), DataError> {
    check_sheet_size(rows.len() + 1, PRICE_HEADER.len())?;
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("data")?;
    for (col, name) in PRICE_HEADER.iter().enumerate() {
        sheet.write_string(0, col as u16, *name)?;
    }
    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        sheet.write_string(r, 0, row.ticker)?;
        sheet.write_string(r, 1, &row.date)?;
        sheet.write_number(r, 2, row.open)?;
        sheet.write_number(r, 3, row.high)?;
        sheet.write_number(r, 4, row.low)?;
        sheet.write_number(r, 5, row.close)?;
        if let Some(adj) = row.adj_close {
            sheet.write_number(r, 6, adj)?;
        }
        sheet.write_number(r, 7, row.volume)?;
    }
    workbook.save(path)?;
    Ok(())
}

fn write_paths_xlsx(path: &Path, paths: &PathMatrix) -> Result<(), DataError> {
    check_sheet_size(paths.horizon_days() + 1, paths.num_simulations() + 1)?;
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("paths")?;
    sheet.write_string(0, 0, "Day")?;
    for s in 0..paths.num_simulations() {
        sheet.write_string(0, (s + 1) as u16, format!("sim_{}", s + 1))?;
    }
    for day in 0..paths.horizon_days() {
        let r = (day + 1) as u32;
        sheet.write_number(r, 0, (day + 1) as f64)?;
        for (s, v) in paths.day_values(day).iter().enumerate() {
            sheet.write_number(r, (s + 1) as u16, *v)?;
        }
    }
    workbook.save(path)?;
    Ok(())
}

/// Writes the cleaned price history of every asset in long format.
pub fn export_prices(data: &[StockData], dir: &Path, format: ExportFormat) -> Result<PathBuf, DataError> {
    let path = target(dir, "data", format)?;
    let rows: Vec<PriceRow> = data
        .iter()
        .flat_map(|stock| {
            stock.history.iter().map(move |c| PriceRow {
                ticker: &stock.symbol,
                date: c.date.format("%Y-%m-%d").to_string(),
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                adj_close: c.adj_close,
                volume: c.volume,
            })
        })
        .collect();

    match format {
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(&path)?;
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        ExportFormat::Json => write_json(&path, &rows)?,
        ExportFormat::Excel => write_prices_xlsx(&path, &rows)?,
    }
    info!("Exported {} price rows to {}", rows.len(), path.display());
    Ok(path)
}

/// Writes every simulated path; CSV and xlsx have one row per day and one column per simulation.
pub fn export_paths(paths: &PathMatrix, dir: &Path, format: ExportFormat) -> Result<PathBuf, DataError> {
    let path = target(dir, "paths", format)?;
    match format {
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_path(&path)?;
            let mut header = vec!["Day".to_string()];
            header.extend((1..=paths.num_simulations()).map(|s| format!("sim_{s}")));
            writer.write_record(&header)?;
            for day in 0..paths.horizon_days() {
                let mut record = vec![format!("{}", day + 1)];
                record.extend(paths.day_values(day).iter().map(|v| format!("{v}")));
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }
        ExportFormat::Json => write_json(
            &path,
            &PathsDocument {
                horizon_days: paths.horizon_days(),
                num_simulations: paths.num_simulations(),
                paths: paths.paths().collect(),
            },
        )?,
        ExportFormat::Excel => write_paths_xlsx(&path, paths)?,
    }
    info!("Exported {} simulated paths to {}", paths.num_simulations(), path.display());
    Ok(path)
}

pub fn export_report(report: &SimulationReport, dir: &Path) -> Result<PathBuf, DataError> {
    let path = target(dir, "report", ExportFormat::Json)?;
    write_json(&path, report)?;
    info!("Exported report to {}", path.display());
    Ok(path)
}
