use crate::config::SimulationConfig;
use crate::data::AssetSummary;
use crate::error::SimulationError;
use crate::simulation::PathMatrix;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt::{self, Write};

/// Lower, middle and upper percentiles of the per-day confidence bands.
pub const BAND_PERCENTILES: (f64, f64, f64) = (2.5, 50.0, 97.5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Recommendation {
    #[serde(rename = "invest")]
    Invest,
    #[serde(rename = "do not invest")]
    DoNotInvest,
}

impl Recommendation {
    /// Threshold rule on the expected terminal value against the principal.
    pub fn from_mean(mean_terminal: f64, initial_investment: f64) -> Self {
        if mean_terminal >= initial_investment {
            Recommendation::Invest
        } else {
            Recommendation::DoNotInvest
        }
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recommendation::Invest => write!(f, "invest"),
            Recommendation::DoNotInvest => write!(f, "do not invest"),
        }
    }
}

/// Per-day percentile bands over the horizon, one entry per day.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PercentileBands {
    pub lower: Vec<f64>,
    pub median: Vec<f64>,
    pub upper: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationReport {
    pub initial_investment: f64,
    pub horizon_days: usize,
    pub num_simulations: usize,
    pub favorable_count: usize,
    /// Percent of paths ending at or above the initial investment.
    pub favorable_rate: f64,
    pub best_terminal: f64,
    pub worst_terminal: f64,
    pub percentile_5: f64,
    pub percentile_95: f64,
    pub mean_terminal: f64,
    pub median_terminal: f64,
    pub std_terminal: f64,
    pub expected_return_pct: f64,
    pub recommendation: Recommendation,
    pub bands: PercentileBands,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Percentile of an ascending slice with linear interpolation between the
/// closest ranks (`rank = p/100 · (n-1)`). NaN for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

fn sorted(mut values: Vec<f64>) -> Vec<f64> {
    values.sort_by(f64::total_cmp);
    values
}

pub struct DistributionSummarizer;

impl DistributionSummarizer {
    pub fn summarize(paths: &PathMatrix, config: &SimulationConfig) -> Result<SimulationReport, SimulationError> {
        config.validate()?;
        if paths.horizon_days() != config.horizon_days {
            return Err(SimulationError::DimensionMismatch {
                what: "path days",
                expected: config.horizon_days,
                got: paths.horizon_days(),
            });
        }
        if paths.num_simulations() != config.num_simulations {
            return Err(SimulationError::DimensionMismatch {
                what: "simulations",
                expected: config.num_simulations,
                got: paths.num_simulations(),
            });
        }

        let initial = config.initial_investment;
        let terminal = sorted(paths.terminal_values());
        let n = terminal.len() as f64;

        let favorable_count = terminal.iter().filter(|&&v| v >= initial).count();
        let mean_terminal = terminal.iter().sum::<f64>() / n;
        let std_terminal = (terminal.iter().map(|v| (v - mean_terminal).powi(2)).sum::<f64>() / n).sqrt();

        Ok(SimulationReport {
            initial_investment: initial,
            horizon_days: config.horizon_days,
            num_simulations: config.num_simulations,
            favorable_count,
            favorable_rate: favorable_count as f64 / n * 100.0,
            best_terminal: terminal[terminal.len() - 1],
            worst_terminal: terminal[0],
            percentile_5: percentile(&terminal, 5.0),
            percentile_95: percentile(&terminal, 95.0),
            mean_terminal,
            median_terminal: percentile(&terminal, 50.0),
            std_terminal,
            expected_return_pct: (mean_terminal / initial - 1.0) * 100.0,
            recommendation: Recommendation::from_mean(mean_terminal, initial),
            bands: Self::bands(paths),
        })
    }

    /// 2.5 / 50 / 97.5 percentiles of the path values on every day.
    pub fn bands(paths: &PathMatrix) -> PercentileBands {
        let (lo, mid, hi) = BAND_PERCENTILES;
        let per_day: Vec<(f64, f64, f64)> = (0..paths.horizon_days())
            .into_par_iter()
            .map(|day| {
                let values = sorted(paths.day_values(day));
                (percentile(&values, lo), percentile(&values, mid), percentile(&values, hi))
            })
            .collect();

        let mut bands = PercentileBands::default();
        for (l, m, u) in per_day {
            bands.lower.push(l);
            bands.median.push(m);
            bands.upper.push(u);
        }
        bands
    }
}

/// Equal-width histogram of finite values. A constant sample lands in one bin.
pub fn terminal_histogram(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() || bins == 0 {
        return Vec::new();
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max <= min {
        return vec![HistogramBin {
            lower: min,
            upper: max,
            count: finite.len(),
        }];
    }

    let width = (max - min) / bins as f64;
    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower: min + width * i as f64,
            upper: min + width * (i + 1) as f64,
            count: 0,
        })
        .collect();
    for v in finite {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}

// ── Text Report ─────────────────────────────────────────────────────────────

const BOX_WIDTH: usize = 60;

fn boxed(out: &mut String, text: &str) {
    let _ = writeln!(out, "║  {:<width$}║", text, width = BOX_WIDTH - 2);
}

fn rule(out: &mut String, left: char, right: char) {
    let _ = writeln!(out, "{}{}{}", left, "═".repeat(BOX_WIDTH), right);
}

/// Boxed summary printed by the CLI: assets, simulation results, recommendation.
pub fn render_text(report: &SimulationReport, assets: &[AssetSummary]) -> String {
    let mut out = String::new();
    out.push('\n');
    rule(&mut out, '╔', '╗');
    boxed(&mut out, "            Portfolio Monte Carlo Simulation");

    if !assets.is_empty() {
        rule(&mut out, '╠', '╣');
        boxed(&mut out, "Symbol       Min       Max      Mean       Std");
        for a in assets {
            boxed(
                &mut out,
                &format!(
                    "{:<8} {:>8.2}  {:>8.2}  {:>8.2}  {:>8.2}",
                    a.symbol, a.min_price, a.max_price, a.mean_price, a.std_price
                ),
            );
        }
    }

    rule(&mut out, '╠', '╣');
    boxed(&mut out, &format!("Initial Investment     : {:>12.2}", report.initial_investment));
    boxed(&mut out, &format!("Horizon (days)         : {:>12}", report.horizon_days));
    boxed(&mut out, &format!("Simulations            : {:>12}", report.num_simulations));
    boxed(
        &mut out,
        &format!(
            "Favorable Simulations  : {:>12} ({:.2}%)",
            report.favorable_count, report.favorable_rate
        ),
    );
    boxed(&mut out, &format!("Best Terminal Value    : {:>12.2}", report.best_terminal));
    boxed(&mut out, &format!("Worst Terminal Value   : {:>12.2}", report.worst_terminal));
    boxed(&mut out, &format!("5th Percentile         : {:>12.2}", report.percentile_5));
    boxed(&mut out, &format!("95th Percentile        : {:>12.2}", report.percentile_95));
    boxed(&mut out, &format!("Mean Terminal Value    : {:>12.2}", report.mean_terminal));
    boxed(&mut out, &format!("Median Terminal Value  : {:>12.2}", report.median_terminal));
    boxed(&mut out, &format!("Expected Return        : {:>+11.2}%", report.expected_return_pct));
    rule(&mut out, '╠', '╣');
    boxed(&mut out, &format!("Recommendation: {}", report.recommendation.to_string().to_uppercase()));
    rule(&mut out, '╚', '╝');
    out.push('\n');
    out.push_str("⚠  Educational use only. Not financial advice.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_paths() -> (PathMatrix, SimulationConfig) {
        let paths = PathMatrix::from_paths(vec![vec![1010.0, 1020.0], vec![990.0, 980.0], vec![1000.0, 1000.0]]).unwrap();
        (paths, SimulationConfig::new(2, 3, 1000.0).unwrap())
    }

    #[test]
    fn test_percentile_interpolates_between_ranks() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 50.0), 2.5);
        assert!((percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 5.0) - 1.2).abs() < 1e-12);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.0), 1.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 100.0), 3.0);
        assert_eq!(percentile(&[7.0], 95.0), 7.0);
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn test_summarize_small_matrix() {
        let (paths, config) = small_paths();
        let report = DistributionSummarizer::summarize(&paths, &config).unwrap();

        assert_eq!(report.favorable_count, 2);
        assert!((report.favorable_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.best_terminal, 1020.0);
        assert_eq!(report.worst_terminal, 980.0);
        assert!((report.percentile_5 - 982.0).abs() < 1e-9);
        assert!((report.percentile_95 - 1018.0).abs() < 1e-9);
        assert_eq!(report.mean_terminal, 1000.0);
        assert_eq!(report.median_terminal, 1000.0);
        assert_eq!(report.expected_return_pct, 0.0);
        assert_eq!(report.recommendation, Recommendation::Invest);

        assert!((report.bands.lower[0] - 990.5).abs() < 1e-9);
        assert_eq!(report.bands.median[0], 1000.0);
        assert!((report.bands.upper[0] - 1009.5).abs() < 1e-9);
        assert_eq!(report.bands.median.len(), 2);
    }

    #[test]
    fn test_losing_paths_recommend_against() {
        let paths = PathMatrix::from_paths(vec![vec![990.0], vec![995.0], vec![1001.0]]).unwrap();
        let config = SimulationConfig::new(1, 3, 1000.0).unwrap();
        let report = DistributionSummarizer::summarize(&paths, &config).unwrap();
        assert_eq!(report.favorable_count, 1);
        assert_eq!(report.recommendation, Recommendation::DoNotInvest);
        assert_eq!(report.recommendation.to_string(), "do not invest");
    }

    #[test]
    fn test_non_positive_values_are_tolerated() {
        let paths = PathMatrix::from_paths(vec![vec![-50.0], vec![0.0], vec![2000.0]]).unwrap();
        let config = SimulationConfig::new(1, 3, 1000.0).unwrap();
        let report = DistributionSummarizer::summarize(&paths, &config).unwrap();
        assert_eq!(report.worst_terminal, -50.0);
        assert!(report.percentile_5 <= report.percentile_95);
        assert!(report.std_terminal.is_finite());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let (paths, _) = small_paths();
        let config = SimulationConfig::new(3, 3, 1000.0).unwrap();
        let err = DistributionSummarizer::summarize(&paths, &config).unwrap_err();
        assert!(matches!(err, SimulationError::DimensionMismatch { what: "path days", .. }));
    }

    #[test]
    fn test_histogram_counts_every_value() {
        let values = [1.0, 2.0, 2.5, 3.0, 10.0, f64::NAN];
        let bins = terminal_histogram(&values, 3);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), 5);
        assert_eq!(bins[0].count, 4);
        assert_eq!(bins[2].count, 1);

        let flat = terminal_histogram(&[5.0, 5.0], 10);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].count, 2);
        assert!(terminal_histogram(&[], 4).is_empty());
    }

    #[test]
    fn test_render_text_contains_results() {
        let (paths, config) = small_paths();
        let report = DistributionSummarizer::summarize(&paths, &config).unwrap();
        let assets = vec![AssetSummary {
            symbol: "SPY".to_string(),
            first_date: None,
            last_date: None,
            min_price: 400.0,
            max_price: 500.0,
            mean_price: 450.0,
            std_price: 20.0,
        }];
        let text = render_text(&report, &assets);
        assert!(text.contains("SPY"));
        assert!(text.contains("Favorable Simulations"));
        assert!(text.contains("INVEST"));
        assert!(text.contains("Not financial advice"));
    }
}
