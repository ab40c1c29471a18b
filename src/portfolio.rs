use crate::config::WEIGHT_SUM_TOLERANCE;
use crate::data::StockData;
use crate::error::SimulationError;
use chrono::NaiveDate;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

/// Fewest aligned observations that give a non-degenerate covariance.
pub const MIN_OBSERVATIONS: usize = 2;

// ──────────────────────────────────────────────────────────────────────────────
// Return Series
// ──────────────────────────────────────────────────────────────────────────────

/// Fractional returns of one asset, one per observation date.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetReturnSeries {
    symbol: String,
    points: Vec<(NaiveDate, f64)>,
}

impl AssetReturnSeries {
    /// Dates must be strictly increasing and returns finite.
    pub fn new(symbol: &str, points: Vec<(NaiveDate, f64)>) -> Result<Self, SimulationError> {
        let malformed = |reason: String| SimulationError::MalformedSeries {
            symbol: symbol.to_string(),
            reason,
        };
        if let Some(w) = points.windows(2).find(|w| w[1].0 <= w[0].0) {
            return Err(malformed(format!("date {} does not follow {}", w[1].0, w[0].0)));
        }
        if let Some((date, r)) = points.iter().find(|(_, r)| !r.is_finite()) {
            return Err(malformed(format!("non-finite return {} on {}", r, date)));
        }
        Ok(Self {
            symbol: symbol.to_string(),
            points,
        })
    }

    /// Percentage change between consecutive prices; the first date has no return.
    pub fn from_prices(symbol: &str, prices: &[(NaiveDate, f64)]) -> Result<Self, SimulationError> {
        if let Some((date, p)) = prices.iter().find(|(_, p)| !p.is_finite() || *p <= 0.0) {
            return Err(SimulationError::MalformedSeries {
                symbol: symbol.to_string(),
                reason: format!("non-positive price {} on {}", p, date),
            });
        }
        let points = prices
            .windows(2)
            .map(|w| (w[1].0, w[1].1 / w[0].1 - 1.0))
            .collect();
        Self::new(symbol, points)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn points(&self) -> &[(NaiveDate, f64)] {
        &self.points
    }

}

/// Multi-asset returns aligned on the dates every asset has.
///
/// The asset order here is the ordering used by the mean vector, the
/// covariance matrix and the weights downstream.
#[derive(Clone, Debug, PartialEq)]
pub struct ReturnDataset {
    symbols: Vec<String>,
    dates: Vec<NaiveDate>,
    returns: Vec<Vec<f64>>,
}

fn reject_duplicates<'a>(symbols: impl IntoIterator<Item = &'a str>) -> Result<(), SimulationError> {
    let mut seen = HashSet::new();
    for symbol in symbols {
        if !seen.insert(symbol) {
            return Err(SimulationError::DuplicateAsset(symbol.to_string()));
        }
    }
    Ok(())
}

fn common_dates<'a>(series: impl IntoIterator<Item = &'a [(NaiveDate, f64)]>) -> Vec<NaiveDate> {
    let mut common: Option<BTreeSet<NaiveDate>> = None;
    for points in series {
        let dates: BTreeSet<NaiveDate> = points.iter().map(|(d, _)| *d).collect();
        common = Some(match common {
            Some(acc) => acc.intersection(&dates).copied().collect(),
            None => dates,
        });
    }
    common.map(|s| s.into_iter().collect()).unwrap_or_default()
}

fn values_on(points: &[(NaiveDate, f64)], dates: &[NaiveDate]) -> Vec<f64> {
    let mut out = Vec::with_capacity(dates.len());
    let mut it = points.iter();
    for date in dates {
        if let Some((_, v)) = it.by_ref().find(|(d, _)| d == date) {
            out.push(*v);
        }
    }
    out
}

impl ReturnDataset {
    /// Aligns already computed return series, dropping dates any asset lacks.
    pub fn new(series: Vec<AssetReturnSeries>) -> Result<Self, SimulationError> {
        reject_duplicates(series.iter().map(|s| s.symbol()))?;
        let dates = common_dates(series.iter().map(|s| s.points()));
        let returns = series.iter().map(|s| values_on(s.points(), &dates)).collect();
        Ok(Self {
            symbols: series.into_iter().map(|s| s.symbol).collect(),
            dates,
            returns,
        })
    }

    /// Aligns the price columns of several assets on their common dates, then
    /// converts them to percentage returns.
    pub fn from_prices(data: &[StockData]) -> Result<Self, SimulationError> {
        reject_duplicates(data.iter().map(|d| d.symbol.as_str()))?;
        let prices: Vec<Vec<(NaiveDate, f64)>> = data.iter().map(|d| d.prices()).collect();
        let dates = common_dates(prices.iter().map(|p| p.as_slice()));

        let series = data
            .iter()
            .zip(prices.iter())
            .map(|(d, p)| {
                let aligned: Vec<(NaiveDate, f64)> = dates.iter().copied().zip(values_on(p, &dates)).collect();
                AssetReturnSeries::from_prices(&d.symbol, &aligned)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(series)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    /// Aligned returns of the asset at `index`.
    pub fn returns(&self, index: usize) -> &[f64] {
        &self.returns[index]
    }

    pub fn num_assets(&self) -> usize {
        self.symbols.len()
    }

    pub fn num_observations(&self) -> usize {
        self.dates.len()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Return Statistics
// ──────────────────────────────────────────────────────────────────────────────

/// Mean vector and covariance matrix of daily returns, in dataset order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReturnStatistics {
    symbols: Vec<String>,
    mean: Vec<f64>,
    covariance: Vec<Vec<f64>>,
}

impl ReturnStatistics {
    /// Sample mean and sample covariance (divisor T-1).
    pub fn estimate(dataset: &ReturnDataset) -> Result<Self, SimulationError> {
        let n = dataset.num_assets();
        if n == 0 {
            return Err(SimulationError::EmptyPortfolio);
        }
        let t = dataset.num_observations();
        if t < MIN_OBSERVATIONS {
            return Err(SimulationError::InsufficientData {
                observations: t,
                required: MIN_OBSERVATIONS,
            });
        }

        let means: Vec<f64> = (0..n)
            .map(|i| dataset.returns(i).iter().sum::<f64>() / t as f64)
            .collect();

        let mut cov = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in i..n {
                let sum: f64 = dataset
                    .returns(i)
                    .iter()
                    .zip(dataset.returns(j))
                    .map(|(ri, rj)| (ri - means[i]) * (rj - means[j]))
                    .sum();
                let covariance = sum / (t as f64 - 1.0);
                cov[i][j] = covariance;
                cov[j][i] = covariance;
            }
        }

        Self::from_parts(dataset.symbols().to_vec(), means, cov)
    }

    /// Statistics supplied directly by the caller; also the final check on
    /// estimated ones, which can overflow to non-finite values.
    pub fn from_parts(
        symbols: Vec<String>,
        mean: Vec<f64>,
        covariance: Vec<Vec<f64>>,
    ) -> Result<Self, SimulationError> {
        let n = symbols.len();
        if n == 0 {
            return Err(SimulationError::EmptyPortfolio);
        }
        reject_duplicates(symbols.iter().map(|s| s.as_str()))?;
        if mean.len() != n {
            return Err(SimulationError::DimensionMismatch {
                what: "mean vector",
                expected: n,
                got: mean.len(),
            });
        }
        if covariance.len() != n {
            return Err(SimulationError::DimensionMismatch {
                what: "covariance rows",
                expected: n,
                got: covariance.len(),
            });
        }
        if let Some(row) = covariance.iter().find(|row| row.len() != n) {
            return Err(SimulationError::DimensionMismatch {
                what: "covariance columns",
                expected: n,
                got: row.len(),
            });
        }
        if let Some(bad) = mean.iter().chain(covariance.iter().flatten()).find(|v| !v.is_finite()) {
            return Err(SimulationError::MalformedSeries {
                symbol: "statistics".to_string(),
                reason: format!("non-finite value {}", bad),
            });
        }
        for i in 0..n {
            for j in 0..i {
                let (a, b) = (covariance[i][j], covariance[j][i]);
                if (a - b).abs() > 1e-12 * a.abs().max(b.abs()).max(1.0) {
                    return Err(SimulationError::MalformedSeries {
                        symbol: symbols[i].clone(),
                        reason: format!("covariance is not symmetric at ({}, {})", i, j),
                    });
                }
            }
        }

        Ok(Self {
            symbols,
            mean,
            covariance,
        })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn covariance(&self) -> &[Vec<f64>] {
        &self.covariance
    }

    pub fn num_assets(&self) -> usize {
        self.symbols.len()
    }

    /// Daily standard deviation per asset.
    pub fn volatilities(&self) -> Vec<f64> {
        (0..self.num_assets())
            .map(|i| self.covariance[i][i].max(0.0).sqrt())
            .collect()
    }

}

// ──────────────────────────────────────────────────────────────────────────────
// Weights
// ──────────────────────────────────────────────────────────────────────────────

/// Non-negative allocation fractions summing to one.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Weights(Vec<f64>);

impl Weights {
    pub fn new(values: Vec<f64>) -> Result<Self, SimulationError> {
        if values.is_empty() {
            return Err(SimulationError::InvalidWeightVector {
                reason: "no weights given".to_string(),
            });
        }
        if let Some((i, w)) = values.iter().enumerate().find(|(_, w)| !w.is_finite() || **w < 0.0) {
            return Err(SimulationError::InvalidWeightVector {
                reason: format!("weight {} is {}, must be a non-negative number", i, w),
            });
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(SimulationError::InvalidWeightVector {
                reason: format!("weights sum to {}, expected 1", sum),
            });
        }
        Ok(Self(values))
    }

    /// Uniform draws normalized to sum to one.
    pub fn random(n: usize, rng: &mut impl Rng) -> Result<Self, SimulationError> {
        if n == 0 {
            return Err(SimulationError::EmptyPortfolio);
        }
        loop {
            let raw: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
            let sum: f64 = raw.iter().sum();
            if sum > 0.0 {
                return Ok(Self(raw.iter().map(|v| v / sum).collect()));
            }
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn mock_dataset(n: usize, days: usize) -> ReturnDataset {
        let mut rng = StdRng::seed_from_u64(11);
        let data: Vec<StockData> = ["AAAA", "BBBB", "CCCC", "DDDD", "EEEE"][..n]
            .iter()
            .map(|s| StockData::new_mock(s, days, &mut rng))
            .collect();
        ReturnDataset::from_prices(&data).unwrap()
    }

    #[test]
    fn test_from_prices_aligns_on_common_dates() {
        let a = AssetReturnSeries::from_prices("A", &[(d(1), 100.0), (d(2), 110.0), (d(3), 99.0), (d(4), 99.0)]).unwrap();
        assert_eq!(a.points().len(), 3);
        assert!((a.points()[0].1 - 0.10).abs() < 1e-12);
        assert!((a.points()[1].1 + 0.10).abs() < 1e-12);

        let b = AssetReturnSeries::new("B", vec![(d(3), 0.01), (d(4), 0.02), (d(5), 0.03)]).unwrap();
        let ds = ReturnDataset::new(vec![a, b]).unwrap();
        assert_eq!(ds.dates(), &[d(3), d(4)]);
        assert_eq!(ds.returns(1), &[0.01, 0.02]);
        assert_eq!(ds.returns(0).len(), 2);
        assert_eq!(ds.symbols(), &["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_series_rejects_unordered_dates() {
        let err = AssetReturnSeries::new("X", vec![(d(2), 0.01), (d(2), 0.02)]).unwrap_err();
        assert!(matches!(err, SimulationError::MalformedSeries { .. }));
        let err = AssetReturnSeries::from_prices("X", &[(d(1), 0.0), (d(2), 1.0)]).unwrap_err();
        assert!(matches!(err, SimulationError::MalformedSeries { .. }));
    }

    #[test]
    fn test_duplicate_assets_rejected() {
        let a = AssetReturnSeries::new("A", vec![(d(1), 0.01), (d(2), 0.02)]).unwrap();
        let err = ReturnDataset::new(vec![a.clone(), a]).unwrap_err();
        assert_eq!(err, SimulationError::DuplicateAsset("A".to_string()));
    }

    #[test]
    fn test_covariance_matrix_symmetry() {
        let dataset = mock_dataset(3, 120);
        let stats = ReturnStatistics::estimate(&dataset).unwrap();

        assert_eq!(stats.mean().len(), 3);
        assert_eq!(stats.covariance().len(), 3);
        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    (stats.covariance()[i][j] - stats.covariance()[j][i]).abs() < 1e-15,
                    "Covariance matrix should be symmetric"
                );
            }
            assert!(stats.covariance()[i][i] > 0.0, "Variance should be positive");
        }
    }

    #[test]
    fn test_sample_statistics_known_values() {
        let a = AssetReturnSeries::new("A", vec![(d(1), 0.01), (d(2), 0.03), (d(3), 0.02)]).unwrap();
        let b = AssetReturnSeries::new("B", vec![(d(1), 0.02), (d(2), -0.02), (d(3), 0.0)]).unwrap();
        let stats = ReturnStatistics::estimate(&ReturnDataset::new(vec![a, b]).unwrap()).unwrap();

        assert!((stats.mean()[0] - 0.02).abs() < 1e-15);
        assert!(stats.mean()[1].abs() < 1e-15);
        // var(A) = (1e-4 + 1e-4 + 0) / 2
        assert!((stats.covariance()[0][0] - 1e-4).abs() < 1e-15);
        // cov(A,B) = ((-0.01)(0.02) + (0.01)(-0.02) + 0) / 2
        assert!((stats.covariance()[0][1] + 2e-4).abs() < 1e-15);
        assert!((stats.volatilities()[0] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_preconditions() {
        let empty = ReturnDataset::new(vec![]).unwrap();
        assert_eq!(ReturnStatistics::estimate(&empty).unwrap_err(), SimulationError::EmptyPortfolio);

        let one = AssetReturnSeries::new("A", vec![(d(1), 0.01)]).unwrap();
        let err = ReturnStatistics::estimate(&ReturnDataset::new(vec![one]).unwrap()).unwrap_err();
        assert_eq!(err, SimulationError::InsufficientData { observations: 1, required: 2 });
    }

    #[test]
    fn test_from_parts_validates_shape() {
        let names = vec!["A".to_string(), "B".to_string()];
        let err = ReturnStatistics::from_parts(names.clone(), vec![0.0], vec![vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, SimulationError::DimensionMismatch { what: "mean vector", .. }));

        let err = ReturnStatistics::from_parts(names.clone(), vec![0.0, 0.0], vec![vec![1.0, 0.5], vec![0.1, 1.0]]).unwrap_err();
        assert!(matches!(err, SimulationError::MalformedSeries { .. }));

        assert!(ReturnStatistics::from_parts(names, vec![0.0, 0.0], vec![vec![1.0, 0.5], vec![0.5, 1.0]]).is_ok());
    }

    #[test]
    fn test_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let w = Weights::random(5, &mut rng).unwrap();
            let sum: f64 = w.as_slice().iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "Weights should sum to 1.0, got {}", sum);
            assert!(w.as_slice().iter().all(|&v| v >= 0.0), "Weights should be non-negative");
        }
    }

    #[test]
    fn test_weight_validation() {
        assert!(Weights::new(vec![0.6, 0.4]).is_ok());
        assert!(matches!(Weights::new(vec![0.6, 0.6]), Err(SimulationError::InvalidWeightVector { .. })));
        assert!(matches!(Weights::new(vec![1.2, -0.2]), Err(SimulationError::InvalidWeightVector { .. })));
        assert!(matches!(Weights::new(vec![]), Err(SimulationError::InvalidWeightVector { .. })));
        assert_eq!(Weights::random(0, &mut StdRng::seed_from_u64(1)).unwrap_err(), SimulationError::EmptyPortfolio);
    }
}
