use crate::config::SimulationConfig;
use crate::error::SimulationError;
use crate::portfolio::{ReturnDataset, ReturnStatistics, Weights};
use crate::report::{DistributionSummarizer, SimulationReport};
use crate::sampler::{CorrelatedSampler, ShockMatrix};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

// ──────────────────────────────────────────────────────────────────────────────
// Path Matrix
// ──────────────────────────────────────────────────────────────────────────────

/// Simulated portfolio values, `horizon_days × num_simulations`.
///
/// Row `d` holds the value at the end of day `d + 1`; the initial investment
/// is not stored. Each path is contiguous in memory.
#[derive(Clone, Debug, PartialEq)]
pub struct PathMatrix {
    horizon_days: usize,
    num_simulations: usize,
    values: Vec<f64>,
}

impl PathMatrix {
    /// Builds a matrix from one vector per path.
    pub fn from_paths(paths: Vec<Vec<f64>>) -> Result<Self, SimulationError> {
        let num_simulations = paths.len();
        let horizon_days = paths.first().map(|p| p.len()).unwrap_or(0);
        if let Some(p) = paths.iter().find(|p| p.len() != horizon_days) {
            return Err(SimulationError::DimensionMismatch {
                what: "path length",
                expected: horizon_days,
                got: p.len(),
            });
        }
        Ok(Self {
            horizon_days,
            num_simulations,
            values: paths.into_iter().flatten().collect(),
        })
    }

    pub fn horizon_days(&self) -> usize {
        self.horizon_days
    }

    pub fn num_simulations(&self) -> usize {
        self.num_simulations
    }

    pub fn paths(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.values.chunks(self.horizon_days.max(1)).take(self.num_simulations)
    }

    /// Values of every path on one day.
    pub fn day_values(&self, day: usize) -> Vec<f64> {
        self.paths().map(|p| p[day]).collect()
    }

    pub fn terminal_values(&self) -> Vec<f64> {
        match self.horizon_days {
            0 => Vec::new(),
            h => self.day_values(h - 1),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Path Simulator
// ──────────────────────────────────────────────────────────────────────────────

/// Compounds correlated daily returns into portfolio value paths for one
/// fixed allocation.
#[derive(Clone, Debug)]
pub struct PathSimulator {
    statistics: ReturnStatistics,
    weights: Weights,
    config: SimulationConfig,
    sampler: CorrelatedSampler,
}

impl PathSimulator {
    pub fn new(
        statistics: ReturnStatistics,
        weights: Weights,
        config: SimulationConfig,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        if weights.len() != statistics.num_assets() {
            return Err(SimulationError::InvalidWeightVector {
                reason: format!(
                    "{} weights given for {} assets",
                    weights.len(),
                    statistics.num_assets()
                ),
            });
        }
        let sampler = CorrelatedSampler::new(statistics.covariance())?;
        Ok(Self {
            statistics,
            weights,
            config,
            sampler,
        })
    }

    /// Value path for one matrix of shocks:
    /// `V_d = V_0 · ∏_{i≤d} (1 + w·(μ + shock_i))`.
    ///
    /// Compounds in linear space; a daily return at or below -100% yields a
    /// zero or negative value rather than an error.
    pub fn compound(&self, shocks: &ShockMatrix) -> Result<Vec<f64>, SimulationError> {
        if shocks.num_assets() != self.statistics.num_assets() {
            return Err(SimulationError::DimensionMismatch {
                what: "shock assets",
                expected: self.statistics.num_assets(),
                got: shocks.num_assets(),
            });
        }
        if shocks.horizon_days() != self.config.horizon_days {
            return Err(SimulationError::DimensionMismatch {
                what: "shock days",
                expected: self.config.horizon_days,
                got: shocks.horizon_days(),
            });
        }

        let w = self.weights.as_slice();
        let mean = self.statistics.mean();
        let mut value = self.config.initial_investment;

        Ok((0..shocks.horizon_days())
            .map(|day| {
                let daily: f64 = (0..w.len()).map(|i| w[i] * (mean[i] + shocks.get(i, day))).sum();
                value *= 1.0 + daily;
                value
            })
            .collect())
    }

    /// Simulates every path. Path `k` uses its own generator seeded from the
    /// `k`-th draw of `seed`, so the result does not depend on thread count.
    pub fn simulate(&self, seed: u64) -> Result<PathMatrix, SimulationError> {
        self.simulate_with_cancel(seed, None)
    }

    /// Like [`simulate`](Self::simulate), checking `cancel` before each path.
    pub fn simulate_with_cancel(&self, seed: u64, cancel: Option<&AtomicBool>) -> Result<PathMatrix, SimulationError> {
        self.config.validate()?;
        let horizon = self.config.horizon_days;

        let mut master = StdRng::seed_from_u64(seed);
        let path_seeds: Vec<u64> = (0..self.config.num_simulations).map(|_| master.next_u64()).collect();

        let columns: Vec<Vec<f64>> = path_seeds
            .par_iter()
            .map(|&path_seed| {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(SimulationError::Cancelled);
                }
                let mut rng = StdRng::seed_from_u64(path_seed);
                let shocks = self.sampler.draw(horizon, &mut rng);
                self.compound(&shocks)
            })
            .collect::<Result<_, _>>()?;

        PathMatrix::from_paths(columns)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Run
// ──────────────────────────────────────────────────────────────────────────────

/// Everything one run produces.
#[derive(Clone, Debug)]
pub struct SimulationOutcome {
    pub seed: u64,
    pub statistics: ReturnStatistics,
    pub weights: Weights,
    pub paths: PathMatrix,
    pub report: SimulationReport,
}

/// Full pipeline from aligned returns: statistics → weights → paths → report.
pub fn run_simulation(
    dataset: &ReturnDataset,
    config: SimulationConfig,
    weights: Option<Weights>,
    seed: Option<u64>,
    cancel: Option<&AtomicBool>,
) -> Result<SimulationOutcome, SimulationError> {
    config.validate()?;
    let statistics = ReturnStatistics::estimate(dataset)?;
    info!(
        "Estimated statistics for {} assets over {} observations",
        dataset.num_assets(),
        dataset.num_observations()
    );
    simulate_portfolio(statistics, config, weights, seed, cancel)
}

/// Runs the simulation for given statistics.
///
/// Without explicit weights a random allocation is drawn once, from the same
/// seeded generator that seeds the paths.
pub fn simulate_portfolio(
    statistics: ReturnStatistics,
    config: SimulationConfig,
    weights: Option<Weights>,
    seed: Option<u64>,
    cancel: Option<&AtomicBool>,
) -> Result<SimulationOutcome, SimulationError> {
    config.validate()?;
    let seed = seed.unwrap_or_else(|| rand::thread_rng().next_u64());
    let mut master = StdRng::seed_from_u64(seed);

    let weights = match weights {
        Some(w) => w,
        None => Weights::random(statistics.num_assets(), &mut master)?,
    };

    info!(
        "Simulating {} paths over {} days (seed {}, weights {:?})",
        config.num_simulations,
        config.horizon_days,
        seed,
        weights.as_slice()
    );

    let simulator = PathSimulator::new(statistics, weights, config)?;
    let paths = simulator.simulate_with_cancel(master.next_u64(), cancel)?;
    let report = DistributionSummarizer::summarize(&paths, &config)?;

    info!(
        "Favorable simulations: {}/{} ({:.2}%), expected value {:.2}",
        report.favorable_count, config.num_simulations, report.favorable_rate, report.mean_terminal
    );

    let PathSimulator { statistics, weights, .. } = simulator;
    Ok(SimulationOutcome {
        seed,
        statistics,
        weights,
        paths,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Recommendation;

    fn two_asset_stats() -> ReturnStatistics {
        ReturnStatistics::from_parts(
            vec!["A".to_string(), "B".to_string()],
            vec![0.001, 0.0005],
            vec![vec![0.0004, 0.0001], vec![0.0001, 0.0002]],
        )
        .unwrap()
    }

    fn scenario_simulator(investment: f64) -> PathSimulator {
        PathSimulator::new(
            two_asset_stats(),
            Weights::new(vec![0.6, 0.4]).unwrap(),
            SimulationConfig::new(5, 1000, investment).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_variance_keeps_initial_investment() {
        let stats = ReturnStatistics::from_parts(vec!["CASH".to_string()], vec![0.0], vec![vec![0.0]]).unwrap();
        let sim = PathSimulator::new(stats, Weights::new(vec![1.0]).unwrap(), SimulationConfig::new(1, 1, 1000.0).unwrap())
            .unwrap();
        let paths = sim.simulate(123).unwrap();
        assert_eq!(paths.horizon_days(), 1);
        assert_eq!(paths.num_simulations(), 1);
        assert_eq!(paths.terminal_values(), vec![1000.0]);
    }

    #[test]
    fn test_compound_known_returns() {
        let sim = scenario_simulator(1000.0);
        let shocks = ShockMatrix::from_rows(vec![
            vec![0.009, -0.021, 0.0, 0.0, 0.0],
            vec![0.0095, 0.0195, 0.0, 0.0, 0.0],
        ])
        .unwrap();
        let path = sim.compound(&shocks).unwrap();

        // Day 1: 0.6·0.010 + 0.4·0.010 = 1%; day 2: 0.6·(-0.02) + 0.4·0.02 = -0.4%.
        assert!((path[0] - 1010.0).abs() < 1e-9);
        assert!((path[1] - 1010.0 * 0.996).abs() < 1e-9);
        let drift: f64 = 1.0 + 0.6 * 0.001 + 0.4 * 0.0005;
        assert!((path[4] - 1010.0 * 0.996 * drift.powi(3)).abs() < 1e-9);
    }

    #[test]
    fn test_wipeout_does_not_panic() {
        let sim = scenario_simulator(1000.0);
        let shocks = ShockMatrix::from_rows(vec![vec![-3.0; 5], vec![-3.0; 5]]).unwrap();
        let path = sim.compound(&shocks).unwrap();
        assert!(path[0] < 0.0);
        assert!(path.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_weight_length_mismatch_rejected() {
        let err = PathSimulator::new(
            two_asset_stats(),
            Weights::new(vec![0.2, 0.3, 0.5]).unwrap(),
            SimulationConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::InvalidWeightVector { .. }));
    }

    #[test]
    fn test_invalid_config_rejected_before_simulation() {
        let bad = SimulationConfig {
            horizon_days: 0,
            num_simulations: 10,
            initial_investment: 1000.0,
        };
        let err = PathSimulator::new(two_asset_stats(), Weights::new(vec![0.5, 0.5]).unwrap(), bad).unwrap_err();
        assert!(matches!(err, SimulationError::InvalidConfig { field: "horizon_days", .. }));

        let bad = SimulationConfig {
            horizon_days: 5,
            num_simulations: 0,
            initial_investment: 1000.0,
        };
        let err = simulate_portfolio(two_asset_stats(), bad, None, Some(1), None).unwrap_err();
        assert!(matches!(err, SimulationError::InvalidConfig { field: "num_simulations", .. }));
    }

    #[test]
    fn test_indefinite_covariance_rejected() {
        let stats = ReturnStatistics::from_parts(
            vec!["A".to_string(), "B".to_string()],
            vec![0.0, 0.0],
            vec![vec![1.0, 2.0], vec![2.0, 1.0]],
        )
        .unwrap();
        let err = simulate_portfolio(stats, SimulationConfig::default(), None, Some(5), None).unwrap_err();
        assert!(matches!(err, SimulationError::NonPositiveDefiniteCovariance { .. }));
    }

    #[test]
    fn test_scaling_investment_scales_paths() {
        let base = scenario_simulator(1000.0);
        let scaled = scenario_simulator(2500.0);
        let mut rng = StdRng::seed_from_u64(77);
        for _ in 0..20 {
            let shocks = base.sampler.draw(5, &mut rng);
            let a = base.compound(&shocks).unwrap();
            let b = scaled.compound(&shocks).unwrap();
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((y - 2.5 * x).abs() <= 1e-12 * y.abs());
            }
        }
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let sim = scenario_simulator(1000.0);
        let a = sim.simulate(2024).unwrap();
        let b = sim.simulate(2024).unwrap();
        let c = sim.simulate(2025).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_end_to_end_scenario() {
        let run = || {
            simulate_portfolio(
                two_asset_stats(),
                SimulationConfig::new(5, 1000, 1000.0).unwrap(),
                Some(Weights::new(vec![0.6, 0.4]).unwrap()),
                Some(42),
                None,
            )
            .unwrap()
        };
        let first = run();
        let second = run();

        assert_eq!(first.paths, second.paths);
        assert_eq!(first.report, second.report);

        let report = &first.report;
        assert_eq!(first.paths.horizon_days(), 5);
        assert_eq!(first.paths.num_simulations(), 1000);
        assert!(report.percentile_5 <= report.percentile_95);
        assert!(report.worst_terminal <= report.best_terminal);
        // Expected terminal ≈ 1000·(1.0008)^5 ≈ 1004; standard error ≈ 1.1.
        assert!((report.mean_terminal - 1004.0).abs() < 6.0, "mean {}", report.mean_terminal);
        assert!(report.favorable_rate > 40.0 && report.favorable_rate < 70.0);
        assert_eq!(report.recommendation, Recommendation::from_mean(report.mean_terminal, 1000.0));
    }

    #[test]
    fn test_random_weights_drawn_once_per_run() {
        let outcome = simulate_portfolio(two_asset_stats(), SimulationConfig::new(3, 50, 100.0).unwrap(), None, Some(8), None)
            .unwrap();
        let sum: f64 = outcome.weights.as_slice().iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);

        let again = simulate_portfolio(two_asset_stats(), SimulationConfig::new(3, 50, 100.0).unwrap(), None, Some(8), None)
            .unwrap();
        assert_eq!(outcome.weights, again.weights);
        assert_eq!(outcome.paths, again.paths);
    }

    #[test]
    fn test_paths_identical_across_thread_counts() {
        let sim = scenario_simulator(1000.0);
        let pool = |threads: usize| rayon::ThreadPoolBuilder::new().num_threads(threads).build().unwrap();

        let single = pool(1).install(|| sim.simulate(42)).unwrap();
        let many = pool(7).install(|| sim.simulate(42)).unwrap();
        assert_eq!(single, many);
    }

    #[test]
    fn test_fewer_observations_than_assets_rejected() {
        use crate::portfolio::AssetReturnSeries;
        use chrono::NaiveDate;

        let dates: Vec<NaiveDate> = (2..=4).map(|d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap()).collect();
        let returns = [
            ("A", [0.01, -0.02, 0.005]),
            ("B", [0.003, 0.004, -0.01]),
            ("C", [-0.01, 0.02, 0.0]),
            ("D", [0.02, 0.01, -0.03]),
        ];
        let series = returns
            .iter()
            .map(|(symbol, r)| AssetReturnSeries::new(symbol, dates.iter().copied().zip(r.iter().copied()).collect()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let dataset = ReturnDataset::new(series).unwrap();
        assert_eq!(dataset.num_observations(), 3);

        let err = run_simulation(&dataset, SimulationConfig::new(5, 10, 1000.0).unwrap(), None, Some(1), None).unwrap_err();
        assert!(matches!(err, SimulationError::NonPositiveDefiniteCovariance { asset: 2, .. }), "{err:?}");
    }

    #[test]
    fn test_cancelled_run_returns_no_matrix() {
        let sim = scenario_simulator(1000.0);
        let cancel = AtomicBool::new(true);
        assert_eq!(sim.simulate_with_cancel(1, Some(&cancel)).unwrap_err(), SimulationError::Cancelled);
    }

    #[test]
    fn test_run_from_dataset() {
        use crate::data::StockData;

        let mut rng = StdRng::seed_from_u64(5);
        let data: Vec<StockData> = ["SPY", "QQQ", "TLT"].iter().map(|s| StockData::new_mock(s, 90, &mut rng)).collect();
        let dataset = ReturnDataset::from_prices(&data).unwrap();
        let outcome = run_simulation(&dataset, SimulationConfig::new(10, 200, 1000.0).unwrap(), None, Some(3), None).unwrap();

        assert_eq!(outcome.statistics.symbols(), dataset.symbols());
        assert_eq!(outcome.weights.len(), 3);
        assert_eq!(outcome.report.bands.median.len(), 10);
    }
}
