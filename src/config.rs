use crate::error::SimulationError;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Number of HTTP attempts per history request (`PORTFOLIO_MC_RETRY_ATTEMPTS`, 1..=8).
pub fn fetch_retry_attempts() -> usize {
    std::env::var("PORTFOLIO_MC_RETRY_ATTEMPTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, 8))
        .unwrap_or(DEFAULT_RETRY_ATTEMPTS)
}

pub fn alpha_vantage_api_key() -> Option<String> {
    std::env::var(ALPHA_VANTAGE_KEY_VAR)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub const ALPHA_VANTAGE_KEY_VAR: &str = "ALPHAVANTAGE_API_KEY";
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;
pub const HTTP_TIMEOUT_SECS: u64 = 15;

pub const DEFAULT_START_DATE: &str = "2025-01-01";
pub const DEFAULT_HORIZON_DAYS: usize = 100;
pub const DEFAULT_SIMULATIONS: usize = 100;
pub const DEFAULT_INVESTMENT: f64 = 1000.0;

/// Paths drawn on the dashboard chart on top of the percentile bands.
pub const DASHBOARD_SAMPLE_PATHS: usize = 20;
/// Bins of the terminal-value histogram.
pub const HISTOGRAM_BINS: usize = 20;

/// Input-side tolerance on `sum(weights) == 1`.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ── Simulation Config ───────────────────────────────────────────────────────

/// Size of one Monte Carlo run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub horizon_days: usize,
    pub num_simulations: usize,
    pub initial_investment: f64,
}

impl SimulationConfig {
    pub fn new(
        horizon_days: usize,
        num_simulations: usize,
        initial_investment: f64,
    ) -> Result<Self, SimulationError> {
        let config = Self {
            horizon_days,
            num_simulations,
            initial_investment,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.horizon_days == 0 {
            return Err(SimulationError::InvalidConfig {
                field: "horizon_days",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.num_simulations == 0 {
            return Err(SimulationError::InvalidConfig {
                field: "num_simulations",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.initial_investment.is_finite() || self.initial_investment <= 0.0 {
            return Err(SimulationError::InvalidConfig {
                field: "initial_investment",
                reason: format!("must be a positive amount, got {}", self.initial_investment),
            });
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            horizon_days: DEFAULT_HORIZON_DAYS,
            num_simulations: DEFAULT_SIMULATIONS,
            initial_investment: DEFAULT_INVESTMENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sizes_are_rejected() {
        let err = SimulationConfig::new(0, 10, 1000.0).unwrap_err();
        assert!(matches!(err, SimulationError::InvalidConfig { field: "horizon_days", .. }));

        let err = SimulationConfig::new(10, 0, 1000.0).unwrap_err();
        assert!(matches!(err, SimulationError::InvalidConfig { field: "num_simulations", .. }));
    }

    #[test]
    fn test_investment_must_be_positive() {
        for bad in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let err = SimulationConfig::new(5, 5, bad).unwrap_err();
            assert!(matches!(err, SimulationError::InvalidConfig { field: "initial_investment", .. }));
        }
        assert!(SimulationConfig::new(1, 1, 0.01).is_ok());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(SimulationConfig::default().validate().is_ok());
    }
}
