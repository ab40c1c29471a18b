//! Correlated return shocks.
//!
//! Independent standard normals `Z` are turned into shocks `L·Z` whose
//! covariance across assets is `C = L·Lᵗ`, with `L` the lower-triangular
//! Cholesky factor of the return covariance.

use crate::error::SimulationError;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// A pivot smaller than this fraction of the asset's own variance means the
/// asset is a linear combination of the ones before it.
const PIVOT_RTOL: f64 = 1e-10;

/// Lower-triangular factor `L` with `L·Lᵗ = C`, stored row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct CholeskyFactor {
    dim: usize,
    lower: Vec<f64>,
}

impl CholeskyFactor {
    /// Factorizes a symmetric positive semi-definite matrix.
    ///
    /// Only the lower triangle is read. An asset with zero variance must have
    /// zero covariance with every other asset; it gets a zero row in `L`.
    /// Every other pivot must stay positive, so an indefinite matrix or
    /// collinear assets fail here instead of producing NaN shocks later.
    pub fn factorize(cov: &[Vec<f64>]) -> Result<Self, SimulationError> {
        let n = cov.len();
        if n == 0 {
            return Err(SimulationError::EmptyPortfolio);
        }
        if let Some(row) = cov.iter().find(|row| row.len() != n) {
            return Err(SimulationError::DimensionMismatch {
                what: "covariance columns",
                expected: n,
                got: row.len(),
            });
        }

        let scale = (0..n).map(|i| cov[i][i].abs()).fold(0.0, f64::max);
        let tol = scale * 1e-12;
        let mut lower = vec![0.0; n * n];

        for j in 0..n {
            let c_jj = cov[j][j];

            if c_jj.abs() <= tol {
                // Riskless asset: the whole row and column must vanish.
                for i in 0..n {
                    let c = if i > j { cov[i][j] } else { cov[j][i] };
                    if i != j && !(c.abs() <= tol) {
                        return Err(SimulationError::NonPositiveDefiniteCovariance { asset: j, pivot: c_jj });
                    }
                }
                continue;
            }

            let sum: f64 = (0..j).map(|k| lower[j * n + k] * lower[j * n + k]).sum();
            let pivot = c_jj - sum;
            if !(pivot > c_jj * PIVOT_RTOL) {
                return Err(SimulationError::NonPositiveDefiniteCovariance { asset: j, pivot });
            }
            let l_jj = pivot.sqrt();
            lower[j * n + j] = l_jj;

            for i in (j + 1)..n {
                let sum: f64 = (0..j).map(|k| lower[i * n + k] * lower[j * n + k]).sum();
                lower[i * n + j] = (cov[i][j] - sum) / l_jj;
            }
        }

        Ok(Self { dim: n, lower })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `L·z` for one vector of independent draws.
    pub fn transform(&self, z: &[f64]) -> Vec<f64> {
        (0..self.dim)
            .map(|i| (0..=i).map(|k| self.lower[i * self.dim + k] * z[k]).sum())
            .collect()
    }
}

/// Correlated shocks of one path: `num_assets × horizon_days`, asset-major.
#[derive(Clone, Debug, PartialEq)]
pub struct ShockMatrix {
    num_assets: usize,
    horizon_days: usize,
    data: Vec<f64>,
}

impl ShockMatrix {
    /// Builds a matrix from one row of shocks per asset.
    #[cfg(test)]
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, SimulationError> {
        let num_assets = rows.len();
        let horizon_days = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(row) = rows.iter().find(|r| r.len() != horizon_days) {
            return Err(SimulationError::DimensionMismatch {
                what: "shock rows",
                expected: horizon_days,
                got: row.len(),
            });
        }
        Ok(Self {
            num_assets,
            horizon_days,
            data: rows.into_iter().flatten().collect(),
        })
    }

    pub fn zeros(num_assets: usize, horizon_days: usize) -> Self {
        Self {
            num_assets,
            horizon_days,
            data: vec![0.0; num_assets * horizon_days],
        }
    }

    pub fn num_assets(&self) -> usize {
        self.num_assets
    }

    pub fn horizon_days(&self) -> usize {
        self.horizon_days
    }

    pub fn get(&self, asset: usize, day: usize) -> f64 {
        self.data[asset * self.horizon_days + day]
    }
}

/// Draws correlated normal shocks consistent with a covariance matrix.
#[derive(Clone, Debug)]
pub struct CorrelatedSampler {
    factor: CholeskyFactor,
}

impl CorrelatedSampler {
    pub fn new(cov: &[Vec<f64>]) -> Result<Self, SimulationError> {
        Ok(Self {
            factor: CholeskyFactor::factorize(cov)?,
        })
    }

    pub fn num_assets(&self) -> usize {
        self.factor.dim()
    }

    /// One path of shocks. Draws day by day, asset by asset, so a seeded `rng`
    /// always yields the same matrix.
    pub fn draw<R: Rng + ?Sized>(&self, horizon_days: usize, rng: &mut R) -> ShockMatrix {
        let n = self.num_assets();
        let mut shocks = ShockMatrix::zeros(n, horizon_days);
        let mut z = vec![0.0; n];

        for day in 0..horizon_days {
            for zk in z.iter_mut() {
                *zk = StandardNormal.sample(rng);
            }
            for (asset, value) in self.factor.transform(&z).into_iter().enumerate() {
                shocks.data[asset * horizon_days + day] = value;
            }
        }
        shocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(f: &CholeskyFactor, row: usize, col: usize) -> f64 {
        f.lower[row * f.dim + col]
    }

    fn reconstruct(f: &CholeskyFactor) -> Vec<Vec<f64>> {
        (0..f.dim)
            .map(|i| {
                (0..f.dim)
                    .map(|j| (0..=i.min(j)).map(|k| at(f, i, k) * at(f, j, k)).sum())
                    .collect()
            })
            .collect()
    }

    fn asset_row(m: &ShockMatrix, asset: usize) -> &[f64] {
        &m.data[asset * m.horizon_days..(asset + 1) * m.horizon_days]
    }

    fn assert_reconstructs(cov: &[Vec<f64>]) {
        let factor = CholeskyFactor::factorize(cov).expect("factorization should succeed");
        let rebuilt = reconstruct(&factor);
        let scale = cov.iter().flatten().fold(0.0_f64, |a, b| a.max(b.abs()));
        for (i, row) in cov.iter().enumerate() {
            for (j, &c) in row.iter().enumerate() {
                assert!(
                    (rebuilt[i][j] - c).abs() <= 1e-8 * scale,
                    "L·Lᵗ[{}][{}] = {} differs from {}",
                    i,
                    j,
                    rebuilt[i][j],
                    c
                );
            }
            for j in (i + 1)..cov.len() {
                assert_eq!(at(&factor, i, j), 0.0, "factor must be lower triangular");
            }
        }
    }

    #[test]
    fn test_cholesky_roundtrip() {
        assert_reconstructs(&[vec![0.0004, 0.0001], vec![0.0001, 0.0002]]);
        assert_reconstructs(&[
            vec![4.0, 12.0, -16.0],
            vec![12.0, 37.0, -43.0],
            vec![-16.0, -43.0, 98.0],
        ]);
        assert_reconstructs(&[vec![2.5e-4]]);
    }

    #[test]
    fn test_cholesky_known_factor() {
        let f = CholeskyFactor::factorize(&[
            vec![4.0, 12.0, -16.0],
            vec![12.0, 37.0, -43.0],
            vec![-16.0, -43.0, 98.0],
        ])
        .unwrap();
        let expected = [[2.0, 0.0, 0.0], [6.0, 1.0, 0.0], [-8.0, 5.0, 3.0]];
        for i in 0..3 {
            for j in 0..3 {
                assert!((at(&f, i, j) - expected[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_negative_eigenvalue_is_rejected() {
        let err = CholeskyFactor::factorize(&[vec![1.0, 2.0], vec![2.0, 1.0]]).unwrap_err();
        match err {
            SimulationError::NonPositiveDefiniteCovariance { asset, pivot } => {
                assert_eq!(asset, 1);
                assert!(pivot < 0.0);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_duplicated_asset_is_rejected() {
        let err = CholeskyFactor::factorize(&[vec![0.0004, 0.0004], vec![0.0004, 0.0004]]).unwrap_err();
        assert!(matches!(err, SimulationError::NonPositiveDefiniteCovariance { asset: 1, .. }));
    }

    #[test]
    fn test_riskless_asset_is_accepted() {
        let f = CholeskyFactor::factorize(&[vec![0.0, 0.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(reconstruct(&f), vec![vec![0.0, 0.0], vec![0.0, 0.0]]);

        let f = CholeskyFactor::factorize(&[vec![0.0004, 0.0], vec![0.0, 0.0]]).unwrap();
        assert_eq!(at(&f, 1, 1), 0.0);

        let err = CholeskyFactor::factorize(&[vec![0.0, 0.1], vec![0.1, 1.0]]).unwrap_err();
        assert!(matches!(err, SimulationError::NonPositiveDefiniteCovariance { asset: 0, .. }));
    }

    #[test]
    fn test_non_finite_covariance_is_rejected() {
        let err = CholeskyFactor::factorize(&[vec![f64::NAN, 0.0], vec![0.0, 1.0]]).unwrap_err();
        assert!(matches!(err, SimulationError::NonPositiveDefiniteCovariance { asset: 0, .. }));
    }

    #[test]
    fn test_draw_shape_and_determinism() {
        let sampler = CorrelatedSampler::new(&[vec![0.0004, 0.0001], vec![0.0001, 0.0002]]).unwrap();
        let a = sampler.draw(7, &mut StdRng::seed_from_u64(42));
        let b = sampler.draw(7, &mut StdRng::seed_from_u64(42));
        let c = sampler.draw(7, &mut StdRng::seed_from_u64(43));

        assert_eq!(a.num_assets(), 2);
        assert_eq!(a.horizon_days(), 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shocks_follow_covariance() {
        let cov = vec![vec![0.0004, 0.0001], vec![0.0001, 0.0002]];
        let sampler = CorrelatedSampler::new(&cov).unwrap();
        let shocks = sampler.draw(200_000, &mut StdRng::seed_from_u64(9));

        let n = shocks.horizon_days() as f64;
        let (x, y) = (asset_row(&shocks, 0), asset_row(&shocks, 1));
        let mx = x.iter().sum::<f64>() / n;
        let my = y.iter().sum::<f64>() / n;
        let vx = x.iter().map(|v| (v - mx).powi(2)).sum::<f64>() / (n - 1.0);
        let cxy = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum::<f64>() / (n - 1.0);

        assert!((vx - 0.0004).abs() < 0.0004 * 0.03, "variance {} too far from 4e-4", vx);
        assert!((cxy - 0.0001).abs() < 0.0001 * 0.1, "covariance {} too far from 1e-4", cxy);
    }

    #[test]
    fn test_zero_covariance_gives_zero_shocks() {
        let sampler = CorrelatedSampler::new(&[vec![0.0]]).unwrap();
        let shocks = sampler.draw(5, &mut StdRng::seed_from_u64(1));
        assert!(asset_row(&shocks, 0).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_from_rows_checks_shape() {
        assert!(ShockMatrix::from_rows(vec![vec![0.1, 0.2], vec![0.3]]).is_err());
        let m = ShockMatrix::from_rows(vec![vec![0.1, 0.2], vec![0.3, 0.4]]).unwrap();
        assert_eq!(m.get(1, 0), 0.3);
    }
}
