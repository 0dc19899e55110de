use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HetBlockError, Result};

/// Tolerance on row sums when checking that a matrix is stochastic.
const ROW_SUM_TOLERANCE: f64 = 1e-8;

/// Settings for the power iteration behind [`stationary`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StationarySettings {
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for StationarySettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-11,
            max_iterations: 10_000,
        }
    }
}

impl StationarySettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(HetBlockError::InvalidSettings(
                "stationary max_iterations must be greater than zero.".into(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(HetBlockError::InvalidSettings(
                "stationary tolerance must be positive.".into(),
            ));
        }
        Ok(())
    }
}

/// Checks that `pi` is square, non-negative and row-stochastic.
pub fn validate_markov(name: &str, pi: &DMatrix<f64>) -> Result<()> {
    if pi.nrows() != pi.ncols() || pi.nrows() == 0 {
        return Err(HetBlockError::Shape(format!(
            "Markov matrix '{name}' must be square and non-empty, got {}x{}",
            pi.nrows(),
            pi.ncols()
        )));
    }
    if pi.iter().any(|&p| !p.is_finite() || p < 0.0) {
        return Err(HetBlockError::NumericalDegeneracy(format!(
            "Markov matrix '{name}' has negative or non-finite entries"
        )));
    }
    for (row_idx, row) in pi.row_iter().enumerate() {
        let total: f64 = row.iter().sum();
        if (total - 1.0).abs() > ROW_SUM_TOLERANCE {
            return Err(HetBlockError::NumericalDegeneracy(format!(
                "row {row_idx} of Markov matrix '{name}' sums to {total}"
            )));
        }
    }
    Ok(())
}

/// Stationary distribution of a row-stochastic matrix by power iteration.
///
/// Starts from `seed` when given, otherwise from the uniform distribution.
pub fn stationary(
    pi: &DMatrix<f64>,
    seed: Option<&[f64]>,
    settings: StationarySettings,
) -> Result<Vec<f64>> {
    settings.validate()?;
    let n = pi.nrows();
    let mut dist = match seed {
        Some(seed) => {
            if seed.len() != n {
                return Err(HetBlockError::Shape(format!(
                    "stationary seed has length {}, expected {n}",
                    seed.len()
                )));
            }
            DVector::from_column_slice(seed)
        }
        None => DVector::from_element(n, 1.0 / n as f64),
    };
    let pi_t = pi.transpose();

    let mut residual = f64::INFINITY;
    for it in 0..settings.max_iterations {
        let next = &pi_t * &dist;
        residual = (&next - &dist).amax();
        dist = next;
        if residual < settings.tolerance {
            debug!(iterations = it + 1, residual, "stationary distribution converged");
            return Ok(dist.iter().copied().collect());
        }
    }
    Err(HetBlockError::Convergence {
        solver: "stationary distribution",
        max_iterations: settings.max_iterations,
        residual,
    })
}
