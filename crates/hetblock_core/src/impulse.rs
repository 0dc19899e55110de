//! Nonlinear transition paths and the brute-force sequence-space Jacobian.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::trace;

use crate::array::StateArray;
use crate::backward::{next_period, BackwardFunction, BackwardFunctionSpec};
use crate::error::{HetBlockError, Result};
use crate::jacobian::{DifferenceScheme, JacobianSettings, Jacobians, Shock};
use crate::lottery::Grid;
use crate::steady_state::{policy_lotteries, Aggregate};
use crate::transition::TransitionOperator;
use crate::variables::{Value, Variables};

/// Per-period deviations of backward-function arguments, indexed `0..T`.
pub type ShockPaths = BTreeMap<String, Vec<Value>>;

/// Steady-state snapshot a transition path starts from and returns to.
pub(crate) struct PathContext<'a> {
    pub spec: &'a BackwardFunctionSpec,
    pub function: &'a dyn BackwardFunction,
    pub args: Variables,
    pub distribution: &'a StateArray,
    pub markov: Vec<DMatrix<f64>>,
    pub grids: Vec<Grid>,
}

impl<'a> PathContext<'a> {
    fn check_paths(&self, shocks: &ShockPaths, horizon: usize) -> Result<()> {
        for (name, path) in shocks {
            if !self.spec.arguments().contains(name) {
                return Err(HetBlockError::Configuration(format!(
                    "shocked input '{name}' is not an argument of {}",
                    self.spec.name()
                )));
            }
            if path.len() != horizon {
                return Err(HetBlockError::Shape(format!(
                    "path for '{name}' has length {}, horizon is {horizon}",
                    path.len()
                )));
            }
        }
        Ok(())
    }

    /// Aggregate levels of `outputs` along the path implied by `shocks`.
    ///
    /// Agents expect the steady state from period T on.
    fn aggregate_paths(
        &self,
        shocks: &ShockPaths,
        outputs: &[String],
        horizon: usize,
    ) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut periods: Vec<Variables> = Vec::with_capacity(horizon);
        for t in (0..horizon).rev() {
            let mut args = self.args.clone();
            for (name, path) in shocks {
                let shocked = self.args.require(name)?.scaled_add(1.0, &path[t])?;
                args.insert(name.clone(), shocked);
            }
            if let Some(later) = periods.last() {
                for back in self.spec.backward() {
                    args.insert(next_period(back), later.require(back)?.clone());
                }
            }
            periods.push(self.spec.call(self.function, &args)?);
        }
        periods.reverse();

        let grids: Vec<&Grid> = self.grids.iter().collect();
        let mut paths: BTreeMap<String, Vec<f64>> = outputs
            .iter()
            .map(|o| (o.clone(), Vec::with_capacity(horizon)))
            .collect();
        let mut d = self.distribution.clone();
        for (t, out) in periods.iter().enumerate() {
            for (o, path) in paths.iter_mut() {
                path.push(d.dot(out.array(o)?)?);
            }
            if t + 1 < horizon {
                let policies = self
                    .spec
                    .policy()
                    .names()
                    .into_iter()
                    .map(|p| out.array(p))
                    .collect::<Result<Vec<_>>>()?;
                let lottery = policy_lotteries(&grids, &policies)?;
                let operator = TransitionOperator::new(self.markov.clone(), lottery)?;
                d = operator.forward_step(&d)?;
            }
        }
        Ok(paths)
    }

    /// Deviations of aggregate outputs from the unshocked path.
    pub fn impulse_nonlinear(
        &self,
        shocks: &ShockPaths,
        outputs: &[String],
        horizon: usize,
    ) -> Result<BTreeMap<Aggregate, Vec<f64>>> {
        self.check_paths(shocks, horizon)?;
        let shocked = self.aggregate_paths(shocks, outputs, horizon)?;
        let unshocked = self.aggregate_paths(&ShockPaths::new(), outputs, horizon)?;
        Ok(shocked
            .into_iter()
            .map(|(o, path)| {
                let deviation = path
                    .iter()
                    .zip(&unshocked[&o])
                    .map(|(y, y0)| y - y0)
                    .collect();
                (Aggregate::of(&o), deviation)
            })
            .collect())
    }

    /// One nonlinear path per (input, horizon) pair, differenced against the baseline.
    pub fn direct_jacobian(
        &self,
        horizon: usize,
        shocks: &BTreeMap<String, Shock>,
        outputs: &[String],
        settings: &JacobianSettings,
    ) -> Result<Jacobians> {
        let h = settings.h;
        let baseline = match settings.scheme {
            DifferenceScheme::Forward => {
                Some(self.aggregate_paths(&ShockPaths::new(), outputs, horizon)?)
            }
            DifferenceScheme::Central => None,
        };

        let mut by_input: BTreeMap<String, Vec<DMatrix<f64>>> = BTreeMap::new();
        for (input, shock) in shocks {
            let columns: Vec<Vec<Vec<f64>>> = (0..horizon)
                .into_par_iter()
                .map(|s| -> Result<Vec<Vec<f64>>> {
                    trace!(block = self.spec.name(), input = %input, horizon = s, "direct Jacobian column");
                    let up_paths = unit_paths(shock, s, h, horizon);
                    self.check_paths(&up_paths, horizon)?;
                    let up = self.aggregate_paths(&up_paths, outputs, horizon)?;
                    let (down, width) = match &baseline {
                        Some(base) => (base.clone(), h),
                        None => {
                            let down_paths = unit_paths(shock, s, -h, horizon);
                            (self.aggregate_paths(&down_paths, outputs, horizon)?, 2.0 * h)
                        }
                    };
                    Ok(outputs
                        .iter()
                        .map(|o| {
                            up[o]
                                .iter()
                                .zip(&down[o])
                                .map(|(a, b)| (a - b) / width)
                                .collect()
                        })
                        .collect())
                })
                .collect::<Result<_>>()?;
            let matrices = (0..outputs.len())
                .map(|k| DMatrix::from_fn(horizon, horizon, |t, s| columns[s][k][t]))
                .collect();
            by_input.insert(input.clone(), matrices);
        }

        let mut entries = BTreeMap::new();
        for (k, o) in outputs.iter().enumerate() {
            let per_input = by_input
                .iter()
                .map(|(input, matrices)| (input.clone(), matrices[k].clone()))
                .collect();
            entries.insert(Aggregate::of(o), per_input);
        }
        Ok(Jacobians::new(horizon, entries))
    }
}

/// Shock `direction` scaled by `scale` at period `s`, zero elsewhere.
fn unit_paths(direction: &Shock, s: usize, scale: f64, horizon: usize) -> ShockPaths {
    direction
        .iter()
        .map(|(name, dir)| {
            let path = (0..horizon)
                .map(|t| if t == s { dir.scale(scale) } else { dir.zeros_like() })
                .collect();
            (name.to_string(), path)
        })
        .collect()
}
