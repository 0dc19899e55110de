//! Sequence-space Jacobians with the fake-news algorithm.
//!
//! For a shock to input `i` and an outcome `o`, the T x T Jacobian is built
//! from O(T) passes instead of T full simulations:
//!
//! 1. A backward pass from a shock `s` periods ahead gives the direct effect on
//!    `o` today (`curlyY`) and on tomorrow's distribution (`curlyD`).
//! 2. A forward pass with the transposed law of motion gives prediction vectors
//!    `curlyP[k]`: the effect on `o`, k periods later, of a unit of mass today.
//! 3. The fake-news matrix `F` stacks `curlyY` on top of `curlyP * curlyD'`.
//! 4. `J[t, s] = F[t, s] + J[t-1, s-1]` accumulates the diagonals.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::array::StateArray;
use crate::backward::{next_period, BackwardFunction, BackwardFunctionSpec};
use crate::error::{HetBlockError, Result};
use crate::steady_state::Aggregate;
use crate::transition::{TransitionOperator, WeightShock};
use crate::variables::{Value, Variables};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferenceScheme {
    /// `(f(x + h dx) - f(x)) / h`, against the precomputed baseline.
    Forward,
    /// `(f(x + h dx) - f(x - h dx)) / 2h`.
    Central,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JacobianSettings {
    pub h: f64,
    pub scheme: DifferenceScheme,
}

impl Default for JacobianSettings {
    fn default() -> Self {
        Self {
            h: 1e-4,
            scheme: DifferenceScheme::Forward,
        }
    }
}

impl JacobianSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.h > 0.0) || !self.h.is_finite() {
            return Err(HetBlockError::InvalidSettings(format!(
                "differentiation step h must be positive and finite, got {}",
                self.h
            )));
        }
        Ok(())
    }
}

/// Shock descriptor: argument name -> direction of the unit perturbation.
pub type Shock = Variables;

/// Nested `output -> input -> T x T` Jacobians.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobians {
    horizon: usize,
    entries: BTreeMap<Aggregate, BTreeMap<String, DMatrix<f64>>>,
}

impl Jacobians {
    pub(crate) fn new(
        horizon: usize,
        entries: BTreeMap<Aggregate, BTreeMap<String, DMatrix<f64>>>,
    ) -> Self {
        Self { horizon, entries }
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn get(&self, output: &str, input: &str) -> Option<&DMatrix<f64>> {
        self.entries.get(&Aggregate::of(output))?.get(input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &Aggregate> {
        self.entries.keys()
    }

    pub fn inputs(&self, output: &str) -> impl Iterator<Item = &str> {
        self.entries
            .get(&Aggregate::of(output))
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    /// Linear response `dY_o = sum_i J[o][i] dX_i` to input paths of length T.
    pub fn apply(&self, paths: &BTreeMap<String, Vec<f64>>) -> Result<BTreeMap<Aggregate, Vec<f64>>> {
        for (input, path) in paths {
            if path.len() != self.horizon {
                return Err(HetBlockError::Shape(format!(
                    "path for '{input}' has length {}, horizon is {}",
                    path.len(),
                    self.horizon
                )));
            }
        }
        let mut responses = BTreeMap::new();
        for (output, by_input) in &self.entries {
            let mut total = nalgebra::DVector::zeros(self.horizon);
            for (input, path) in paths {
                let jac = by_input.get(input).ok_or_else(|| {
                    HetBlockError::Configuration(format!(
                        "no Jacobian of {output} with respect to '{input}'"
                    ))
                })?;
                total += jac * nalgebra::DVector::from_column_slice(path);
            }
            responses.insert(output.clone(), total.iter().copied().collect());
        }
        Ok(responses)
    }
}

/// Steady-state data shared by every backward and forward pass.
pub(crate) struct FakeNews<'a> {
    pub spec: &'a BackwardFunctionSpec,
    pub function: &'a dyn BackwardFunction,
    /// Steady-state arguments of the backward function.
    pub args: Variables,
    /// The backward function evaluated at `args`.
    pub baseline: Variables,
    pub distribution: &'a StateArray,
    pub operator: TransitionOperator,
    /// Bracket widths of each policy's steady-state lottery.
    pub spacing: Vec<StateArray>,
    pub settings: JacobianSettings,
}

/// One period's linearized response of the backward function.
struct BackwardStep {
    /// Next iteration's perturbation, keyed by `_p` argument names.
    curly_v: Variables,
    curly_d: StateArray,
    curly_y: BTreeMap<String, f64>,
}

impl<'a> FakeNews<'a> {
    /// Derivative of every output in direction `din`.
    fn numerical_diff(&self, din: &Variables) -> Result<Variables> {
        let h = self.settings.h;
        let perturbed = |sign: f64| -> Result<Variables> {
            let mut args = self.args.clone();
            for (name, direction) in din.iter() {
                let base = self.args.require(name)?;
                args.insert(name, base.scaled_add(sign * h, direction)?);
            }
            self.spec.call(self.function, &args)
        };
        let (upper, lower, width) = match self.settings.scheme {
            DifferenceScheme::Forward => (perturbed(1.0)?, None, h),
            DifferenceScheme::Central => (perturbed(1.0)?, Some(perturbed(-1.0)?), 2.0 * h),
        };
        let lower = lower.as_ref().unwrap_or(&self.baseline);
        upper
            .iter()
            .map(|(name, value)| -> Result<(String, Value)> {
                let diff = value.scaled_add(-1.0, lower.require(name)?)?;
                Ok((name.to_string(), diff.scale(1.0 / width)))
            })
            .collect()
    }

    fn backward_step(&self, din: &Variables, outputs: &[String]) -> Result<BackwardStep> {
        let d_out = self.numerical_diff(din)?;

        let mut curly_v = Variables::new();
        for back in self.spec.backward() {
            curly_v.insert(next_period(back), d_out.require(back)?.clone());
        }

        let mut weight_shocks = self
            .spec
            .policy()
            .names()
            .into_iter()
            .zip(&self.spacing)
            .map(|(p, spacing)| {
                let dpol = per_state(&d_out, p, self.distribution)?;
                dpol.zip_map(spacing, |dp, space| -dp / space)
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter();
        let shock = match (weight_shocks.next(), weight_shocks.next()) {
            (Some(first), None) => WeightShock::One(first),
            (Some(first), Some(second)) => WeightShock::Two(first, second),
            _ => {
                return Err(HetBlockError::Configuration(format!(
                    "no policy lottery for {}",
                    self.spec.name()
                )))
            }
        };
        let curly_d = self.operator.forward_shock(self.distribution, &shock)?;

        let mut curly_y = BTreeMap::new();
        for o in outputs {
            let dy = per_state(&d_out, o, self.distribution)?;
            curly_y.insert(o.clone(), self.distribution.dot(dy)?);
        }

        Ok(BackwardStep {
            curly_v,
            curly_d,
            curly_y,
        })
    }

    /// `curlyY` paths per output and `curlyD[0..T]` for a single shock.
    fn backward_iteration(
        &self,
        shock: &Shock,
        outputs: &[String],
        horizon: usize,
    ) -> Result<(BTreeMap<String, Vec<f64>>, Vec<StateArray>)> {
        let mut curly_ys: BTreeMap<String, Vec<f64>> = outputs
            .iter()
            .map(|o| (o.clone(), Vec::with_capacity(horizon)))
            .collect();
        let mut curly_ds = Vec::with_capacity(horizon);

        let mut step = self.backward_step(shock, outputs)?;
        for t in 0..horizon {
            if t > 0 {
                step = self.backward_step(&step.curly_v, outputs)?;
            }
            for (o, y) in &step.curly_y {
                if let Some(path) = curly_ys.get_mut(o) {
                    path.push(*y);
                }
            }
            curly_ds.push(step.curly_d.clone());
        }
        Ok((curly_ys, curly_ds))
    }

    /// Prediction vectors `curlyP[0..T]` for one outcome.
    fn forward_iteration(&self, o_ss: &StateArray, horizon: usize) -> Result<Vec<StateArray>> {
        let mut curly_ps = Vec::with_capacity(horizon);
        curly_ps.push(o_ss.clone());
        for t in 1..horizon {
            let next = self.operator.forward_transpose(&curly_ps[t - 1])?;
            curly_ps.push(next);
        }
        Ok(curly_ps)
    }

    pub fn jacobians(
        &self,
        horizon: usize,
        shocks: &BTreeMap<String, Shock>,
        outputs: &[String],
    ) -> Result<Jacobians> {
        let backward: Vec<(&String, BTreeMap<String, Vec<f64>>, Vec<StateArray>)> = shocks
            .par_iter()
            .map(|(input, shock)| -> Result<(&String, BTreeMap<String, Vec<f64>>, Vec<StateArray>)> {
                trace!(block = self.spec.name(), input = %input, "fake news backward pass");
                let (ys, ds) = self.backward_iteration(shock, outputs, horizon)?;
                Ok((input, ys, ds))
            })
            .collect::<Result<_>>()?;

        let forward: Vec<(&String, Vec<StateArray>)> = outputs
            .par_iter()
            .map(|o| -> Result<(&String, Vec<StateArray>)> {
                trace!(block = self.spec.name(), output = %o, "fake news forward pass");
                let o_ss = per_state(&self.baseline, o, self.distribution)?;
                Ok((o, self.forward_iteration(o_ss, horizon)?))
            })
            .collect::<Result<_>>()?;

        let mut entries = BTreeMap::new();
        for (o, curly_ps) in &forward {
            let mut by_input = BTreeMap::new();
            for (input, curly_ys, curly_ds) in &backward {
                let f = build_fake_news(&curly_ys[o.as_str()], curly_ds, curly_ps);
                by_input.insert((*input).clone(), jacobian_from_fake_news(&f));
            }
            entries.insert(Aggregate::of(o), by_input);
        }
        Ok(Jacobians::new(horizon, entries))
    }
}

/// Output `name` as an array on the distribution's grid.
fn per_state<'v>(vars: &'v Variables, name: &str, grid_of: &StateArray) -> Result<&'v StateArray> {
    let array = vars.array(name)?;
    array.ensure_same_shape(grid_of, name)?;
    Ok(array)
}

/// Fake-news matrix: row 0 is `curlyY`, row t >= 1 is `curlyP[t-1] . curlyD[s]`.
pub fn build_fake_news(
    curly_y: &[f64],
    curly_ds: &[StateArray],
    curly_ps: &[StateArray],
) -> DMatrix<f64> {
    let horizon = curly_ds.len();
    let mut f = DMatrix::zeros(horizon, horizon);
    for (s, &y) in curly_y.iter().enumerate() {
        f[(0, s)] = y;
    }
    if horizon > 1 {
        let n = curly_ds[0].len();
        let p = DMatrix::from_fn(horizon - 1, n, |t, k| curly_ps[t][k]);
        let d = DMatrix::from_fn(n, horizon, |k, s| curly_ds[s][k]);
        f.rows_mut(1, horizon - 1).copy_from(&(p * d));
    }
    f
}

/// Accumulates the fake-news matrix along its diagonals.
pub fn jacobian_from_fake_news(f: &DMatrix<f64>) -> DMatrix<f64> {
    let mut j = f.clone();
    for s in 1..j.ncols() {
        for t in 1..j.nrows() {
            j[(t, s)] += j[(t - 1, s - 1)];
        }
    }
    j
}

/// Checks shocks and outputs against the declared interface.
pub(crate) fn validate_request(
    spec: &BackwardFunctionSpec,
    horizon: usize,
    shocks: &BTreeMap<String, Shock>,
    outputs: &[String],
) -> Result<()> {
    if horizon == 0 {
        return Err(HetBlockError::InvalidSettings(
            "Jacobian horizon T must be at least 1".into(),
        ));
    }
    for (input, shock) in shocks {
        for name in shock.names() {
            if !spec.arguments().iter().any(|a| a == name) {
                return Err(HetBlockError::Configuration(format!(
                    "shock '{input}' perturbs '{name}', which is not an argument of {}",
                    spec.name()
                )));
            }
        }
    }
    for o in outputs {
        if !spec.outputs().contains(o) {
            return Err(HetBlockError::Configuration(format!(
                "'{o}' is not an output of {}",
                spec.name()
            )));
        }
    }
    Ok(())
}
