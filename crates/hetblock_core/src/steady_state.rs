//! Backward (policy) and forward (distribution) steady-state iterations.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::array::StateArray;
use crate::backward::{next_period, BackwardFunction, BackwardFunctionSpec};
use crate::error::{HetBlockError, Result};
use crate::lottery::{Grid, PolicyLottery};
use crate::markov::{stationary, StationarySettings};
use crate::transition::{EndoLottery, TransitionOperator};
use crate::variables::{Value, Variables};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SteadyStateSettings {
    pub backward_tol: f64,
    pub backward_max_iterations: usize,
    pub forward_tol: f64,
    pub forward_max_iterations: usize,
    /// Convergence is only checked every `check_interval` iterations.
    pub check_interval: usize,
    /// Power iteration for the exogenous stationary distributions of the initial guess.
    pub stationary: StationarySettings,
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        Self {
            backward_tol: 1e-8,
            backward_max_iterations: 5000,
            forward_tol: 1e-10,
            forward_max_iterations: 5000,
            check_interval: 10,
            stationary: StationarySettings::default(),
        }
    }
}

impl SteadyStateSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(HetBlockError::InvalidSettings(msg.to_string()));
        if self.backward_max_iterations == 0 || self.forward_max_iterations == 0 {
            return invalid("max iterations must be greater than zero.");
        }
        if !(self.backward_tol > 0.0) || !(self.forward_tol > 0.0) {
            return invalid("tolerances must be positive.");
        }
        if self.check_interval == 0 {
            return invalid("check_interval must be at least 1.");
        }
        self.stationary.validate()
    }
}

/// Population-weighted aggregate of a per-state output.
///
/// Kept apart from per-state names; its label is the upper-cased output name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Aggregate(String);

impl Aggregate {
    pub fn of(output: &str) -> Self {
        Aggregate(output.to_string())
    }

    pub fn output(&self) -> &str {
        &self.0
    }

    pub fn label(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone)]
pub struct PolicySolution {
    pub outputs: Variables,
    pub iterations: usize,
    pub residual: f64,
}

#[derive(Debug, Clone)]
pub struct DistributionSolution {
    pub distribution: StateArray,
    pub iterations: usize,
    pub residual: f64,
}

/// Iterates the backward function to a fixed point of its policies.
pub fn policy_ss(
    spec: &BackwardFunctionSpec,
    function: &dyn BackwardFunction,
    inputs: &Variables,
    settings: &SteadyStateSettings,
) -> Result<PolicySolution> {
    settings.validate()?;
    let mut args = spec.argument_record(&[inputs])?;
    let policies = spec.policy().names();
    let mut previous: Vec<StateArray> = Vec::new();
    let mut residual = f64::INFINITY;

    for it in 0..settings.backward_max_iterations {
        let outputs = spec.call(function, &args)?;
        let current = policies
            .iter()
            .map(|p| outputs.array(p).cloned())
            .collect::<Result<Vec<_>>>()?;

        if it >= 1 && (it - 1) % settings.check_interval == 0 {
            residual = max_abs_diff_all(&current, &previous)?;
            if residual < settings.backward_tol {
                debug!(
                    block = spec.name(),
                    iterations = it + 1,
                    residual,
                    "policy steady state converged"
                );
                return Ok(PolicySolution {
                    outputs,
                    iterations: it + 1,
                    residual,
                });
            }
        }

        previous = current;
        for back in spec.backward() {
            args.insert(next_period(back), outputs.require(back)?.clone());
        }
    }

    Err(HetBlockError::Convergence {
        solver: "policy functions (backward iteration)",
        max_iterations: settings.backward_max_iterations,
        residual,
    })
}

fn max_abs_diff_all(current: &[StateArray], previous: &[StateArray]) -> Result<f64> {
    current
        .iter()
        .zip(previous)
        .try_fold(0.0, |acc, (c, p)| -> Result<f64> { Ok(f64::max(acc, c.max_abs_diff(p)?)) })
}

/// Initial distribution: product of the exogenous stationary distributions,
/// uniform over the policy grid(s).
pub fn initial_distribution(
    markov: &[&DMatrix<f64>],
    seeds: &[Option<&[f64]>],
    policy_sizes: &[usize],
    settings: StationarySettings,
) -> Result<StateArray> {
    let mut exog = vec![1.0];
    let mut shape = Vec::new();
    for (pi, seed) in markov.iter().zip(seeds) {
        let dist = stationary(pi, *seed, settings)?;
        exog = exog
            .iter()
            .flat_map(|&a| dist.iter().map(move |&b| a * b))
            .collect();
        shape.push(pi.nrows());
    }
    let endo: usize = policy_sizes.iter().product();
    shape.extend_from_slice(policy_sizes);
    let data = exog
        .iter()
        .flat_map(|&p| std::iter::repeat(p / endo as f64).take(endo))
        .collect();
    StateArray::new(shape, data)
}

/// Builds the lotteries of every policy on its grid.
pub fn policy_lotteries(grids: &[&Grid], policies: &[&StateArray]) -> Result<EndoLottery> {
    let lotteries = grids
        .iter()
        .zip(policies)
        .map(|(grid, policy)| PolicyLottery::new(grid, policy))
        .collect::<Result<Vec<_>>>()?;
    EndoLottery::from_vec(lotteries)
}

/// Iterates the law of motion to its stationary distribution.
pub fn dist_ss(
    operator: &TransitionOperator,
    seed: StateArray,
    settings: &SteadyStateSettings,
) -> Result<DistributionSolution> {
    settings.validate()?;
    if seed.shape() != operator.shape() {
        return Err(HetBlockError::Shape(format!(
            "distribution seed has shape {:?}, grid is {:?}",
            seed.shape(),
            operator.shape()
        )));
    }
    let mut d = seed;
    let mut residual = f64::INFINITY;
    for it in 0..settings.forward_max_iterations {
        let next = operator.forward_step(&d)?;
        if it % settings.check_interval == 0 {
            residual = next.max_abs_diff(&d)?;
            if residual < settings.forward_tol {
                debug!(iterations = it + 1, residual, "distribution steady state converged");
                return Ok(DistributionSolution {
                    distribution: next,
                    iterations: it + 1,
                    residual,
                });
            }
        }
        d = next;
    }
    Err(HetBlockError::Convergence {
        solver: "distribution (forward iteration)",
        max_iterations: settings.forward_max_iterations,
        residual,
    })
}

/// Converged steady state of a block.
#[derive(Debug, Clone)]
pub struct SteadyState {
    pub(crate) inputs: Variables,
    pub(crate) outputs: Variables,
    pub(crate) distribution: StateArray,
    pub(crate) aggregates: BTreeMap<Aggregate, f64>,
    pub(crate) backward_iterations: usize,
    pub(crate) forward_iterations: usize,
}

impl SteadyState {
    /// Looks a name up among the outputs first, then the inputs.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name).or_else(|| self.inputs.get(name))
    }

    pub fn inputs(&self) -> &Variables {
        &self.inputs
    }

    pub fn outputs(&self) -> &Variables {
        &self.outputs
    }

    pub fn distribution(&self) -> &StateArray {
        &self.distribution
    }

    pub fn aggregate(&self, output: &str) -> Option<f64> {
        self.aggregates.get(&Aggregate::of(output)).copied()
    }

    pub fn aggregates(&self) -> impl Iterator<Item = (&Aggregate, f64)> {
        self.aggregates.iter().map(|(k, &v)| (k, v))
    }

    pub fn backward_iterations(&self) -> usize {
        self.backward_iterations
    }

    pub fn forward_iterations(&self) -> usize {
        self.forward_iterations
    }

    /// Flat output map: per-state outputs, `D`, and one upper-cased scalar per aggregate.
    pub fn to_variables(&self) -> Variables {
        let mut vars = self.outputs.clone();
        vars.insert("D", self.distribution.clone());
        for (agg, &value) in &self.aggregates {
            vars.insert(agg.label(), value);
        }
        vars
    }
}
