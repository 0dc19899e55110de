use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use nalgebra::DMatrix;
use tracing::debug;

use crate::array::StateArray;
use crate::backward::{rename, BackwardFunction, BackwardFunctionSpec, RenamedFunction};
use crate::error::{HetBlockError, Result};
use crate::impulse::{PathContext, ShockPaths};
use crate::jacobian::{validate_request, FakeNews, JacobianSettings, Jacobians, Shock};
use crate::lottery::Grid;
use crate::markov::validate_markov;
use crate::steady_state::{
    dist_ss, initial_distribution, policy_lotteries, policy_ss, Aggregate, DistributionSolution,
    PolicySolution, SteadyState, SteadyStateSettings,
};
use crate::transition::{EndoLottery, TransitionOperator};
use crate::variables::{Value, Variables};

/// Input key of a policy's grid.
pub fn grid_key(policy: &str) -> String {
    format!("{policy}_grid")
}

/// Input key of an exogenous variable's stationary-distribution seed.
pub fn seed_key(exogenous: &str) -> String {
    format!("{exogenous}_seed")
}

/// Key of the distribution, in inputs (as a seed) and in steady-state output maps.
pub const DISTRIBUTION_KEY: &str = "D";

/// A heterogeneous-agent block: a backward function plus its validated interface.
#[derive(Clone)]
pub struct HetBlock {
    function: Arc<dyn BackwardFunction>,
    spec: BackwardFunctionSpec,
}

impl std::fmt::Debug for HetBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HetBlock").field("spec", &self.spec).finish()
    }
}

impl HetBlock {
    pub fn new(
        function: impl BackwardFunction + 'static,
        exogenous: &[&str],
        policy: &[&str],
        backward: &[&str],
    ) -> Result<Self> {
        Self::from_arc(Arc::new(function), exogenous, policy, backward)
    }

    pub fn from_arc(
        function: Arc<dyn BackwardFunction>,
        exogenous: &[&str],
        policy: &[&str],
        backward: &[&str],
    ) -> Result<Self> {
        let spec = BackwardFunctionSpec::new(function.as_ref(), exogenous, policy, backward)?;
        Ok(Self { function, spec })
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn spec(&self) -> &BackwardFunctionSpec {
        &self.spec
    }

    pub fn function(&self) -> &dyn BackwardFunction {
        self.function.as_ref()
    }

    /// Backward iteration to the policy fixed point.
    pub fn policy_ss(
        &self,
        inputs: &Variables,
        settings: &SteadyStateSettings,
    ) -> Result<PolicySolution> {
        policy_ss(&self.spec, self.function.as_ref(), inputs, settings)
    }

    /// Forward iteration to the stationary distribution for given policies.
    ///
    /// `inputs` supplies Markov matrices, grids and the optional seeds.
    pub fn dist_ss(
        &self,
        policies: &Variables,
        inputs: &Variables,
        settings: &SteadyStateSettings,
    ) -> Result<DistributionSolution> {
        let layers = [policies, inputs];
        let operator = self.transition_operator(&layers)?;
        let seed = match inputs.get(DISTRIBUTION_KEY) {
            Some(d) => expect_array(d, DISTRIBUTION_KEY)?.clone(),
            None => {
                let markov = self.markov_matrices(&layers)?;
                let markov: Vec<&DMatrix<f64>> = markov.iter().collect();
                let seeds = self
                    .spec
                    .exogenous()
                    .iter()
                    .map(|exo| match inputs.get(&seed_key(exo)) {
                        Some(v) => expect_array(v, &seed_key(exo)).map(|a| Some(a.as_slice())),
                        None => Ok(None),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let sizes: Vec<usize> = self.grids(&layers)?.iter().map(Grid::len).collect();
                initial_distribution(&markov, &seeds, &sizes, settings.stationary)?
            }
        };
        dist_ss(&operator, seed, settings)
    }

    /// Policy fixed point, stationary distribution and aggregates.
    pub fn steady_state(
        &self,
        inputs: &Variables,
        settings: &SteadyStateSettings,
    ) -> Result<SteadyState> {
        let policy = self.policy_ss(inputs, settings)?;
        let dist = self.dist_ss(&policy.outputs, inputs, settings)?;

        let mut aggregates = BTreeMap::new();
        for o in self.spec.non_backward_outputs() {
            if let Value::Array(array) = policy.outputs.require(o)? {
                aggregates.insert(Aggregate::of(o), dist.distribution.dot(array)?);
            }
        }
        debug!(
            block = self.name(),
            backward_iterations = policy.iterations,
            forward_iterations = dist.iterations,
            "steady state solved"
        );
        Ok(SteadyState {
            inputs: inputs.clone(),
            outputs: policy.outputs,
            distribution: dist.distribution,
            aggregates,
            backward_iterations: policy.iterations,
            forward_iterations: dist.iterations,
        })
    }

    /// Validated Markov matrices, in the order of the exogenous axes.
    pub fn markov_matrices(&self, layers: &[&Variables]) -> Result<Vec<DMatrix<f64>>> {
        self.spec
            .exogenous()
            .iter()
            .map(|exo| -> Result<DMatrix<f64>> {
                let pi = lookup(layers, exo, self.name())?
                    .as_matrix()
                    .ok_or_else(|| {
                        HetBlockError::Shape(format!("'{exo}': expected a Markov matrix"))
                    })?;
                validate_markov(exo, pi)?;
                Ok(pi.clone())
            })
            .collect()
    }

    /// Policy grids read from `<policy>_grid`.
    pub fn grids(&self, layers: &[&Variables]) -> Result<Vec<Grid>> {
        self.spec
            .policy()
            .names()
            .into_iter()
            .map(|p| {
                let key = grid_key(p);
                Grid::from_array(expect_array(lookup(layers, &key, self.name())?, &key)?)
            })
            .collect()
    }

    /// Law of motion implied by the policies, grids and Markov matrices in `layers`.
    pub fn transition_operator(&self, layers: &[&Variables]) -> Result<TransitionOperator> {
        let markov = self.markov_matrices(layers)?;
        let grids = self.grids(layers)?;
        let mut shape: Vec<usize> = markov.iter().map(|m| m.nrows()).collect();
        shape.extend(grids.iter().map(Grid::len));

        let policies = self
            .spec
            .policy()
            .names()
            .into_iter()
            .map(|p| {
                let array = expect_array(lookup(layers, p, self.name())?, p)?;
                if array.shape() != shape.as_slice() {
                    return Err(HetBlockError::Shape(format!(
                        "policy '{p}' has shape {:?}, state grid is {shape:?}",
                        array.shape()
                    )));
                }
                Ok(array)
            })
            .collect::<Result<Vec<_>>>()?;
        let grid_refs: Vec<&Grid> = grids.iter().collect();
        TransitionOperator::new(markov, policy_lotteries(&grid_refs, &policies)?)
    }

    /// Law of motion at a solved steady state.
    pub fn steady_state_operator(&self, ss: &SteadyState) -> Result<TransitionOperator> {
        self.transition_operator(&[ss.outputs(), ss.inputs()])
    }

    /// Sequence-space Jacobians of the aggregates of `outputs` by the fake-news algorithm.
    pub fn jacobian(
        &self,
        ss: &SteadyState,
        horizon: usize,
        shocks: &BTreeMap<String, Shock>,
        outputs: &[&str],
        settings: &JacobianSettings,
    ) -> Result<Jacobians> {
        settings.validate()?;
        let outputs: Vec<String> = outputs.iter().map(|o| o.to_string()).collect();
        validate_request(&self.spec, horizon, shocks, &outputs)?;

        let layers = [ss.outputs(), ss.inputs()];
        let args = self.spec.argument_record(&layers)?;
        let baseline = self.spec.call(self.function.as_ref(), &args)?;
        let operator = self.transition_operator(&layers)?;
        let grids = self.grids(&layers)?;
        let spacing = match operator.lottery() {
            EndoLottery::One(l) => vec![l.spacing(&grids[0])?],
            EndoLottery::Two(l1, l2) => vec![l1.spacing(&grids[0])?, l2.spacing(&grids[1])?],
        };

        FakeNews {
            spec: &self.spec,
            function: self.function.as_ref(),
            args,
            baseline,
            distribution: ss.distribution(),
            operator,
            spacing,
            settings: *settings,
        }
        .jacobians(horizon, shocks, &outputs)
    }

    fn path_context<'a>(&'a self, ss: &'a SteadyState) -> Result<PathContext<'a>> {
        let layers = [ss.outputs(), ss.inputs()];
        Ok(PathContext {
            spec: &self.spec,
            function: self.function.as_ref(),
            args: self.spec.argument_record(&layers)?,
            distribution: ss.distribution(),
            markov: self.markov_matrices(&layers)?,
            grids: self.grids(&layers)?,
        })
    }

    /// Aggregate responses to the input deviations `shocks` along a nonlinear path.
    pub fn impulse_nonlinear(
        &self,
        ss: &SteadyState,
        shocks: &ShockPaths,
        outputs: &[&str],
        horizon: usize,
    ) -> Result<BTreeMap<Aggregate, Vec<f64>>> {
        let outputs: Vec<String> = outputs.iter().map(|o| o.to_string()).collect();
        validate_request(&self.spec, horizon, &BTreeMap::new(), &outputs)?;
        self.path_context(ss)?
            .impulse_nonlinear(shocks, &outputs, horizon)
    }

    /// Jacobians by resimulating one nonlinear path per shock date.
    pub fn direct_jacobian(
        &self,
        ss: &SteadyState,
        horizon: usize,
        shocks: &BTreeMap<String, Shock>,
        outputs: &[&str],
        settings: &JacobianSettings,
    ) -> Result<Jacobians> {
        settings.validate()?;
        let outputs: Vec<String> = outputs.iter().map(|o| o.to_string()).collect();
        validate_request(&self.spec, horizon, shocks, &outputs)?;
        self.path_context(ss)?
            .direct_jacobian(horizon, shocks, &outputs, settings)
    }

    /// Same block with arguments and outputs renamed by the bijection `map`.
    ///
    /// Next-period arguments, grids and seeds follow their base names unless
    /// `map` renames them explicitly.
    pub fn remap(&self, map: &BTreeMap<String, String>) -> Result<Self> {
        let targets: BTreeSet<&String> = map.values().collect();
        if targets.len() != map.len() {
            return Err(HetBlockError::Configuration(format!(
                "rename map for {} is not one-to-one",
                self.name()
            )));
        }
        let names: BTreeSet<&String> = self
            .function
            .arguments()
            .iter()
            .chain(self.function.outputs())
            .collect();
        if let Some(clash) = targets
            .iter()
            .find(|t| names.contains(*t) && !map.contains_key(t.as_str()))
        {
            return Err(HetBlockError::Configuration(format!(
                "rename target '{clash}' collides with an existing name in {}",
                self.name()
            )));
        }

        let mut full = map.clone();
        for p in self.spec.policy().names() {
            if let Some(new) = map.get(p) {
                full.entry(grid_key(p)).or_insert_with(|| grid_key(new));
            }
        }
        for exo in self.spec.exogenous() {
            if let Some(new) = map.get(exo) {
                full.entry(seed_key(exo)).or_insert_with(|| seed_key(new));
            }
        }

        let renamed = RenamedFunction::new(self.function.clone(), &full);
        let exogenous: Vec<String> = self.spec.exogenous().iter().map(|e| rename(&full, e)).collect();
        let policy: Vec<String> = self.spec.policy().names().iter().map(|p| rename(&full, p)).collect();
        let backward: Vec<String> = self.spec.backward().iter().map(|b| rename(&full, b)).collect();
        Self::new(
            renamed,
            &as_refs(&exogenous),
            &as_refs(&policy),
            &as_refs(&backward),
        )
    }
}

fn as_refs(names: &[String]) -> Vec<&str> {
    names.iter().map(String::as_str).collect()
}

fn lookup<'v>(layers: &[&'v Variables], key: &str, block: &str) -> Result<&'v Value> {
    layers
        .iter()
        .find_map(|vars| vars.get(key))
        .ok_or_else(|| HetBlockError::missing(key, block))
}

fn expect_array<'v>(value: &'v Value, name: &str) -> Result<&'v StateArray> {
    value.as_array().ok_or_else(|| {
        HetBlockError::Shape(format!("'{name}': expected array, found {}", value.kind()))
    })
}
