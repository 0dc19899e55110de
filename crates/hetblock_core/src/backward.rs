//! Backward iteration functions and their declared interface.
//!
//! A backward function maps next-period continuation values (arguments with a
//! `_p` suffix) plus this period's inputs into policies and updated values.
//! Argument and output names are declared explicitly and validated once, when
//! the [`BackwardFunctionSpec`] is built.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{HetBlockError, Result};
use crate::variables::{Value, Variables};

/// Suffix marking next-period arguments.
pub const NEXT_PERIOD_SUFFIX: &str = "_p";

pub fn next_period(name: &str) -> String {
    format!("{name}{NEXT_PERIOD_SUFFIX}")
}

/// A single-period backward step with declared argument and output order.
pub trait BackwardFunction: Send + Sync {
    fn name(&self) -> &str;

    fn arguments(&self) -> &[String];

    /// Output names, in the order `evaluate` returns them.
    fn outputs(&self) -> &[String];

    /// Receives exactly the declared arguments.
    fn evaluate(&self, args: &Variables) -> anyhow::Result<Vec<Value>>;
}

/// Closure-backed [`BackwardFunction`].
pub struct FnBackward<F> {
    name: String,
    arguments: Vec<String>,
    outputs: Vec<String>,
    f: F,
}

impl<F> FnBackward<F>
where
    F: Fn(&Variables) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    pub fn new(name: &str, arguments: &[&str], outputs: &[&str], f: F) -> Self {
        Self {
            name: name.to_string(),
            arguments: arguments.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            f,
        }
    }
}

impl<F> BackwardFunction for FnBackward<F>
where
    F: Fn(&Variables) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> &[String] {
        &self.arguments
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn evaluate(&self, args: &Variables) -> anyhow::Result<Vec<Value>> {
        (self.f)(args)
    }
}

/// Endogenous policy names; at most two are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Policy {
    One(String),
    Two(String, String),
}

#[allow(clippy::len_without_is_empty)]
impl Policy {
    pub fn from_names(names: &[&str], function: &str) -> Result<Self> {
        match names {
            [p] => Ok(Policy::One(p.to_string())),
            [p1, p2] => Ok(Policy::Two(p1.to_string(), p2.to_string())),
            [] => Err(HetBlockError::Configuration(format!(
                "No endogenous policy declared for {function}"
            ))),
            _ => Err(HetBlockError::Configuration(format!(
                "More than two endogenous policies in {function}, not supported"
            ))),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            Policy::One(p) => vec![p.as_str()],
            Policy::Two(p1, p2) => vec![p1.as_str(), p2.as_str()],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Policy::One(_) => 1,
            Policy::Two(..) => 2,
        }
    }
}

/// Validated metadata of a backward function.
#[derive(Debug, Clone, PartialEq)]
pub struct BackwardFunctionSpec {
    name: String,
    exogenous: Vec<String>,
    policy: Policy,
    backward: Vec<String>,
    arguments: Vec<String>,
    outputs: Vec<String>,
}

impl BackwardFunctionSpec {
    pub fn new(
        function: &dyn BackwardFunction,
        exogenous: &[&str],
        policy: &[&str],
        backward: &[&str],
    ) -> Result<Self> {
        let name = function.name().to_string();
        let policy = Policy::from_names(policy, &name)?;
        let arguments = function.arguments().to_vec();
        let outputs = function.outputs().to_vec();
        let config = |msg: String| Err(HetBlockError::Configuration(msg));

        let all_inputs: BTreeSet<&str> = arguments.iter().map(String::as_str).collect();
        if all_inputs.len() != arguments.len() {
            return config(format!("Duplicate argument names in {name}"));
        }
        let all_outputs: BTreeSet<&str> = outputs.iter().map(String::as_str).collect();
        if all_outputs.len() != outputs.len() {
            return config(format!("Duplicate output names in {name}"));
        }
        if exogenous.is_empty() {
            return config(format!("No exogenous Markov process declared for {name}"));
        }

        for exo in exogenous {
            if !all_inputs.contains(next_period(exo).as_str()) {
                return config(format!(
                    "Markov matrix '{exo}_p' not included as argument in {name}"
                ));
            }
        }
        for pol in policy.names() {
            if !all_outputs.contains(pol) {
                return config(format!("Policy '{pol}' not included as output in {name}"));
            }
        }
        for back in backward {
            if !all_inputs.contains(next_period(back).as_str()) {
                return config(format!(
                    "Backward variable '{back}_p' not included as argument in {name}"
                ));
            }
            if !all_outputs.contains(back) {
                return config(format!(
                    "Backward variable '{back}' not included as output in {name}"
                ));
            }
        }
        for out in &outputs {
            if backward.contains(&out.as_str()) {
                continue;
            }
            if is_uppercase(out) {
                return config(format!(
                    "Output '{out}' is uppercase in {name}, reserved for aggregates"
                ));
            }
            if out == "D" {
                return config(format!("Output 'D' in {name} collides with the distribution"));
            }
        }

        Ok(Self {
            name,
            exogenous: exogenous.iter().map(|s| s.to_string()).collect(),
            policy,
            backward: backward.iter().map(|s| s.to_string()).collect(),
            arguments,
            outputs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exogenous(&self) -> &[String] {
        &self.exogenous
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn backward(&self) -> &[String] {
        &self.backward
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_backward(&self, name: &str) -> bool {
        self.backward.iter().any(|b| b == name)
    }

    /// Outputs that get aggregated: everything except backward variables.
    pub fn non_backward_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .map(String::as_str)
            .filter(|o| !self.is_backward(o))
    }

    /// Maps a next-period argument name back to its exogenous or backward variable.
    pub fn lagged_source(&self, argument: &str) -> Option<&str> {
        let base = argument.strip_suffix(NEXT_PERIOD_SUFFIX)?;
        self.exogenous
            .iter()
            .chain(&self.backward)
            .find(|n| n.as_str() == base)
            .map(String::as_str)
    }

    /// Assembles exactly the declared arguments.
    ///
    /// `_p` arguments of exogenous and backward variables are filled from the
    /// un-suffixed name; everything else by its own name. Earlier layers win.
    pub fn argument_record(&self, layers: &[&Variables]) -> Result<Variables> {
        let lookup = |key: &str| layers.iter().find_map(|vars| vars.get(key));
        let mut record = Variables::new();
        for arg in &self.arguments {
            let key = self.lagged_source(arg).unwrap_or(arg);
            let value = lookup(key).ok_or_else(|| HetBlockError::missing(key, &self.name))?;
            record.insert(arg.clone(), value.clone());
        }
        Ok(record)
    }

    /// Evaluates `function` and names its outputs.
    pub fn call(&self, function: &dyn BackwardFunction, args: &Variables) -> Result<Variables> {
        let values = function
            .evaluate(args)
            .map_err(|err| HetBlockError::from_backward(&self.name, err))?;
        if values.len() != self.outputs.len() {
            return Err(HetBlockError::Shape(format!(
                "{} returned {} values for {} declared outputs",
                self.name,
                values.len(),
                self.outputs.len()
            )));
        }
        Ok(self.outputs.iter().cloned().zip(values).collect())
    }
}

fn is_uppercase(name: &str) -> bool {
    name.chars().any(char::is_alphabetic) && !name.chars().any(char::is_lowercase)
}

/// Applies a rename map to a name, carrying the `_p` suffix along.
pub(crate) fn rename(map: &BTreeMap<String, String>, name: &str) -> String {
    if let Some(new) = map.get(name) {
        return new.clone();
    }
    if let Some(base) = name.strip_suffix(NEXT_PERIOD_SUFFIX) {
        if let Some(new) = map.get(base) {
            return next_period(new);
        }
    }
    name.to_string()
}

/// Wraps a backward function under new argument and output names.
pub struct RenamedFunction {
    inner: Arc<dyn BackwardFunction>,
    name: String,
    arguments: Vec<String>,
    outputs: Vec<String>,
}

impl RenamedFunction {
    pub fn new(inner: Arc<dyn BackwardFunction>, map: &BTreeMap<String, String>) -> Self {
        let arguments = inner.arguments().iter().map(|a| rename(map, a)).collect();
        let outputs = inner.outputs().iter().map(|o| rename(map, o)).collect();
        Self {
            name: inner.name().to_string(),
            inner,
            arguments,
            outputs,
        }
    }
}

impl BackwardFunction for RenamedFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn arguments(&self) -> &[String] {
        &self.arguments
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn evaluate(&self, args: &Variables) -> anyhow::Result<Vec<Value>> {
        let mut original = Variables::new();
        for (old, new) in self.inner.arguments().iter().zip(&self.arguments) {
            original.insert(old.clone(), args.require(new)?.clone());
        }
        self.inner.evaluate(&original)
    }
}
