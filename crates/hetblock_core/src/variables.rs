//! Named values passed to and returned from backward functions.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::array::StateArray;
use crate::error::{HetBlockError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array(StateArray),
    Matrix(DMatrix<f64>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Array(_) => "array",
            Value::Matrix(_) => "matrix",
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&StateArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_matrix(&self) -> Option<&DMatrix<f64>> {
        match self {
            Value::Matrix(m) => Some(m),
            _ => None,
        }
    }

    pub fn scale(&self, alpha: f64) -> Value {
        match self {
            Value::Scalar(v) => Value::Scalar(alpha * v),
            Value::Array(a) => Value::Array(a.map(|v| alpha * v)),
            Value::Matrix(m) => Value::Matrix(m * alpha),
        }
    }

    /// `self + alpha * other`. A scalar `other` broadcasts over an array.
    pub fn scaled_add(&self, alpha: f64, other: &Value) -> Result<Value> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(a + alpha * b)),
            (Value::Array(a), Value::Array(b)) => Ok(Value::Array(a.scaled_add(alpha, b)?)),
            (Value::Array(a), Value::Scalar(b)) => Ok(Value::Array(a.map(|v| v + alpha * b))),
            (Value::Matrix(a), Value::Matrix(b)) => {
                if a.shape() != b.shape() {
                    return Err(HetBlockError::Shape(format!(
                        "matrix shape {:?} does not match {:?}",
                        a.shape(),
                        b.shape()
                    )));
                }
                Ok(Value::Matrix(a + b * alpha))
            }
            (a, b) => Err(HetBlockError::Shape(format!(
                "cannot combine {} with {}",
                a.kind(),
                b.kind()
            ))),
        }
    }

    pub fn zeros_like(&self) -> Value {
        self.scale(0.0)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(value)
    }
}

impl From<StateArray> for Value {
    fn from(value: StateArray) -> Self {
        Value::Array(value)
    }
}

impl From<DMatrix<f64>> for Value {
    fn from(value: DMatrix<f64>) -> Self {
        Value::Matrix(value)
    }
}

/// Ordered name -> value record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn require(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| HetBlockError::missing(name, "variables"))
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        let value = self.require(name)?;
        value.as_scalar().ok_or_else(|| wrong_kind(name, "scalar", value))
    }

    pub fn array(&self, name: &str) -> Result<&StateArray> {
        let value = self.require(name)?;
        value.as_array().ok_or_else(|| wrong_kind(name, "array", value))
    }

    pub fn matrix(&self, name: &str) -> Result<&DMatrix<f64>> {
        let value = self.require(name)?;
        value
            .as_matrix()
            .ok_or_else(|| wrong_kind(name, "matrix", value))
    }
}

fn wrong_kind(name: &str, expected: &str, found: &Value) -> HetBlockError {
    HetBlockError::Shape(format!(
        "'{name}': expected {expected}, found {}",
        found.kind()
    ))
}

impl FromIterator<(String, Value)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Variables {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl Extend<(String, Value)> for Variables {
    fn extend<I: IntoIterator<Item = (String, Value)>>(&mut self, iter: I) {
        self.values.extend(iter);
    }
}
