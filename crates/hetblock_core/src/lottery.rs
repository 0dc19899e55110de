//! Lottery discretization of continuous policies onto a grid.
//!
//! A policy value between two gridpoints is represented by putting weight `pi`
//! on the lower bracketing point and `1 - pi` on the upper one, which keeps the
//! conditional mean exact.

use crate::array::StateArray;
use crate::error::{HetBlockError, Result};

/// Strictly monotonic grid for one policy dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    points: Vec<f64>,
    increasing: bool,
}

#[allow(clippy::len_without_is_empty)]
impl Grid {
    pub fn new(points: Vec<f64>) -> Result<Self> {
        if points.len() < 2 {
            return Err(HetBlockError::NumericalDegeneracy(format!(
                "grid needs at least two points, got {}",
                points.len()
            )));
        }
        if let Some(bad) = points.iter().position(|v| !v.is_finite()) {
            return Err(HetBlockError::NumericalDegeneracy(format!(
                "grid point {bad} is not finite"
            )));
        }
        let increasing = points[1] > points[0];
        let monotonic = points.windows(2).all(|w| {
            if increasing {
                w[1] > w[0]
            } else {
                w[1] < w[0]
            }
        });
        if !monotonic {
            return Err(HetBlockError::NumericalDegeneracy(
                "grid is not strictly monotonic".into(),
            ));
        }
        Ok(Self { points, increasing })
    }

    pub fn from_array(array: &StateArray) -> Result<Self> {
        if array.ndim() != 1 {
            return Err(HetBlockError::Shape(format!(
                "grid must be one-dimensional, got shape {:?}",
                array.shape()
            )));
        }
        Self::new(array.as_slice().to_vec())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[f64] {
        &self.points
    }

    pub fn is_increasing(&self) -> bool {
        self.increasing
    }

    /// Lower bracket index `i` and weight `pi` with `pi*g[i] + (1-pi)*g[i+1] == value`.
    ///
    /// Values outside the grid use the boundary bracket and extrapolate `pi`
    /// linearly past `[0, 1]`, so the identity holds everywhere.
    pub fn locate(&self, value: f64) -> (usize, f64) {
        let n = self.points.len();
        let count = if self.increasing {
            self.points.partition_point(|&g| g <= value)
        } else {
            self.points.partition_point(|&g| g >= value)
        };
        let i = count.saturating_sub(1).min(n - 2);
        let lo = self.points[i];
        let hi = self.points[i + 1];
        let pi = (hi - value) / (hi - lo);
        (i, pi)
    }

    /// Distance `g[i+1] - g[i]` of the bracket starting at `i`.
    pub fn spacing(&self, i: usize) -> f64 {
        self.points[i + 1] - self.points[i]
    }
}

/// Validates `grid` and locates a single value on it.
pub fn locate(grid: &[f64], value: f64) -> Result<(usize, f64)> {
    Ok(Grid::new(grid.to_vec())?.locate(value))
}

/// Bracket indices and lower-point weights for a whole policy array.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyLottery {
    shape: Vec<usize>,
    index: Vec<usize>,
    weight: Vec<f64>,
}

impl PolicyLottery {
    pub fn new(grid: &Grid, policy: &StateArray) -> Result<Self> {
        let mut index = Vec::with_capacity(policy.len());
        let mut weight = Vec::with_capacity(policy.len());
        for (k, &value) in policy.as_slice().iter().enumerate() {
            if !value.is_finite() {
                return Err(HetBlockError::NumericalDegeneracy(format!(
                    "policy value at flat index {k} is not finite"
                )));
            }
            let (i, pi) = grid.locate(value);
            index.push(i);
            weight.push(pi);
        }
        Ok(Self {
            shape: policy.shape().to_vec(),
            index,
            weight,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn index(&self) -> &[usize] {
        &self.index
    }

    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    /// Bracket widths at every state, used to turn policy changes into weight changes.
    pub fn spacing(&self, grid: &Grid) -> Result<StateArray> {
        let data = self.index.iter().map(|&i| grid.spacing(i)).collect();
        StateArray::new(self.shape.clone(), data)
    }
}
