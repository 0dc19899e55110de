//! Dense row-major arrays over the joint state grid.
//!
//! Distributions, policies and the other per-state outputs of a backward
//! function all live on the grid `exogenous dims x policy dims`. They are
//! stored flat in row-major order, so the last policy dimension varies fastest.

use std::ops::{Index, IndexMut};

use crate::error::{HetBlockError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct StateArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl StateArray {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(HetBlockError::Shape(format!(
                "shape {:?} needs {} entries, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: &[usize], value: f64) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![value; len],
        }
    }

    /// One-dimensional array, e.g. a grid.
    pub fn from_vec(data: Vec<f64>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Two-dimensional array from equally long rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let ncols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != ncols) {
            return Err(HetBlockError::Shape("rows have unequal lengths".into()));
        }
        let data = rows.iter().flatten().copied().collect();
        Self::new(vec![rows.len(), ncols], data)
    }

    /// Builds an array by evaluating `f` at every multi-index.
    pub fn from_fn(shape: &[usize], mut f: impl FnMut(&[usize]) -> f64) -> Self {
        let len: usize = shape.iter().product();
        let mut data = Vec::with_capacity(len);
        let mut idx = vec![0usize; shape.len()];
        for _ in 0..len {
            data.push(f(&idx));
            for axis in (0..shape.len()).rev() {
                idx[axis] += 1;
                if idx[axis] < shape[axis] {
                    break;
                }
                idx[axis] = 0;
            }
        }
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Flat offset of a multi-index.
    pub fn offset(&self, idx: &[usize]) -> usize {
        debug_assert_eq!(idx.len(), self.shape.len());
        idx.iter()
            .zip(&self.shape)
            .fold(0, |acc, (&i, &n)| acc * n + i)
    }

    pub fn at(&self, idx: &[usize]) -> f64 {
        self.data[self.offset(idx)]
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Self::new(shape, self.data)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn ensure_same_shape(&self, other: &StateArray, what: &str) -> Result<()> {
        if self.shape != other.shape {
            return Err(HetBlockError::Shape(format!(
                "{what}: shape {:?} does not match {:?}",
                self.shape, other.shape
            )));
        }
        Ok(())
    }

    /// Inner product over every entry.
    pub fn dot(&self, other: &StateArray) -> Result<f64> {
        self.ensure_same_shape(other, "inner product")?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a * b)
            .sum())
    }

    pub fn max_abs_diff(&self, other: &StateArray) -> Result<f64> {
        self.ensure_same_shape(other, "max abs diff")?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max))
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> StateArray {
        StateArray {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn zip_map(&self, other: &StateArray, f: impl Fn(f64, f64) -> f64) -> Result<StateArray> {
        self.ensure_same_shape(other, "elementwise op")?;
        Ok(StateArray {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// `self + alpha * other`.
    pub fn scaled_add(&self, alpha: f64, other: &StateArray) -> Result<StateArray> {
        self.zip_map(other, |a, b| a + alpha * b)
    }

    /// Splits the shape around `axis` into (outer, axis length, inner) block sizes.
    pub(crate) fn axis_blocks(&self, axis: usize) -> (usize, usize, usize) {
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        (outer, self.shape[axis], inner)
    }

    /// Sizes of the leading block and the trailing `trailing` dimensions.
    pub(crate) fn split_trailing(&self, trailing: usize) -> (usize, usize) {
        let cut = self.shape.len() - trailing;
        (
            self.shape[..cut].iter().product(),
            self.shape[cut..].iter().product(),
        )
    }
}

impl Index<usize> for StateArray {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.data[index]
    }
}

impl IndexMut<usize> for StateArray {
    fn index_mut(&mut self, index: usize) -> &mut f64 {
        &mut self.data[index]
    }
}
