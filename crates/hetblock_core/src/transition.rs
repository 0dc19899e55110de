//! Forward transition operators on the joint `exogenous x policy` grid.
//!
//! One period of the distribution's law of motion is `forward_exog(forward_endo(D))`:
//! agents first move along the policy grid(s) via their lotteries, then draw
//! next period's exogenous states. The transpose and the linearization with
//! respect to lottery weights are what the fake-news algorithm needs.

use std::borrow::Cow;

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::array::StateArray;
use crate::error::{HetBlockError, Result};
use crate::lottery::PolicyLottery;

/// Lotteries for the one or two endogenous policy dimensions of a block.
#[derive(Debug, Clone, PartialEq)]
pub enum EndoLottery {
    One(PolicyLottery),
    Two(PolicyLottery, PolicyLottery),
}

impl EndoLottery {
    /// Builds the tagged variant, rejecting more than two policy dimensions.
    pub fn from_vec(mut lotteries: Vec<PolicyLottery>) -> Result<Self> {
        match lotteries.len() {
            1 => Ok(EndoLottery::One(lotteries.remove(0))),
            2 => {
                let second = lotteries.remove(1);
                let first = lotteries.remove(0);
                if first.shape() != second.shape() {
                    return Err(HetBlockError::Shape(format!(
                        "policy lotteries have shapes {:?} and {:?}",
                        first.shape(),
                        second.shape()
                    )));
                }
                Ok(EndoLottery::Two(first, second))
            }
            n => Err(HetBlockError::Configuration(format!(
                "{n} policy variables, only 1 or 2 are supported"
            ))),
        }
    }

    pub fn policy_dims(&self) -> usize {
        match self {
            EndoLottery::One(_) => 1,
            EndoLottery::Two(..) => 2,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            EndoLottery::One(l) | EndoLottery::Two(l, _) => l.shape(),
        }
    }
}

/// Perturbation of the lottery weights, one array per policy dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightShock {
    One(StateArray),
    Two(StateArray, StateArray),
}

/// The law of motion `D' = Lambda' D` for fixed policies and Markov matrices.
///
/// Markov matrices are ordered like the leading exogenous axes of the grid.
#[derive(Debug, Clone)]
pub struct TransitionOperator {
    markov: Vec<DMatrix<f64>>,
    lottery: EndoLottery,
    shape: Vec<usize>,
}

impl TransitionOperator {
    pub fn new(markov: Vec<DMatrix<f64>>, lottery: EndoLottery) -> Result<Self> {
        let shape = lottery.shape().to_vec();
        let n_policy = lottery.policy_dims();
        if markov.is_empty() {
            return Err(HetBlockError::Configuration(
                "at least one exogenous Markov matrix is required".into(),
            ));
        }
        if shape.len() != markov.len() + n_policy {
            return Err(HetBlockError::Shape(format!(
                "grid shape {:?} does not have {} exogenous and {} policy dimensions",
                shape,
                markov.len(),
                n_policy
            )));
        }
        for (axis, pi) in markov.iter().enumerate() {
            if pi.nrows() != shape[axis] || pi.ncols() != shape[axis] {
                return Err(HetBlockError::Shape(format!(
                    "Markov matrix for axis {axis} is {}x{}, grid has {} states",
                    pi.nrows(),
                    pi.ncols(),
                    shape[axis]
                )));
            }
        }
        let check = |lottery: &PolicyLottery, axis: usize| -> Result<()> {
            let n = shape[axis];
            if lottery.index().iter().any(|&i| i + 1 >= n) {
                return Err(HetBlockError::Shape(format!(
                    "lottery index exceeds policy axis {axis} of length {n}"
                )));
            }
            Ok(())
        };
        match &lottery {
            EndoLottery::One(l) => check(l, shape.len() - 1)?,
            EndoLottery::Two(l1, l2) => {
                check(l1, shape.len() - 2)?;
                check(l2, shape.len() - 1)?;
            }
        }
        Ok(Self {
            markov,
            lottery,
            shape,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn markov(&self) -> &[DMatrix<f64>] {
        &self.markov
    }

    pub fn lottery(&self) -> &EndoLottery {
        &self.lottery
    }

    fn check_input(&self, array: &StateArray, what: &str) -> Result<()> {
        if array.shape() != self.shape.as_slice() {
            return Err(HetBlockError::Shape(format!(
                "{what}: shape {:?} does not match grid {:?}",
                array.shape(),
                self.shape
            )));
        }
        Ok(())
    }

    /// Moves mass along the policy grid(s) according to the lotteries.
    pub fn forward_endo(&self, d: &StateArray) -> Result<StateArray> {
        self.check_input(d, "forward_endo")?;
        let mut out = StateArray::zeros(&self.shape);
        let src = d.as_slice();
        let dst = out.as_mut_slice();
        match &self.lottery {
            EndoLottery::One(l) => {
                let (outer, n) = d.split_trailing(1);
                let (idx, w) = (l.index(), l.weight());
                for o in 0..outer {
                    let base = o * n;
                    for j in 0..n {
                        let f = base + j;
                        let i = base + idx[f];
                        dst[i] += w[f] * src[f];
                        dst[i + 1] += (1.0 - w[f]) * src[f];
                    }
                }
            }
            EndoLottery::Two(l1, l2) => {
                let n2 = self.shape[self.shape.len() - 1];
                let (outer, block) = d.split_trailing(2);
                let (idx1, w1, idx2, w2) = (l1.index(), l1.weight(), l2.index(), l2.weight());
                for o in 0..outer {
                    let base = o * block;
                    for k in 0..block {
                        let f = base + k;
                        let at = base + idx1[f] * n2 + idx2[f];
                        let (p1, p2) = (w1[f], w2[f]);
                        dst[at] += p1 * p2 * src[f];
                        dst[at + 1] += p1 * (1.0 - p2) * src[f];
                        dst[at + n2] += (1.0 - p1) * p2 * src[f];
                        dst[at + n2 + 1] += (1.0 - p1) * (1.0 - p2) * src[f];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Adjoint of [`forward_endo`](Self::forward_endo): gathers values back onto pre-policy states.
    pub fn forward_endo_transpose(&self, x: &StateArray) -> Result<StateArray> {
        self.check_input(x, "forward_endo_transpose")?;
        let mut out = StateArray::zeros(&self.shape);
        let src = x.as_slice();
        let dst = out.as_mut_slice();
        match &self.lottery {
            EndoLottery::One(l) => {
                let (outer, n) = x.split_trailing(1);
                let (idx, w) = (l.index(), l.weight());
                for o in 0..outer {
                    let base = o * n;
                    for j in 0..n {
                        let f = base + j;
                        let i = base + idx[f];
                        dst[f] = w[f] * src[i] + (1.0 - w[f]) * src[i + 1];
                    }
                }
            }
            EndoLottery::Two(l1, l2) => {
                let n2 = self.shape[self.shape.len() - 1];
                let (outer, block) = x.split_trailing(2);
                let (idx1, w1, idx2, w2) = (l1.index(), l1.weight(), l2.index(), l2.weight());
                for o in 0..outer {
                    let base = o * block;
                    for k in 0..block {
                        let f = base + k;
                        let at = base + idx1[f] * n2 + idx2[f];
                        let (p1, p2) = (w1[f], w2[f]);
                        dst[f] = p1 * p2 * src[at]
                            + p1 * (1.0 - p2) * src[at + 1]
                            + (1.0 - p1) * p2 * src[at + n2]
                            + (1.0 - p1) * (1.0 - p2) * src[at + n2 + 1];
                    }
                }
            }
        }
        Ok(out)
    }

    /// Derivative of [`forward_endo`](Self::forward_endo) in the lottery weights, indices held fixed.
    pub fn forward_endo_shock(&self, d_ss: &StateArray, shock: &WeightShock) -> Result<StateArray> {
        self.check_input(d_ss, "forward_endo_shock")?;
        let mut out = StateArray::zeros(&self.shape);
        let src = d_ss.as_slice();
        let dst = out.as_mut_slice();
        match (&self.lottery, shock) {
            (EndoLottery::One(l), WeightShock::One(dw)) => {
                self.check_input(dw, "weight shock")?;
                let (outer, n) = d_ss.split_trailing(1);
                let (idx, dw) = (l.index(), dw.as_slice());
                for o in 0..outer {
                    let base = o * n;
                    for j in 0..n {
                        let f = base + j;
                        let i = base + idx[f];
                        let moved = dw[f] * src[f];
                        dst[i] += moved;
                        dst[i + 1] -= moved;
                    }
                }
            }
            (EndoLottery::Two(l1, l2), WeightShock::Two(dw1, dw2)) => {
                self.check_input(dw1, "weight shock")?;
                self.check_input(dw2, "weight shock")?;
                let n2 = self.shape[self.shape.len() - 1];
                let (outer, block) = d_ss.split_trailing(2);
                let (idx1, w1, idx2, w2) = (l1.index(), l1.weight(), l2.index(), l2.weight());
                let (dw1, dw2) = (dw1.as_slice(), dw2.as_slice());
                for o in 0..outer {
                    let base = o * block;
                    for k in 0..block {
                        let f = base + k;
                        let at = base + idx1[f] * n2 + idx2[f];
                        let (p1, p2, dp1, dp2) = (w1[f], w2[f], dw1[f], dw2[f]);
                        let mass = src[f];
                        dst[at] += (dp1 * p2 + p1 * dp2) * mass;
                        dst[at + 1] += (dp1 * (1.0 - p2) - p1 * dp2) * mass;
                        dst[at + n2] += (-dp1 * p2 + (1.0 - p1) * dp2) * mass;
                        dst[at + n2 + 1] += (-dp1 * (1.0 - p2) - (1.0 - p1) * dp2) * mass;
                    }
                }
            }
            _ => {
                return Err(HetBlockError::Shape(
                    "weight shock does not match the number of policy dimensions".into(),
                ))
            }
        }
        Ok(out)
    }

    /// Applies each exogenous transition along its own axis.
    pub fn forward_exog(&self, d: &StateArray) -> Result<StateArray> {
        self.check_input(d, "forward_exog")?;
        let mut current = apply_along_axis(d, 0, &self.markov[0], Orientation::Forward);
        for (axis, pi) in self.markov.iter().enumerate().skip(1) {
            current = apply_along_axis(&current, axis, pi, Orientation::Forward);
        }
        Ok(current)
    }

    fn forward_exog_transpose(&self, x: &StateArray) -> Result<StateArray> {
        self.check_input(x, "forward_exog_transpose")?;
        let mut current = apply_along_axis(x, 0, &self.markov[0], Orientation::Backward);
        for (axis, pi) in self.markov.iter().enumerate().skip(1) {
            current = apply_along_axis(&current, axis, pi, Orientation::Backward);
        }
        Ok(current)
    }

    /// One full period: policy step followed by exogenous transitions.
    pub fn forward_step(&self, d: &StateArray) -> Result<StateArray> {
        self.forward_exog(&self.forward_endo(d)?)
    }

    /// Exact adjoint of [`forward_step`](Self::forward_step).
    pub fn forward_transpose(&self, x: &StateArray) -> Result<StateArray> {
        self.forward_endo_transpose(&self.forward_exog_transpose(x)?)
    }

    /// Linearized step: next period's distribution change from a change in lottery weights.
    pub fn forward_shock(&self, d_ss: &StateArray, shock: &WeightShock) -> Result<StateArray> {
        self.forward_exog(&self.forward_endo_shock(d_ss, shock)?)
    }

    /// Materializes `Lambda'` so that `vec(forward_step(D)) == Lambda' * vec(D)`.
    pub fn sparse_matrix(&self) -> CsrMatrix<f64> {
        let size: usize = self.shape.iter().product();
        let n_exog = self.markov.len();
        let mut coo = CooMatrix::new(size, size);
        let layout = StateArray::zeros(&self.shape);
        let mut targets: Vec<(usize, f64)> = Vec::with_capacity(4);
        let mut spread: Vec<(usize, f64)> = Vec::new();

        for source in 0..size {
            targets.clear();
            self.endo_targets(source, &mut targets);
            for axis in 0..n_exog {
                let (_, n, inner) = layout.axis_blocks(axis);
                spread.clear();
                for &(flat, weight) in &targets {
                    let i = (flat / inner) % n;
                    let root = flat - i * inner;
                    for j in 0..n {
                        let p = self.markov[axis][(i, j)];
                        if p != 0.0 {
                            spread.push((root + j * inner, weight * p));
                        }
                    }
                }
                std::mem::swap(&mut targets, &mut spread);
            }
            for &(target, weight) in &targets {
                if weight != 0.0 {
                    coo.push(target, source, weight);
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    fn endo_targets(&self, f: usize, out: &mut Vec<(usize, f64)>) {
        match &self.lottery {
            EndoLottery::One(l) => {
                let n = self.shape[self.shape.len() - 1];
                let base = f - f % n;
                let (i, p) = (l.index()[f], l.weight()[f]);
                out.push((base + i, p));
                out.push((base + i + 1, 1.0 - p));
            }
            EndoLottery::Two(l1, l2) => {
                let n2 = self.shape[self.shape.len() - 1];
                let block = self.shape[self.shape.len() - 2] * n2;
                let at = f - f % block + l1.index()[f] * n2 + l2.index()[f];
                let (p1, p2) = (l1.weight()[f], l2.weight()[f]);
                out.push((at, p1 * p2));
                out.push((at + 1, p1 * (1.0 - p2)));
                out.push((at + n2, (1.0 - p1) * p2));
                out.push((at + n2 + 1, (1.0 - p1) * (1.0 - p2)));
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Orientation {
    /// `out[j] = sum_i Pi[i, j] x[i]`
    Forward,
    /// `out[i] = sum_j Pi[i, j] x[j]`
    Backward,
}

/// Applies `pi` along `axis`: each block of the joint array over the
/// leading axes is an `inner x n` column-major matrix, multiplied by `pi`
/// (or its transpose) on the right.
fn apply_along_axis(
    x: &StateArray,
    axis: usize,
    pi: &DMatrix<f64>,
    orientation: Orientation,
) -> StateArray {
    let (_, n, inner) = x.axis_blocks(axis);
    let pi = match orientation {
        Orientation::Forward => Cow::Borrowed(pi),
        Orientation::Backward => Cow::Owned(pi.transpose()),
    };
    let mut out = StateArray::zeros(x.shape());
    let block = n * inner;
    for (src, dst) in x
        .as_slice()
        .chunks_exact(block)
        .zip(out.as_mut_slice().chunks_exact_mut(block))
    {
        let source = DMatrixView::from_slice(src, inner, n);
        let mut target = DMatrixViewMut::from_slice(dst, inner, n);
        target.gemm(1.0, &source, &*pi, 0.0);
    }
    out
}
