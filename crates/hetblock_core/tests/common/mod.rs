#![allow(dead_code)]

use hetblock_core::markov::{stationary, StationarySettings};
use hetblock_core::{FnBackward, HetBlock, StateArray, Value, Variables};
use nalgebra::DMatrix;

pub const N_E: usize = 3;
pub const N_A: usize = 100;

/// Rouwenhorst discretization of a log AR(1) with persistence `rho` and
/// cross-sectional standard deviation `sd`.
///
/// Returns levels normalized to mean one, their stationary distribution and the Markov matrix.
pub fn rouwenhorst(rho: f64, sd: f64, n: usize) -> (Vec<f64>, Vec<f64>, DMatrix<f64>) {
    let p = (1.0 + rho) / 2.0;
    let mut pi = DMatrix::from_row_slice(2, 2, &[p, 1.0 - p, 1.0 - p, p]);
    for k in 3..=n {
        let mut next = DMatrix::zeros(k, k);
        for i in 0..k - 1 {
            for j in 0..k - 1 {
                next[(i, j)] += p * pi[(i, j)];
                next[(i, j + 1)] += (1.0 - p) * pi[(i, j)];
                next[(i + 1, j)] += (1.0 - p) * pi[(i, j)];
                next[(i + 1, j + 1)] += p * pi[(i, j)];
            }
        }
        for i in 1..k - 1 {
            for j in 0..k {
                next[(i, j)] /= 2.0;
            }
        }
        pi = next;
    }

    let dist = stationary(&pi, None, StationarySettings::default()).expect("stationary");
    let half_width = sd * ((n - 1) as f64).sqrt();
    let levels: Vec<f64> = (0..n)
        .map(|i| (-half_width + 2.0 * half_width * i as f64 / (n - 1) as f64).exp())
        .collect();
    let mean: f64 = levels.iter().zip(&dist).map(|(e, p)| e * p).sum();
    let levels = levels.iter().map(|e| e / mean).collect();
    (levels, dist, pi)
}

/// Asset grid on `[amin, amax]`, denser near the borrowing limit.
pub fn agrid(amax: f64, n: usize, amin: f64) -> Vec<f64> {
    let pivot = amin.abs() + 0.25;
    let (lo, hi) = ((amin + pivot).ln(), (amax + pivot).ln());
    let mut grid: Vec<f64> = (0..n)
        .map(|i| (lo + (hi - lo) * i as f64 / (n - 1) as f64).exp() - pivot)
        .collect();
    grid[0] = amin;
    grid
}

/// Piecewise-linear interpolation of `(x, y)` at `xq`, extrapolating linearly.
pub fn interpolate_y(x: &[f64], xq: &[f64], y: &[f64]) -> Vec<f64> {
    xq.iter()
        .map(|&q| {
            let i = x.partition_point(|&v| v < q).clamp(1, x.len() - 1);
            let w = (q - x[i - 1]) / (x[i] - x[i - 1]);
            y[i - 1] + w * (y[i] - y[i - 1])
        })
        .collect()
}

/// `out[e, k] = scale * sum_e' pi[e, e'] next[e', k]`.
fn expectation(pi: &DMatrix<f64>, next: &StateArray, scale: f64) -> StateArray {
    StateArray::from_fn(next.shape(), |idx| {
        (0..pi.ncols())
            .map(|j| pi[(idx[0], j)] * next.at(&[j, idx[1]]))
            .sum::<f64>()
            * scale
    })
}

/// Endogenous gridpoints: savings and consumption from next period's marginal utility.
fn egm(
    uc_nextgrid: &StateArray,
    a_grid: &StateArray,
    e_grid: &StateArray,
    r: f64,
    w: f64,
    eis: f64,
) -> (StateArray, StateArray) {
    let shape = uc_nextgrid.shape().to_vec();
    let (n_e, n_a) = (shape[0], shape[1]);
    let grid = a_grid.as_slice();
    let mut a = StateArray::zeros(&shape);
    let mut c = StateArray::zeros(&shape);
    for e in 0..n_e {
        let coh: Vec<f64> = grid.iter().map(|&ak| (1.0 + r) * ak + w * e_grid[e]).collect();
        let endo: Vec<f64> = (0..n_a)
            .map(|k| uc_nextgrid.at(&[e, k]).powf(-eis) + grid[k])
            .collect();
        let savings = interpolate_y(&endo, &coh, grid);
        for k in 0..n_a {
            let ak = savings[k].max(grid[0]);
            a[e * n_a + k] = ak;
            c[e * n_a + k] = coh[k] - ak;
        }
    }
    (a, c)
}

/// Income-fluctuation household iterating on the marginal value of assets.
pub fn household() -> HetBlock {
    let f = FnBackward::new(
        "household",
        &["Va_p", "Pi_p", "a_grid", "e_grid", "r", "w", "beta", "eis"],
        &["Va", "a", "c"],
        |args: &Variables| {
            let va_p = args.array("Va_p")?;
            let pi = args.matrix("Pi_p")?;
            let (r, w, beta, eis) = (
                args.scalar("r")?,
                args.scalar("w")?,
                args.scalar("beta")?,
                args.scalar("eis")?,
            );
            let uc_nextgrid = expectation(pi, va_p, beta);
            let (a, c) = egm(&uc_nextgrid, args.array("a_grid")?, args.array("e_grid")?, r, w, eis);
            let va = c.map(|ci| (1.0 + r) * ci.powf(-1.0 / eis));
            Ok(vec![Value::from(va), a.into(), c.into()])
        },
    );
    HetBlock::new(f, &["Pi"], &["a"], &["Va"]).expect("household block")
}

/// The same household iterating on marginal utility of consumption.
pub fn household_uc() -> HetBlock {
    let f = FnBackward::new(
        "household_uc",
        &["uc_p", "Pi_p", "a_grid", "e_grid", "r", "w", "beta", "eis"],
        &["uc", "a", "c"],
        |args: &Variables| {
            let uc_p = args.array("uc_p")?;
            let pi = args.matrix("Pi_p")?;
            let (r, w, beta, eis) = (
                args.scalar("r")?,
                args.scalar("w")?,
                args.scalar("beta")?,
                args.scalar("eis")?,
            );
            let uc_nextgrid = expectation(pi, uc_p, beta * (1.0 + r));
            let (a, c) = egm(&uc_nextgrid, args.array("a_grid")?, args.array("e_grid")?, r, w, eis);
            let uc = c.map(|ci| ci.powf(-1.0 / eis));
            Ok(vec![Value::from(uc), a.into(), c.into()])
        },
    );
    HetBlock::new(f, &["Pi"], &["a"], &["uc"]).expect("household_uc block")
}

pub struct Calibration {
    pub r: f64,
    pub w: f64,
    pub beta: f64,
    pub eis: f64,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            r: 0.01,
            w: 1.0,
            beta: 0.96,
            eis: 0.5,
        }
    }
}

/// Common inputs plus the marginal-utility seed `uc = (0.1 coh)^(-1/eis)`.
fn base_inputs(cal: &Calibration) -> (Variables, StateArray) {
    let (e, _, pi) = rouwenhorst(0.9, 0.5, N_E);
    let a = agrid(50.0, N_A, 0.0);
    let uc = StateArray::from_fn(&[N_E, N_A], |idx| {
        let coh = (1.0 + cal.r) * a[idx[1]] + cal.w * e[idx[0]];
        (0.1 * coh).powf(-1.0 / cal.eis)
    });
    let inputs = Variables::new()
        .with("Pi", pi)
        .with("a_grid", StateArray::from_vec(a))
        .with("e_grid", StateArray::from_vec(e))
        .with("r", cal.r)
        .with("w", cal.w)
        .with("beta", cal.beta)
        .with("eis", cal.eis);
    (inputs, uc)
}

pub fn household_inputs(cal: &Calibration) -> Variables {
    let (inputs, uc) = base_inputs(cal);
    let r = cal.r;
    inputs.with("Va", uc.map(|u| (1.0 + r) * u))
}

pub fn household_uc_inputs(cal: &Calibration) -> Variables {
    let (inputs, uc) = base_inputs(cal);
    inputs.with("uc", uc)
}

/// Linear saver: `a = 0.4 a_grid + 0.2 e + 0.05 E[v'] + 5 r`, `v = (1 + r) a_grid + 0.5 E[v']`.
pub fn linear_saver() -> HetBlock {
    let f = FnBackward::new(
        "linear_saver",
        &["v_p", "Pi_p", "a_grid", "e_grid", "r", "beta"],
        &["v", "a"],
        |args: &Variables| {
            let ev = expectation(args.matrix("Pi_p")?, args.array("v_p")?, args.scalar("beta")?);
            let grid = args.array("a_grid")?;
            let e = args.array("e_grid")?;
            let r = args.scalar("r")?;
            let shape = ev.shape().to_vec();
            let a = StateArray::from_fn(&shape, |idx| {
                0.4 * grid[idx[1]] + 0.2 * e[idx[0]] + 0.05 * ev.at(idx) + 5.0 * r
            });
            let v = StateArray::from_fn(&shape, |idx| (1.0 + r) * grid[idx[1]] + 0.5 * ev.at(idx));
            Ok(vec![Value::from(v), a.into()])
        },
    );
    HetBlock::new(f, &["Pi"], &["a"], &["v"]).expect("linear saver block")
}

pub fn linear_saver_inputs() -> Variables {
    let n_a = 40;
    let grid: Vec<f64> = (0..n_a).map(|i| 10.0 * i as f64 / (n_a - 1) as f64).collect();
    Variables::new()
        .with("Pi", DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]))
        .with("a_grid", StateArray::from_vec(grid))
        .with("e_grid", StateArray::from_vec(vec![0.5, 1.5]))
        .with("r", 0.01)
        .with("beta", 0.95)
        .with("v", StateArray::zeros(&[2, n_a]))
}

/// `scale * sum_e' pi[e, e'] next[.., e', ..]` along one exogenous `axis`.
pub fn expectation_along(pi: &DMatrix<f64>, next: &StateArray, axis: usize, scale: f64) -> StateArray {
    StateArray::from_fn(next.shape(), |idx| {
        let mut at = idx.to_vec();
        (0..pi.ncols())
            .map(|j| {
                at[axis] = j;
                pi[(idx[axis], j)] * next.at(&at)
            })
            .sum::<f64>()
            * scale
    })
}

fn linspace(lo: f64, hi: f64, n: usize) -> StateArray {
    StateArray::from_vec((0..n).map(|i| lo + (hi - lo) * i as f64 / (n - 1) as f64).collect())
}

/// Savings `a = 0.5 a_grid + 1.6 + e + 10 r` on a grid topping out at 3, so the
/// stationary mass keeps choosing savings above the last gridpoint.
pub fn ceiling_saver() -> HetBlock {
    let f = FnBackward::new(
        "ceiling_saver",
        &["v_p", "Pi_p", "a_grid", "e_grid", "r", "beta"],
        &["v", "a"],
        |args: &Variables| {
            let ev = expectation(args.matrix("Pi_p")?, args.array("v_p")?, args.scalar("beta")?);
            let grid = args.array("a_grid")?;
            let e = args.array("e_grid")?;
            let r = args.scalar("r")?;
            let shape = ev.shape().to_vec();
            let a = StateArray::from_fn(&shape, |idx| 0.5 * grid[idx[1]] + 1.6 + e[idx[0]] + 10.0 * r);
            let v = StateArray::from_fn(&shape, |idx| grid[idx[1]] + 0.5 * ev.at(idx));
            Ok(vec![Value::from(v), a.into()])
        },
    );
    HetBlock::new(f, &["Pi"], &["a"], &["v"]).expect("ceiling saver block")
}

pub fn ceiling_saver_inputs() -> Variables {
    Variables::new()
        .with("Pi", DMatrix::from_row_slice(2, 2, &[0.8, 0.2, 0.3, 0.7]))
        .with("a_grid", StateArray::from_vec(vec![0.0, 1.0, 2.0, 3.0]))
        .with("e_grid", StateArray::from_vec(vec![0.0, 0.2]))
        .with("r", 0.01)
        .with("beta", 0.95)
        .with("v", StateArray::zeros(&[2, 4]))
}

/// Two linear savings policies `a` and `b` on a `2 x 12 x 9` grid.
pub fn two_asset_saver() -> HetBlock {
    let f = FnBackward::new(
        "two_asset_saver",
        &["v_p", "Pi_p", "a_grid", "b_grid", "e_grid", "r", "beta"],
        &["v", "a", "b"],
        |args: &Variables| {
            let ev = expectation_along(args.matrix("Pi_p")?, args.array("v_p")?, 0, args.scalar("beta")?);
            let a_grid = args.array("a_grid")?;
            let b_grid = args.array("b_grid")?;
            let e = args.array("e_grid")?;
            let r = args.scalar("r")?;
            let shape = ev.shape().to_vec();
            let a = StateArray::from_fn(&shape, |idx| {
                0.4 * a_grid[idx[1]] + 0.1 * b_grid[idx[2]] + 0.5 * e[idx[0]] + 0.02 * ev.at(idx) + 5.0 * r
            });
            let b = StateArray::from_fn(&shape, |idx| {
                0.3 * b_grid[idx[2]] + 0.1 * a_grid[idx[1]] + 0.5 + 3.0 * r
            });
            let v = StateArray::from_fn(&shape, |idx| {
                (1.0 + r) * (a_grid[idx[1]] + b_grid[idx[2]]) + 0.5 * ev.at(idx)
            });
            Ok(vec![Value::from(v), a.into(), b.into()])
        },
    );
    HetBlock::new(f, &["Pi"], &["a", "b"], &["v"]).expect("two asset saver block")
}

pub fn two_asset_saver_inputs() -> Variables {
    Variables::new()
        .with("Pi", DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]))
        .with("a_grid", linspace(0.0, 6.0, 12))
        .with("b_grid", linspace(0.0, 4.0, 9))
        .with("e_grid", StateArray::from_vec(vec![0.5, 1.5]))
        .with("r", 0.01)
        .with("beta", 0.95)
        .with("v", StateArray::zeros(&[2, 12, 9]))
}

/// One savings policy driven by two independent exogenous chains `Pi` and `Z`.
pub fn two_shock_saver() -> HetBlock {
    let f = FnBackward::new(
        "two_shock_saver",
        &["v_p", "Pi_p", "Z_p", "a_grid", "e_grid", "z_grid", "r", "beta"],
        &["v", "a"],
        |args: &Variables| {
            let ez = expectation_along(args.matrix("Z_p")?, args.array("v_p")?, 1, 1.0);
            let ev = expectation_along(args.matrix("Pi_p")?, &ez, 0, args.scalar("beta")?);
            let grid = args.array("a_grid")?;
            let e = args.array("e_grid")?;
            let z = args.array("z_grid")?;
            let r = args.scalar("r")?;
            let shape = ev.shape().to_vec();
            let a = StateArray::from_fn(&shape, |idx| {
                0.4 * grid[idx[2]] + 0.2 * e[idx[0]] + 0.1 * z[idx[1]] + 0.05 * ev.at(idx) + 5.0 * r
            });
            let v = StateArray::from_fn(&shape, |idx| (1.0 + r) * grid[idx[2]] + 0.5 * ev.at(idx));
            Ok(vec![Value::from(v), a.into()])
        },
    );
    HetBlock::new(f, &["Pi", "Z"], &["a"], &["v"]).expect("two shock saver block")
}

pub fn two_shock_saver_inputs() -> Variables {
    Variables::new()
        .with("Pi", DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.1, 0.9]))
        .with(
            "Z",
            DMatrix::from_row_slice(3, 3, &[0.7, 0.2, 0.1, 0.25, 0.5, 0.25, 0.1, 0.3, 0.6]),
        )
        .with("a_grid", linspace(0.0, 10.0, 30))
        .with("e_grid", StateArray::from_vec(vec![0.5, 1.5]))
        .with("z_grid", StateArray::from_vec(vec![0.0, 1.0, 2.0]))
        .with("r", 0.01)
        .with("beta", 0.95)
        .with("v", StateArray::zeros(&[2, 3, 30]))
}

/// Largest absolute entry difference relative to the largest entry of `expected`.
pub fn relative_gap(actual: &DMatrix<f64>, expected: &DMatrix<f64>) -> f64 {
    let scale = expected.amax().max(1e-12);
    (actual - expected).amax() / scale
}

/// Deterministic values in `[0, 1)` for operator identities.
pub fn noise(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}
