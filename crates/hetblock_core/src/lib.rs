//! The `hetblock_core` crate solves heterogeneous-agent blocks defined by a
//! single-agent backward iteration.
//!
//! Key components:
//! - **Block**: `HetBlock` validates a backward function's interface and runs steady states.
//! - **Lottery**: Grid search placing continuous policies on two bracketing gridpoints.
//! - **Transition**: Forward, transposed and linearized laws of motion of the distribution.
//! - **Jacobian**: The fake-news algorithm for sequence-space Jacobians, plus a brute-force check.

pub mod array;
pub mod backward;
pub mod block;
pub mod error;
pub mod impulse;
pub mod jacobian;
pub mod lottery;
pub mod markov;
pub mod steady_state;
pub mod transition;
pub mod variables;

pub use array::StateArray;
pub use backward::{BackwardFunction, BackwardFunctionSpec, FnBackward, Policy};
pub use block::HetBlock;
pub use error::{HetBlockError, Result};
pub use impulse::ShockPaths;
pub use jacobian::{DifferenceScheme, JacobianSettings, Jacobians, Shock};
pub use lottery::{Grid, PolicyLottery};
pub use markov::StationarySettings;
pub use steady_state::{Aggregate, SteadyState, SteadyStateSettings};
pub use transition::{EndoLottery, TransitionOperator, WeightShock};
pub use variables::{Value, Variables};
