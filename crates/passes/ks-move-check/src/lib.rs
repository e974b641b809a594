//! Move-state tracking
//!
//! Forward dataflow over a four-point per-place lattice recording whether a
//! value is present: `Uninit` before first assignment, `Init` once assigned,
//! `Moved` after an unconditional move, `MaybeMoved` when control-flow merges
//! disagree. Any read of a place that is not provably `Init` is rejected; the
//! analysis continues with the pre-violation state so independent errors in
//! one function surface in one run.

mod error;
mod tracker;

pub use error::{MoveError, MoveResult};
pub use tracker::{MoveMap, MoveResults, MoveState, MoveTracker};
