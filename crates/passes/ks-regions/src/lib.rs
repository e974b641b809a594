//! Region/outlives constraint solving
//!
//! Every borrow expression owns a region: the set of program points over
//! which the borrow must remain valid. The solver seeds each region from a
//! backward liveness pass over the borrowing reference's own place, collects
//! outlives constraints from reborrows, and grows the point sets to a
//! fixpoint. Declared generic lifetime parameters become universal regions
//! covering the whole body; obligations derived against them must be
//! dominated by the declared bounds under the position's variance, otherwise
//! the function is rejected.

mod error;
mod solver;

pub use error::LifetimeError;
pub use solver::{RegionResults, RegionSolution, RegionSolver, universal_region};
