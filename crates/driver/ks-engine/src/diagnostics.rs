//! Unified diagnostic surface over the per-pass error enums.

use ks_borrow_check::BorrowError;
use ks_move_check::MoveError;
use ks_regions::LifetimeError;
use ks_span::FileSpan;
use thiserror::Error;

/// Any diagnostic the analysis can attach to a function.
///
/// Nothing is downgraded: every per-pass error surfaces to the caller, and a
/// diagnostic on one function never blocks analysis of another.
#[derive(Debug, Clone, Error)]
pub enum Diagnostic {
    /// A lifetime/outlives violation
    #[error(transparent)]
    Lifetime(#[from] LifetimeError),
    /// A borrow conflict
    #[error(transparent)]
    Borrow(#[from] BorrowError),
    /// An initialization/move violation
    #[error(transparent)]
    Move(#[from] MoveError),
}

impl Diagnostic {
    /// Returns the primary source location for this diagnostic.
    pub fn span(&self) -> FileSpan {
        match self {
            Self::Lifetime(error) => error.span(),
            Self::Borrow(error) => error.span(),
            Self::Move(error) => error.span(),
        }
    }

    /// Returns a detailed message explaining the diagnostic.
    pub fn detailed_message(&self) -> String {
        match self {
            Self::Lifetime(error) => error.detailed_message(),
            Self::Borrow(error) => error.detailed_message(),
            Self::Move(error) => error.detailed_message(),
        }
    }
}
