//! Borrow checking error types.

use crate::loans::Loan;
use ks_mir::Place;
use ks_span::FileSpan;
use thiserror::Error;

/// Result type for borrow checking operations.
///
/// Borrow checking can produce multiple errors, so we collect them all.
pub type BorrowResult<T> = Result<T, Vec<BorrowError>>;

/// Borrow conflicts: two incompatible loans, or an operation on a place with
/// outstanding loans.
#[derive(Debug, Clone, Error)]
pub enum BorrowError {
    /// A new borrow overlaps a live loan and at least one side is exclusive.
    #[error("cannot borrow: conflicting borrow is still live")]
    ConflictingBorrow {
        /// The new loan being created
        new_loan: Loan,
        /// The live loan it conflicts with
        existing_loan: Loan,
    },

    /// Assignment to a place with a live loan.
    #[error("cannot assign: place is borrowed")]
    WriteWhileBorrowed {
        /// The place being written to
        place: Place,
        /// The live loan preventing the write
        loan: Loan,
        /// Location of the write
        write_span: FileSpan,
    },

    /// Moving out of a place with a live loan.
    #[error("cannot move out of borrowed place")]
    MoveWhileBorrowed {
        /// The place being moved
        place: Place,
        /// The live loan preventing the move
        loan: Loan,
        /// Location of the move
        move_span: FileSpan,
    },

    /// Reading a place while an exclusive loan of it is live.
    #[error("cannot use: place is exclusively borrowed")]
    UseWhileExclusivelyBorrowed {
        /// The place being read
        place: Place,
        /// The live exclusive loan
        loan: Loan,
        /// Location of the read
        use_span: FileSpan,
    },
}

impl BorrowError {
    /// Returns the primary source location for this error.
    pub fn span(&self) -> FileSpan {
        match self {
            Self::ConflictingBorrow { new_loan, .. } => new_loan.span,
            Self::WriteWhileBorrowed { write_span, .. } => *write_span,
            Self::MoveWhileBorrowed { move_span, .. } => *move_span,
            Self::UseWhileExclusivelyBorrowed { use_span, .. } => *use_span,
        }
    }

    /// Returns a detailed message explaining the error.
    pub fn detailed_message(&self) -> String {
        match self {
            Self::ConflictingBorrow {
                new_loan,
                existing_loan,
            } => format!(
                "cannot borrow {:?} as {:?} because it is already borrowed as {:?}",
                new_loan.place, new_loan.kind, existing_loan.kind
            ),
            Self::WriteWhileBorrowed { place, loan, .. } => format!(
                "cannot assign to {:?} because it is borrowed as {:?}",
                place, loan.kind
            ),
            Self::MoveWhileBorrowed { place, loan, .. } => format!(
                "cannot move out of {:?} because it is borrowed as {:?}",
                place, loan.kind
            ),
            Self::UseWhileExclusivelyBorrowed { place, .. } => {
                format!("cannot use {place:?} while it is exclusively borrowed")
            }
        }
    }
}
