//! Lifetime error types.

use ks_mir::{Place, RegionId};
use ks_span::FileSpan;
use thiserror::Error;

/// Errors produced by region solving.
#[derive(Debug, Clone, Error)]
pub enum LifetimeError {
    /// A region cannot satisfy a declared or inferred outlives obligation.
    ///
    /// Raised when a borrow must remain valid for a span the declared
    /// lifetime bounds do not dominate, or when a reference of unknown
    /// provenance would have to escape the function.
    #[error("lifetime may not live long enough")]
    LifetimeTooShort {
        /// The region whose solved span falls short of the obligation
        region: RegionId,
        /// Where the obligation arises
        span: FileSpan,
    },

    /// A region would have to outlive the function it was created in.
    ///
    /// Returning (or storing through a caller-provided reference) a borrow
    /// of function-local storage.
    #[error("cannot return a borrow of a function-local value")]
    ReturnOfBorrowedLocal {
        /// The local place that was borrowed
        place: Place,
        /// Where the borrow was created
        borrow_span: FileSpan,
        /// Where the borrow escapes
        escape_span: FileSpan,
    },
}

impl LifetimeError {
    /// Returns the primary source location for this error.
    pub fn span(&self) -> FileSpan {
        match self {
            Self::LifetimeTooShort { span, .. } => *span,
            Self::ReturnOfBorrowedLocal { escape_span, .. } => *escape_span,
        }
    }

    /// Returns a detailed message explaining the error.
    pub fn detailed_message(&self) -> String {
        match self {
            Self::LifetimeTooShort { region, .. } => format!(
                "the borrow in region {region:?} must outlive the declared bounds, \
                 but no declared bound guarantees it"
            ),
            Self::ReturnOfBorrowedLocal { place, .. } => format!(
                "{place:?} is owned by this function, so a borrow of it cannot leave"
            ),
        }
    }
}
