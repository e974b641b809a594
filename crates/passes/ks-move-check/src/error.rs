//! Move checking error types.

use ks_mir::Place;
use ks_span::FileSpan;
use thiserror::Error;

/// Result type for move checking operations.
///
/// Move checking can produce multiple errors, so we collect them all.
pub type MoveResult<T> = Result<T, Vec<MoveError>>;

/// Initialization violations: reading a place whose value is absent or only
/// conditionally present.
#[derive(Debug, Clone, Error)]
pub enum MoveError {
    /// Reading, borrowing, or re-moving a place after it was moved out on
    /// every incoming path.
    #[error("use of moved value")]
    UseAfterMove {
        /// The place being used
        place: Place,
        /// Location of the offending use
        use_span: FileSpan,
    },

    /// Reading a place that was moved out on some but not all incoming paths.
    #[error("use of possibly-moved value")]
    UseOfPossiblyMoved {
        /// The place being used
        place: Place,
        /// Location of the offending use
        use_span: FileSpan,
    },

    /// Reading a place before its first assignment.
    #[error("use of uninitialized value")]
    UseOfUninitialized {
        /// The place being used
        place: Place,
        /// Location of the offending use
        use_span: FileSpan,
    },
}

impl MoveError {
    /// Returns the primary source location for this error.
    pub fn span(&self) -> FileSpan {
        match self {
            Self::UseAfterMove { use_span, .. }
            | Self::UseOfPossiblyMoved { use_span, .. }
            | Self::UseOfUninitialized { use_span, .. } => *use_span,
        }
    }

    /// Returns a detailed message explaining the error.
    pub fn detailed_message(&self) -> String {
        match self {
            Self::UseAfterMove { place, .. } => {
                format!("{place:?} was moved out and not reassigned before this use")
            }
            Self::UseOfPossiblyMoved { place, .. } => format!(
                "{place:?} is moved out on some control-flow paths reaching this use"
            ),
            Self::UseOfUninitialized { place, .. } => {
                format!("{place:?} is read before it is ever assigned")
            }
        }
    }
}
