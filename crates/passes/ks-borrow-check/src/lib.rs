//! Loan & alias checking
//!
//! Forward dataflow over the CFG where the state at each point is the set of
//! live loans. A new borrow is checked against every live loan on an
//! overlapping place: Shared+Shared is never a conflict, any pairing that
//! involves an Exclusive loan is. Loans die when their solved region span
//! ends or when the underlying place is moved or reassigned, the move or
//! reassignment itself being rejected while loans are outstanding.

mod checker;
mod error;
mod loans;

pub use checker::BorrowChecker;
pub use error::{BorrowError, BorrowResult};
pub use loans::{Loan, LoanId, gather_loans};
