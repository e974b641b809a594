//! Loan representation and gathering.

use ks_mir::{BorrowKind, CfgFunction, Location, Place, RegionId, places_overlap};
use ks_span::FileSpan;

/// Identifies a loan within one function's gathered loan list.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct LoanId(pub u32);

/// A borrow with its kind and owning region.
///
/// A loan is live at a program point when that point lies within the solved
/// span of its region.
#[derive(Debug, Clone, PartialEq)]
pub struct Loan {
    /// Loan ID, indexing the function's loan list
    pub id: LoanId,
    /// Region allocated for the borrow expression
    pub region: RegionId,
    /// The borrowed place
    pub place: Place,
    /// Kind of borrow
    pub kind: BorrowKind,
    /// Where the loan was issued
    pub issued_at: Location,
    /// Source location of the borrow expression
    pub span: FileSpan,
}

impl Loan {
    /// Whether two simultaneously live loans are illegal.
    ///
    /// Loans conflict when their places overlap and at least one side is
    /// exclusive.
    pub fn conflicts_with(&self, other: &Loan) -> bool {
        if !places_overlap(&self.place, &other.place) {
            return false;
        }
        self.kind == BorrowKind::Exclusive || other.kind == BorrowKind::Exclusive
    }
}

/// Collects every loan in the function, in program order.
pub fn gather_loans(function: &CfgFunction) -> Vec<Loan> {
    function
        .borrow_sites()
        .into_iter()
        .enumerate()
        .map(|(index, site)| Loan {
            id: LoanId(index as u32),
            region: site.region,
            place: site.place,
            kind: site.kind,
            issued_at: site.location,
            span: site.span,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_mir::LocalId;
    use ks_span::{FileId, Span};

    fn loan(id: u32, kind: BorrowKind, place: Place) -> Loan {
        Loan {
            id: LoanId(id),
            region: RegionId(id),
            place,
            kind,
            issued_at: Location::new(0, id as usize),
            span: FileSpan::new(FileId(0), Span::new(0, 0)),
        }
    }

    #[test]
    fn shared_loans_never_conflict() {
        let first = loan(0, BorrowKind::Shared, Place::from_local(LocalId(0)));
        let second = loan(1, BorrowKind::Shared, Place::from_local(LocalId(0)));
        assert!(!first.conflicts_with(&second));
    }

    #[test]
    fn exclusive_conflicts_with_overlapping_shared() {
        let shared = loan(0, BorrowKind::Shared, Place::from_local(LocalId(0)));
        let exclusive = loan(
            1,
            BorrowKind::Exclusive,
            Place::from_local(LocalId(0)).field(2),
        );
        assert!(shared.conflicts_with(&exclusive));
        assert!(exclusive.conflicts_with(&shared));
    }

    #[test]
    fn disjoint_places_do_not_conflict() {
        let first = loan(
            0,
            BorrowKind::Exclusive,
            Place::from_local(LocalId(0)).field(0),
        );
        let second = loan(
            1,
            BorrowKind::Exclusive,
            Place::from_local(LocalId(0)).field(1),
        );
        assert!(!first.conflicts_with(&second));
    }
}
