//! Main loan checking implementation.

use crate::{
    error::{BorrowError, BorrowResult},
    loans::{Loan, LoanId, gather_loans},
};
use ks_mir::{
    CfgFunction, Location, Operand, Place, RValue, Statement, Terminator, places_overlap,
};
use ks_regions::RegionSolution;
use ks_span::FileSpan;
use rustc_hash::{FxHashMap, FxHashSet};

/// Deduplication key for diagnostics, so a loop body does not repeat the
/// same report per iteration.
#[derive(Hash, Eq, PartialEq)]
enum ReportKey {
    /// Conflicting loan pair, ordered
    Pair(LoanId, LoanId),
    /// Write over a loan at a point
    Write(LoanId, Location),
    /// Move over a loan at a point
    Move(LoanId, Location),
    /// Read over an exclusive loan at a point
    Use(LoanId, Location),
}

/// Flow-sensitive loan checker for one function.
///
/// The checker runs a forward dataflow whose state is the set of live loans;
/// loop back-edges are iterated to a fixpoint, which terminates because the
/// live set is monotone under union and bounded by the total loan count.
pub struct BorrowChecker<'mir> {
    function: &'mir CfgFunction,
    solution: &'mir RegionSolution,
    loans: Vec<Loan>,
    loan_at: FxHashMap<Location, LoanId>,
    /// Live-loan set at each block entry
    entry: Vec<FxHashSet<LoanId>>,
    errors: Vec<BorrowError>,
    reported: FxHashSet<ReportKey>,
}

impl<'mir> BorrowChecker<'mir> {
    /// Runs loan checking on a function against its solved regions.
    ///
    /// # Errors
    ///
    /// Returns all borrow conflicts found in the function. Analysis continues
    /// past each violation using the pre-violation state, so independent
    /// errors are all reported in one pass.
    pub fn check(function: &'mir CfgFunction, solution: &'mir RegionSolution) -> BorrowResult<()> {
        let loans = gather_loans(function);
        let loan_at = loans
            .iter()
            .map(|loan| (loan.issued_at, loan.id))
            .collect();
        let mut checker = Self {
            function,
            solution,
            loans,
            loan_at,
            entry: vec![FxHashSet::default(); function.basic_blocks.len()],
            errors: Vec::new(),
            reported: FxHashSet::default(),
        };
        checker.run();

        if checker.errors.is_empty() {
            Ok(())
        } else {
            checker.errors.sort_by_key(|error| {
                let span = error.span();
                (span.file.0, span.span.start, span.span.end)
            });
            Err(checker.errors)
        }
    }

    /// Iterates reachable blocks to a fixpoint over live-loan entry sets.
    fn run(&mut self) {
        let entry_block = self.function.entry_block;
        let mut visited = vec![false; self.function.basic_blocks.len()];
        visited[entry_block] = true;
        let mut worklist = vec![entry_block];

        while let Some(block_id) = worklist.pop() {
            let mut state = self.entry[block_id].clone();
            self.transfer_block(block_id, &mut state);
            for succ in self.function.successors(block_id) {
                let mut changed = false;
                for loan in &state {
                    changed |= self.entry[succ].insert(*loan);
                }
                if changed || !visited[succ] {
                    visited[succ] = true;
                    worklist.push(succ);
                }
            }
        }
    }

    fn transfer_block(&mut self, block_id: usize, state: &mut FxHashSet<LoanId>) {
        let function = self.function;
        let block = &function.basic_blocks[block_id];

        for (idx, stmt) in block.statements.iter().enumerate() {
            let location = Location::new(block_id, idx);
            self.kill_expired(state, location);

            match stmt {
                Statement::Assign {
                    place,
                    rvalue,
                    span,
                } => {
                    let new_loan = match rvalue {
                        RValue::Use(operand) => {
                            self.check_operand(state, operand, *span, location);
                            None
                        }
                        RValue::Call { args, .. } => {
                            for arg in args {
                                self.check_operand(state, arg, *span, location);
                            }
                            None
                        }
                        RValue::Ref { .. } => {
                            let id = self.loan_at[&location];
                            self.check_new_loan(state, id);
                            Some(id)
                        }
                    };

                    self.check_write(state, place, *span, location, new_loan);
                    // Reassignment kills outstanding loans of the place.
                    let loans = &self.loans;
                    state.retain(|id| {
                        Some(*id) == new_loan
                            || !places_overlap(&loans[id.0 as usize].place, place)
                    });
                    if let Some(id) = new_loan {
                        state.insert(id);
                    }
                }

                Statement::Drop { place, .. } => {
                    // Elaborated drops read the value; outstanding loans of
                    // the place make the drop a conflict.
                    let span = function.span;
                    self.check_write(state, place, span, location, None);
                }

                Statement::StorageDead(local) => {
                    // Scope end: loans of the dead local cannot stay live.
                    let loans = &self.loans;
                    state.retain(|id| loans[id.0 as usize].place.local != *local);
                }

                Statement::StorageLive(_) | Statement::Nop => {}
            }
        }

        let location = function.terminator_location(block_id);
        self.kill_expired(state, location);
        match &block.terminator {
            Terminator::Branch {
                condition, span, ..
            } => self.check_operand(state, condition, *span, location),
            Terminator::Return {
                value: Some(operand),
                span,
            } => self.check_operand(state, operand, *span, location),
            Terminator::Return { value: None, .. }
            | Terminator::Goto(_)
            | Terminator::Unreachable => {}
        }
    }

    /// Removes loans whose solved region span has ended.
    fn kill_expired(&self, state: &mut FxHashSet<LoanId>, location: Location) {
        let loans = &self.loans;
        let solution = self.solution;
        state.retain(|id| solution.contains(loans[id.0 as usize].region, location));
    }

    /// Checks a fresh loan against every live loan on an overlapping place.
    fn check_new_loan(&mut self, state: &FxHashSet<LoanId>, new_id: LoanId) {
        let mut conflicts = Vec::new();
        {
            let new_loan = &self.loans[new_id.0 as usize];
            for &existing in state.iter() {
                if new_loan.conflicts_with(&self.loans[existing.0 as usize]) {
                    conflicts.push(existing);
                }
            }
        }
        for existing in conflicts {
            let key = ReportKey::Pair(new_id.min(existing), new_id.max(existing));
            if self.reported.insert(key) {
                self.errors.push(BorrowError::ConflictingBorrow {
                    new_loan: self.loans[new_id.0 as usize].clone(),
                    existing_loan: self.loans[existing.0 as usize].clone(),
                });
            }
        }
    }

    /// Checks a read for conflicts with live loans and applies move kills.
    ///
    /// Reports are keyed on the offending point, so revisiting a statement
    /// across a loop back-edge stays deduplicated while distinct offending
    /// statements against the same loan each get their own diagnostic.
    fn check_operand(
        &mut self,
        state: &mut FxHashSet<LoanId>,
        operand: &Operand,
        span: FileSpan,
        location: Location,
    ) {
        match operand {
            Operand::Move(place) => {
                let mut offending = Vec::new();
                for &id in state.iter() {
                    if places_overlap(&self.loans[id.0 as usize].place, place) {
                        offending.push(id);
                    }
                }
                for id in offending {
                    let key = ReportKey::Move(id, location);
                    if self.reported.insert(key) {
                        self.errors.push(BorrowError::MoveWhileBorrowed {
                            place: place.clone(),
                            loan: self.loans[id.0 as usize].clone(),
                            move_span: span,
                        });
                    }
                }
                // The move deinitializes the place; its loans die with it.
                let loans = &self.loans;
                state.retain(|id| !places_overlap(&loans[id.0 as usize].place, place));
            }

            Operand::Copy(place) => {
                let mut offending = Vec::new();
                for &id in state.iter() {
                    let loan = &self.loans[id.0 as usize];
                    if loan.kind == ks_mir::BorrowKind::Exclusive
                        && places_overlap(&loan.place, place)
                    {
                        offending.push(id);
                    }
                }
                for id in offending {
                    let key = ReportKey::Use(id, location);
                    if self.reported.insert(key) {
                        self.errors.push(BorrowError::UseWhileExclusivelyBorrowed {
                            place: place.clone(),
                            loan: self.loans[id.0 as usize].clone(),
                            use_span: span,
                        });
                    }
                }
            }

            Operand::Constant(_) => {}
        }
    }

    /// Checks a write against live loans, excluding the loan being created
    /// by the same statement.
    fn check_write(
        &mut self,
        state: &FxHashSet<LoanId>,
        place: &Place,
        span: FileSpan,
        location: Location,
        exclude: Option<LoanId>,
    ) {
        let mut offending = Vec::new();
        for &id in state.iter() {
            if Some(id) == exclude {
                continue;
            }
            if places_overlap(&self.loans[id.0 as usize].place, place) {
                offending.push(id);
            }
        }
        for id in offending {
            let key = ReportKey::Write(id, location);
            if self.reported.insert(key) {
                self.errors.push(BorrowError::WriteWhileBorrowed {
                    place: place.clone(),
                    loan: self.loans[id.0 as usize].clone(),
                    write_span: span,
                });
            }
        }
    }
}
