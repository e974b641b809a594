//! Analysis driver
//!
//! Runs the full ownership pipeline over a typed program: region solving,
//! loan checking, and move checking per function, drop elaboration for the
//! functions that come out clean, and Send/Sync derivation once over the
//! whole type graph. Functions are independent, so the per-function work
//! fans out across a rayon pool; results are collected back in input order
//! so diagnostics are deterministic.

mod diagnostics;

pub use diagnostics::Diagnostic;

use ks_borrow_check::BorrowChecker;
use ks_intern::Symbol;
use ks_markers::{MarkerTable, derive_markers};
use ks_mir::CfgFunction;
use ks_move_check::MoveTracker;
use ks_regions::RegionSolver;
use ks_types::TypeGraph;
use rayon::prelude::*;

/// Everything the analysis produced for one function.
#[derive(Debug)]
pub struct FunctionAnalysis {
    /// Function name
    pub name: Symbol,
    /// All diagnostics, in source order
    pub diagnostics: Vec<Diagnostic>,
    /// The drop-elaborated CFG, present only when the diagnostics are empty
    pub elaborated: Option<CfgFunction>,
}

impl FunctionAnalysis {
    /// Whether the function passed every check.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Whole-program analysis output.
#[derive(Debug)]
pub struct ProgramAnalysis {
    /// Per-function results, in input order
    pub functions: Vec<FunctionAnalysis>,
    /// Derived thread-safety markers for every type
    pub markers: MarkerTable,
}

impl ProgramAnalysis {
    /// Whether every function passed every check.
    pub fn is_clean(&self) -> bool {
        self.functions.iter().all(FunctionAnalysis::is_clean)
    }
}

/// Runs the full pipeline on one function.
///
/// All three checks always run to completion, so one function reports every
/// independent violation in a single pass. Drop elaboration only runs on a
/// clean function; a rejected CFG keeps its original shape so diagnostics
/// point at code the caller actually wrote.
pub fn analyze_function(function: &CfgFunction, graph: &TypeGraph) -> FunctionAnalysis {
    let regions = RegionSolver::solve(function);
    let mut diagnostics: Vec<Diagnostic> =
        regions.errors.into_iter().map(Diagnostic::from).collect();

    if let Err(errors) = BorrowChecker::check(function, &regions.solution) {
        diagnostics.extend(errors.into_iter().map(Diagnostic::from));
    }

    let mut moves = MoveTracker::check(function);
    let move_errors = std::mem::take(&mut moves.errors);
    diagnostics.extend(move_errors.into_iter().map(Diagnostic::from));

    diagnostics.sort_by_key(|diagnostic| {
        let span = diagnostic.span();
        (span.file.0, span.span.start, span.span.end)
    });

    let elaborated = if diagnostics.is_empty() {
        Some(ks_drop_elab::elaborate(function, &moves, graph))
    } else {
        None
    };

    FunctionAnalysis {
        name: function.name,
        diagnostics,
        elaborated,
    }
}

/// Runs the full pipeline on a program.
///
/// Per-function analyses are pure over their immutable inputs and run in
/// parallel; the marker fixpoint runs once afterwards, single-threaded.
pub fn analyze_program(functions: &[CfgFunction], graph: &TypeGraph) -> ProgramAnalysis {
    let functions = functions
        .par_iter()
        .map(|function| analyze_function(function, graph))
        .collect();
    let markers = derive_markers(graph);
    ProgramAnalysis { functions, markers }
}
