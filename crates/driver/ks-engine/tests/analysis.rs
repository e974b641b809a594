//! End-to-end pipeline scenarios: each one lowers a small function by hand,
//! runs the full analysis, and checks the verdict.

use ks_borrow_check::BorrowError;
use ks_engine::{Diagnostic, analyze_function, analyze_program};
use ks_intern::Interner;
use ks_mir::build::CfgBuilder;
use ks_mir::{BorrowKind, CfgFunction, Operand, Place, Statement, Terminator, Ty};
use ks_move_check::MoveError;
use ks_regions::LifetimeError;
use ks_span::{FileId, FileSpan, Span};
use ks_types::TypeGraph;

fn span() -> FileSpan {
    FileSpan::new(FileId(0), Span::new(0, 0))
}

fn shared_ref(inner: Ty) -> Ty {
    Ty::Ref {
        kind: BorrowKind::Shared,
        inner: Box::new(inner),
        lifetime: None,
    }
}

fn exclusive_ref(inner: Ty) -> Ty {
    Ty::Ref {
        kind: BorrowKind::Exclusive,
        inner: Box::new(inner),
        lifetime: None,
    }
}

/// A graph holding one resource-owning type.
fn owned_graph(interner: &Interner) -> (TypeGraph, Ty) {
    let mut graph = TypeGraph::new();
    let id = graph.declare(interner.intern("Buffer"));
    if let Some(def) = graph.get_mut(id) {
        def.has_destructor = true;
    }
    (graph, Ty::Named(id))
}

/// `fn scoped(input: Buffer) { { let held = input; } }`
fn clean_scoped_function(interner: &Interner, buffer_ty: &Ty) -> CfgFunction {
    let mut builder = CfgBuilder::new(interner.intern("scoped"), Ty::Unit, span());
    let input = builder.param(interner.intern("input"), buffer_ty.clone(), false);
    builder.begin_scope();
    let held = builder.local(interner.intern("held"), buffer_ty.clone(), false);
    builder.assign(
        Place::from_local(held),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.end_scope();
    builder.terminate(Terminator::Return { value: None, span: span() });
    builder.finish()
}

#[test]
fn accepted_function_is_elaborated_and_reanalysis_is_idempotent() {
    let interner = Interner::new();
    let (graph, buffer_ty) = owned_graph(&interner);
    let function = clean_scoped_function(&interner, &buffer_ty);

    let first = analyze_function(&function, &graph);
    assert!(first.is_clean(), "{:?}", first.diagnostics);
    let elaborated = first.elaborated.as_ref().expect("clean functions are elaborated");
    assert!(
        elaborated
            .basic_blocks
            .iter()
            .flat_map(|block| &block.statements)
            .any(|stmt| matches!(stmt, Statement::Drop { .. })),
        "the held value receives a drop"
    );

    // The input is immutable; analyzing it again must find nothing new.
    let second = analyze_function(&function, &graph);
    assert!(second.is_clean());
    assert_eq!(
        second.elaborated.as_ref().map(|f| &f.basic_blocks),
        first.elaborated.as_ref().map(|f| &f.basic_blocks),
    );
}

#[test]
fn unconditional_move_then_use_is_rejected() {
    let interner = Interner::new();
    let (graph, buffer_ty) = owned_graph(&interner);
    let mut builder = CfgBuilder::new(interner.intern("double"), Ty::Unit, span());
    let input = builder.param(interner.intern("input"), buffer_ty.clone(), false);
    let first = builder.local(interner.intern("first"), buffer_ty.clone(), false);
    let second = builder.local(interner.intern("second"), buffer_ty, false);
    builder.assign(
        Place::from_local(first),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.assign(
        Place::from_local(second),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.terminate(Terminator::Return { value: None, span: span() });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert_eq!(analysis.diagnostics.len(), 1);
    assert!(matches!(
        analysis.diagnostics[0],
        Diagnostic::Move(MoveError::UseAfterMove { .. })
    ));
    assert!(analysis.elaborated.is_none(), "rejected functions are not elaborated");
}

#[test]
fn one_branch_move_then_merge_use_is_possibly_moved() {
    let interner = Interner::new();
    let (graph, buffer_ty) = owned_graph(&interner);
    let mut builder = CfgBuilder::new(interner.intern("forked"), Ty::Unit, span());
    let condition = builder.param(interner.intern("condition"), Ty::Bool, false);
    let input = builder.param(interner.intern("input"), buffer_ty.clone(), false);
    let taken = builder.local(interner.intern("taken"), buffer_ty.clone(), false);
    let after = builder.local(interner.intern("after"), buffer_ty, false);
    let then_bb = builder.block();
    let join_bb = builder.block();
    builder.terminate(Terminator::Branch {
        condition: Operand::Copy(Place::from_local(condition)),
        then_bb,
        else_bb: join_bb,
        span: span(),
    });
    builder.switch_to(then_bb);
    builder.assign(
        Place::from_local(taken),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.terminate(Terminator::Goto(join_bb));
    builder.switch_to(join_bb);
    builder.assign(
        Place::from_local(after),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.terminate(Terminator::Return { value: None, span: span() });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert_eq!(analysis.diagnostics.len(), 1);
    assert!(matches!(
        analysis.diagnostics[0],
        Diagnostic::Move(MoveError::UseOfPossiblyMoved { .. })
    ));
}

#[test]
fn two_shared_borrows_are_accepted() {
    let interner = Interner::new();
    let graph = TypeGraph::new();
    let mut builder = CfgBuilder::new(interner.intern("readers"), Ty::Unit, span());
    let value = builder.local(interner.intern("value"), Ty::Int, false);
    let first = builder.temp(shared_ref(Ty::Int));
    let second = builder.temp(shared_ref(Ty::Int));
    let sink = builder.temp(Ty::Unit);
    builder.assign(
        Place::from_local(value),
        Operand::Constant(ks_mir::Constant::Int(1)),
        span(),
    );
    builder.borrow(
        Place::from_local(first),
        BorrowKind::Shared,
        Place::from_local(value),
        span(),
    );
    builder.borrow(
        Place::from_local(second),
        BorrowKind::Shared,
        Place::from_local(value),
        span(),
    );
    builder.call(
        Place::from_local(sink),
        interner.intern("read_both"),
        vec![
            Operand::Copy(Place::from_local(first)),
            Operand::Copy(Place::from_local(second)),
        ],
        span(),
    );
    builder.terminate(Terminator::Return { value: None, span: span() });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert!(analysis.is_clean(), "{:?}", analysis.diagnostics);
}

#[test]
fn exclusive_borrow_crossing_a_live_shared_borrow_is_rejected() {
    let interner = Interner::new();
    let graph = TypeGraph::new();
    let mut builder = CfgBuilder::new(interner.intern("crossed"), Ty::Unit, span());
    let value = builder.local(interner.intern("value"), Ty::Int, true);
    let reader = builder.temp(shared_ref(Ty::Int));
    let writer = builder.temp(exclusive_ref(Ty::Int));
    let sink = builder.temp(Ty::Unit);
    builder.assign(
        Place::from_local(value),
        Operand::Constant(ks_mir::Constant::Int(1)),
        span(),
    );
    builder.borrow(
        Place::from_local(reader),
        BorrowKind::Shared,
        Place::from_local(value),
        span(),
    );
    builder.borrow(
        Place::from_local(writer),
        BorrowKind::Exclusive,
        Place::from_local(value),
        span(),
    );
    builder.call(
        Place::from_local(sink),
        interner.intern("read"),
        vec![Operand::Copy(Place::from_local(reader))],
        span(),
    );
    builder.terminate(Terminator::Return { value: None, span: span() });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert_eq!(analysis.diagnostics.len(), 1);
    assert!(matches!(
        analysis.diagnostics[0],
        Diagnostic::Borrow(BorrowError::ConflictingBorrow { .. })
    ));
}

#[test]
fn returning_a_borrow_of_a_local_is_rejected() {
    let interner = Interner::new();
    let graph = TypeGraph::new();
    let mut builder = CfgBuilder::new(interner.intern("escape"), shared_ref(Ty::Int), span());
    let value = builder.local(interner.intern("value"), Ty::Int, false);
    let reference = builder.temp(shared_ref(Ty::Int));
    builder.assign(
        Place::from_local(value),
        Operand::Constant(ks_mir::Constant::Int(7)),
        span(),
    );
    builder.borrow(
        Place::from_local(reference),
        BorrowKind::Shared,
        Place::from_local(value),
        span(),
    );
    builder.terminate(Terminator::Return {
        value: Some(Operand::Move(Place::from_local(reference))),
        span: span(),
    });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert_eq!(analysis.diagnostics.len(), 1);
    assert!(matches!(
        analysis.diagnostics[0],
        Diagnostic::Lifetime(LifetimeError::ReturnOfBorrowedLocal { .. })
    ));
}

#[test]
fn program_analysis_keeps_functions_independent_and_derives_markers() {
    let interner = Interner::new();
    let mut graph = TypeGraph::new();
    let buffer = graph.declare(interner.intern("Buffer"));
    if let Some(def) = graph.get_mut(buffer) {
        def.has_destructor = true;
    }
    // A Send-only recursive list must derive without divergence.
    let list = graph.declare(interner.intern("List"));
    if let Some(def) = graph.get_mut(list) {
        def.fields = vec![ks_types::FieldTy::Prim, ks_types::FieldTy::Named(list)];
    }
    let buffer_ty = Ty::Named(buffer);

    let clean = clean_scoped_function(&interner, &buffer_ty);
    let broken = {
        let mut builder = CfgBuilder::new(interner.intern("broken"), Ty::Unit, span());
        let value = builder.local(interner.intern("value"), Ty::Int, false);
        let out = builder.local(interner.intern("out"), Ty::Int, false);
        builder.assign(
            Place::from_local(out),
            Operand::Copy(Place::from_local(value)),
            span(),
        );
        builder.terminate(Terminator::Return { value: None, span: span() });
        builder.finish()
    };

    let analysis = analyze_program(&[clean, broken], &graph);
    assert!(!analysis.is_clean());
    assert_eq!(analysis.functions.len(), 2);
    assert!(analysis.functions[0].is_clean());
    assert!(analysis.functions[0].elaborated.is_some());
    assert!(matches!(
        analysis.functions[1].diagnostics[0],
        Diagnostic::Move(MoveError::UseOfUninitialized { .. })
    ));
    assert!(analysis.functions[1].elaborated.is_none());

    assert!(analysis.markers.get(list).send);
    assert!(analysis.markers.get(list).sync);
}

#[test]
fn conditional_move_elaborates_a_guarded_drop() {
    let interner = Interner::new();
    let (graph, buffer_ty) = owned_graph(&interner);
    let mut builder = CfgBuilder::new(interner.intern("maybe"), Ty::Unit, span());
    let condition = builder.param(interner.intern("condition"), Ty::Bool, false);
    let input = builder.param(interner.intern("input"), buffer_ty.clone(), false);
    let taken = builder.local(interner.intern("taken"), buffer_ty, false);
    let then_bb = builder.block();
    let join_bb = builder.block();
    builder.terminate(Terminator::Branch {
        condition: Operand::Copy(Place::from_local(condition)),
        then_bb,
        else_bb: join_bb,
        span: span(),
    });
    builder.switch_to(then_bb);
    builder.assign(
        Place::from_local(taken),
        Operand::Move(Place::from_local(input)),
        span(),
    );
    builder.terminate(Terminator::Goto(join_bb));
    builder.switch_to(join_bb);
    builder.terminate(Terminator::Return { value: None, span: span() });
    let function = builder.finish();

    let analysis = analyze_function(&function, &graph);
    assert!(analysis.is_clean(), "{:?}", analysis.diagnostics);
    let elaborated = analysis.elaborated.expect("clean");
    let guarded = elaborated
        .basic_blocks
        .iter()
        .flat_map(|block| &block.statements)
        .any(|stmt| matches!(stmt, Statement::Drop { guard: Some(_), .. }));
    assert!(guarded, "the conditionally-moved value gets a flag-guarded drop");
}
