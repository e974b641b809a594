//! Drop elaboration
//!
//! Rewrites a checked CFG so that every resource-owning local is destroyed
//! exactly once: a `Drop` is spliced in at the local's scope end and at every
//! return exit where it is still in scope, in reverse declaration order.
//! Final move states decide the shape of each drop: unconditional for a value
//! that is present on every path, omitted for one that is gone on every path,
//! and guarded by a synthesized boolean flag when paths disagree. Flags are
//! set on assignment and cleared on moves, so the guarded drop runs only when
//! the value is actually there.
//!
//! Elaboration cannot fail. The caller only invokes it for functions whose
//! diagnostics are empty, so the move states it consumes are trustworthy.

use ks_mir::{
    CfgFunction, Constant, Local, LocalId, Location, Operand, Place, RValue, Statement,
    Terminator, Ty,
};
use ks_move_check::{MoveResults, MoveState};
use ks_types::TypeGraph;
use rustc_hash::{FxHashMap, FxHashSet};

/// Splices drops and drop flags into a clone of the function.
pub fn elaborate(
    function: &CfgFunction,
    moves: &MoveResults<'_>,
    graph: &TypeGraph,
) -> CfgFunction {
    let owning: Vec<LocalId> = function
        .locals
        .iter()
        .filter(|local| local.ty.needs_drop(graph))
        .map(|local| local.id)
        .collect();
    if owning.is_empty() {
        return function.clone();
    }

    let mut result = function.clone();
    let flags = allocate_flags(&mut result, function, moves, &owning);
    let owning: FxHashSet<LocalId> = owning.into_iter().collect();
    let scope_entry = storage_entry_sets(function);

    for block in &function.basic_blocks {
        let mut stmts = Vec::with_capacity(block.statements.len());
        let mut in_scope = scope_entry[block.id].clone();

        if block.id == function.entry_block {
            init_flags(&mut stmts, function, &flags);
        }

        for (idx, stmt) in block.statements.iter().enumerate() {
            if let Statement::StorageDead(local) = stmt {
                if owning.contains(local) {
                    let state = moves.state_before(Location::new(block.id, idx));
                    push_drop(&mut stmts, function, &flags, &state, *local);
                }
            }
            match stmt {
                Statement::StorageLive(local) => {
                    in_scope.insert(*local);
                }
                Statement::StorageDead(local) => {
                    in_scope.remove(local);
                }
                _ => {}
            }
            stmts.push(stmt.clone());
            maintain_flags(&mut stmts, function, &flags, stmt);
        }

        if let Terminator::Return { value, .. } = &block.terminator {
            let mut state = moves.state_before(function.terminator_location(block.id));
            if let Some(Operand::Move(place)) = value {
                // The returned value leaves by move before any drop runs.
                state.mark_moved(place);
            }
            let mut exiting: Vec<LocalId> = in_scope
                .iter()
                .copied()
                .filter(|local| owning.contains(local))
                .collect();
            // Reverse declaration order mirrors construction order.
            exiting.sort_by(|a, b| b.cmp(a));
            for local in exiting {
                push_drop(&mut stmts, function, &flags, &state, local);
            }
        }

        result.basic_blocks[block.id].statements = stmts;
    }

    result
}

/// Allocates one boolean flag local per owning local that is only
/// conditionally present somewhere in the function.
fn allocate_flags(
    result: &mut CfgFunction,
    function: &CfgFunction,
    moves: &MoveResults<'_>,
    owning: &[LocalId],
) -> FxHashMap<LocalId, LocalId> {
    let mut flags = FxHashMap::default();
    for &local in owning {
        let conditional = moves
            .flagged_places()
            .iter()
            .any(|place| place.local == local);
        if conditional {
            let flag = LocalId(result.locals.len() as u32);
            result.locals.push(Local {
                id: flag,
                name: None,
                ty: Ty::Bool,
                mutable: true,
            });
            flags.insert(local, flag);
        }
    }
    flags
}

/// Declares and initializes every flag at the top of the entry block.
/// Parameters arrive initialized, so their flags start true.
fn init_flags(
    stmts: &mut Vec<Statement>,
    function: &CfgFunction,
    flags: &FxHashMap<LocalId, LocalId>,
) {
    let mut ordered: Vec<(LocalId, LocalId)> =
        flags.iter().map(|(local, flag)| (*local, *flag)).collect();
    ordered.sort();
    for (local, flag) in ordered {
        stmts.push(Statement::StorageLive(flag));
        stmts.push(set_flag(function, flag, function.is_param(local)));
    }
}

/// Emits flag updates reflecting a statement's effect: moves clear the source
/// flag, whole-local assignments set the destination flag.
fn maintain_flags(
    stmts: &mut Vec<Statement>,
    function: &CfgFunction,
    flags: &FxHashMap<LocalId, LocalId>,
    stmt: &Statement,
) {
    let Statement::Assign { place, rvalue, .. } = stmt else {
        return;
    };
    for moved in moved_places(rvalue) {
        if let Some(&flag) = flags.get(&moved.local) {
            stmts.push(set_flag(function, flag, false));
        }
    }
    if place.is_bare() {
        if let Some(&flag) = flags.get(&place.local) {
            stmts.push(set_flag(function, flag, true));
        }
    }
}

fn moved_places(rvalue: &RValue) -> Vec<&Place> {
    match rvalue {
        RValue::Use(Operand::Move(place)) => vec![place],
        RValue::Use(_) | RValue::Ref { .. } => Vec::new(),
        RValue::Call { args, .. } => args
            .iter()
            .filter_map(|arg| match arg {
                Operand::Move(place) => Some(place),
                Operand::Copy(_) | Operand::Constant(_) => None,
            })
            .collect(),
    }
}

fn set_flag(function: &CfgFunction, flag: LocalId, value: bool) -> Statement {
    Statement::Assign {
        place: Place::from_local(flag),
        rvalue: RValue::Use(Operand::Constant(Constant::Bool(value))),
        span: function.span,
    }
}

/// Emits the drop a local deserves at an exit point, judged by its move
/// state there: present on every path drops unconditionally, gone on every
/// path drops nothing, and a disagreement consults the local's flag.
fn push_drop(
    stmts: &mut Vec<Statement>,
    function: &CfgFunction,
    flags: &FxHashMap<LocalId, LocalId>,
    state: &ks_move_check::MoveMap,
    local: LocalId,
) {
    let place = Place::from_local(local);
    match state.effective(function, &place) {
        MoveState::Init => stmts.push(Statement::Drop { place, guard: None }),
        MoveState::MaybeMoved => stmts.push(Statement::Drop {
            place,
            guard: flags.get(&local).copied(),
        }),
        MoveState::Moved | MoveState::Uninit => {}
    }
}

/// Forward dataflow of which locals have live storage at each block entry.
/// Parameters are in scope for the whole body.
fn storage_entry_sets(function: &CfgFunction) -> Vec<FxHashSet<LocalId>> {
    let mut entry: Vec<FxHashSet<LocalId>> =
        vec![FxHashSet::default(); function.basic_blocks.len()];
    for local in &function.locals[..function.param_count] {
        entry[function.entry_block].insert(local.id);
    }

    let mut visited = vec![false; function.basic_blocks.len()];
    visited[function.entry_block] = true;
    let mut worklist = vec![function.entry_block];
    while let Some(block_id) = worklist.pop() {
        let mut state = entry[block_id].clone();
        for stmt in &function.basic_blocks[block_id].statements {
            match stmt {
                Statement::StorageLive(local) => {
                    state.insert(*local);
                }
                Statement::StorageDead(local) => {
                    state.remove(local);
                }
                _ => {}
            }
        }
        for succ in function.successors(block_id) {
            let mut changed = false;
            for local in &state {
                changed |= entry[succ].insert(*local);
            }
            if changed || !visited[succ] {
                visited[succ] = true;
                worklist.push(succ);
            }
        }
    }
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_intern::Interner;
    use ks_mir::build::CfgBuilder;
    use ks_move_check::MoveTracker;
    use ks_span::{FileId, FileSpan, Span};

    fn span() -> FileSpan {
        FileSpan::new(FileId(0), Span::new(0, 0))
    }

    fn owned_graph(interner: &Interner) -> (TypeGraph, Ty) {
        let mut graph = TypeGraph::new();
        let id = graph.declare(interner.intern("Buffer"));
        if let Some(def) = graph.get_mut(id) {
            def.has_destructor = true;
        }
        (graph, Ty::Named(id))
    }

    fn drops_of(stmts: &[Statement]) -> Vec<&Statement> {
        stmts
            .iter()
            .filter(|stmt| matches!(stmt, Statement::Drop { .. }))
            .collect()
    }

    #[test]
    fn initialized_local_is_dropped_at_scope_end() {
        let interner = Interner::new();
        let (graph, buffer_ty) = owned_graph(&interner);
        let function = {
            let mut builder = CfgBuilder::new(interner.intern("scoped"), Ty::Unit, span());
            let input = builder.param(interner.intern("input"), buffer_ty.clone(), false);
            builder.begin_scope();
            let held = builder.local(interner.intern("held"), buffer_ty, false);
            builder.assign(
                Place::from_local(held),
                Operand::Move(Place::from_local(input)),
                span(),
            );
            builder.end_scope();
            builder.terminate(Terminator::Return { value: None, span: span() });
            builder.finish()
        };

        let moves = MoveTracker::check(&function);
        assert!(moves.errors.is_empty());
        let elaborated = elaborate(&function, &moves, &graph);

        let stmts = &elaborated.basic_blocks[0].statements;
        let dead_idx = stmts
            .iter()
            .position(|stmt| matches!(stmt, Statement::StorageDead(_)))
            .expect("scope end survives elaboration");
        assert!(
            matches!(
                &stmts[dead_idx - 1],
                Statement::Drop { place, guard: None } if place.local.0 == 1
            ),
            "the held value is dropped right before its storage ends"
        );
        // The parameter was moved out on every path: no drop for it anywhere.
        assert_eq!(drops_of(stmts).len(), 1);
    }

    #[test]
    fn moved_out_local_is_never_dropped() {
        let interner = Interner::new();
        let (graph, buffer_ty) = owned_graph(&interner);
        let function = {
            let mut builder = CfgBuilder::new(interner.intern("handoff"), buffer_ty.clone(), span());
            let input = builder.param(interner.intern("input"), buffer_ty, false);
            builder.terminate(Terminator::Return {
                value: Some(Operand::Move(Place::from_local(input))),
                span: span(),
            });
            builder.finish()
        };

        let moves = MoveTracker::check(&function);
        assert!(moves.errors.is_empty());
        let elaborated = elaborate(&function, &moves, &graph);
        assert!(drops_of(&elaborated.basic_blocks[0].statements).is_empty());
    }

    #[test]
    fn every_return_exit_drops_the_initialized_param() {
        let interner = Interner::new();
        let (graph, buffer_ty) = owned_graph(&interner);
        let function = {
            let mut builder = CfgBuilder::new(interner.intern("forked"), Ty::Unit, span());
            let condition = builder.param(interner.intern("condition"), Ty::Bool, false);
            let _input = builder.param(interner.intern("input"), buffer_ty, false);
            let then_bb = builder.block();
            let else_bb = builder.block();
            builder.terminate(Terminator::Branch {
                condition: Operand::Copy(Place::from_local(condition)),
                then_bb,
                else_bb,
                span: span(),
            });
            for exit in [then_bb, else_bb] {
                builder.switch_to(exit);
                builder.terminate(Terminator::Return { value: None, span: span() });
            }
            builder.finish()
        };

        let moves = MoveTracker::check(&function);
        assert!(moves.errors.is_empty());
        let elaborated = elaborate(&function, &moves, &graph);

        for exit in [1, 2] {
            let drops = drops_of(&elaborated.basic_blocks[exit].statements);
            assert_eq!(drops.len(), 1, "exit block {exit} drops the param once");
            assert!(matches!(
                drops[0],
                Statement::Drop { place, guard: None } if place.local.0 == 1
            ));
        }
    }

    #[test]
    fn conditionally_moved_local_gets_a_guarded_drop() {
        let interner = Interner::new();
        let (graph, buffer_ty) = owned_graph(&interner);
        let function = {
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
            builder.finish()
        };

        let moves = MoveTracker::check(&function);
        assert!(moves.errors.is_empty(), "{:?}", moves.errors);
        let elaborated = elaborate(&function, &moves, &graph);

        // A flag local was synthesized for the conditionally-moved param.
        assert!(elaborated.locals.len() > function.locals.len());
        let exit_drops: Vec<_> = elaborated.basic_blocks[2]
            .statements
            .iter()
            .filter_map(|stmt| match stmt {
                Statement::Drop { place, guard } if place.local.0 == 1 => Some(*guard),
                _ => None,
            })
            .collect();
        assert_eq!(exit_drops.len(), 1);
        assert!(exit_drops[0].is_some(), "the drop consults the flag");

        // The move in the taken branch clears the flag.
        let flag = exit_drops[0].expect("guarded");
        let clears = elaborated.basic_blocks[1]
            .statements
            .iter()
            .any(|stmt| matches!(
                stmt,
                Statement::Assign {
                    place,
                    rvalue: RValue::Use(Operand::Constant(Constant::Bool(false))),
                    ..
                } if place.local == flag
            ));
        assert!(clears);
    }
}
