//! Per-place initialization state tracking.

use crate::error::MoveError;
use ks_mir::{CfgFunction, Location, Operand, Place, PlaceElem, RValue, Statement, Terminator};
use ks_span::FileSpan;
use rustc_hash::{FxHashMap, FxHashSet};

/// Whether a place currently holds a value.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum MoveState {
    /// No assignment has reached this point yet
    Uninit,
    /// A value is present on every incoming path
    Init,
    /// Moved out on some incoming paths but not all
    MaybeMoved,
    /// Moved out on every incoming path
    Moved,
}

impl MoveState {
    /// Joins the states of two merging control-flow paths.
    ///
    /// Paths that agree keep their state; any disagreement means the value is
    /// only conditionally present, which is `MaybeMoved`.
    pub fn join(self, other: MoveState) -> MoveState {
        if self == other { self } else { MoveState::MaybeMoved }
    }

    /// Rank for resolving a whole-place read over differing sub-place states;
    /// the most pessimistic state governs.
    fn severity(self) -> u8 {
        match self {
            MoveState::Init => 0,
            MoveState::Uninit => 1,
            MoveState::MaybeMoved => 2,
            MoveState::Moved => 3,
        }
    }
}

/// Move states at one program point, keyed by place.
///
/// Absent places take a default from their base local: parameters are `Init`,
/// everything else `Uninit`. Tracked entries form a sparse tree; the most
/// specific prefix entry governs a place, and any worse-off sub-place entry
/// overrides reads of its parents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveMap {
    states: FxHashMap<Place, MoveState>,
}

impl MoveMap {
    /// The state of a place, resolved through prefix and sub-place entries.
    pub fn effective(&self, function: &CfgFunction, place: &Place) -> MoveState {
        let mut state = self
            .longest_prefix(place)
            .unwrap_or_else(|| self.default_for(function, place));
        for (key, value) in &self.states {
            if is_strict_prefix(place, key) && value.severity() > state.severity() {
                state = *value;
            }
        }
        state
    }

    /// Records a move out of a place, superseding any sub-place entries.
    pub fn mark_moved(&mut self, place: &Place) {
        self.states.retain(|key, _| !is_strict_prefix(place, key));
        self.states.insert(place.clone(), MoveState::Moved);
    }

    /// Records an assignment to a place, superseding any sub-place entries.
    pub fn mark_init(&mut self, place: &Place) {
        self.states.retain(|key, _| !is_strict_prefix(place, key));
        self.states.insert(place.clone(), MoveState::Init);
    }

    /// Forgets every entry rooted at the given local.
    fn clear_local(&mut self, local: ks_mir::LocalId) {
        self.states.retain(|key, _| key.local != local);
    }

    fn longest_prefix(&self, place: &Place) -> Option<MoveState> {
        let mut best: Option<(usize, MoveState)> = None;
        for (key, value) in &self.states {
            if key.local == place.local
                && key.projection.len() <= place.projection.len()
                && place.projection[..key.projection.len()] == key.projection[..]
            {
                match best {
                    Some((len, _)) if len >= key.projection.len() => {}
                    _ => best = Some((key.projection.len(), *value)),
                }
            }
        }
        best.map(|(_, state)| state)
    }

    fn default_for(&self, function: &CfgFunction, place: &Place) -> MoveState {
        if function.is_param(place.local) {
            MoveState::Init
        } else {
            MoveState::Uninit
        }
    }

    /// Joins another path's states into this map. Returns whether anything
    /// observable changed.
    fn join_from(&mut self, function: &CfgFunction, other: &MoveMap) -> bool {
        let keys: Vec<Place> = self
            .states
            .keys()
            .chain(other.states.keys())
            .cloned()
            .collect();
        let mut changed = false;
        for key in keys {
            let ours = self.effective(function, &key);
            let theirs = other.effective(function, &key);
            let joined = ours.join(theirs);
            if joined != ours {
                self.states.insert(key, joined);
                changed = true;
            }
        }
        changed
    }

    fn record_flagged(&self, flagged: &mut FxHashSet<Place>) {
        for (key, value) in &self.states {
            if *value == MoveState::MaybeMoved {
                flagged.insert(key.clone());
            }
        }
    }
}

/// Whether `outer` is a strict prefix of `inner` (same local, shorter chain).
fn is_strict_prefix(outer: &Place, inner: &Place) -> bool {
    outer.local == inner.local
        && outer.projection.len() < inner.projection.len()
        && inner.projection[..outer.projection.len()] == outer.projection[..]
}

/// Output of move checking for one function.
#[derive(Debug)]
pub struct MoveResults<'mir> {
    function: &'mir CfgFunction,
    entry: Vec<MoveMap>,
    /// Initialization violations, in block order
    pub errors: Vec<MoveError>,
    flagged: FxHashSet<Place>,
}

impl MoveResults<'_> {
    /// Replays the move states holding just before the given point. The
    /// statement index one past the block's last statement addresses the
    /// terminator.
    pub fn state_before(&self, location: Location) -> MoveMap {
        let block = &self.function.basic_blocks[location.block];
        let mut state = self.entry[location.block].clone();
        let upto = location.statement_index.min(block.statements.len());
        for stmt in &block.statements[..upto] {
            apply_statement(&mut state, stmt);
        }
        state
    }

    /// Whether dropping this place must be guarded by a run-time flag because
    /// it is only conditionally present somewhere in the function.
    pub fn needs_flag(&self, place: &Place) -> bool {
        self.flagged.contains(place)
    }

    /// All places that are `MaybeMoved` at some point, the drop-flag
    /// candidates.
    pub fn flagged_places(&self) -> &FxHashSet<Place> {
        &self.flagged
    }
}

/// Flow-sensitive initialization checker for one function.
pub struct MoveTracker<'mir> {
    function: &'mir CfgFunction,
    entry: Vec<MoveMap>,
}

impl<'mir> MoveTracker<'mir> {
    /// Runs move checking on a function.
    ///
    /// Violations never abort the pass: each use is judged against the
    /// pre-violation state and analysis continues, so every independent
    /// error is reported in one run.
    pub fn check(function: &'mir CfgFunction) -> MoveResults<'mir> {
        let mut tracker = Self {
            function,
            entry: vec![MoveMap::default(); function.basic_blocks.len()],
        };
        for local in &function.locals[..function.param_count] {
            tracker.entry[function.entry_block]
                .states
                .insert(Place::from_local(local.id), MoveState::Init);
        }
        tracker.fixpoint();
        tracker.report()
    }

    /// Iterates block-entry states to a fixpoint without reporting.
    fn fixpoint(&mut self) {
        let function = self.function;
        let mut visited = vec![false; function.basic_blocks.len()];
        visited[function.entry_block] = true;
        let mut worklist = vec![function.entry_block];

        while let Some(block_id) = worklist.pop() {
            let mut state = self.entry[block_id].clone();
            let block = &function.basic_blocks[block_id];
            for stmt in &block.statements {
                apply_statement(&mut state, stmt);
            }
            apply_terminator(&mut state, &block.terminator);
            for succ in function.successors(block_id) {
                let changed = self.entry[succ].join_from(function, &state);
                if changed || !visited[succ] {
                    visited[succ] = true;
                    worklist.push(succ);
                }
            }
        }
    }

    /// One pass over each block from its fixed entry state, collecting
    /// diagnostics and drop-flag candidates.
    fn report(self) -> MoveResults<'mir> {
        let mut errors = Vec::new();
        let mut flagged = FxHashSet::default();

        for block in &self.function.basic_blocks {
            let mut state = self.entry[block.id].clone();
            state.record_flagged(&mut flagged);
            for stmt in &block.statements {
                apply_statement_with_function(self.function, &mut state, stmt, &mut errors);
                state.record_flagged(&mut flagged);
            }
            apply_terminator_with_function(self.function, &mut state, &block.terminator, &mut errors);
        }

        errors.sort_by_key(|error| {
            let span = error.span();
            (span.file.0, span.span.start, span.span.end)
        });

        MoveResults {
            function: self.function,
            entry: self.entry,
            errors,
            flagged,
        }
    }
}

/// Transfer for the silent fixpoint: reads are not judged, only the state
/// updates matter.
fn apply_statement(state: &mut MoveMap, stmt: &Statement) {
    match stmt {
        Statement::Assign { place, rvalue, .. } => {
            if let RValue::Use(Operand::Move(moved)) = rvalue {
                state.mark_moved(moved);
            }
            if let RValue::Call { args, .. } = rvalue {
                for arg in args {
                    if let Operand::Move(moved) = arg {
                        state.mark_moved(moved);
                    }
                }
            }
            state.mark_init(place);
        }
        Statement::StorageLive(local) | Statement::StorageDead(local) => {
            state.clear_local(*local);
        }
        Statement::Drop { .. } | Statement::Nop => {}
    }
}

fn apply_terminator(state: &mut MoveMap, terminator: &Terminator) {
    if let Terminator::Return {
        value: Some(Operand::Move(moved)),
        ..
    } = terminator
    {
        state.mark_moved(moved);
    }
}

fn check_read(
    function: &CfgFunction,
    state: &MoveMap,
    place: &Place,
    span: FileSpan,
    errors: &mut Vec<MoveError>,
) {
    match state.effective(function, place) {
        MoveState::Init => {}
        MoveState::Uninit => errors.push(MoveError::UseOfUninitialized {
            place: place.clone(),
            use_span: span,
        }),
        MoveState::MaybeMoved => errors.push(MoveError::UseOfPossiblyMoved {
            place: place.clone(),
            use_span: span,
        }),
        MoveState::Moved => errors.push(MoveError::UseAfterMove {
            place: place.clone(),
            use_span: span,
        }),
    }
    // Index projections read their index local as well.
    for elem in &place.projection {
        if let PlaceElem::Index(index) = elem {
            check_read(
                function,
                state,
                &Place::from_local(*index),
                span,
                errors,
            );
        }
    }
}

fn check_operand(
    function: &CfgFunction,
    state: &mut MoveMap,
    operand: &Operand,
    span: FileSpan,
    errors: &mut Vec<MoveError>,
) {
    match operand {
        Operand::Copy(place) => check_read(function, state, place, span, errors),
        Operand::Move(place) => {
            check_read(function, state, place, span, errors);
            state.mark_moved(place);
        }
        Operand::Constant(_) => {}
    }
}

/// Transfer for the reporting pass: judges every read against the
/// pre-violation state before applying the effect.
fn apply_statement_with_function(
    function: &CfgFunction,
    state: &mut MoveMap,
    stmt: &Statement,
    errors: &mut Vec<MoveError>,
) {
    match stmt {
        Statement::Assign { place, rvalue, span } => {
            match rvalue {
                RValue::Use(operand) => check_operand(function, state, operand, *span, errors),
                RValue::Ref { place: borrowed, .. } => {
                    // Borrowing requires the borrowed value to be present.
                    check_read(function, state, borrowed, *span, errors);
                }
                RValue::Call { args, .. } => {
                    for arg in args {
                        check_operand(function, state, arg, *span, errors);
                    }
                }
            }
            state.mark_init(place);
        }
        Statement::StorageLive(local) | Statement::StorageDead(local) => {
            state.clear_local(*local);
        }
        Statement::Drop { .. } | Statement::Nop => {}
    }
}

fn apply_terminator_with_function(
    function: &CfgFunction,
    state: &mut MoveMap,
    terminator: &Terminator,
    errors: &mut Vec<MoveError>,
) {
    match terminator {
        Terminator::Branch { condition, span, .. } => {
            check_operand(function, state, condition, *span, errors);
        }
        Terminator::Return {
            value: Some(operand),
            span,
        } => check_operand(function, state, operand, *span, errors),
        Terminator::Return { value: None, .. }
        | Terminator::Goto(_)
        | Terminator::Unreachable => {}
    }
}
