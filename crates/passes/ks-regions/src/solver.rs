//! Region inference over the CFG.
//!
//! The solver computes, for every borrow region, the set of program points
//! the borrow must remain valid over. Point sets only grow and are bounded by
//! the CFG size, so the worklist fixpoint terminates. When diamond control
//! flow admits several minimal solutions the union of branch-local spans is
//! taken, the least region that satisfies every use.

use crate::error::LifetimeError;
use ks_mir::{
    BasicBlock, BorrowKind, BorrowSite, CfgFunction, LocalId, Location, Operand, Place, PlaceElem,
    RValue, RegionId, Statement, Terminator, Ty, Variance,
};
use ks_span::FileSpan;
use rustc_hash::{FxHashMap, FxHashSet};

/// Which borrow regions a local may currently hold.
type CarriedMap = FxHashMap<LocalId, FxHashSet<RegionId>>;

/// The universal region standing in for a declared lifetime parameter.
///
/// Universal regions are numbered after the function's borrow regions.
pub fn universal_region(function: &CfgFunction, param_index: usize) -> RegionId {
    RegionId(function.region_count + param_index as u32)
}

/// Solved region spans, read-only input to the loan checker.
#[derive(Debug, Clone)]
pub struct RegionSolution {
    borrow_region_count: u32,
    values: Vec<FxHashSet<Location>>,
}

impl RegionSolution {
    /// Whether the region stands for a declared lifetime parameter.
    pub fn is_universal(&self, region: RegionId) -> bool {
        region.0 >= self.borrow_region_count
    }

    /// Whether the region's solved span includes the given point.
    ///
    /// Universal regions cover the whole body.
    pub fn contains(&self, region: RegionId, location: Location) -> bool {
        if self.is_universal(region) {
            return true;
        }
        self.values[region.0 as usize].contains(&location)
    }
}

/// Output of region solving: the solution plus any lifetime errors.
///
/// Analysis continues past a violation, so downstream passes always receive
/// a usable solution even for rejected functions.
#[derive(Debug)]
pub struct RegionResults {
    /// Solved spans for every borrow region
    pub solution: RegionSolution,
    /// Lifetime violations, in block order
    pub errors: Vec<LifetimeError>,
}

/// Where an escaping set of regions is headed.
enum EscapePoint {
    /// Flows out through the return value
    Return { target: Option<usize> },
    /// Stored through a dereference of a caller-provided reference
    ParamStore { target: Option<usize> },
}

/// A set of regions that must outlive the function body.
struct Obligation {
    regions: FxHashSet<RegionId>,
    point: EscapePoint,
    span: FileSpan,
}

/// The ultimate origin of a region, after chasing reborrows.
enum Root {
    /// A declared lifetime parameter
    Universal(usize),
    /// A borrow of function-local storage, by site index
    LocalBorrow(usize),
    /// Provenance unknown; cannot be proven to outlive anything
    Opaque(RegionId),
}

/// Region/outlives constraint solver for one function.
pub struct RegionSolver<'mir> {
    function: &'mir CfgFunction,
    sites: Vec<BorrowSite>,
    site_index: FxHashMap<RegionId, usize>,
    /// For reborrow sites, the regions carried by the base reference at the
    /// borrow point.
    reborrow_base: FxHashMap<RegionId, FxHashSet<RegionId>>,
    /// `(sup, sub)`: sup's span must contain sub's.
    constraints: Vec<(RegionId, RegionId)>,
    obligations: Vec<Obligation>,
    errors: Vec<LifetimeError>,
}

impl<'mir> RegionSolver<'mir> {
    /// Solves all regions of a function.
    pub fn solve(function: &'mir CfgFunction) -> RegionResults {
        let sites = function.borrow_sites();
        let site_index = sites
            .iter()
            .enumerate()
            .map(|(idx, site)| (site.region, idx))
            .collect();
        let mut solver = Self {
            function,
            sites,
            site_index,
            reborrow_base: FxHashMap::default(),
            constraints: Vec::new(),
            obligations: Vec::new(),
            errors: Vec::new(),
        };
        let solution = solver.run();
        RegionResults {
            solution,
            errors: solver.errors,
        }
    }

    fn run(&mut self) -> RegionSolution {
        let function = self.function;
        let live_out = self.block_liveness();
        let carried_entry = self.carried_fixpoint();

        // A span begins at the first point after the borrow where a live
        // local still carries the region. The issue point itself is left
        // out: on a loop back-edge it belongs to the previous incarnation
        // of the same loan, which may already be dead there.
        let mut values = vec![FxHashSet::default(); function.region_count as usize];

        for block in &function.basic_blocks {
            let live = self.block_live_sets(block, &live_out[block.id]);
            let carried = self.block_carried_sets(block, carried_entry[block.id].clone());

            for (slot, state) in carried.iter().enumerate() {
                for (local, regions) in state {
                    if !live[slot].contains(local) {
                        continue;
                    }
                    for region in regions {
                        if region.0 < function.region_count {
                            values[region.0 as usize].insert(Location::new(block.id, slot));
                        }
                    }
                }
            }

            self.scan_block(block, &carried);
        }

        self.propagate(&mut values);

        let obligations = std::mem::take(&mut self.obligations);
        for obligation in obligations {
            self.check_obligation(&obligation);
        }
        self.errors.sort_by_key(|error| {
            let span = error.span();
            (span.file.0, span.span.start, span.span.end)
        });

        RegionSolution {
            borrow_region_count: self.function.region_count,
            values,
        }
    }

    /// Grows spans along collected outlives constraints until stable.
    fn propagate(&self, values: &mut [FxHashSet<Location>]) {
        let count = self.function.region_count;
        let mut changed = true;
        while changed {
            changed = false;
            for (sup, sub) in &self.constraints {
                if sup.0 >= count || sub.0 >= count {
                    // A universal sup already covers everything; a universal
                    // sub never arises because sub is always a fresh borrow.
                    continue;
                }
                let points: Vec<Location> =
                    values[sub.0 as usize].iter().copied().collect();
                for point in points {
                    changed |= values[sup.0 as usize].insert(point);
                }
            }
        }
    }

    // ---- carried-region forward analysis ----

    fn entry_carried(&self) -> CarriedMap {
        let mut state = CarriedMap::default();
        for local in &self.function.locals[..self.function.param_count] {
            if let Ty::Ref {
                lifetime: Some(param_index),
                ..
            } = &local.ty
            {
                state
                    .entry(local.id)
                    .or_default()
                    .insert(universal_region(self.function, *param_index));
            }
        }
        state
    }

    fn carried_fixpoint(&self) -> Vec<CarriedMap> {
        let block_count = self.function.basic_blocks.len();
        let mut entry_states = vec![CarriedMap::default(); block_count];
        entry_states[self.function.entry_block] = self.entry_carried();

        let mut worklist = vec![self.function.entry_block];
        while let Some(block_id) = worklist.pop() {
            let mut state = entry_states[block_id].clone();
            for stmt in &self.function.basic_blocks[block_id].statements {
                self.apply_statement(&mut state, stmt);
            }
            for succ in self.function.successors(block_id) {
                if join_carried(&mut entry_states[succ], &state) {
                    worklist.push(succ);
                }
            }
        }
        entry_states
    }

    /// The carried state before each statement slot of a block, terminator
    /// slot included.
    fn block_carried_sets(&self, block: &BasicBlock, entry: CarriedMap) -> Vec<CarriedMap> {
        let mut state = entry;
        let mut slots = Vec::with_capacity(block.statements.len() + 1);
        for stmt in &block.statements {
            slots.push(state.clone());
            self.apply_statement(&mut state, stmt);
        }
        slots.push(state);
        slots
    }

    fn apply_statement(&self, state: &mut CarriedMap, stmt: &Statement) {
        match stmt {
            Statement::Assign { place, rvalue, .. } => {
                let regions = self.rvalue_regions(state, rvalue);
                if place.is_bare() {
                    if regions.is_empty() {
                        state.remove(&place.local);
                    } else {
                        state.insert(place.local, regions);
                    }
                } else if !regions.is_empty() {
                    state.entry(place.local).or_default().extend(regions);
                }
            }
            Statement::StorageDead(local) => {
                state.remove(local);
            }
            Statement::StorageLive(_) | Statement::Drop { .. } | Statement::Nop => {}
        }
    }

    fn rvalue_regions(&self, state: &CarriedMap, rvalue: &RValue) -> FxHashSet<RegionId> {
        match rvalue {
            RValue::Use(operand) => operand
                .place()
                .and_then(|place| state.get(&place.local))
                .cloned()
                .unwrap_or_default(),
            RValue::Ref { region, .. } => std::iter::once(*region).collect(),
            RValue::Call { args, .. } => {
                // Interprocedural-free: assume a returned reference may carry
                // any loan reachable through the arguments.
                let mut regions = FxHashSet::default();
                for arg in args {
                    if let Some(place) = arg.place() {
                        if let Some(carried) = state.get(&place.local) {
                            regions.extend(carried.iter().copied());
                        }
                    }
                }
                regions
            }
        }
    }

    // ---- constraint and obligation collection ----

    fn scan_block(&mut self, block: &BasicBlock, carried: &[CarriedMap]) {
        for (idx, stmt) in block.statements.iter().enumerate() {
            let Statement::Assign {
                place,
                rvalue,
                span,
            } = stmt
            else {
                continue;
            };
            let state = &carried[idx];

            // A reborrow through a reference must not outlive the loans the
            // reference carries.
            if let RValue::Ref {
                region,
                place: borrowed,
                ..
            } = rvalue
            {
                if borrowed.projection.first() == Some(&PlaceElem::Deref) {
                    let bases = state.get(&borrowed.local).cloned().unwrap_or_default();
                    for base in &bases {
                        self.constraints.push((*base, *region));
                    }
                    self.reborrow_base.insert(*region, bases);
                }
            }

            // Storing borrowed data through a caller-provided exclusive
            // reference makes it escape the function.
            if place.projection.first() == Some(&PlaceElem::Deref) {
                if let Ty::Ref {
                    kind: BorrowKind::Exclusive,
                    lifetime,
                    ..
                } = &self.function.local(place.local).ty
                {
                    if self.function.is_param(place.local) {
                        let regions = self.rvalue_regions(state, rvalue);
                        if !regions.is_empty() {
                            self.obligations.push(Obligation {
                                regions,
                                point: EscapePoint::ParamStore { target: *lifetime },
                                span: *span,
                            });
                        }
                    }
                }
            }
        }

        if let Terminator::Return {
            value: Some(operand),
            span,
        } = &block.terminator
        {
            let state = &carried[block.statements.len()];
            if let Some(place) = operand.place() {
                if let Some(regions) = state.get(&place.local) {
                    if !regions.is_empty() {
                        let target = match &self.function.return_ty {
                            Ty::Ref { lifetime, .. } => *lifetime,
                            _ => None,
                        };
                        self.obligations.push(Obligation {
                            regions: regions.clone(),
                            point: EscapePoint::Return { target },
                            span: *span,
                        });
                    }
                }
            }
        }
    }

    fn check_obligation(&mut self, obligation: &Obligation) {
        let target = match obligation.point {
            EscapePoint::Return { target } | EscapePoint::ParamStore { target } => target,
        };
        let mut roots = Vec::new();
        let mut visited = FxHashSet::default();
        for region in &obligation.regions {
            self.collect_roots(*region, &mut visited, &mut roots);
        }
        for root in roots {
            match root {
                Root::Universal(source) => {
                    let met = target
                        .is_some_and(|target| self.obligation_met(source, target));
                    if !met {
                        self.errors.push(LifetimeError::LifetimeTooShort {
                            region: universal_region(self.function, source),
                            span: obligation.span,
                        });
                    }
                }
                Root::LocalBorrow(site_idx) => {
                    let site = &self.sites[site_idx];
                    self.errors.push(LifetimeError::ReturnOfBorrowedLocal {
                        place: site.place.clone(),
                        borrow_span: site.span,
                        escape_span: obligation.span,
                    });
                }
                Root::Opaque(region) => {
                    self.errors.push(LifetimeError::LifetimeTooShort {
                        region,
                        span: obligation.span,
                    });
                }
            }
        }
    }

    /// Chases a region back to its origins through reborrow edges.
    fn collect_roots(
        &self,
        region: RegionId,
        visited: &mut FxHashSet<RegionId>,
        out: &mut Vec<Root>,
    ) {
        if !visited.insert(region) {
            return;
        }
        if region.0 >= self.function.region_count {
            out.push(Root::Universal(
                (region.0 - self.function.region_count) as usize,
            ));
            return;
        }
        let Some(&site_idx) = self.site_index.get(&region) else {
            out.push(Root::Opaque(region));
            return;
        };
        let site = &self.sites[site_idx];
        if site.place.projection.first() == Some(&PlaceElem::Deref) {
            match self.reborrow_base.get(&region) {
                Some(bases) if !bases.is_empty() => {
                    for base in bases {
                        self.collect_roots(*base, visited, out);
                    }
                }
                _ => out.push(Root::Opaque(region)),
            }
        } else {
            out.push(Root::LocalBorrow(site_idx));
        }
    }

    /// Whether the declared bounds dominate the derived `source outlives
    /// target` constraint, under the target position's variance.
    ///
    /// The derived direction is kept for covariant (output) positions,
    /// flipped for contravariant (input) positions, and required both ways
    /// for invariant positions.
    fn obligation_met(&self, source: usize, target: usize) -> bool {
        match self.function.lifetime_params[target].variance {
            Variance::Covariant => self.declared_outlives(source, target),
            Variance::Contravariant => self.declared_outlives(target, source),
            Variance::Invariant => {
                self.declared_outlives(source, target) && self.declared_outlives(target, source)
            }
        }
    }

    /// Reflexive-transitive closure of the declared outlives bounds.
    fn declared_outlives(&self, sup: usize, sub: usize) -> bool {
        if sup == sub {
            return true;
        }
        let mut stack = vec![sup];
        let mut seen = FxHashSet::default();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            for &next in &self.function.lifetime_params[current].outlives {
                if next == sub {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    // ---- backward liveness of reference-holding locals ----

    fn block_liveness(&self) -> Vec<FxHashSet<LocalId>> {
        let block_count = self.function.basic_blocks.len();
        let preds = self.function.predecessors();
        let mut live_in: Vec<FxHashSet<LocalId>> = vec![FxHashSet::default(); block_count];
        let mut live_out: Vec<FxHashSet<LocalId>> = vec![FxHashSet::default(); block_count];

        let mut worklist: Vec<_> = (0..block_count).collect();
        while let Some(block_id) = worklist.pop() {
            let block = &self.function.basic_blocks[block_id];
            let mut state = live_out[block_id].clone();
            apply_terminator_reads(&block.terminator, &mut state);
            for stmt in block.statements.iter().rev() {
                apply_statement_backward(stmt, &mut state);
            }
            if state != live_in[block_id] {
                live_in[block_id] = state;
                for &pred in &preds[block_id] {
                    let mut changed = false;
                    for local in &live_in[block_id] {
                        changed |= live_out[pred].insert(*local);
                    }
                    if changed {
                        worklist.push(pred);
                    }
                }
            }
        }
        live_out
    }

    /// The live set before each statement slot of a block, terminator slot
    /// included. A slot's set includes the slot's own reads.
    fn block_live_sets(
        &self,
        block: &BasicBlock,
        live_out: &FxHashSet<LocalId>,
    ) -> Vec<FxHashSet<LocalId>> {
        let len = block.statements.len();
        let mut slots = vec![FxHashSet::default(); len + 1];
        let mut state = live_out.clone();
        apply_terminator_reads(&block.terminator, &mut state);
        slots[len] = state.clone();
        for idx in (0..len).rev() {
            apply_statement_backward(&block.statements[idx], &mut state);
            slots[idx] = state.clone();
        }
        slots
    }
}

fn join_carried(target: &mut CarriedMap, source: &CarriedMap) -> bool {
    let mut changed = false;
    for (local, regions) in source {
        let entry = target.entry(*local).or_default();
        for region in regions {
            changed |= entry.insert(*region);
        }
    }
    changed
}

fn read_place_locals(place: &Place, state: &mut FxHashSet<LocalId>) {
    state.insert(place.local);
    for elem in &place.projection {
        if let PlaceElem::Index(index) = elem {
            state.insert(*index);
        }
    }
}

fn read_operand_locals(operand: &Operand, state: &mut FxHashSet<LocalId>) {
    if let Some(place) = operand.place() {
        read_place_locals(place, state);
    }
}

fn apply_statement_backward(stmt: &Statement, state: &mut FxHashSet<LocalId>) {
    match stmt {
        Statement::Assign { place, rvalue, .. } => {
            if place.is_bare() {
                state.remove(&place.local);
            } else {
                read_place_locals(place, state);
            }
            match rvalue {
                RValue::Use(operand) => read_operand_locals(operand, state),
                RValue::Ref { place, .. } => read_place_locals(place, state),
                RValue::Call { args, .. } => {
                    for arg in args {
                        read_operand_locals(arg, state);
                    }
                }
            }
        }
        Statement::StorageLive(local) | Statement::StorageDead(local) => {
            state.remove(local);
        }
        Statement::Drop { place, guard } => {
            read_place_locals(place, state);
            if let Some(guard) = guard {
                state.insert(*guard);
            }
        }
        Statement::Nop => {}
    }
}

fn apply_terminator_reads(terminator: &Terminator, state: &mut FxHashSet<LocalId>) {
    match terminator {
        Terminator::Branch { condition, .. } => read_operand_locals(condition, state),
        Terminator::Return {
            value: Some(operand),
            ..
        } => read_operand_locals(operand, state),
        Terminator::Return { value: None, .. }
        | Terminator::Goto(_)
        | Terminator::Unreachable => {}
    }
}
