//! CFG construction
//!
//! [`CfgBuilder`] is the surface the upstream lowering drives to decompose a
//! type-checked function body into place-level primitive statements. The
//! builder owns local allocation (including unnamed temporaries, which take
//! full drop responsibility for the values they hold), block creation, region
//! allocation per borrow expression, and structured scope tracking via
//! `StorageLive`/`StorageDead` markers.
//!
//! Building cannot fail: type errors are caught upstream and the builder
//! assumes well-typed input.

use crate::{
    BasicBlock, BasicBlockId, BorrowKind, CfgFunction, LifetimeParam, Local, LocalId, Operand,
    Place, RValue, RegionId, Statement, Terminator, Ty, Variance,
};
use ks_intern::Symbol;
use ks_span::FileSpan;

/// Builder for constructing CFG functions
pub struct CfgBuilder {
    function: CfgFunction,
    current_block: BasicBlockId,
    scopes: Vec<Vec<LocalId>>,
    next_region: u32,
}

impl CfgBuilder {
    /// Creates a builder with an empty entry block and an open function scope
    pub fn new(name: Symbol, return_ty: Ty, span: FileSpan) -> Self {
        let entry = BasicBlock {
            id: 0,
            statements: Vec::new(),
            terminator: Terminator::Unreachable,
        };
        Self {
            function: CfgFunction {
                name,
                span,
                basic_blocks: vec![entry],
                locals: Vec::new(),
                entry_block: 0,
                param_count: 0,
                return_ty,
                lifetime_params: Vec::new(),
                region_count: 0,
            },
            current_block: 0,
            scopes: vec![Vec::new()],
            next_region: 0,
        }
    }

    /// Declares a generic lifetime parameter, returning its index
    pub fn lifetime_param(
        &mut self,
        name: Symbol,
        variance: Variance,
        outlives: Vec<usize>,
    ) -> usize {
        let index = self.function.lifetime_params.len();
        self.function.lifetime_params.push(LifetimeParam {
            name,
            variance,
            outlives,
        });
        index
    }

    /// Declares a parameter; parameters must precede all other locals
    ///
    /// Parameters are initialized on entry and live for the whole body, so no
    /// storage markers are emitted for them.
    pub fn param(&mut self, name: Symbol, ty: Ty, mutable: bool) -> LocalId {
        debug_assert_eq!(
            self.function.locals.len(),
            self.function.param_count,
            "parameters must be declared before locals"
        );
        let id = self.alloc_local(Some(name), ty, mutable);
        self.function.param_count += 1;
        id
    }

    /// Declares a named local in the current scope
    pub fn local(&mut self, name: Symbol, ty: Ty, mutable: bool) -> LocalId {
        let id = self.alloc_local(Some(name), ty, mutable);
        self.declare_in_scope(id);
        id
    }

    /// Allocates an unnamed temporary in the current scope
    ///
    /// Temporaries hold intermediate values of decomposed compound
    /// expressions and carry full drop responsibility for them.
    pub fn temp(&mut self, ty: Ty) -> LocalId {
        let id = self.alloc_local(None, ty, false);
        self.declare_in_scope(id);
        id
    }

    fn alloc_local(&mut self, name: Option<Symbol>, ty: Ty, mutable: bool) -> LocalId {
        let id = LocalId(self.function.locals.len() as u32);
        self.function.locals.push(Local {
            id,
            name,
            ty,
            mutable,
        });
        id
    }

    fn declare_in_scope(&mut self, id: LocalId) {
        self.push(Statement::StorageLive(id));
        if let Some(scope) = self.scopes.last_mut() {
            scope.push(id);
        }
    }

    /// Opens a structured scope
    pub fn begin_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Closes the innermost scope, ending storage in reverse declaration
    /// order to mirror construction order
    pub fn end_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            for id in scope.into_iter().rev() {
                self.push(Statement::StorageDead(id));
            }
        }
    }

    /// Creates a new basic block and returns its ID
    pub fn block(&mut self) -> BasicBlockId {
        let id = self.function.basic_blocks.len();
        self.function.basic_blocks.push(BasicBlock {
            id,
            statements: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    /// Directs subsequent statements into the given block
    pub fn switch_to(&mut self, block: BasicBlockId) {
        self.current_block = block;
    }

    /// Appends a statement to the current block
    pub fn push(&mut self, stmt: Statement) {
        self.function.basic_blocks[self.current_block]
            .statements
            .push(stmt);
    }

    /// Sets the terminator of the current block
    pub fn terminate(&mut self, terminator: Terminator) {
        self.function.basic_blocks[self.current_block].terminator = terminator;
    }

    /// Allocates a fresh region for a borrow expression
    pub fn fresh_region(&mut self) -> RegionId {
        let region = RegionId(self.next_region);
        self.next_region += 1;
        region
    }

    /// Emits `place = operand`
    pub fn assign(&mut self, place: Place, operand: Operand, span: FileSpan) {
        self.push(Statement::Assign {
            place,
            rvalue: RValue::Use(operand),
            span,
        });
    }

    /// Emits `dest = &place` / `dest = &mut place`, allocating the borrow's
    /// region
    pub fn borrow(
        &mut self,
        dest: Place,
        kind: BorrowKind,
        place: Place,
        span: FileSpan,
    ) -> RegionId {
        let region = self.fresh_region();
        self.push(Statement::Assign {
            place: dest,
            rvalue: RValue::Ref {
                kind,
                place,
                region,
            },
            span,
        });
        region
    }

    /// Emits `dest = callee(args...)`
    pub fn call(&mut self, dest: Place, callee: Symbol, args: Vec<Operand>, span: FileSpan) {
        self.push(Statement::Assign {
            place: dest,
            rvalue: RValue::Call { callee, args },
            span,
        });
    }

    /// Finishes building and returns the immutable function
    pub fn finish(mut self) -> CfgFunction {
        debug_assert!(
            self.scopes.len() == 1,
            "structured scopes must be closed before finishing"
        );
        self.function.region_count = self.next_region;
        self.function
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_intern::Interner;
    use ks_span::{FileId, Span};

    fn span() -> FileSpan {
        FileSpan::new(FileId(0), Span::new(0, 0))
    }

    #[test]
    fn scope_end_reverses_declaration_order() {
        let interner = Interner::new();
        let mut builder = CfgBuilder::new(interner.intern("scoped"), Ty::Unit, span());
        builder.begin_scope();
        let first = builder.local(interner.intern("first"), Ty::Int, false);
        let second = builder.local(interner.intern("second"), Ty::Int, false);
        builder.end_scope();
        builder.terminate(Terminator::Return {
            value: None,
            span: span(),
        });
        let func = builder.finish();

        let stmts = &func.basic_blocks[0].statements;
        assert_eq!(
            stmts.as_slice(),
            &[
                Statement::StorageLive(first),
                Statement::StorageLive(second),
                Statement::StorageDead(second),
                Statement::StorageDead(first),
            ]
        );
    }

    #[test]
    fn borrow_sites_report_each_borrow_once() {
        let interner = Interner::new();
        let mut builder = CfgBuilder::new(interner.intern("borrows"), Ty::Unit, span());
        let value = builder.local(interner.intern("value"), Ty::Int, true);
        let shared = builder.temp(Ty::Ref {
            kind: BorrowKind::Shared,
            inner: Box::new(Ty::Int),
            lifetime: None,
        });
        let region = builder.borrow(
            Place::from_local(shared),
            BorrowKind::Shared,
            Place::from_local(value),
            span(),
        );
        builder.terminate(Terminator::Return {
            value: None,
            span: span(),
        });
        let func = builder.finish();

        let sites = func.borrow_sites();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].region, region);
        assert_eq!(sites[0].place, Place::from_local(value));
        assert_eq!(func.region_count, 1);
    }

    #[test]
    fn successors_follow_branch_targets() {
        let interner = Interner::new();
        let mut builder = CfgBuilder::new(interner.intern("branchy"), Ty::Unit, span());
        let condition = builder.local(interner.intern("condition"), Ty::Bool, false);
        let then_bb = builder.block();
        let else_bb = builder.block();
        builder.terminate(Terminator::Branch {
            condition: Operand::Copy(Place::from_local(condition)),
            then_bb,
            else_bb,
            span: span(),
        });
        let func = builder.finish();

        assert_eq!(func.successors(0), vec![then_bb, else_bb]);
        assert!(func.successors(then_bb).is_empty());
    }
}
