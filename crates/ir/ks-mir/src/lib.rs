//! Control-flow graph representation
//!
//! The ownership engine runs over a CFG of place-level primitive statements:
//! assignments, borrows, moves, uses, calls, conditional branches, loop
//! back-edges, drops, and returns. The graph is produced once per function by
//! [`build::CfgBuilder`] from the type-checked body and is immutable
//! afterwards; passes read it, and only drop elaboration produces a rewritten
//! copy.

pub mod build;

use ks_intern::Symbol;
use ks_span::FileSpan;
use ks_types::{TypeGraph, TypeId};
use serde::{Deserialize, Serialize};

/// Basic block ID
pub type BasicBlockId = usize;

/// Local variable ID
///
/// Invariant: `CfgFunction::locals[i].id == LocalId(i)`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(pub u32);

/// Lifetime variable ID
///
/// One region is allocated per borrow expression and, during solving, per
/// declared lifetime parameter. The CFG only records the allocation; solved
/// spans live in the region pass.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(pub u32);

/// Kind of a borrow
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum BorrowKind {
    /// Shared, read-only borrow; any number may coexist
    Shared,
    /// Exclusive borrow; coexists with nothing that overlaps it
    Exclusive,
}

/// Variance of a lifetime parameter position in a signature
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Variance {
    /// Output position: a longer caller lifetime is acceptable
    Covariant,
    /// Input position: the required direction of a bound flips
    Contravariant,
    /// Both at once: bounds must hold exactly
    Invariant,
}

/// A declared generic lifetime parameter on a function signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeParam {
    /// Parameter name, e.g. `'a`
    pub name: Symbol,
    /// Variance of the position the parameter appears in
    pub variance: Variance,
    /// Indices of lifetime parameters this one is declared to outlive
    pub outlives: Vec<usize>,
}

/// Place projection element
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlaceElem {
    /// Dereference (*place)
    Deref,
    /// Field access (place.field) by field index
    Field {
        /// Index of the field within its parent
        index: usize,
    },
    /// Array/slice indexing (place[index])
    Index(LocalId),
}

/// Place where a value can be stored: a base local plus a projection chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Place {
    /// Base local variable
    pub local: LocalId,
    /// Projection chain applied to the base
    pub projection: Vec<PlaceElem>,
}

impl Place {
    /// Creates a bare place from a local
    pub fn from_local(local: LocalId) -> Self {
        Self {
            local,
            projection: Vec::new(),
        }
    }

    /// Extends the place with a field projection
    pub fn field(mut self, index: usize) -> Self {
        self.projection.push(PlaceElem::Field { index });
        self
    }

    /// Extends the place with a dereference projection
    pub fn deref(mut self) -> Self {
        self.projection.push(PlaceElem::Deref);
        self
    }

    /// Whether the place has no projections
    pub fn is_bare(&self) -> bool {
        self.projection.is_empty()
    }
}

/// Whether two places may refer to overlapping storage
///
/// Two places overlap when one's projection chain is a prefix of the other's.
/// Index projections with distinct index locals are still treated as
/// overlapping because their runtime values cannot be proven disjoint; the
/// same conservative rule covers dereferences of unknown pointers.
pub fn places_overlap(first: &Place, second: &Place) -> bool {
    if first.local != second.local {
        return false;
    }
    first
        .projection
        .iter()
        .zip(&second.projection)
        .all(|(lhs, rhs)| match (lhs, rhs) {
            (PlaceElem::Index(_), PlaceElem::Index(_)) => true,
            _ => lhs == rhs,
        })
}

/// Simplified type carried on locals
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    /// Boolean type
    Bool,
    /// Integer type
    Int,
    /// Unit type
    Unit,
    /// Nominal type; structure lives in the type graph
    Named(TypeId),
    /// Tuple type
    Tuple(Vec<Ty>),
    /// Reference type
    Ref {
        /// Kind of borrow the reference grants
        kind: BorrowKind,
        /// Referent type
        inner: Box<Ty>,
        /// Declared lifetime parameter index, for signature positions
        lifetime: Option<usize>,
    },
}

impl Ty {
    /// Whether values of this type are duplicated on use instead of moved
    pub fn is_copy(&self) -> bool {
        match self {
            Self::Bool | Self::Int | Self::Unit => true,
            Self::Named(_) => false,
            Self::Tuple(elems) => elems.iter().all(Self::is_copy),
            Self::Ref { kind, .. } => *kind == BorrowKind::Shared,
        }
    }

    /// Whether the type is a reference
    pub fn is_ref(&self) -> bool {
        matches!(self, Self::Ref { .. })
    }

    /// Whether values of this type own resources and require a destructor
    pub fn needs_drop(&self, graph: &TypeGraph) -> bool {
        match self {
            Self::Bool | Self::Int | Self::Unit | Self::Ref { .. } => false,
            Self::Named(id) => graph.needs_drop(*id),
            Self::Tuple(elems) => elems.iter().any(|elem| elem.needs_drop(graph)),
        }
    }
}

/// Local variable declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Local {
    /// Local ID
    pub id: LocalId,
    /// Variable name; `None` for compiler temporaries
    pub name: Option<Symbol>,
    /// Declared type
    pub ty: Ty,
    /// Whether the binding is mutable
    pub mutable: bool,
}

/// Constant value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// Boolean constant
    Bool(bool),
    /// Integer constant
    Int(i64),
    /// Unit constant
    Unit,
}

/// Operand (value being read)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Copy a place's value; legal for `Copy`-semantics types
    Copy(Place),
    /// Move a place's value out, leaving the place deinitialized
    Move(Place),
    /// Constant value
    Constant(Constant),
}

impl Operand {
    /// The place read by this operand, if any
    pub fn place(&self) -> Option<&Place> {
        match self {
            Self::Copy(place) | Self::Move(place) => Some(place),
            Self::Constant(_) => None,
        }
    }
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RValue {
    /// Read a value (copy or move)
    Use(Operand),
    /// Create a reference to a place
    Ref {
        /// Kind of borrow
        kind: BorrowKind,
        /// Place being borrowed
        place: Place,
        /// Region allocated for this borrow expression
        region: RegionId,
    },
    /// Call a function
    Call {
        /// Callee name
        callee: Symbol,
        /// Arguments, each a read
        args: Vec<Operand>,
    },
}

/// CFG statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Assign an rvalue to a place
    Assign {
        /// Destination
        place: Place,
        /// Value being assigned
        rvalue: RValue,
        /// Source location
        span: FileSpan,
    },
    /// A local's structured scope begins
    StorageLive(LocalId),
    /// A local's structured scope ends
    StorageDead(LocalId),
    /// Destructor invocation, inserted by drop elaboration
    Drop {
        /// Place whose value is destroyed
        place: Place,
        /// Drop-flag local consulted first, for possibly-moved places
        guard: Option<LocalId>,
    },
    /// No-op
    Nop,
}

/// Block terminator (control flow)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional jump; jumps to earlier blocks are loop back-edges
    Goto(BasicBlockId),
    /// Two-way conditional branch
    Branch {
        /// Condition being read
        condition: Operand,
        /// Target when the condition is true
        then_bb: BasicBlockId,
        /// Target when the condition is false
        else_bb: BasicBlockId,
        /// Source location
        span: FileSpan,
    },
    /// Return from the function
    Return {
        /// Returned value, if any
        value: Option<Operand>,
        /// Source location
        span: FileSpan,
    },
    /// Code that will never be reached
    Unreachable,
}

/// Basic block in the control flow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicBlock {
    /// Block ID
    pub id: BasicBlockId,
    /// Statements in this block
    pub statements: Vec<Statement>,
    /// How control flow exits this block
    pub terminator: Terminator,
}

/// A program point: a statement slot within a block
///
/// The index one past the last statement addresses the terminator.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Containing block
    pub block: BasicBlockId,
    /// Statement index, or `statements.len()` for the terminator
    pub statement_index: usize,
}

impl Location {
    /// Creates a location
    pub fn new(block: BasicBlockId, statement_index: usize) -> Self {
        Self {
            block,
            statement_index,
        }
    }
}

/// A borrow expression found in the CFG, shared ground truth for the region
/// solver and the loan checker
#[derive(Debug, Clone, PartialEq)]
pub struct BorrowSite {
    /// Region allocated for the borrow
    pub region: RegionId,
    /// Kind of borrow
    pub kind: BorrowKind,
    /// Place being borrowed
    pub place: Place,
    /// Place the resulting reference is written into
    pub dest: Place,
    /// Program point of the borrow
    pub location: Location,
    /// Source location
    pub span: FileSpan,
}

/// A CFG function: the unit every per-function pass runs over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfgFunction {
    /// Function name
    pub name: Symbol,
    /// Span of the whole function
    pub span: FileSpan,
    /// Basic blocks; block ids index this vector
    pub basic_blocks: Vec<BasicBlock>,
    /// Local variables; the first `param_count` are parameters
    pub locals: Vec<Local>,
    /// Entry block ID
    pub entry_block: BasicBlockId,
    /// Number of parameters
    pub param_count: usize,
    /// Declared return type
    pub return_ty: Ty,
    /// Declared generic lifetime parameters
    pub lifetime_params: Vec<LifetimeParam>,
    /// Number of borrow regions allocated during building
    pub region_count: u32,
}

impl CfgFunction {
    /// Looks up a local declaration
    pub fn local(&self, id: LocalId) -> &Local {
        &self.locals[id.0 as usize]
    }

    /// Whether a local is a parameter
    pub fn is_param(&self, id: LocalId) -> bool {
        (id.0 as usize) < self.param_count
    }

    /// Successor blocks of a block
    pub fn successors(&self, block: BasicBlockId) -> Vec<BasicBlockId> {
        match &self.basic_blocks[block].terminator {
            Terminator::Goto(target) => vec![*target],
            Terminator::Branch {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            Terminator::Return { .. } | Terminator::Unreachable => Vec::new(),
        }
    }

    /// Predecessor lists for every block
    pub fn predecessors(&self) -> Vec<Vec<BasicBlockId>> {
        let mut preds = vec![Vec::new(); self.basic_blocks.len()];
        for block in &self.basic_blocks {
            for succ in self.successors(block.id) {
                preds[succ].push(block.id);
            }
        }
        preds
    }

    /// The program point of a block's terminator
    pub fn terminator_location(&self, block: BasicBlockId) -> Location {
        Location::new(block, self.basic_blocks[block].statements.len())
    }

    /// Iterates every program point, terminators included
    pub fn locations(&self) -> impl Iterator<Item = Location> + '_ {
        self.basic_blocks
            .iter()
            .flat_map(|block| (0..=block.statements.len()).map(|idx| Location::new(block.id, idx)))
    }

    /// Collects every borrow expression in the function
    pub fn borrow_sites(&self) -> Vec<BorrowSite> {
        let mut sites = Vec::new();
        for block in &self.basic_blocks {
            for (idx, stmt) in block.statements.iter().enumerate() {
                if let Statement::Assign {
                    place: dest,
                    rvalue: RValue::Ref {
                        kind,
                        place,
                        region,
                    },
                    span,
                } = stmt
                {
                    sites.push(BorrowSite {
                        region: *region,
                        kind: *kind,
                        place: place.clone(),
                        dest: dest.clone(),
                        location: Location::new(block.id, idx),
                        span: *span,
                    });
                }
            }
        }
        sites
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(index: u32) -> LocalId {
        LocalId(index)
    }

    #[test]
    fn bare_place_overlaps_its_projections() {
        let base = Place::from_local(local(0));
        let field = Place::from_local(local(0)).field(1);
        assert!(places_overlap(&base, &field));
        assert!(places_overlap(&field, &base));
    }

    #[test]
    fn sibling_fields_do_not_overlap() {
        let first = Place::from_local(local(0)).field(0);
        let second = Place::from_local(local(0)).field(1);
        assert!(!places_overlap(&first, &second));
    }

    #[test]
    fn distinct_locals_never_overlap() {
        let first = Place::from_local(local(0));
        let second = Place::from_local(local(1));
        assert!(!places_overlap(&first, &second));
    }

    #[test]
    fn index_projections_overlap_conservatively() {
        let mut first = Place::from_local(local(0));
        first.projection.push(PlaceElem::Index(local(1)));
        let mut second = Place::from_local(local(0));
        second.projection.push(PlaceElem::Index(local(2)));
        assert!(places_overlap(&first, &second));
    }

    #[test]
    fn shared_refs_are_copy_exclusive_refs_are_not() {
        let shared = Ty::Ref {
            kind: BorrowKind::Shared,
            inner: Box::new(Ty::Int),
            lifetime: None,
        };
        let exclusive = Ty::Ref {
            kind: BorrowKind::Exclusive,
            inner: Box::new(Ty::Int),
            lifetime: None,
        };
        assert!(shared.is_copy());
        assert!(!exclusive.is_copy());
    }
}
