//! Structural type graph
//!
//! Struct/enum declarations arrive from the upstream type checker as a graph:
//! nodes are nominal types (generic instantiations are distinct nodes), edges
//! are field types. The graph is consumed by the Send/Sync deriver and by
//! drop elaboration, which needs to know whether a type owns resources.

use indexmap::IndexMap;
use ks_intern::Symbol;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Identifies a nominal type (or one generic instantiation of it) in the graph
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// A field edge in the type graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTy {
    /// Primitive scalar: always thread-safe, never owns resources
    Prim,
    /// Another nominal node, possibly the defining node itself
    Named(TypeId),
}

/// A nominal type definition
#[derive(Debug, Clone)]
pub struct TypeDef {
    /// Type name (instantiations carry distinct mangled names)
    pub name: Symbol,
    /// Field edges in declaration order
    pub fields: Vec<FieldTy>,
    /// Whether the type has destructor semantics of its own
    pub has_destructor: bool,
    /// Explicit opt-out or known non-Send primitive wrapper
    pub not_send: bool,
    /// Explicit opt-out or unsynchronized interior mutability
    pub not_sync: bool,
}

impl TypeDef {
    /// Creates a plain definition with no fields and no special capabilities
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            fields: Vec::new(),
            has_destructor: false,
            not_send: false,
            not_sync: false,
        }
    }
}

/// The whole-program type graph
///
/// Definitions are kept in insertion order so that derived tables and
/// diagnostics are deterministic across runs.
#[derive(Debug, Clone, Default)]
pub struct TypeGraph {
    defs: IndexMap<TypeId, TypeDef>,
}

impl TypeGraph {
    /// Creates an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a type, returning its id
    ///
    /// Fields may be filled in afterwards through [`TypeGraph::get_mut`],
    /// which is how self-referential types are constructed.
    pub fn declare(&mut self, name: Symbol) -> TypeId {
        let id = TypeId(self.defs.len() as u32);
        self.defs.insert(id, TypeDef::new(name));
        id
    }

    /// Looks up a definition
    pub fn get(&self, id: TypeId) -> Option<&TypeDef> {
        self.defs.get(&id)
    }

    /// Looks up a definition for modification during graph construction
    pub fn get_mut(&mut self, id: TypeId) -> Option<&mut TypeDef> {
        self.defs.get_mut(&id)
    }

    /// Number of definitions
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Whether the graph has no definitions
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterates definitions in declaration order
    pub fn defs(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> {
        self.defs.iter().map(|(id, def)| (*id, def))
    }

    /// Whether values of this type own resources and need a destructor call
    ///
    /// True when the type or any type reachable through its fields carries
    /// destructor semantics. Cycles contribute nothing: a recursive edge back
    /// into a type already on the walk cannot add a destructor that the walk
    /// has not already seen.
    pub fn needs_drop(&self, id: TypeId) -> bool {
        fn walk(graph: &TypeGraph, id: TypeId, visiting: &mut FxHashSet<TypeId>) -> bool {
            if !visiting.insert(id) {
                return false;
            }
            // Unknown ids are treated as owning, matching the conservative
            // posture of the rest of the engine.
            let Some(def) = graph.defs.get(&id) else {
                return true;
            };
            let owns = def.has_destructor
                || def.fields.iter().any(|field| match field {
                    FieldTy::Prim => false,
                    FieldTy::Named(inner) => walk(graph, *inner, visiting),
                });
            visiting.remove(&id);
            owns
        }

        walk(self, id, &mut FxHashSet::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ks_intern::Interner;

    #[test]
    fn destructor_flag_propagates_through_fields() {
        let interner = Interner::new();
        let mut graph = TypeGraph::new();
        let buffer = graph.declare(interner.intern("Buffer"));
        graph.get_mut(buffer).unwrap().has_destructor = true;
        let wrapper = graph.declare(interner.intern("Wrapper"));
        graph.get_mut(wrapper).unwrap().fields = vec![FieldTy::Named(buffer), FieldTy::Prim];

        assert!(graph.needs_drop(buffer));
        assert!(graph.needs_drop(wrapper));
    }

    #[test]
    fn recursive_type_without_destructor_does_not_need_drop() {
        let interner = Interner::new();
        let mut graph = TypeGraph::new();
        let node = graph.declare(interner.intern("Node"));
        graph.get_mut(node).unwrap().fields = vec![FieldTy::Prim, FieldTy::Named(node)];

        assert!(!graph.needs_drop(node));
    }

    #[test]
    fn recursive_type_with_destructor_terminates() {
        let interner = Interner::new();
        let mut graph = TypeGraph::new();
        let node = graph.declare(interner.intern("List"));
        let def = graph.get_mut(node).unwrap();
        def.fields = vec![FieldTy::Named(node)];
        def.has_destructor = true;

        assert!(graph.needs_drop(node));
    }
}
