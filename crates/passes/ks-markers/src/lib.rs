//! Send/Sync derivation
//!
//! Structural thread-safety markers are derived coinductively over the type
//! graph: every type starts with both capabilities, explicit opt-outs strip
//! theirs, and a worklist then shrinks the rest until stable. A type keeps a
//! capability only while all of its field types keep it, so a lost capability
//! propagates to everything that embeds the loser. Recursive types are safe
//! by construction: a self-edge can only confirm the optimistic assumption,
//! never grow the changed set, so the fixpoint terminates.

use indexmap::IndexMap;
use ks_types::{FieldTy, TypeGraph, TypeId};
use rustc_hash::FxHashMap;

/// Thread-safety capabilities of one type.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Markers {
    /// Values may be transferred to another thread
    pub send: bool,
    /// Shared references may be accessed from another thread
    pub sync: bool,
}

impl Markers {
    /// Both capabilities present, the optimistic starting point.
    pub fn all() -> Self {
        Self {
            send: true,
            sync: true,
        }
    }

    fn intersect(self, other: Markers) -> Markers {
        Markers {
            send: self.send && other.send,
            sync: self.sync && other.sync,
        }
    }
}

/// Derived markers for every type, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct MarkerTable {
    markers: IndexMap<TypeId, Markers>,
}

impl MarkerTable {
    /// The markers of a type. Unknown ids carry no capabilities.
    pub fn get(&self, id: TypeId) -> Markers {
        self.markers.get(&id).copied().unwrap_or(Markers {
            send: false,
            sync: false,
        })
    }

    /// Iterates entries in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, Markers)> + '_ {
        self.markers.iter().map(|(id, markers)| (*id, *markers))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

/// Derives Send/Sync markers for every type in the graph.
pub fn derive_markers(graph: &TypeGraph) -> MarkerTable {
    let mut markers: IndexMap<TypeId, Markers> = graph
        .defs()
        .map(|(id, def)| {
            (
                id,
                Markers {
                    send: !def.not_send,
                    sync: !def.not_sync,
                },
            )
        })
        .collect();

    // Reverse field edges: who embeds whom.
    let mut dependents: FxHashMap<TypeId, Vec<TypeId>> = FxHashMap::default();
    for (id, def) in graph.defs() {
        for field in &def.fields {
            if let FieldTy::Named(inner) = field {
                dependents.entry(*inner).or_default().push(id);
            }
        }
    }

    let mut worklist: Vec<TypeId> = markers.keys().copied().collect();
    while let Some(id) = worklist.pop() {
        let Some(def) = graph.get(id) else { continue };
        let mut derived = markers.get(&id).copied().unwrap_or(Markers::all());
        for field in &def.fields {
            let field_markers = match field {
                FieldTy::Prim => Markers::all(),
                FieldTy::Named(inner) => markers.get(inner).copied().unwrap_or(Markers {
                    send: false,
                    sync: false,
                }),
            };
            derived = derived.intersect(field_markers);
        }
        let current = markers.get(&id).copied().unwrap_or(Markers::all());
        if derived != current {
            markers.insert(id, derived);
            if let Some(embedders) = dependents.get(&id) {
                worklist.extend(embedders.iter().copied());
            }
        }
    }

    MarkerTable { markers }
}
