//! String interning for symbols
//!
//! Local names, type names, and callee names are interned once and passed
//! around as copyable [`Symbol`] handles.

pub use lasso::Spur as Symbol;
use lasso::ThreadedRodeo;
use std::sync::Arc;

/// Thread-safe string interner
#[derive(Clone)]
pub struct Interner {
    inner: Arc<ThreadedRodeo>,
}

impl Interner {
    /// Creates an empty interner
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ThreadedRodeo::new()),
        }
    }

    /// Interns a string, returning its symbol
    pub fn intern(&self, text: &str) -> Symbol {
        self.inner.get_or_intern(text)
    }

    /// Resolves a symbol back to its string
    pub fn resolve(&self, sym: Symbol) -> &str {
        self.inner.resolve(&sym)
    }

    /// Resolves a symbol if it was interned by this interner
    pub fn try_resolve(&self, sym: Symbol) -> Option<&str> {
        self.inner.try_resolve(&sym)
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}
