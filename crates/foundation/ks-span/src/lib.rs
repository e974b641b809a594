//! Source file spans and locations

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A unique identifier for a source file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileId(pub u32);

impl FileId {
    /// Creates a file id from a raw index
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// A byte offset span in a source file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Start byte offset, inclusive
    pub start: u32,
    /// End byte offset, exclusive
    pub end: u32,
}

impl Span {
    /// Creates a span from start and end byte offsets
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The span as a byte range
    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }

    /// Number of bytes covered by the span
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    /// Whether the span covers zero bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The smallest span covering both `self` and `other`
    pub fn merge(&self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// A span with associated file
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileSpan {
    /// File the span points into
    pub file: FileId,
    /// Byte span within that file
    pub span: Span,
}

impl FileSpan {
    /// Creates a file span
    pub fn new(file: FileId, span: Span) -> Self {
        Self { file, span }
    }

    /// The span as a byte range
    pub fn range(&self) -> Range<usize> {
        self.span.range()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_covers_both_spans() {
        let merged = Span::new(4, 8).merge(Span::new(1, 6));
        assert_eq!(merged, Span::new(1, 8));
    }

    #[test]
    fn empty_span() {
        assert!(Span::new(3, 3).is_empty());
        assert_eq!(Span::new(3, 7).len(), 4);
    }
}
