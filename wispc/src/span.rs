//! Source spans and line lookup.
//!
//! Spans are plain byte ranges into the source file. Line and column
//! numbers are only needed when a diagnostic is rendered or the runtime
//! diagnostics section is written, so they are computed on demand through
//! a [`LineIndex`] instead of being cached in every span.

use serde::{Deserialize, Serialize};
use wisp_runtime::LineCol;

/// A precomputed index of line start positions for O(log n) line/column lookup.
#[derive(Debug, Clone)]
pub struct LineIndex {
    /// Byte offsets where each line starts. line_starts[0] = 0.
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (offset, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset + 1);
            }
        }
        Self {
            line_starts,
            len: source.len(),
        }
    }

    /// 1-based line and column of a byte offset. Offsets past the end clamp
    /// to the end of the source.
    pub fn line_col(&self, offset: usize) -> LineCol {
        let offset = offset.min(self.len);
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        LineCol {
            line: (line_idx + 1) as u32,
            col: (offset - self.line_starts[line_idx] + 1) as u32,
        }
    }

    /// Start and end positions of a span.
    pub fn span_bounds(&self, span: Span) -> (LineCol, LineCol) {
        (self.line_col(span.start), self.line_col(span.end))
    }
}

/// A contiguous byte range in the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    /// Byte offset of the start (inclusive).
    pub start: usize,
    /// Byte offset of the end (exclusive).
    pub end: usize,
}

impl Span {
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// A span for synthesized code.
    pub const fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Smallest span covering both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn to_u32_range(self) -> std::ops::Range<u32> {
        self.start as u32..self.end as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let index = LineIndex::new("fn main() {\n    let x = 1;\n}");
        assert_eq!(index.line_col(0), LineCol { line: 1, col: 1 });
        assert_eq!(index.line_col(3), LineCol { line: 1, col: 4 });
        assert_eq!(index.line_col(12), LineCol { line: 2, col: 1 });
        assert_eq!(index.line_col(16), LineCol { line: 2, col: 5 });
        assert_eq!(index.line_col(1_000), LineCol { line: 3, col: 2 });
    }

    #[test]
    fn test_span_merge() {
        let merged = Span::new(0, 5).merge(Span::new(10, 15));
        assert_eq!(merged, Span::new(0, 15));
        assert_eq!(merged.len(), 15);
        assert!(Span::dummy().is_empty());
    }
}
