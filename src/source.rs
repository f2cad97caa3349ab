//! Source positions and spans
//!
//! Every token, AST node, symbol, IL instruction, and diagnostic carries a
//! [`SourceLocation`] so that later phases can point back at the code that
//! produced them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single point in a source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePosition {
    /// Name of the source file (module path or file name)
    pub file: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Byte offset from the start of the file
    pub offset: usize,
}

impl SourcePosition {
    /// Creates a position at the start of the given file
    pub fn start_of(file: &str) -> Self {
        SourcePosition {
            file: file.to_string(),
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A span of source text between two positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Start of the span (inclusive)
    pub start: SourcePosition,
    /// End of the span (exclusive)
    pub end: SourcePosition,
    /// Original text covered by the span, when the producer kept it
    pub text: Option<String>,
}

impl SourceLocation {
    /// Creates a span covering `start..end`
    pub fn new(start: SourcePosition, end: SourcePosition) -> Self {
        SourceLocation {
            start,
            end,
            text: None,
        }
    }

    /// A zero-width span at the start of the given file
    pub fn start_of(file: &str) -> Self {
        let pos = SourcePosition::start_of(file);
        SourceLocation::new(pos.clone(), pos)
    }

    /// Merge two spans into one covering both
    pub fn merge(&self, other: &SourceLocation) -> SourceLocation {
        let start = if self.start.offset <= other.start.offset {
            self.start.clone()
        } else {
            other.start.clone()
        };
        let end = if self.end.offset >= other.end.offset {
            self.end.clone()
        } else {
            other.end.clone()
        };
        SourceLocation::new(start, end)
    }

    /// File this span belongs to
    pub fn file(&self) -> &str {
        &self.start.file
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_spans() {
        let mut a = SourceLocation::start_of("t.bl65");
        a.end.offset = 4;
        let mut b = SourceLocation::start_of("t.bl65");
        b.start.offset = 2;
        b.end.offset = 9;

        let merged = a.merge(&b);
        assert_eq!(merged.start.offset, 0);
        assert_eq!(merged.end.offset, 9);
    }

    #[test]
    fn test_display() {
        let pos = SourcePosition {
            file: "main.bl65".to_string(),
            line: 3,
            column: 7,
            offset: 42,
        };
        assert_eq!(pos.to_string(), "main.bl65:3:7");
    }
}
