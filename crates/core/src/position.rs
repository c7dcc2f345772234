//! Source files and positions
//!
//! The compiler records a byte offset per emitted instruction; offsets are
//! resolved to line/column pairs only when an error or stack trace needs
//! them.

use std::fmt;
use std::rc::Rc;

/// A compiled source file: name plus full text, with a line-start table for
/// offset resolution.
pub struct SrcFile {
    name: String,
    src: String,
    line_starts: Vec<u32>,
}

impl SrcFile {
    pub fn new(name: impl Into<String>, src: impl Into<String>) -> Rc<SrcFile> {
        let src = src.into();
        let mut line_starts = vec![0u32];
        for (i, b) in src.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push((i + 1) as u32);
            }
        }
        Rc::new(SrcFile {
            name: name.into(),
            src,
            line_starts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    /// Resolve a byte offset to a 1-based line/column position.
    pub fn position(&self, offset: usize) -> Position {
        let offset = offset.min(self.src.len()) as u32;
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Position {
            line: line + 1,
            column: (offset - self.line_starts[line]) as usize + 1,
        }
    }
}

impl fmt::Debug for SrcFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SrcFile({})", self.name)
    }
}

/// 1-based line/column pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_resolve_to_lines_and_columns() {
        let f = SrcFile::new("t.js", "ab\ncd\n\nx");
        assert_eq!(f.position(0), Position { line: 1, column: 1 });
        assert_eq!(f.position(1), Position { line: 1, column: 2 });
        assert_eq!(f.position(3), Position { line: 2, column: 1 });
        assert_eq!(f.position(6), Position { line: 3, column: 1 });
        assert_eq!(f.position(7), Position { line: 4, column: 1 });
        // Past-the-end offsets clamp to the last position.
        assert_eq!(f.position(999), Position { line: 4, column: 2 });
    }
}
