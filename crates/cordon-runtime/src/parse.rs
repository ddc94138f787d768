//! Parser adapter: source text to dialect AST with 1-based locations.
//!
//! The grammar itself is external (`rustpython-parser`); this module only
//! wraps parsing and converts byte offsets into line/column pairs for
//! error reporting.

use rustpython_parser::ast::Suite;
use rustpython_parser::{Parse, ParseError};

/// Byte-offset to (line, column) conversion, both 1-based.
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    pub fn location(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let col = offset - self.line_starts[line];
        (line as u32 + 1, col as u32 + 1)
    }
}

/// Parse failure with source coordinates already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub message: String,
    pub lineno: u32,
    pub col: u32,
}

/// Parse a module-level program.
pub fn parse_program(source: &str) -> Result<Suite, ParseFailure> {
    Suite::parse(source, "<sandbox>").map_err(|e| parse_failure(source, e))
}

fn parse_failure(source: &str, err: ParseError) -> ParseFailure {
    let index = LineIndex::new(source);
    let offset = usize::try_from(u32::from(err.offset)).unwrap_or(0);
    let (lineno, col) = index.location(offset.min(source.len()));
    ParseFailure {
        message: err.error.to_string(),
        lineno,
        col,
    }
}
