//! Lexing and parsing of rules documents

pub mod lexer;
pub mod parser;

pub use lexer::{LexResult, LexerError, Span, Token, TokenKind, lex};
pub use parser::{MAX_EXPANDED_RULES, MAX_NESTING, MAX_REPEAT, ParseResult, parse};

use crate::diagnostics::Location;

/// Maps byte offsets to zero-based line/column positions
#[derive(Debug, Clone)]
pub struct LineIndex<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self {
            source,
            line_starts,
        }
    }

    /// Line and column (in characters) of a byte offset
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.source.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];
        let column = self
            .source
            .get(start..offset)
            .map(|s| s.chars().count())
            .unwrap_or(offset - start);
        (line, column)
    }

    pub fn location(&self, span: &Span) -> Location {
        let (line, column) = self.line_col(span.start);
        let (end_line, end_column) = self.line_col(span.end);
        Location {
            line,
            column,
            end_line,
            end_column,
            offset: span.start,
            length: span.end.saturating_sub(span.start),
        }
    }

    /// Byte offset of a line/column position, clamped to the source
    pub fn offset(&self, line: usize, column: usize) -> usize {
        let Some(&start) = self.line_starts.get(line) else {
            return self.source.len();
        };
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.source.len());
        self.source[start..end]
            .char_indices()
            .nth(column)
            .map(|(i, _)| start + i)
            .unwrap_or(end)
    }

    /// Line and column in UTF-16 code units of a byte offset, as editors count them
    pub fn line_col_utf16(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.source.len());
        let (line, _) = self.line_col(offset);
        let start = self.line_starts[line];
        let column = self
            .source
            .get(start..offset)
            .map(|s| s.encode_utf16().count())
            .unwrap_or(offset - start);
        (line, column)
    }

    /// Byte offset of a line and UTF-16 column, clamped to the end of the line
    pub fn offset_utf16(&self, line: usize, character: usize) -> usize {
        let Some(&start) = self.line_starts.get(line) else {
            return self.source.len();
        };
        let text = self.line_text(line);
        let mut units = 0;
        for (i, c) in text.char_indices() {
            if units >= character {
                return start + i;
            }
            units += c.len_utf16();
        }
        start + text.len()
    }

    /// Text of `line` without its terminator
    pub fn line_text(&self, line: usize) -> &'a str {
        let Some(&start) = self.line_starts.get(line) else {
            return "";
        };
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.source.len());
        self.source[start..end].trim_end_matches(['\n', '\r'])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let index = LineIndex::new("ab\ncd\n\nef");
        assert_eq!(index.line_col(0), (0, 0));
        assert_eq!(index.line_col(3), (1, 0));
        assert_eq!(index.line_col(4), (1, 1));
        assert_eq!(index.line_col(7), (3, 0));
    }

    #[test]
    fn test_columns_count_characters() {
        let index = LineIndex::new("é = 1");
        assert_eq!(index.line_col(3), (0, 2));
    }

    #[test]
    fn test_utf16_columns_count_surrogate_pairs() {
        let source = "// 🩺 é\nVALUE(pat";
        let index = LineIndex::new(source);
        let after_emoji = "// 🩺".len();
        assert_eq!(index.line_col(after_emoji), (0, 4));
        assert_eq!(index.line_col_utf16(after_emoji), (0, 5));
        assert_eq!(index.offset_utf16(0, 5), after_emoji);
        assert_eq!(index.offset_utf16(0, 100), "// 🩺 é".len());
        assert_eq!(index.offset_utf16(1, 6), source.len() - 3);
        assert_eq!(index.offset_utf16(7, 0), source.len());
    }

    #[test]
    fn test_offset_round_trips_line_col() {
        let source = "RULES: {\n  VALUE(pat";
        let index = LineIndex::new(source);
        let offset = index.offset(1, 11);
        assert_eq!(offset, source.len());
        assert_eq!(index.line_col(offset), (1, 11));
        assert_eq!(index.line_text(1), "  VALUE(pat");
    }
}
