//! Conversion of rules diagnostics to LSP diagnostics

use redmatch_core::syntax::LineIndex;
use redmatch_core::{Diagnostic, Severity};
use tower_lsp::lsp_types::{self, DiagnosticSeverity, NumberOrString, Position, Range};

pub const SOURCE: &str = "redmatch";

/// Character columns become UTF-16 columns of the analysed text
fn position(index: &LineIndex<'_>, line: usize, column: usize) -> Position {
    let (line, character) = index.line_col_utf16(index.offset(line, column));
    Position::new(line as u32, character as u32)
}

pub fn to_lsp(diagnostic: &Diagnostic, index: &LineIndex<'_>) -> lsp_types::Diagnostic {
    let location = &diagnostic.location;
    let range = Range::new(
        position(index, location.line, location.column),
        position(index, location.end_line, location.end_column),
    );
    let severity = match diagnostic.severity {
        Severity::Error => DiagnosticSeverity::ERROR,
        Severity::Warning => DiagnosticSeverity::WARNING,
        Severity::Information => DiagnosticSeverity::INFORMATION,
        Severity::Hint => DiagnosticSeverity::HINT,
    };

    lsp_types::Diagnostic {
        range,
        severity: Some(severity),
        code: Some(NumberOrString::String(diagnostic.code.as_str().to_string())),
        source: Some(SOURCE.to_string()),
        message: diagnostic.message.clone(),
        // Quick fixes read the replacement back from here
        data: diagnostic
            .suggestion
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok()),
        ..Default::default()
    }
}
