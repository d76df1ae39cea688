//! Output formatting for diagnostics

use std::fmt::Write as _;
use std::path::Path;

use colored::*;
use redmatch_core::syntax::LineIndex;
use redmatch_core::{Diagnostic, RedmatchError, Result, Severity};

use crate::OutputFormat;

/// Diagnostic counts by severity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticSummary {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
    pub hints: usize,
}

impl DiagnosticSummary {
    pub fn from_diagnostics(diagnostics: &[Diagnostic]) -> Self {
        let mut summary = Self::default();
        for diagnostic in diagnostics {
            match diagnostic.severity {
                Severity::Error => summary.errors += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Information => summary.info += 1,
                Severity::Hint => summary.hints += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.info + self.hints
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

/// Output formatter for diagnostics of one rules document
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn print_diagnostics(
        &self,
        path: &Path,
        source: &str,
        diagnostics: &[Diagnostic],
        summary: &DiagnosticSummary,
    ) -> Result<()> {
        match self.format {
            OutputFormat::Human => {
                print!("{}", render_human(path, source, diagnostics, summary));
                Ok(())
            }
            OutputFormat::Json => {
                let result = serde_json::json!({
                    "file": path.display().to_string(),
                    "diagnostics": diagnostics,
                    "summary": {
                        "errors": summary.errors,
                        "warnings": summary.warnings,
                        "info": summary.info,
                        "hints": summary.hints,
                        "total": summary.total(),
                    }
                });
                let rendered = serde_json::to_string_pretty(&result).map_err(|e| {
                    RedmatchError::internal_error(format!("Failed to serialize JSON: {e}"))
                })?;
                println!("{rendered}");
                Ok(())
            }
        }
    }
}

fn render_human(
    path: &Path,
    source: &str,
    diagnostics: &[Diagnostic],
    summary: &DiagnosticSummary,
) -> String {
    let index = LineIndex::new(source);
    let mut out = String::new();

    for diagnostic in diagnostics {
        render_diagnostic(&mut out, path, &index, diagnostic);
    }

    if summary.total() == 0 {
        let _ = writeln!(out, "{} {}: no problems found", "✔".green(), path.display());
    } else {
        let _ = writeln!(
            out,
            "{}: {} error(s), {} warning(s), {} info",
            path.display(),
            summary.errors.to_string().red(),
            summary.warnings.to_string().yellow(),
            summary.info.to_string().blue()
        );
    }
    out
}

fn render_diagnostic(out: &mut String, path: &Path, index: &LineIndex<'_>, diagnostic: &Diagnostic) {
    let severity = match diagnostic.severity {
        Severity::Error => "error".red().bold(),
        Severity::Warning => "warning".yellow().bold(),
        Severity::Information => "info".blue().bold(),
        Severity::Hint => "hint".cyan().bold(),
    };
    let location = &diagnostic.location;
    let _ = writeln!(
        out,
        "{}[{}]: {}",
        severity,
        diagnostic.code,
        diagnostic.message.bold()
    );
    let _ = writeln!(
        out,
        "  {} {}:{}:{}",
        "-->".blue(),
        path.display(),
        location.line + 1,
        location.column + 1
    );

    let line_text = index.line_text(location.line);
    let gutter = (location.line + 1).to_string();
    let pad = " ".repeat(gutter.len());
    let width = if location.end_line == location.line {
        location.end_column.saturating_sub(location.column)
    } else {
        line_text.chars().count().saturating_sub(location.column)
    }
    .max(1);
    let _ = writeln!(out, "{pad} {}", "|".blue());
    let _ = writeln!(out, "{} {} {}", gutter.blue(), "|".blue(), line_text);
    let _ = writeln!(
        out,
        "{pad} {} {}{}",
        "|".blue(),
        " ".repeat(location.column),
        "^".repeat(width).red()
    );
    if let Some(suggestion) = &diagnostic.suggestion {
        let _ = writeln!(
            out,
            "{pad} {} help: did you mean '{}'?",
            "=".blue(),
            suggestion.replacement
        );
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use redmatch_core::{DiagnosticCode, Location};

    fn unknown_field() -> Diagnostic {
        Diagnostic::error(
            DiagnosticCode::UnknownField,
            "Field 'pat_dox' is not in the schema",
            Location {
                line: 1,
                column: 7,
                end_line: 1,
                end_column: 14,
                offset: 16,
                length: 7,
            },
        )
        .with_suggestion("pat_dox", "pat_dob")
    }

    #[test]
    fn test_summary_counts() {
        let diagnostics = vec![
            unknown_field(),
            Diagnostic::warning(
                DiagnosticCode::MappingNotNeeded,
                "Mapping for field x is not needed",
                Location::default(),
            ),
        ];
        let summary = DiagnosticSummary::from_diagnostics(&diagnostics);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.total(), 2);
        assert!(summary.has_errors());
    }

    #[test]
    fn test_human_rendering_points_at_the_field() {
        colored::control::set_override(false);
        let source = "RULES: {\n  NULL(pat_dox) { }\n}";
        let diagnostics = vec![unknown_field()];
        let summary = DiagnosticSummary::from_diagnostics(&diagnostics);
        let rendered = render_human(Path::new("study.rdm"), source, &diagnostics, &summary);

        assert!(rendered.contains("error[unknown-field]: Field 'pat_dox' is not in the schema"));
        assert!(rendered.contains("--> study.rdm:2:8"));
        assert!(rendered.contains("2 |   NULL(pat_dox) { }"));
        assert!(rendered.contains("  |        ^^^^^^^"));
        assert!(rendered.contains("help: did you mean 'pat_dob'?"));
        assert!(rendered.contains("1 error(s), 0 warning(s)"));
    }

    #[test]
    fn test_clean_document() {
        colored::control::set_override(false);
        let rendered = render_human(
            Path::new("study.rdm"),
            "",
            &[],
            &DiagnosticSummary::default(),
        );
        assert!(rendered.contains("study.rdm: no problems found"));
    }
}
