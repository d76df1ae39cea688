//! Diagnostics produced while parsing and resolving rules documents
//!
//! Diagnostics are accumulated, never thrown. The editing path and the
//! command line both consume the same [`Diagnostic`] values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity levels for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Hint,
    Information,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Hint => write!(f, "hint"),
            Severity::Information => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// Position of a node in the source text.
///
/// Lines and columns are zero-based, columns count characters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub line: usize,
    pub column: usize,
    pub end_line: usize,
    pub end_column: usize,
    pub offset: usize,
    pub length: usize,
}

impl Location {
    /// Byte range covered by this location
    pub fn span(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.length
    }

    /// Smallest location covering both `self` and `other`
    pub fn to(&self, other: &Location) -> Location {
        let end = (self.offset + self.length).max(other.offset + other.length);
        let (end_line, end_column) = if other.offset + other.length >= self.offset + self.length {
            (other.end_line, other.end_column)
        } else {
            (self.end_line, self.end_column)
        };
        Location {
            line: self.line,
            column: self.column,
            end_line,
            end_column,
            offset: self.offset,
            length: end - self.offset,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

/// Stable identifiers for every class of diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticCode {
    Lexer,
    Parser,
    UnknownVariable,
    UnknownField,
    InvalidFieldId,
    InvalidFhirId,
    UnknownAlias,
    UnresolvedResource,
    ResourceCycle,
    IncompatibleExpression,
    InvalidDatePrecision,
    MappingMissing,
    MappingNotNeeded,
    MappedFieldMissing,
    MappedFieldLabelMismatch,
    MissingSchema,
    SchemaUnavailable,
    InvalidTarget,
    InvalidAttributePath,
    AttributeNotAllowed,
    InvalidAttributeIndex,
    IncompatibleType,
    InvalidCode,
    TerminologySkipped,
}

impl DiagnosticCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosticCode::Lexer => "lexer",
            DiagnosticCode::Parser => "parser",
            DiagnosticCode::UnknownVariable => "unknown-variable",
            DiagnosticCode::UnknownField => "unknown-field",
            DiagnosticCode::InvalidFieldId => "invalid-field-id",
            DiagnosticCode::InvalidFhirId => "invalid-fhir-id",
            DiagnosticCode::UnknownAlias => "unknown-alias",
            DiagnosticCode::UnresolvedResource => "unresolved-resource",
            DiagnosticCode::ResourceCycle => "resource-cycle",
            DiagnosticCode::IncompatibleExpression => "incompatible-expression",
            DiagnosticCode::InvalidDatePrecision => "invalid-date-precision",
            DiagnosticCode::MappingMissing => "mapping-missing",
            DiagnosticCode::MappingNotNeeded => "mapping-not-needed",
            DiagnosticCode::MappedFieldMissing => "mapped-field-missing",
            DiagnosticCode::MappedFieldLabelMismatch => "mapped-field-label-mismatch",
            DiagnosticCode::MissingSchema => "missing-schema",
            DiagnosticCode::SchemaUnavailable => "schema-unavailable",
            DiagnosticCode::InvalidTarget => "invalid-target",
            DiagnosticCode::InvalidAttributePath => "invalid-attribute-path",
            DiagnosticCode::AttributeNotAllowed => "attribute-not-allowed",
            DiagnosticCode::InvalidAttributeIndex => "invalid-attribute-index",
            DiagnosticCode::IncompatibleType => "incompatible-type",
            DiagnosticCode::InvalidCode => "invalid-code",
            DiagnosticCode::TerminologySkipped => "terminology-skipped",
        }
    }

    /// Codes that are part of the syntax (as opposed to resolution) pass
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            DiagnosticCode::Lexer | DiagnosticCode::Parser | DiagnosticCode::UnknownVariable
        )
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replacement the editor can offer as a quick fix
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Suggestion {
    pub original: String,
    pub replacement: String,
}

/// A single problem found in a rules document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Suggestion>,
}

impl Diagnostic {
    pub fn new(
        severity: Severity,
        code: DiagnosticCode,
        message: impl Into<String>,
        location: Location,
    ) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            location,
            suggestion: None,
        }
    }

    pub fn error(code: DiagnosticCode, message: impl Into<String>, location: Location) -> Self {
        Self::new(Severity::Error, code, message, location)
    }

    pub fn warning(code: DiagnosticCode, message: impl Into<String>, location: Location) -> Self {
        Self::new(Severity::Warning, code, message, location)
    }

    pub fn info(code: DiagnosticCode, message: impl Into<String>, location: Location) -> Self {
        Self::new(Severity::Information, code, message, location)
    }

    pub fn with_suggestion(
        mut self,
        original: impl Into<String>,
        replacement: impl Into<String>,
    ) -> Self {
        self.suggestion = Some(Suggestion {
            original: original.into(),
            replacement: replacement.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]: {}",
            self.location, self.severity, self.code, self.message
        )
    }
}

/// True if any diagnostic is an error
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Sort by position and drop exact duplicates, keeping the first occurrence
pub fn normalize(diagnostics: &mut Vec<Diagnostic>) {
    let mut seen = std::collections::HashSet::new();
    diagnostics.retain(|d| seen.insert(d.clone()));
    diagnostics.sort_by(|a, b| {
        a.location
            .offset
            .cmp(&b.location.offset)
            .then_with(|| b.severity.cmp(&a.severity))
    });
}
