//! Error types for Redmatch operations
//!
//! Parse and resolution problems are never errors: they are reported as
//! [`Diagnostic`](crate::diagnostics::Diagnostic) values. The types here cover
//! the failures that abort an operation (importing a schema, talking to a
//! terminology server, running a transformation, loading configuration).

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::diagnostics::Location;

/// Main error type for Redmatch operations
#[derive(Debug, Error)]
pub enum RedmatchError {
    /// Malformed schema export
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// Terminology server failures
    #[error("Terminology error: {0}")]
    Terminology(#[from] TerminologyError),

    /// Transformation failures
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Configuration loading or validation errors
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// File system I/O errors
    #[error("IO error for path '{path}': {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A rules document that cannot be used for the requested operation
    #[error("Invalid rules document: {message}")]
    InvalidDocument { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

/// Error kind enumeration for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Import,
    Terminology,
    Execution,
    Config,
    Io,
    Document,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Import => "import",
            ErrorKind::Terminology => "terminology",
            ErrorKind::Execution => "execution",
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Document => "document",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl RedmatchError {
    /// Get the error kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedmatchError::Import(_) => ErrorKind::Import,
            RedmatchError::Terminology(_) => ErrorKind::Terminology,
            RedmatchError::Execution(_) => ErrorKind::Execution,
            RedmatchError::ConfigError { .. } => ErrorKind::Config,
            RedmatchError::IoError { .. } => ErrorKind::Io,
            RedmatchError::InvalidDocument { .. } => ErrorKind::Document,
            RedmatchError::InternalError { .. } => ErrorKind::Internal,
        }
    }

    /// Check if this error is recoverable (the caller can move on to the next input)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Import | ErrorKind::Terminology | ErrorKind::Document
        )
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create an IO error with path context
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoError {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Tag this error with a fresh correlation id and log it.
    ///
    /// Call this once, where the failure leaves the core (CLI exit path,
    /// language server notification). Internal propagation keeps the plain
    /// error so one failure maps to exactly one id.
    pub fn report(&self) -> ReportedError {
        let reported = ReportedError {
            kind: self.kind(),
            message: self.to_string(),
            correlation_id: Uuid::new_v4(),
        };
        tracing::error!(
            correlation_id = %reported.correlation_id,
            kind = %reported.kind,
            "{}",
            reported.message
        );
        reported
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for RedmatchError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError {
            path: PathBuf::new(),
            source: err,
        }
    }
}

/// A failure as it is shown to a user or written to a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
    pub correlation_id: Uuid,
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.correlation_id)
    }
}

/// Schema import failures. No partial schema is ever returned alongside one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("invalid JSON at line {line}, column {column}: {message}")]
    Json {
        message: String,
        line: usize,
        column: usize,
    },

    #[error("invalid CSV at row {row}{}: {message}", .column.map(|c| format!(", column {c}")).unwrap_or_default())]
    Csv {
        message: String,
        row: usize,
        column: Option<usize>,
    },

    #[error("the schema export contains no fields")]
    EmptyMetadata,

    #[error("row {row} has no value for required column '{column}'")]
    MissingColumn { row: usize, column: String },

    #[error("field '{field_id}' is declared more than once (row {row})")]
    DuplicateField { field_id: String, row: usize },
}

/// Terminology validator failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminologyError {
    #[error("code system '{system}' is not supported")]
    Unsupported { system: String },

    #[error("code '{code}' was not found in '{system}'")]
    NotFound { system: String, code: String },

    #[error("terminology service unavailable: {message}")]
    Unavailable { message: String },
}

/// Transformation failures. Each carries the location of the rule that
/// produced the failing binding.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("{location}: no mapping for '{field_id}' (record {record_id})")]
    MissingMapping {
        field_id: String,
        record_id: String,
        location: Location,
    },

    #[error("{location}: attribute '{attribute}' of {resource} could not be bound: {reason}")]
    UnboundAttribute {
        resource: String,
        attribute: String,
        reason: String,
        location: Location,
    },

    #[error("{location}: value '{value}' of field '{field_id}' is invalid: {reason}")]
    InvalidValue {
        field_id: String,
        value: String,
        reason: String,
        location: Location,
    },

    #[error("{location}: code '{code}' is not valid in '{system}'")]
    InvalidCode {
        system: String,
        code: String,
        location: Location,
    },

    #[error("{location}: {source}")]
    Terminology {
        #[source]
        source: TerminologyError,
        location: Location,
    },

    #[error("record {row} has no value for the record id field '{field_id}'")]
    MissingRecordId { row: usize, field_id: String },
}
