//! Redmatch Core
//!
//! Engine for the Redmatch rules language, which maps REDCap study data to
//! FHIR resources. This crate imports study schemas, parses and resolves
//! rules documents, validates terminology and transforms records.
//!
//! The stateless services are exposed as free functions:
//!
//! - [`load_schema`] imports a schema export
//! - [`parse`] turns rules text into a [`Document`] and diagnostics
//! - [`resolve`] checks a document against a schema
//! - [`execute`] applies a resolved document to records

pub mod ast;
pub mod config;
pub mod dates;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod result;
pub mod schema;
pub mod semantic;
pub mod syntax;
pub mod terminology;

#[cfg(test)]
pub(crate) mod testing;

pub use ast::{DataReference, Document};
pub use config::{ConfigLoader, RedmatchConfig};
pub use diagnostics::{Diagnostic, DiagnosticCode, Location, Severity, Suggestion};
pub use error::{
    ErrorKind, ExecutionError, ImportError, RedmatchError, ReportedError, TerminologyError,
};
pub use executor::{
    ExecutionOptions, ExecutionOutput, Executor, Record, RecordFormat, load_records,
};
pub use result::{Result, ResultExt};
pub use schema::import::{SchemaImporter, load_schema_file};
pub use schema::{Field, FieldType, Schema, SchemaType, SourceFormat, TextValidation};
pub use semantic::{
    Instantiation, Resolution, ResolvedDocument, TerminologyCheck, TerminologyMode,
    TerminologyOutcome, run_terminology_checks,
};
pub use syntax::ParseResult;
pub use terminology::{FhirTerminologyClient, InMemoryTerminology, TerminologyValidator};

/// Import a schema export in the given format
pub fn load_schema(source: &str, format: SourceFormat) -> Result<Schema> {
    Ok(schema::import::importer_for(format).load_schema(source)?)
}

/// Parse rules text. Never fails; problems are reported as diagnostics.
pub fn parse(source: &str) -> ParseResult {
    syntax::parse(source)
}

/// Check a parsed document against a schema, without terminology checks
pub fn resolve(document: &Document, schema: &Schema) -> Resolution {
    semantic::resolve(document, schema)
}

/// Apply a resolved document to records
pub fn execute(
    resolved: &ResolvedDocument,
    schema: &Schema,
    records: &[Record],
) -> Result<ExecutionOutput> {
    Executor::new(resolved, schema).execute(records)
}

/// Initialize the tracing subscriber for logging
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redmatch=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

/// Initialize the tracing subscriber with JSON output
pub fn init_tracing_json() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redmatch=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
