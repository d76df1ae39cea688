//! Schema importers for REDCap data dictionary exports
//!
//! Both flavors funnel every row through [`interpret_row`], so equivalent
//! exports of the same study produce structurally equal schemas.

mod redcap_csv;
mod redcap_json;

pub use redcap_csv::CsvImporter;
pub use redcap_json::JsonImporter;

use std::path::Path;

use tracing::{debug, warn};

use super::{Field, FieldType, Schema, SchemaBuilder, SourceFormat, TextValidation};
use crate::error::{ImportError, RedmatchError};

/// Prefix REDCap uses for choices backed by a FHIR terminology server
const FHIR_CHOICES_PREFIX: &str = "FHIR:";

/// Turns one export flavor into a [`Schema`]
pub trait SchemaImporter: Send + Sync {
    fn format(&self) -> SourceFormat;

    /// Parse the whole export. Never returns a partial schema.
    fn load_schema(&self, source: &str) -> Result<Schema, ImportError>;
}

/// Importer for the given export flavor
pub fn importer_for(format: SourceFormat) -> &'static dyn SchemaImporter {
    match format {
        SourceFormat::Json => &JsonImporter,
        SourceFormat::Csv => &CsvImporter,
    }
}

/// Guess the export flavor from a file extension
pub fn format_for_path(path: &Path) -> Option<SourceFormat> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => Some(SourceFormat::Json),
        Some("csv") => Some(SourceFormat::Csv),
        _ => None,
    }
}

/// Read and import a schema file, choosing the importer by extension
pub fn load_schema_file(path: &Path) -> crate::Result<Schema> {
    let format = format_for_path(path).ok_or_else(|| {
        RedmatchError::config_error(format!(
            "Cannot tell the export format of '{}' (expected .json or .csv)",
            path.display()
        ))
    })?;
    let source =
        std::fs::read_to_string(path).map_err(|e| RedmatchError::io_error(path, e))?;
    let schema = importer_for(format).load_schema(&source)?;
    debug!("Loaded {} fields from {}", schema.len(), path.display());
    Ok(schema)
}

/// One data dictionary row, whatever the export flavor
#[derive(Debug, Default)]
pub(crate) struct RawField<'a> {
    pub row: usize,
    pub name: &'a str,
    pub field_type: &'a str,
    pub label: &'a str,
    pub choices: &'a str,
    pub validation: &'a str,
}

/// Interpret a raw row and append it (and its options) to the builder
pub(crate) fn interpret_row(builder: &mut SchemaBuilder, raw: &RawField<'_>) -> Result<(), ImportError> {
    let name = raw.name.trim();
    if name.is_empty() {
        return Err(ImportError::MissingColumn {
            row: raw.row,
            column: "field name".to_string(),
        });
    }
    let label = raw.label.trim();

    let field = if !raw.validation.trim().is_empty() {
        let validation = raw.validation.parse::<TextValidation>().unwrap_or_else(|_| {
            warn!(
                "Unknown text validation '{}' for field {} (row {}), ignoring",
                raw.validation.trim(),
                name,
                raw.row
            );
            TextValidation::None
        });
        Field::text(name, label, validation)
    } else if raw.choices.trim_start().starts_with(FHIR_CHOICES_PREFIX) {
        Field::text(name, label, TextValidation::FhirTerminology)
    } else {
        let field_type = raw.field_type.parse::<FieldType>().unwrap_or_else(|_| {
            warn!(
                "Unknown field type '{}' for field {} (row {})",
                raw.field_type.trim(),
                name,
                raw.row
            );
            FieldType::Unknown
        });
        Field::new(name, label, field_type)
    };

    let options = if field.field_type.has_options() {
        parse_choices(name, raw.choices, raw.row)
    } else {
        Vec::new()
    };

    builder.push(field, options, raw.row)?;
    Ok(())
}

/// Split `code, label | code, label` into pairs. Entries without a comma are skipped.
fn parse_choices(field_id: &str, choices: &str, row: usize) -> Vec<(String, String)> {
    choices
        .split('|')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.split_once(',') {
            Some((code, label)) => Some((code.trim().to_string(), label.trim().to_string())),
            None => {
                warn!(
                    "Ignoring malformed choice '{}' of field {} (row {})",
                    entry, field_id, row
                );
                None
            }
        })
        .collect()
}
