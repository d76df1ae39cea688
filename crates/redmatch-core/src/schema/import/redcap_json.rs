//! REDCap metadata exported as JSON (the API `metadata` call)

use serde::Deserialize;

use super::{RawField, SchemaImporter, interpret_row};
use crate::error::ImportError;
use crate::schema::{Schema, SchemaBuilder, SchemaType, SourceFormat};

#[derive(Debug, Deserialize)]
struct MetadataEntry {
    #[serde(default)]
    field_name: String,
    #[serde(default)]
    field_type: String,
    #[serde(default)]
    field_label: String,
    #[serde(default)]
    select_choices_or_calculations: String,
    #[serde(default)]
    text_validation_type_or_show_slider_number: String,
}

/// Importer for the JSON data dictionary
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonImporter;

impl SchemaImporter for JsonImporter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Json
    }

    fn load_schema(&self, source: &str) -> Result<Schema, ImportError> {
        let entries: Vec<MetadataEntry> =
            serde_json::from_str(source).map_err(|e| ImportError::Json {
                message: e.to_string(),
                line: e.line(),
                column: e.column(),
            })?;

        if entries.is_empty() {
            return Err(ImportError::EmptyMetadata);
        }

        let mut builder = SchemaBuilder::new(SchemaType::Redcap, SourceFormat::Json);
        for (i, entry) in entries.iter().enumerate() {
            interpret_row(
                &mut builder,
                &RawField {
                    row: i + 1,
                    name: &entry.field_name,
                    field_type: &entry.field_type,
                    label: &entry.field_label,
                    choices: &entry.select_choices_or_calculations,
                    validation: &entry.text_validation_type_or_show_slider_number,
                },
            )?;
        }
        Ok(builder.build())
    }
}
