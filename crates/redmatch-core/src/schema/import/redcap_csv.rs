//! REDCap data dictionary exported as CSV (the project "Data Dictionary" download)

use tracing::debug;

use super::{RawField, SchemaImporter, interpret_row};
use crate::error::ImportError;
use crate::schema::{Schema, SchemaBuilder, SchemaType, SourceFormat};

/// Column positions in a REDCap data dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Columns {
    name: usize,
    field_type: usize,
    label: usize,
    choices: usize,
    validation: usize,
}

impl Columns {
    /// REDCap's fixed layout, used when the header is not recognized
    const POSITIONAL: Columns = Columns {
        name: 0,
        field_type: 3,
        label: 4,
        choices: 5,
        validation: 7,
    };

    fn locate(headers: &::csv::StringRecord) -> Columns {
        let find = |candidates: &[&str]| {
            headers
                .iter()
                .position(|h| candidates.contains(&normalize_header(h).as_str()))
        };

        let name = find(&["variablefieldname", "fieldname"]);
        let field_type = find(&["fieldtype"]);
        match (name, field_type) {
            (Some(name), Some(field_type)) => Columns {
                name,
                field_type,
                label: find(&["fieldlabel"]).unwrap_or(Self::POSITIONAL.label),
                choices: find(&[
                    "choicescalculationsorsliderlabels",
                    "selectchoicesorcalculations",
                ])
                .unwrap_or(Self::POSITIONAL.choices),
                validation: find(&["textvalidationtypeorshowslidernumber"])
                    .unwrap_or(Self::POSITIONAL.validation),
            },
            _ => {
                debug!("Unrecognized data dictionary header, using positional columns");
                Self::POSITIONAL
            }
        }
    }
}

fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn csv_error(err: ::csv::Error) -> ImportError {
    let row = err.position().map(|p| p.line() as usize).unwrap_or(0);
    let column = match err.kind() {
        ::csv::ErrorKind::Utf8 { err, .. } => Some(err.field() + 1),
        _ => None,
    };
    ImportError::Csv {
        message: err.to_string(),
        row,
        column,
    }
}

/// Importer for the CSV data dictionary
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvImporter;

impl SchemaImporter for CsvImporter {
    fn format(&self) -> SourceFormat {
        SourceFormat::Csv
    }

    fn load_schema(&self, source: &str) -> Result<Schema, ImportError> {
        let mut reader = ::csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(source.as_bytes());

        let headers = reader.headers().map_err(csv_error)?.clone();
        let columns = Columns::locate(&headers);

        let mut builder = SchemaBuilder::new(SchemaType::Redcap, SourceFormat::Csv);
        let mut count = 0usize;
        for (i, result) in reader.records().enumerate() {
            let record = result.map_err(csv_error)?;
            if record.iter().all(|value| value.trim().is_empty()) {
                continue;
            }
            let row = record
                .position()
                .map(|p| p.line() as usize)
                .unwrap_or(i + 2);
            let get = |index: usize| record.get(index).unwrap_or("");

            interpret_row(
                &mut builder,
                &RawField {
                    row,
                    name: get(columns.name),
                    field_type: get(columns.field_type),
                    label: get(columns.label),
                    choices: get(columns.choices),
                    validation: get(columns.validation),
                },
            )?;
            count += 1;
        }

        if count == 0 {
            return Err(ImportError::EmptyMetadata);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldType, TextValidation};

    const HEADER: &str = "\"Variable / Field Name\",\"Form Name\",\"Section Header\",\"Field Type\",\"Field Label\",\"Choices, Calculations, OR Slider Labels\",\"Field Note\",\"Text Validation Type OR Show Slider Number\"";

    #[test]
    fn test_load_dictionary() {
        let source = format!(
            "{HEADER}\nrecord_id,demographics,,text,\"Record ID\",,,\n\
             dob,demographics,,text,\"Date of birth\",,,date_dmy\n\
             sex,demographics,,radio,Sex,\"1, Male | 2, Female\",,\n"
        );
        let schema = CsvImporter.load_schema(&source).unwrap();
        let ids: Vec<&str> = schema.fields().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["record_id", "dob", "sex", "sex___1", "sex___2"]);
        assert_eq!(schema.field("dob").unwrap().validation, TextValidation::DateDmy);
        assert_eq!(schema.field("sex").unwrap().field_type, FieldType::Radio);
        assert_eq!(schema.field("sex___1").unwrap().label, "Male");
    }

    #[test]
    fn test_columns_located_by_header_name() {
        let source = "Field Type,Variable / Field Name,Field Label\ntext,record_id,ID\n";
        let schema = CsvImporter.load_schema(source).unwrap();
        assert_eq!(schema.fields()[0].id, "record_id");
        assert_eq!(schema.fields()[0].label, "ID");
    }

    #[test]
    fn test_blank_rows_are_ignored() {
        let source = format!("{HEADER}\nrecord_id,f,,text,ID,,,\n,,,,,,,\n");
        let schema = CsvImporter.load_schema(&source).unwrap();
        assert_eq!(schema.len(), 1);
    }

    #[test]
    fn test_header_only_is_empty_metadata() {
        assert_eq!(
            CsvImporter.load_schema(HEADER).unwrap_err(),
            ImportError::EmptyMetadata
        );
    }

    #[test]
    fn test_duplicate_reports_row() {
        let source = format!("{HEADER}\na,f,,text,A,,,\na,f,,text,A,,,\n");
        let err = CsvImporter.load_schema(&source).unwrap_err();
        assert_eq!(
            err,
            ImportError::DuplicateField {
                field_id: "a".to_string(),
                row: 3
            }
        );
    }
}
