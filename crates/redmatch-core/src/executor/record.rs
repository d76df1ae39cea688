//! Study records as exported by REDCap

use std::path::Path;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::error::ImportError;
use crate::schema::OPTION_SEPARATOR;

/// One exported record: raw values keyed by field id, in export order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Record {
    values: IndexMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field_id: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(field_id, value);
        self
    }

    pub fn insert(&mut self, field_id: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field_id.into(), value.into());
    }

    /// Raw value of `field_id`, `None` when absent or blank
    pub fn get(&self, field_id: &str) -> Option<&str> {
        self.values
            .get(field_id)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Raw value of an option sub-field `parent___code`. Exports that only
    /// carry the parent column are answered with `1` when the parent holds
    /// `code` and `0` otherwise.
    pub fn option(&self, parent: &str, code: &str) -> Option<&'static str> {
        let id = format!("{parent}{OPTION_SEPARATOR}{code}");
        match self.get(&id) {
            Some(v) if v.trim() == "0" => Some("0"),
            Some(_) => Some("1"),
            None if self.values.contains_key(&id) => None,
            None => self
                .get(parent)
                .map(|selected| if selected.trim() == code { "1" } else { "0" }),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, String)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Format of a record export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Csv,
    Json,
}

impl RecordFormat {
    pub fn from_path(path: &Path) -> Option<RecordFormat> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("csv") => Some(RecordFormat::Csv),
            Some("json") => Some(RecordFormat::Json),
            _ => None,
        }
    }
}

/// Parse a record export: a CSV file with a header row or a JSON array of
/// flat objects
pub fn load_records(source: &str, format: RecordFormat) -> Result<Vec<Record>, ImportError> {
    let records = match format {
        RecordFormat::Csv => load_csv(source)?,
        RecordFormat::Json => load_json(source)?,
    };
    debug!("Loaded {} records", records.len());
    Ok(records)
}

fn load_csv(source: &str) -> Result<Vec<Record>, ImportError> {
    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(source.as_bytes());

    let headers = reader.headers().map_err(csv_error)?.clone();
    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(csv_error)?;
        if row.iter().all(|value| value.trim().is_empty()) {
            continue;
        }
        records.push(
            headers
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.trim().to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(records)
}

fn csv_error(err: ::csv::Error) -> ImportError {
    ImportError::Csv {
        row: err.position().map(|p| p.line() as usize).unwrap_or(0),
        message: err.to_string(),
        column: None,
    }
}

fn load_json(source: &str) -> Result<Vec<Record>, ImportError> {
    let rows: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(source).map_err(|e| ImportError::Json {
            message: e.to_string(),
            line: e.line(),
            column: e.column(),
        })?;

    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter_map(|(k, v)| {
                    let raw = match v {
                        serde_json::Value::Null => return None,
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    Some((k, raw))
                })
                .collect()
        })
        .collect())
}
