//! Schema model for a study's field dictionary
//!
//! A [`Schema`] is built once by an importer and is immutable afterwards.
//! Option sub-fields of checkbox, radio and dropdown fields are materialized
//! as fields of their own (`parent___code`) directly after their parent, so
//! declaration order is the order an editor should present them in.

pub mod import;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ImportError;

/// Separator between a field id and one of its option codes
pub const OPTION_SEPARATOR: &str = "___";

/// Data-capture flavor the schema describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    Redcap,
    Db,
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaType::Redcap => write!(f, "REDCAP"),
            SchemaType::Db => write!(f, "DB"),
        }
    }
}

/// Export flavor a schema was read from. Not part of structural equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Unknown,
    Text,
    Notes,
    Dropdown,
    Radio,
    Checkbox,
    File,
    Calc,
    Sql,
    Descriptive,
    Slider,
    YesNo,
    TrueFalse,
    CheckboxOption,
    DropdownOrRadioOption,
}

impl FieldType {
    /// Field types whose choices become option sub-fields
    pub fn has_options(&self) -> bool {
        matches!(
            self,
            FieldType::Checkbox | FieldType::Radio | FieldType::Dropdown
        )
    }

    pub fn is_option(&self) -> bool {
        matches!(
            self,
            FieldType::CheckboxOption | FieldType::DropdownOrRadioOption
        )
    }
}

impl FromStr for FieldType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(FieldType::Text),
            "notes" => Ok(FieldType::Notes),
            "dropdown" => Ok(FieldType::Dropdown),
            "radio" => Ok(FieldType::Radio),
            "checkbox" => Ok(FieldType::Checkbox),
            "file" => Ok(FieldType::File),
            "calc" => Ok(FieldType::Calc),
            "sql" => Ok(FieldType::Sql),
            "descriptive" => Ok(FieldType::Descriptive),
            "slider" => Ok(FieldType::Slider),
            "yesno" => Ok(FieldType::YesNo),
            "truefalse" => Ok(FieldType::TrueFalse),
            _ => Err(()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Unknown => "UNKNOWN",
            FieldType::Text => "TEXT",
            FieldType::Notes => "NOTES",
            FieldType::Dropdown => "DROPDOWN",
            FieldType::Radio => "RADIO",
            FieldType::Checkbox => "CHECKBOX",
            FieldType::File => "FILE",
            FieldType::Calc => "CALC",
            FieldType::Sql => "SQL",
            FieldType::Descriptive => "DESCRIPTIVE",
            FieldType::Slider => "SLIDER",
            FieldType::YesNo => "YESNO",
            FieldType::TrueFalse => "TRUEFALSE",
            FieldType::CheckboxOption => "CHECKBOX_OPTION",
            FieldType::DropdownOrRadioOption => "DROPDOWN_OR_RADIO_OPTION",
        };
        f.write_str(name)
    }
}

/// Validation attached to a text field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TextValidation {
    None,
    DateYmd,
    DateMdy,
    DateDmy,
    Time,
    DatetimeYmd,
    DatetimeMdy,
    DatetimeDmy,
    DatetimeSecondsYmd,
    DatetimeSecondsMdy,
    DatetimeSecondsDmy,
    Phone,
    Email,
    Number,
    Integer,
    Zipcode,
    FhirTerminology,
}

impl TextValidation {
    pub fn is_date(&self) -> bool {
        matches!(
            self,
            TextValidation::DateYmd | TextValidation::DateMdy | TextValidation::DateDmy
        )
    }

    pub fn is_datetime(&self) -> bool {
        matches!(
            self,
            TextValidation::DatetimeYmd
                | TextValidation::DatetimeMdy
                | TextValidation::DatetimeDmy
                | TextValidation::DatetimeSecondsYmd
                | TextValidation::DatetimeSecondsMdy
                | TextValidation::DatetimeSecondsDmy
        )
    }
}

impl FromStr for TextValidation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" => Ok(TextValidation::None),
            "date_ymd" => Ok(TextValidation::DateYmd),
            "date_mdy" => Ok(TextValidation::DateMdy),
            "date_dmy" => Ok(TextValidation::DateDmy),
            "time" => Ok(TextValidation::Time),
            "datetime_ymd" => Ok(TextValidation::DatetimeYmd),
            "datetime_mdy" => Ok(TextValidation::DatetimeMdy),
            "datetime_dmy" => Ok(TextValidation::DatetimeDmy),
            "datetime_seconds_ymd" => Ok(TextValidation::DatetimeSecondsYmd),
            "datetime_seconds_mdy" => Ok(TextValidation::DatetimeSecondsMdy),
            "datetime_seconds_dmy" => Ok(TextValidation::DatetimeSecondsDmy),
            "phone" => Ok(TextValidation::Phone),
            "email" => Ok(TextValidation::Email),
            "number" => Ok(TextValidation::Number),
            "integer" => Ok(TextValidation::Integer),
            "zipcode" => Ok(TextValidation::Zipcode),
            _ => Err(()),
        }
    }
}

/// A single field of the study
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: String,
    pub label: String,
    pub field_type: FieldType,
    pub validation: TextValidation,
    /// Parent field id for option sub-fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Field {
    pub fn new(id: impl Into<String>, label: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            field_type,
            validation: TextValidation::None,
            parent: None,
        }
    }

    /// A text field carrying the given validation
    pub fn text(
        id: impl Into<String>,
        label: impl Into<String>,
        validation: TextValidation,
    ) -> Self {
        Self {
            validation,
            ..Self::new(id, label, FieldType::Text)
        }
    }

    /// Build the option sub-field `self.id___code`
    pub fn option(&self, code: &str, label: impl Into<String>) -> Field {
        let field_type = if self.field_type == FieldType::Checkbox {
            FieldType::CheckboxOption
        } else {
            FieldType::DropdownOrRadioOption
        };
        Field {
            id: format!("{}{}{}", self.id, OPTION_SEPARATOR, code),
            label: label.into(),
            field_type,
            validation: TextValidation::None,
            parent: Some(self.id.clone()),
        }
    }

    /// Date or datetime text field
    pub fn is_date(&self) -> bool {
        self.field_type == FieldType::Text
            && (self.validation.is_date() || self.validation.is_datetime())
    }

    /// Option code of an option sub-field
    pub fn option_code(&self) -> Option<&str> {
        let parent = self.parent.as_deref()?;
        self.id
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix(OPTION_SEPARATOR))
    }
}

/// Ordered, immutable collection of fields
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    schema_type: SchemaType,
    source_format: SourceFormat,
    fields: Vec<Field>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.schema_type == other.schema_type && self.fields == other.fields
    }
}

impl Schema {
    pub fn schema_type(&self) -> SchemaType {
        self.schema_type
    }

    pub fn source_format(&self) -> SourceFormat {
        self.source_format
    }

    /// All fields, option sub-fields included, in declaration order
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, id: &str) -> Option<&Field> {
        self.index.get(id).map(|&i| &self.fields[i])
    }

    pub fn has_field(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// The field identifying a record: the first declared field
    pub fn unique_field(&self) -> Option<&Field> {
        self.fields.first()
    }

    /// Option sub-fields of `parent`, in declaration order
    pub fn options_of<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Field> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.parent.as_deref() == Some(parent))
    }

    /// Same schema type, same field count, same (id, type) at every index
    pub fn structurally_eq(&self, other: &Schema) -> bool {
        self.schema_type == other.schema_type
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|(a, b)| a.id == b.id && a.field_type == b.field_type)
    }

    /// Field id closest to `id` by edit distance
    pub fn closest_field(&self, id: &str) -> Option<&str> {
        self.fields
            .iter()
            .map(|f| (edit_distance(id, &f.id), f.id.as_str()))
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, field_id)| field_id)
    }
}

/// Incrementally assembles a [`Schema`], expanding options as fields are added
#[derive(Debug)]
pub struct SchemaBuilder {
    schema_type: SchemaType,
    source_format: SourceFormat,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
}

impl SchemaBuilder {
    pub fn new(schema_type: SchemaType, source_format: SourceFormat) -> Self {
        Self {
            schema_type,
            source_format,
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Add a field followed by its option sub-fields. `row` is reported on duplicates.
    pub fn push(
        &mut self,
        field: Field,
        options: Vec<(String, String)>,
        row: usize,
    ) -> Result<&mut Self, ImportError> {
        let expanded: Vec<Field> = if field.field_type.has_options() {
            options
                .iter()
                .map(|(code, label)| field.option(code, label.clone()))
                .collect()
        } else {
            Vec::new()
        };

        for f in std::iter::once(field).chain(expanded) {
            if self.index.contains_key(&f.id) {
                return Err(ImportError::DuplicateField { field_id: f.id, row });
            }
            self.index.insert(f.id.clone(), self.fields.len());
            self.fields.push(f);
        }
        Ok(self)
    }

    pub fn build(self) -> Schema {
        Schema {
            schema_type: self.schema_type,
            source_format: self.source_format,
            fields: self.fields,
            index: self.index,
        }
    }
}

/// Levenshtein distance between two strings
fn edit_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut previous: Vec<usize> = (0..=s2_chars.len()).collect();

    for (i, c1) in s1_chars.iter().enumerate() {
        let mut current = vec![i + 1; s2_chars.len() + 1];
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        previous = current;
    }

    previous[s2_chars.len()]
}
