//! Shared fixtures for unit tests

use crate::schema::{
    Field, FieldType, Schema, SchemaBuilder, SchemaType, SourceFormat, TextValidation,
};

fn options(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(code, label)| (code.to_string(), label.to_string()))
        .collect()
}

/// `record_id`, a birth date and a sex radio with two options
pub fn simple_schema() -> Schema {
    let mut builder = SchemaBuilder::new(SchemaType::Redcap, SourceFormat::Json);
    builder
        .push(Field::text("record_id", "Record ID", TextValidation::None), vec![], 1)
        .and_then(|b| {
            b.push(
                Field::text("pat_dob", "Date of birth", TextValidation::DateYmd),
                vec![],
                2,
            )
        })
        .and_then(|b| {
            b.push(
                Field::new("pat_sex", "Sex", FieldType::Radio),
                options(&[("1", "Male"), ("2", "Female")]),
                3,
            )
        })
        .expect("fixture schema is valid");
    builder.build()
}

/// [`simple_schema`] plus a checkbox, numeric fields and a terminology field
pub fn study_schema() -> Schema {
    let mut builder = SchemaBuilder::new(SchemaType::Redcap, SourceFormat::Json);
    let fields = vec![
        (Field::text("record_id", "Record ID", TextValidation::None), vec![]),
        (
            Field::text("pat_dob", "Date of birth", TextValidation::DateYmd),
            vec![],
        ),
        (
            Field::new("pat_sex", "Sex", FieldType::Radio),
            options(&[("1", "Male"), ("2", "Female")]),
        ),
        (
            Field::new("symptoms", "Symptoms", FieldType::Checkbox),
            options(&[("1", "Fever"), ("2", "Cough")]),
        ),
        (
            Field::text("weight", "Weight (kg)", TextValidation::Number),
            vec![],
        ),
        (
            Field::text("onset_year", "Year of onset", TextValidation::Integer),
            vec![],
        ),
        (
            Field::text("admitted", "Admission", TextValidation::DatetimeYmd),
            vec![],
        ),
        (
            Field::text("diagnosis", "Diagnosis", TextValidation::FhirTerminology),
            vec![],
        ),
        (Field::new("smoker", "Smoker", FieldType::YesNo), vec![]),
    ];
    for (row, (field, opts)) in fields.into_iter().enumerate() {
        builder
            .push(field, opts, row + 1)
            .expect("fixture schema is valid");
    }
    builder.build()
}
