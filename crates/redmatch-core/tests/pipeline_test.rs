//! End-to-end: schema export, rules document and records to FHIR resources

use std::path::PathBuf;

use redmatch_core::terminology::{CodeSystem, Concept};
use redmatch_core::{
    ExecutionOptions, Executor, InMemoryTerminology, RecordFormat, ResolvedDocument, Schema,
    load_records, load_schema_file, parse, resolve,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn read(name: &str) -> String {
    std::fs::read_to_string(fixture(name)).unwrap()
}

fn setup() -> (ResolvedDocument, Schema) {
    let schema = load_schema_file(&fixture("study.json")).unwrap();
    let parsed = parse(&read("study.rdm"));
    assert!(parsed.diagnostics.is_empty(), "{:#?}", parsed.diagnostics);
    let resolution = resolve(&parsed.document, &schema);
    assert!(!resolution.has_errors(), "{:#?}", resolution.diagnostics);
    (resolution.document, schema)
}

#[test]
fn test_study_transformation() {
    let (document, schema) = setup();
    let records = load_records(&read("records.csv"), RecordFormat::Csv).unwrap();
    let output = Executor::new(&document, &schema).execute(&records).unwrap();

    let ids: Vec<&str> = output
        .resources
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "clinic",
            "patient-1",
            "fever-1",
            "weight-1",
            "diagnosis-1",
            "patient-2",
            "weight-2",
            "fever-3",
            "weight-3",
        ]
    );

    let patient = &output.resources[1];
    assert_eq!(patient["birthDate"], "1980-04-01");
    assert_eq!(patient["gender"], "male");
    assert_eq!(patient["identifier"][0]["value"], "1");
    assert_eq!(
        patient["managingOrganization"]["reference"],
        "Organization/clinic"
    );

    let fever = &output.resources[2];
    assert_eq!(fever["code"]["coding"][0]["system"], "http://snomed.info/sct");
    assert_eq!(fever["code"]["coding"][0]["display"], "Fever");
    assert_eq!(fever["subject"]["reference"], "Patient/patient-1");

    assert_eq!(output.resources[3]["valueQuantity"]["value"], 82.5);
    assert_eq!(
        output.resources[4]["code"]["coding"][0]["code"],
        "74400008"
    );
    assert_eq!(output.resources[6]["status"], "cancelled");
    // Record 3 has no patient, so its references are dropped
    assert!(output.resources[7].get("subject").is_none());
    assert!(output.resources[8].get("subject").is_none());
}

#[test]
fn test_output_is_deterministic() {
    let (document, schema) = setup();
    let records = load_records(&read("records.csv"), RecordFormat::Csv).unwrap();

    let render = |options: ExecutionOptions| {
        let output = Executor::new(&document, &schema)
            .with_options(options)
            .execute(&records)
            .unwrap();
        serde_json::to_string(&output).unwrap()
    };

    let first = render(ExecutionOptions::default());
    let second = render(ExecutionOptions::default());
    let sequential = render(ExecutionOptions { parallel: false });
    assert_eq!(first, second);
    assert_eq!(first, sequential);
}

#[test]
fn test_ndjson_files() {
    let (document, schema) = setup();
    let records = load_records(&read("records.csv"), RecordFormat::Csv).unwrap();
    let output = redmatch_core::execute(&document, &schema, &records).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let files = output.write_ndjson(dir.path()).unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "Condition.ndjson",
            "Observation.ndjson",
            "Organization.ndjson",
            "Patient.ndjson",
        ]
    );
    let observations = std::fs::read_to_string(dir.path().join("Observation.ndjson")).unwrap();
    assert_eq!(observations.lines().count(), 5);
}

#[tokio::test]
async fn test_batch_validation_accepts_known_codes() {
    let (document, schema) = setup();
    let records = load_records(&read("records.csv"), RecordFormat::Csv).unwrap();
    let terminology = InMemoryTerminology::new()
        .with_code_system(
            CodeSystem::new("http://snomed.info/sct")
                .with_concept(Concept::new("386661006").with_display("Fever"))
                .with_concept(Concept::new("74400008").with_display("Appendicitis")),
        )
        .with_code_system(
            CodeSystem::new("http://hl7.org/fhir/administrative-gender")
                .with_concept(Concept::new("male"))
                .with_concept(Concept::new("female")),
        );

    let output = Executor::new(&document, &schema)
        .execute_validated(&records, &terminology)
        .await
        .unwrap();
    assert_eq!(output.len(), 9);
}

#[tokio::test]
async fn test_batch_validation_fails_on_unsupported_system() {
    let (document, schema) = setup();
    let records = load_records(&read("records.csv"), RecordFormat::Csv).unwrap();
    let terminology = InMemoryTerminology::new();

    let err = Executor::new(&document, &schema)
        .execute_validated(&records, &terminology)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), redmatch_core::ErrorKind::Execution);
    assert!(err.to_string().contains("not supported"));
}
