//! Terminology phase of resolution
//!
//! Concept literals are validated against their code system. When a target
//! package is declared, attribute paths are validated against the package's
//! code system and their cardinality and type facts looked up. Identical
//! questions are asked once and run concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::ast::{FieldValueKind, PathSegment, Value};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Location};
use crate::error::{ExecutionError, TerminologyError};
use crate::schema::{Field, FieldType, TextValidation};
use crate::terminology::{
    AttributeFacts, MaxCardinality, PROPERTY_MAX, PROPERTY_MIN, PROPERTY_TYPE,
    TerminologyValidator,
};

/// Concurrent requests issued to the validator
const CONCURRENCY: usize = 8;

/// How terminology failures are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminologyMode {
    /// Failures degrade to `TerminologySkipped` information diagnostics
    Interactive,
    /// Failures abort with the location of the originating rule
    Batch,
}

/// Kind of value bound to an attribute, as far as type checking goes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ValueShape {
    Boolean,
    Integer,
    Decimal,
    /// A string literal
    String(String),
    Reference,
    Concept,
    Code,
    /// `VALUE` of a plain text or notes field
    TextField,
    /// `VALUE` of a number or calculated field
    NumberField,
    /// `VALUE` of an integer field; `year` when truncated to YEAR
    IntegerField { year: bool },
    DateField,
    TimeField,
}

impl ValueShape {
    /// Shape of `value`, given the field it reads (if any)
    pub fn of(value: &Value, field: Option<&Field>) -> Option<ValueShape> {
        let shape = match value {
            Value::Boolean(_) => ValueShape::Boolean,
            Value::Integer(_) => ValueShape::Integer,
            Value::Decimal(_) => ValueShape::Decimal,
            Value::String(s) => ValueShape::String(s.clone()),
            Value::Reference(_) => ValueShape::Reference,
            Value::Concept(_) => ValueShape::Concept,
            Value::Code(_) => ValueShape::Code,
            Value::Field(value) => match value.kind {
                FieldValueKind::Concept | FieldValueKind::ConceptSelected => ValueShape::Concept,
                FieldValueKind::CodeSelected => ValueShape::Code,
                FieldValueKind::Value => {
                    let field = field?;
                    match (field.field_type, field.validation) {
                        (FieldType::Calc, _) | (FieldType::Text, TextValidation::Number) => {
                            ValueShape::NumberField
                        }
                        (FieldType::Text, TextValidation::Integer) => ValueShape::IntegerField {
                            year: value.precision == Some(crate::ast::DatePrecision::Year),
                        },
                        (FieldType::Text, TextValidation::Time) => ValueShape::TimeField,
                        (FieldType::Text, _) if field.is_date() => ValueShape::DateField,
                        (FieldType::Text | FieldType::Notes, _) => ValueShape::TextField,
                        _ => return None,
                    }
                }
            },
        };
        Some(shape)
    }

    /// Whether a value of this shape can be bound to an attribute of FHIR
    /// type `type_code`
    pub fn accepts(&self, type_code: &str) -> bool {
        match self {
            ValueShape::Boolean => type_code == "boolean",
            ValueShape::Integer => {
                matches!(type_code, "integer" | "positiveInt" | "unsignedInt" | "integer64")
            }
            ValueShape::Decimal => type_code == "decimal",
            ValueShape::String(literal) => match type_code {
                "id" => super::resolver::is_fhir_id(literal),
                "string" | "markdown" | "uri" | "oid" | "uuid" | "canonical" | "url" => true,
                _ => false,
            },
            ValueShape::Reference => type_code == "Reference",
            ValueShape::Concept => matches!(type_code, "Coding" | "CodeableConcept"),
            ValueShape::Code => type_code == "code",
            ValueShape::TextField => type_code == "string",
            ValueShape::NumberField => matches!(type_code, "decimal" | "string"),
            ValueShape::IntegerField { year } => {
                matches!(type_code, "integer" | "string" | "decimal")
                    || (*year && type_code == "date")
            }
            ValueShape::DateField => matches!(type_code, "date" | "dateTime" | "instant"),
            ValueShape::TimeField => type_code == "time",
        }
    }
}

/// An attribute binding to check against a target package
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeCheck {
    pub package_system: String,
    pub resource_type: String,
    pub path: Vec<PathSegment>,
    pub shape: Option<ValueShape>,
    pub path_location: Location,
    pub value_location: Location,
}

impl AttributeCheck {
    /// `Type.a.b` for the first `n` segments
    fn prefix(&self, n: usize) -> String {
        std::iter::once(self.resource_type.as_str())
            .chain(self.path[..n].iter().map(|s| s.name.as_str()))
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn full_path(&self) -> String {
        self.prefix(self.path.len())
    }
}

/// A question for the terminology validator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TerminologyCheck {
    Code {
        system: String,
        code: String,
        location: Location,
    },
    Attribute(AttributeCheck),
}

/// Diagnostics and facts produced by [`run_terminology_checks`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminologyOutcome {
    pub diagnostics: Vec<Diagnostic>,
    pub attribute_facts: BTreeMap<String, AttributeFacts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Query {
    Validate { system: String, code: String },
    Lookup { system: String, code: String },
}

#[derive(Debug, Clone)]
enum Answer {
    Valid(Result<bool, TerminologyError>),
    Facts(Result<AttributeFacts, TerminologyError>),
}

async fn ask(validator: &dyn TerminologyValidator, query: &Query) -> Answer {
    match query {
        Query::Validate { system, code } => Answer::Valid(validator.validate_code(system, code).await),
        Query::Lookup { system, code } => Answer::Facts(
            validator
                .lookup(system, code, &[PROPERTY_MIN, PROPERTY_MAX, PROPERTY_TYPE])
                .await
                .map(|properties| AttributeFacts::from_properties(&properties)),
        ),
    }
}

/// Ask the validator every question in `checks`.
///
/// Invalid codes and attribute problems are always error diagnostics. A
/// failing validator yields `TerminologySkipped` diagnostics in
/// [`TerminologyMode::Interactive`] and an error in [`TerminologyMode::Batch`].
pub async fn run_terminology_checks(
    checks: &[TerminologyCheck],
    validator: &dyn TerminologyValidator,
    mode: TerminologyMode,
) -> crate::Result<TerminologyOutcome> {
    let mut queries: Vec<Query> = Vec::new();
    let mut seen: HashSet<Query> = HashSet::new();
    let mut queue = |query: Query| {
        if seen.insert(query.clone()) {
            queries.push(query);
        }
    };
    for check in checks {
        match check {
            TerminologyCheck::Code { system, code, .. } => queue(Query::Validate {
                system: system.clone(),
                code: code.clone(),
            }),
            TerminologyCheck::Attribute(attribute) => {
                queue(Query::Validate {
                    system: attribute.package_system.clone(),
                    code: attribute.full_path(),
                });
                for n in 1..=attribute.path.len() {
                    queue(Query::Lookup {
                        system: attribute.package_system.clone(),
                        code: attribute.prefix(n),
                    });
                }
            }
        }
    }

    debug!("Running {} terminology queries", queries.len());
    let answers: HashMap<Query, Answer> = stream::iter(queries)
        .map(|query| async move {
            let answer = ask(validator, &query).await;
            (query, answer)
        })
        .buffered(CONCURRENCY)
        .collect()
        .await;

    let mut run = Run {
        mode,
        answers: &answers,
        outcome: TerminologyOutcome::default(),
    };
    for check in checks {
        match check {
            TerminologyCheck::Code {
                system,
                code,
                location,
            } => run.code(system, code, location)?,
            TerminologyCheck::Attribute(attribute) => run.attribute(attribute)?,
        }
    }
    Ok(run.outcome)
}

struct Run<'a> {
    mode: TerminologyMode,
    answers: &'a HashMap<Query, Answer>,
    outcome: TerminologyOutcome,
}

impl Run<'_> {
    fn valid(&self, system: &str, code: &str) -> Result<bool, TerminologyError> {
        let query = Query::Validate {
            system: system.to_string(),
            code: code.to_string(),
        };
        match self.answers.get(&query) {
            Some(Answer::Valid(result)) => result.clone(),
            _ => Err(missing_answer()),
        }
    }

    fn facts(&self, system: &str, path: &str) -> Result<AttributeFacts, TerminologyError> {
        let query = Query::Lookup {
            system: system.to_string(),
            code: path.to_string(),
        };
        match self.answers.get(&query) {
            Some(Answer::Facts(result)) => result.clone(),
            _ => Err(missing_answer()),
        }
    }

    fn degrade(&mut self, error: TerminologyError, location: &Location) -> crate::Result<()> {
        match self.mode {
            TerminologyMode::Interactive => {
                warn!("Terminology validation skipped: {}", error);
                self.outcome.diagnostics.push(Diagnostic::info(
                    DiagnosticCode::TerminologySkipped,
                    format!("Terminology validation skipped: {error}"),
                    location.clone(),
                ));
                Ok(())
            }
            TerminologyMode::Batch => Err(ExecutionError::Terminology {
                source: error,
                location: location.clone(),
            }
            .into()),
        }
    }

    fn code(&mut self, system: &str, code: &str, location: &Location) -> crate::Result<()> {
        match self.valid(system, code) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.outcome.diagnostics.push(Diagnostic::error(
                    DiagnosticCode::InvalidCode,
                    format!("Code '{code}' is not valid in '{system}'"),
                    location.clone(),
                ));
                Ok(())
            }
            Err(error) => self.degrade(error, location),
        }
    }

    fn attribute(&mut self, check: &AttributeCheck) -> crate::Result<()> {
        let full_path = check.full_path();
        match self.valid(&check.package_system, &full_path) {
            Ok(true) => {}
            Ok(false) => {
                self.invalid_path(&full_path, &check.path_location);
                return Ok(());
            }
            Err(error) => return self.degrade(error, &check.path_location),
        }

        for (i, segment) in check.path.iter().enumerate() {
            let path = check.prefix(i + 1);
            let facts = match self.facts(&check.package_system, &path) {
                Ok(facts) => facts,
                Err(TerminologyError::NotFound { .. }) => {
                    self.invalid_path(&full_path, &check.path_location);
                    return Ok(());
                }
                Err(error) => return self.degrade(error, &check.path_location),
            };

            if let Some(index) = segment.index {
                if facts.index_out_of_bounds(index) {
                    let max = match facts.max {
                        Some(MaxCardinality::Bounded(max)) => max.to_string(),
                        _ => "*".to_string(),
                    };
                    self.outcome.diagnostics.push(Diagnostic::error(
                        DiagnosticCode::InvalidAttributeIndex,
                        format!("Index {index} of '{path}' exceeds its maximum cardinality {max}"),
                        check.path_location.clone(),
                    ));
                }
            }

            let is_leaf = i + 1 == check.path.len();
            if is_leaf {
                if facts.is_forbidden() {
                    self.outcome.diagnostics.push(Diagnostic::error(
                        DiagnosticCode::AttributeNotAllowed,
                        format!("Attribute '{path}' is not allowed (maximum cardinality 0)"),
                        check.path_location.clone(),
                    ));
                }
                if let (Some(shape), Some(type_code)) = (&check.shape, facts.type_code.as_deref())
                {
                    if !type_code.is_empty() && !shape.accepts(type_code) {
                        self.outcome.diagnostics.push(Diagnostic::error(
                            DiagnosticCode::IncompatibleType,
                            format!("Value cannot be assigned to '{path}' of type {type_code}"),
                            check.value_location.clone(),
                        ));
                    }
                }
            }
            self.outcome.attribute_facts.insert(path, facts);
        }
        Ok(())
    }

    fn invalid_path(&mut self, path: &str, location: &Location) {
        self.outcome.diagnostics.push(Diagnostic::error(
            DiagnosticCode::InvalidAttributePath,
            format!("The path {path} is not valid"),
            location.clone(),
        ));
    }
}

fn missing_answer() -> TerminologyError {
    TerminologyError::Unavailable {
        message: "no answer for query".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::resolve;
    use crate::syntax::parse;
    use crate::terminology::{CodeSystem, Concept, InMemoryTerminology, PropertyValue};
    use crate::testing::simple_schema;

    const PACKAGE: &str = "redmatch-hl7.fhir.r4.core-4.0.1";

    fn element(path: &str, max: &str, type_code: &str) -> Concept {
        Concept::new(path)
            .with_property("min", PropertyValue::Integer(0))
            .with_property("max", PropertyValue::String(max.into()))
            .with_property("type", PropertyValue::Code(type_code.into()))
    }

    fn terminology() -> InMemoryTerminology {
        InMemoryTerminology::new()
            .with_code_system(
                CodeSystem::new("http://snomed.info/sct")
                    .with_concept(Concept::new("248153007").with_display("Male")),
            )
            .with_code_system(
                CodeSystem::new(PACKAGE)
                    .with_concept(element("Patient.active", "1", "boolean"))
                    .with_concept(element("Patient.gender", "1", "code"))
                    .with_concept(element("Patient.identifier", "*", "Identifier"))
                    .with_concept(element("Patient.identifier.value", "1", "string"))
                    .with_concept(element("Patient.photo", "0", "Attachment"))
                    .with_concept(element("Patient.maritalStatus", "1", "CodeableConcept")),
            )
    }

    async fn check(rules: &str, mode: TerminologyMode) -> crate::Result<TerminologyOutcome> {
        let source = format!(
            "SCHEMA: 's.json' (REDCAP)\nTARGET: 'hl7.fhir.r4.core#4.0.1'\nRULES: {{ {rules} }}"
        );
        let parsed = parse(&source);
        assert!(parsed.diagnostics.is_empty(), "{:#?}", parsed.diagnostics);
        let resolution = resolve(&parsed.document, &simple_schema());
        run_terminology_checks(&resolution.terminology_checks, &terminology(), mode).await
    }

    fn codes(outcome: &TerminologyOutcome) -> Vec<DiagnosticCode> {
        outcome.diagnostics.iter().map(|d| d.code).collect()
    }

    #[tokio::test]
    async fn test_valid_bindings_collect_facts() {
        let outcome = check(
            "TRUE { Patient<p>: * active = TRUE, * identifier[0].value = VALUE(record_id),
                    * maritalStatus = http://snomed.info/sct|248153007 }",
            TerminologyMode::Interactive,
        )
        .await
        .unwrap();
        assert!(outcome.diagnostics.is_empty(), "{:#?}", outcome.diagnostics);
        assert!(outcome.attribute_facts["Patient.identifier"].is_list());
        assert_eq!(
            outcome.attribute_facts["Patient.active"].type_code.as_deref(),
            Some("boolean")
        );
    }

    #[tokio::test]
    async fn test_attribute_problems() {
        let outcome = check(
            "TRUE { Patient<p>: * activ = TRUE, * photo[0].url = 'x', * gender = TRUE, * active[1] = TRUE }",
            TerminologyMode::Interactive,
        )
        .await
        .unwrap();
        assert_eq!(
            codes(&outcome),
            vec![
                DiagnosticCode::InvalidAttributePath,
                DiagnosticCode::InvalidAttributePath,
                DiagnosticCode::IncompatibleType,
                DiagnosticCode::InvalidAttributeIndex,
            ]
        );
    }

    #[tokio::test]
    async fn test_forbidden_attribute() {
        let terminology = InMemoryTerminology::new().with_code_system(
            CodeSystem::new(PACKAGE).with_concept(element("Patient.photo", "0", "Attachment")),
        );
        let source = "SCHEMA: 's.json' (REDCAP)\nTARGET: 'hl7.fhir.r4.core#4.0.1'\n\
                      RULES: { TRUE { Patient<p>: * photo = 'x' } }";
        let resolution = resolve(&parse(source).document, &simple_schema());
        let outcome = run_terminology_checks(
            &resolution.terminology_checks,
            &terminology,
            TerminologyMode::Interactive,
        )
        .await
        .unwrap();
        assert_eq!(
            codes(&outcome),
            vec![DiagnosticCode::AttributeNotAllowed, DiagnosticCode::IncompatibleType]
        );
    }

    #[tokio::test]
    async fn test_invalid_code() {
        let outcome = check(
            "TRUE { Patient<p>: * maritalStatus = http://snomed.info/sct|999 }",
            TerminologyMode::Interactive,
        )
        .await
        .unwrap();
        assert_eq!(codes(&outcome), vec![DiagnosticCode::InvalidCode]);
    }

    #[tokio::test]
    async fn test_unsupported_system_degrades_when_interactive() {
        let outcome = check(
            "TRUE { Patient<p>: * maritalStatus = http://loinc.org|LA1-2 }",
            TerminologyMode::Interactive,
        )
        .await
        .unwrap();
        assert_eq!(codes(&outcome), vec![DiagnosticCode::TerminologySkipped]);
        assert!(!outcome.diagnostics[0].is_error());
    }

    #[tokio::test]
    async fn test_unsupported_system_is_fatal_in_batch() {
        let err = check(
            "TRUE { Patient<p>: * maritalStatus = http://loinc.org|LA1-2 }",
            TerminologyMode::Batch,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            crate::RedmatchError::Execution(ExecutionError::Terminology {
                source: TerminologyError::Unsupported { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_shape_compatibility() {
        assert!(ValueShape::String("abc".into()).accepts("id"));
        assert!(!ValueShape::String("a b".into()).accepts("id"));
        assert!(ValueShape::IntegerField { year: true }.accepts("date"));
        assert!(!ValueShape::IntegerField { year: false }.accepts("date"));
        assert!(ValueShape::Concept.accepts("Coding"));
        assert!(!ValueShape::Concept.accepts("code"));
    }
}
