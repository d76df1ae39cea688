//! Resolution of a parsed document against a schema

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::resource_graph::{Instantiation, ResourceGraph};
use super::validation::{AttributeCheck, TerminologyCheck, TerminologyOutcome, ValueShape};
use crate::ast::{
    AttributeBinding, ConceptLiteral, Document, FieldRef, FieldValue, FieldValueKind, Resource,
    SystemRef, Value,
};
use crate::diagnostics::{Diagnostic, DiagnosticCode, Location, normalize};
use crate::schema::{Field, FieldType, OPTION_SEPARATOR, Schema, TextValidation};
use crate::terminology::{AttributeFacts, package_system};

static REDCAP_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][A-Za-z0-9_]*$").unwrap());

static FHIR_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-.]{1,64}$").unwrap());

/// Whether `id` is a valid FHIR resource id
pub fn is_fhir_id(id: &str) -> bool {
    FHIR_ID.is_match(id)
}

/// Replace every character a FHIR id cannot hold with `-`
pub fn fhirise_id(id: &str) -> String {
    let fhirised: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if fhirised.is_empty() {
        "id".to_string()
    } else {
        fhirised
    }
}

/// A document whose references have been checked against a schema
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDocument {
    pub document: Document,
    /// Every declared resource key (`Type<id>`) in declaration order
    pub resources: IndexMap<String, Instantiation>,
    /// Facts about attribute paths (`Type.a.b`) reported by the target package
    pub attribute_facts: BTreeMap<String, AttributeFacts>,
    /// `package#version` from a valid `TARGET`
    pub fhir_package: Option<String>,
}

impl ResolvedDocument {
    pub fn instantiation(&self, key: &str) -> Option<Instantiation> {
        self.resources.get(key).copied()
    }

    pub fn facts(&self, resource_type: &str, path: &str) -> Option<&AttributeFacts> {
        self.attribute_facts.get(&format!("{resource_type}.{path}"))
    }
}

/// Output of [`resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub document: ResolvedDocument,
    pub diagnostics: Vec<Diagnostic>,
    /// Questions for the terminology phase
    pub terminology_checks: Vec<TerminologyCheck>,
}

impl Resolution {
    pub fn has_errors(&self) -> bool {
        crate::diagnostics::has_errors(&self.diagnostics)
    }

    /// Merge the results of the terminology phase
    pub fn apply(&mut self, outcome: TerminologyOutcome) {
        self.diagnostics.extend(outcome.diagnostics);
        normalize(&mut self.diagnostics);
        self.document.attribute_facts.extend(outcome.attribute_facts);
    }
}

/// Check `document` against `schema`. Never fails and never mutates its
/// inputs; every problem is a diagnostic.
pub fn resolve(document: &Document, schema: &Schema) -> Resolution {
    let mut resolver = Resolver::new(document, schema);
    resolver.check_target();
    resolver.check_conditions();
    for guarded in document.resources() {
        resolver.check_resource(guarded.resource);
    }
    resolver.check_mappings();

    let graph = ResourceGraph::build(document);
    resolver.diagnostics.extend(graph.diagnostics());
    let resources = graph.instantiations();

    let mut diagnostics = resolver.diagnostics;
    normalize(&mut diagnostics);
    debug!(
        "Resolved {} resources with {} diagnostics and {} terminology checks",
        resources.len(),
        diagnostics.len(),
        resolver.checks.len()
    );

    Resolution {
        document: ResolvedDocument {
            document: document.clone(),
            resources,
            attribute_facts: BTreeMap::new(),
            fhir_package: resolver.fhir_package,
        },
        diagnostics,
        terminology_checks: resolver.checks,
    }
}

struct Resolver<'a> {
    document: &'a Document,
    schema: &'a Schema,
    aliases: HashSet<&'a str>,
    fhir_package: Option<String>,
    diagnostics: Vec<Diagnostic>,
    checks: Vec<TerminologyCheck>,
    /// Fields that need a mapping, with the first value requiring it
    needs_mapping: IndexMap<String, Location>,
}

impl<'a> Resolver<'a> {
    fn new(document: &'a Document, schema: &'a Schema) -> Self {
        Self {
            document,
            schema,
            aliases: document.aliases.iter().map(|a| a.name.as_str()).collect(),
            fhir_package: None,
            diagnostics: Vec::new(),
            checks: Vec::new(),
            needs_mapping: IndexMap::new(),
        }
    }

    fn check_target(&mut self) {
        let Some(target) = &self.document.target else {
            return;
        };
        if target.value.matches('#').count() == 1 {
            self.fhir_package = Some(target.value.clone());
        } else {
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::InvalidTarget,
                format!(
                    "Invalid target '{}': expected a FHIR package of the form 'name#version'",
                    target.value
                ),
                target.location.clone(),
            ));
        }
    }

    fn check_conditions(&mut self) {
        let document = self.document;
        for rule in document.all_rules() {
            for field in rule.condition.fields() {
                self.check_field_ref(field);
            }
        }
    }

    /// Resolve a field reference, reporting it when it does not resolve
    fn check_field_ref(&mut self, field: &FieldRef) -> Option<&'a Field> {
        let schema = self.schema;
        if !REDCAP_ID.is_match(&field.id) {
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::InvalidFieldId,
                format!(
                    "Invalid field id '{}': ids start with a lowercase letter followed by letters, digits or underscores",
                    field.id
                ),
                field.location.clone(),
            ));
            return None;
        }

        if let Some(found) = schema.field(&field.id) {
            return Some(found);
        }

        let option_of = field
            .id
            .rsplit_once(OPTION_SEPARATOR)
            .and_then(|(parent, code)| {
                schema
                    .field(parent)
                    .filter(|p| p.field_type.has_options())
                    .map(|p| (p, code))
            });
        let diagnostic = match option_of {
            Some((parent, code)) => Diagnostic::error(
                DiagnosticCode::UnknownField,
                format!(
                    "Option '{}' is not declared for field '{}'",
                    code, parent.id
                ),
                field.location.clone(),
            ),
            None => {
                let diagnostic = Diagnostic::error(
                    DiagnosticCode::UnknownField,
                    format!("Field '{}' is not in the schema", field.id),
                    field.location.clone(),
                );
                match schema.closest_field(&field.id) {
                    Some(closest) => diagnostic.with_suggestion(&field.id, closest),
                    None => diagnostic,
                }
            }
        };
        self.diagnostics.push(diagnostic);
        None
    }

    fn check_resource(&mut self, resource: &Resource) {
        if !is_fhir_id(&resource.id) {
            self.diagnostics.push(
                Diagnostic::error(
                    DiagnosticCode::InvalidFhirId,
                    format!(
                        "Invalid resource id '{}': FHIR ids are 1 to 64 letters, digits, '-' or '.'",
                        resource.id
                    ),
                    resource.id_location.clone(),
                )
                .with_suggestion(&resource.id, fhirise_id(&resource.id)),
            );
        }

        for attribute in &resource.attributes {
            let field = self.check_value(attribute);
            if let Some(package) = &self.fhir_package {
                self.checks.push(TerminologyCheck::Attribute(AttributeCheck {
                    package_system: package_system(package),
                    resource_type: resource.resource_type.clone(),
                    path: attribute.path.clone(),
                    shape: ValueShape::of(&attribute.value, field),
                    path_location: attribute.path_location.clone(),
                    value_location: attribute.value_location.clone(),
                }));
            }
        }
    }

    /// Check the value of a binding, returning the field it reads if any
    fn check_value(&mut self, attribute: &AttributeBinding) -> Option<&'a Field> {
        match &attribute.value {
            Value::Field(value) => {
                let field = self.check_field_ref(&value.field)?;
                self.check_compatibility(value, field, &attribute.value_location);
                self.record_mapping_need(value, field);
                Some(field)
            }
            Value::Concept(concept) => {
                self.check_concept(concept);
                None
            }
            Value::Reference(reference) => {
                if !is_fhir_id(&reference.id) {
                    self.diagnostics.push(
                        Diagnostic::error(
                            DiagnosticCode::InvalidFhirId,
                            format!("Invalid resource id '{}' in reference", reference.id),
                            reference.location.clone(),
                        )
                        .with_suggestion(&reference.id, fhirise_id(&reference.id)),
                    );
                }
                None
            }
            Value::Boolean(_)
            | Value::String(_)
            | Value::Integer(_)
            | Value::Decimal(_)
            | Value::Code(_) => None,
        }
    }

    fn check_compatibility(&mut self, value: &FieldValue, field: &Field, location: &Location) {
        let compatible = match value.kind {
            FieldValueKind::Value => match field.field_type {
                FieldType::Text => field.validation != TextValidation::FhirTerminology,
                FieldType::Notes | FieldType::Calc => true,
                _ => false,
            },
            FieldValueKind::Concept => match field.field_type {
                FieldType::Text => field.validation == TextValidation::FhirTerminology,
                FieldType::YesNo
                | FieldType::TrueFalse
                | FieldType::Dropdown
                | FieldType::Radio
                | FieldType::Checkbox
                | FieldType::CheckboxOption
                | FieldType::DropdownOrRadioOption => true,
                _ => false,
            },
            FieldValueKind::ConceptSelected | FieldValueKind::CodeSelected => {
                matches!(field.field_type, FieldType::Dropdown | FieldType::Radio)
            }
        };
        if !compatible {
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::IncompatibleExpression,
                format!(
                    "{} cannot be used with field '{}' of type {}",
                    value.kind, field.id, field.field_type
                ),
                location.clone(),
            ));
        }

        if let Some(precision) = value.precision {
            let integer_year = field.field_type == FieldType::Text
                && field.validation == TextValidation::Integer
                && precision == crate::ast::DatePrecision::Year;
            if !field.is_date() && !integer_year {
                self.diagnostics.push(Diagnostic::error(
                    DiagnosticCode::InvalidDatePrecision,
                    format!(
                        "Field '{}' is not a date: a date precision only applies to date fields (or YEAR to integer fields)",
                        field.id
                    ),
                    location.clone(),
                ));
            }
        }
    }

    fn record_mapping_need(&mut self, value: &FieldValue, field: &Field) {
        let location = &value.field.location;
        match value.kind {
            FieldValueKind::ConceptSelected | FieldValueKind::CodeSelected => {
                for option in self.schema.options_of(&field.id) {
                    self.needs_mapping
                        .entry(option.id.clone())
                        .or_insert_with(|| location.clone());
                }
            }
            FieldValueKind::Concept => {
                let self_coded = field.field_type == FieldType::Text
                    && field.validation == TextValidation::FhirTerminology;
                if !self_coded {
                    self.needs_mapping
                        .entry(field.id.clone())
                        .or_insert_with(|| location.clone());
                }
            }
            FieldValueKind::Value => {}
        }
    }

    fn check_concept(&mut self, concept: &ConceptLiteral) {
        let system = match &concept.system {
            SystemRef::Url(url) => url.clone(),
            SystemRef::Alias(name) => {
                if !self.aliases.contains(name.as_str()) {
                    self.diagnostics.push(Diagnostic::error(
                        DiagnosticCode::UnknownAlias,
                        format!("Alias {name} is not declared in ALIASES"),
                        concept.location.clone(),
                    ));
                    return;
                }
                match self.document.resolve_system(&concept.system) {
                    Some(system) => system.to_string(),
                    None => return,
                }
            }
        };
        self.checks.push(TerminologyCheck::Code {
            system,
            code: concept.code.clone(),
            location: concept.location.clone(),
        });
    }

    fn check_mappings(&mut self) {
        let document = self.document;
        let mut needed = std::mem::take(&mut self.needs_mapping);

        for mapping in &document.mappings {
            match self.schema.field(&mapping.field.id) {
                None => {
                    let diagnostic = Diagnostic::error(
                        DiagnosticCode::MappedFieldMissing,
                        format!(
                            "Field '{}' of this mapping is not in the schema",
                            mapping.field.id
                        ),
                        mapping.field.location.clone(),
                    );
                    self.diagnostics.push(
                        match self.schema.closest_field(&mapping.field.id) {
                            Some(closest) => diagnostic.with_suggestion(&mapping.field.id, closest),
                            None => diagnostic,
                        },
                    );
                }
                Some(field) => {
                    if let Some(label) = &mapping.label {
                        if label.trim() != field.label.trim() {
                            self.diagnostics.push(
                                Diagnostic::warning(
                                    DiagnosticCode::MappedFieldLabelMismatch,
                                    format!(
                                        "Label '{}' does not match the label of field '{}' ('{}')",
                                        label, field.id, field.label
                                    ),
                                    mapping.location.clone(),
                                )
                                .with_suggestion(label.as_str(), field.label.as_str()),
                            );
                        }
                    }
                    if needed.shift_remove(&field.id).is_none() {
                        self.diagnostics.push(Diagnostic::warning(
                            DiagnosticCode::MappingNotNeeded,
                            format!("Mapping for field {} is not needed", field.id),
                            mapping.location.clone(),
                        ));
                    }
                }
            }
            self.check_concept(&mapping.target);
        }

        for (field_id, first_use) in needed {
            let location = document.mappings_location.clone().unwrap_or(first_use);
            self.diagnostics.push(Diagnostic::error(
                DiagnosticCode::MappingMissing,
                format!("Mapping for field {field_id} is required but was not found"),
                location,
            ));
        }
    }
}
