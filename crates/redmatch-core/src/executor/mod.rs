//! Transformation of study records into FHIR resources
//!
//! A run has two passes. Static resources are instantiated once against an
//! empty record. Every record then walks the rules, picks the body or `ELSE`
//! body of each rule, and instantiates the per-record resources found there.
//! Records are independent and processed in parallel with `rayon`; results
//! are collected in record order so output is deterministic.
//!
//! Within one record, the set of instantiated resources is known before any
//! attribute is bound, so `REF(...)` can point forward to resources declared
//! later in the rules.

pub mod builder;
pub mod record;

pub use record::{Record, RecordFormat, load_records};

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value as Json, json};
use tracing::{debug, info, info_span};

use crate::ast::{
    AttributeBinding, CompareOp, Condition, ConceptLiteral, DatePrecision, FieldRef, FieldValue,
    FieldValueKind, Literal, MAX_ATTRIBUTE_INDEX, Resource, ResourceRef, Rule, Value,
};
use crate::dates::{self, DateLayout};
use crate::diagnostics::Location;
use crate::error::{ExecutionError, RedmatchError};
use crate::schema::{Field, FieldType, Schema, TextValidation};
use crate::semantic::{Instantiation, ResolvedDocument};
use crate::terminology::TerminologyValidator;
use builder::{Step, merge, prune, set_path};

/// Concurrent code validations in batch mode
const VALIDATION_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Process records on the rayon pool
    pub parallel: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self { parallel: true }
    }
}

/// Resources produced by a run, in order of first creation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionOutput {
    pub resources: Vec<Json>,
}

impl ExecutionOutput {
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources grouped by `resourceType`, types in name order
    pub fn by_type(&self) -> BTreeMap<&str, Vec<&Json>> {
        let mut groups: BTreeMap<&str, Vec<&Json>> = BTreeMap::new();
        for resource in &self.resources {
            let resource_type = resource
                .get("resourceType")
                .and_then(Json::as_str)
                .unwrap_or("Unknown");
            groups.entry(resource_type).or_default().push(resource);
        }
        groups
    }

    /// Write one `<ResourceType>.ndjson` file per type into `dir`
    pub fn write_ndjson(&self, dir: &Path) -> crate::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir).map_err(|e| RedmatchError::io_error(dir, e))?;
        let mut written = Vec::new();
        for (resource_type, resources) in self.by_type() {
            let path = dir.join(format!("{resource_type}.ndjson"));
            let mut content = String::new();
            for resource in resources {
                let line = serde_json::to_string(resource)
                    .map_err(|e| RedmatchError::internal_error(e.to_string()))?;
                content.push_str(&line);
                content.push('\n');
            }
            std::fs::write(&path, content).map_err(|e| RedmatchError::io_error(&path, e))?;
            debug!("Wrote {}", path.display());
            written.push(path);
        }
        Ok(written)
    }
}

/// A code emitted into the output, kept for batch validation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmittedCode {
    system: String,
    code: String,
    location: Location,
}

/// Resources and codes produced by one pass
#[derive(Debug, Default)]
struct PassOutput {
    resources: Vec<(String, Json)>,
    codes: Vec<EmittedCode>,
}

/// Applies a resolved document to records
pub struct Executor<'a> {
    resolved: &'a ResolvedDocument,
    schema: &'a Schema,
    options: ExecutionOptions,
}

impl<'a> Executor<'a> {
    pub fn new(resolved: &'a ResolvedDocument, schema: &'a Schema) -> Self {
        Self {
            resolved,
            schema,
            options: ExecutionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Transform `records` without validating emitted codes
    pub fn execute(&self, records: &[Record]) -> crate::Result<ExecutionOutput> {
        let (output, _) = self.run(records)?;
        Ok(output)
    }

    /// Transform `records`, then validate every distinct emitted code with
    /// `validator`. The first invalid code or validator failure aborts.
    pub async fn execute_validated(
        &self,
        records: &[Record],
        validator: &dyn TerminologyValidator,
    ) -> crate::Result<ExecutionOutput> {
        let (output, codes) = self.run(records)?;
        validate_codes(codes, validator).await?;
        Ok(output)
    }

    fn run(&self, records: &[Record]) -> crate::Result<(ExecutionOutput, Vec<EmittedCode>)> {
        let _span = info_span!("execute", records = records.len()).entered();
        let unique_field = self
            .schema
            .unique_field()
            .ok_or_else(|| RedmatchError::invalid_document("the schema has no fields"))?;

        let empty = Record::new();
        let no_keys = HashSet::new();
        let static_keys =
            RecordRun::new(self, &empty, None, &no_keys).active_keys(Instantiation::Static);
        let static_output =
            RecordRun::new(self, &empty, None, &static_keys).build(Instantiation::Static)?;
        debug!("Instantiated {} static resources", static_output.resources.len());

        let per_record = |(row, record): (usize, &Record)| -> crate::Result<PassOutput> {
            let record_id = record.get(&unique_field.id).ok_or_else(|| {
                ExecutionError::MissingRecordId {
                    row: row + 1,
                    field_id: unique_field.id.clone(),
                }
            })?;
            RecordRun::new(self, record, Some(record_id), &static_keys)
                .build(Instantiation::PerRecord)
                .map_err(RedmatchError::from)
        };

        let outputs: Vec<PassOutput> = if self.options.parallel {
            records
                .par_iter()
                .enumerate()
                .map(per_record)
                .collect::<crate::Result<Vec<_>>>()?
        } else {
            records
                .iter()
                .enumerate()
                .map(per_record)
                .collect::<crate::Result<Vec<_>>>()?
        };

        let mut merged: IndexMap<String, Json> = IndexMap::new();
        let mut codes = Vec::new();
        for pass in std::iter::once(static_output).chain(outputs) {
            for (id, resource) in pass.resources {
                match merged.get_mut(&id) {
                    Some(existing) => merge(existing, resource),
                    None => {
                        merged.insert(id, resource);
                    }
                }
            }
            codes.extend(pass.codes);
        }

        let output = ExecutionOutput {
            resources: merged.into_values().collect(),
        };
        info!(
            "Transformed {} records into {} resources",
            records.len(),
            output.len()
        );
        Ok((output, codes))
    }
}

async fn validate_codes(
    codes: Vec<EmittedCode>,
    validator: &dyn TerminologyValidator,
) -> Result<(), ExecutionError> {
    let mut seen = HashSet::new();
    let distinct: Vec<EmittedCode> = codes
        .into_iter()
        .filter(|c| seen.insert((c.system.clone(), c.code.clone())))
        .collect();
    debug!("Validating {} emitted codes", distinct.len());

    let results: Vec<_> = stream::iter(distinct)
        .map(|emitted| async move {
            let valid = validator.validate_code(&emitted.system, &emitted.code).await;
            (emitted, valid)
        })
        .buffered(VALIDATION_CONCURRENCY)
        .collect()
        .await;

    for (emitted, valid) in results {
        match valid {
            Ok(true) => {}
            Ok(false) => {
                return Err(ExecutionError::InvalidCode {
                    system: emitted.system,
                    code: emitted.code,
                    location: emitted.location,
                });
            }
            Err(source) => {
                return Err(ExecutionError::Terminology {
                    source,
                    location: emitted.location,
                });
            }
        }
    }
    Ok(())
}

/// Evaluation of the rules against one record (or none, for static resources)
struct RecordRun<'a> {
    resolved: &'a ResolvedDocument,
    schema: &'a Schema,
    record: &'a Record,
    record_id: Option<&'a str>,
    static_keys: &'a HashSet<String>,
}

impl<'a> RecordRun<'a> {
    fn new(
        executor: &Executor<'a>,
        record: &'a Record,
        record_id: Option<&'a str>,
        static_keys: &'a HashSet<String>,
    ) -> Self {
        Self {
            resolved: executor.resolved,
            schema: executor.schema,
            record,
            record_id,
            static_keys,
        }
    }

    /// Resources of `wanted` instantiation whose conditions hold, in rule order
    fn active(&self, wanted: Instantiation) -> Vec<&'a Resource> {
        let mut out = Vec::new();
        for rule in &self.resolved.document.rules {
            self.collect(rule, wanted, &mut out);
        }
        out
    }

    fn active_keys(&self, wanted: Instantiation) -> HashSet<String> {
        self.active(wanted).iter().map(|r| r.key()).collect()
    }

    fn collect(&self, rule: &'a Rule, wanted: Instantiation, out: &mut Vec<&'a Resource>) {
        let body = if self.holds(&rule.condition) {
            Some(&rule.body)
        } else {
            rule.else_body.as_ref()
        };
        let Some(body) = body else {
            return;
        };
        for item in &body.items {
            match item {
                crate::ast::BodyItem::Resource(resource) => {
                    if self.resolved.instantiation(&resource.key()) == Some(wanted) {
                        out.push(resource);
                    }
                }
                crate::ast::BodyItem::Rule(nested) => self.collect(nested, wanted, out),
            }
        }
    }

    fn build(&self, wanted: Instantiation) -> Result<PassOutput, ExecutionError> {
        let active = self.active(wanted);
        let active_keys: HashSet<String> = active.iter().map(|r| r.key()).collect();

        let mut built: IndexMap<String, Map<String, Json>> = IndexMap::new();
        let mut codes = Vec::new();
        for resource in active {
            let id = self.instance_id(&resource.id);
            let merge_key = format!("{}/{}", resource.resource_type, id);
            let target = built.entry(merge_key).or_insert_with(|| {
                let mut map = Map::new();
                map.insert("resourceType".into(), json!(resource.resource_type));
                map.insert("id".into(), json!(id));
                map
            });
            for binding in &resource.attributes {
                let bound = Binding {
                    run: self,
                    resource,
                    binding,
                    active_keys: &active_keys,
                };
                if let Some(value) = bound.evaluate(&mut codes)? {
                    set_path(target, &bound.steps(), value).map_err(|e| {
                        bound.unbound(format!(
                            "index {} is larger than the maximum of {}",
                            e.index, MAX_ATTRIBUTE_INDEX
                        ))
                    })?;
                }
            }
        }

        let resources = built
            .into_iter()
            .map(|(key, map)| {
                let mut value = Json::Object(map);
                prune(&mut value);
                (key, value)
            })
            .collect();
        Ok(PassOutput { resources, codes })
    }

    fn instance_id(&self, resource_id: &str) -> String {
        match self.record_id {
            Some(record_id) => format!("{resource_id}-{record_id}"),
            None => resource_id.to_string(),
        }
    }

    fn holds(&self, condition: &Condition) -> bool {
        match condition {
            Condition::Bool { value, .. } => *value,
            Condition::Null(field) => !self.is_present(&field.id),
            Condition::NotNull(field) => self.is_present(&field.id),
            Condition::Compare {
                field, op, literal, ..
            } => self
                .raw(&field.id)
                .is_some_and(|raw| compare(raw, *op, literal)),
            Condition::Not(inner) => !self.holds(inner),
            Condition::And(left, right) => self.holds(left) && self.holds(right),
            Condition::Or(left, right) => self.holds(left) || self.holds(right),
        }
    }

    /// A checkbox is present when any option is ticked; an option when it
    /// is ticked
    fn is_present(&self, field_id: &str) -> bool {
        match self.schema.field(field_id) {
            Some(field) if field.field_type == FieldType::Checkbox => self
                .schema
                .options_of(field_id)
                .any(|option| self.raw_of(option).is_some_and(|v| v != "0")),
            Some(field) if field.field_type.is_option() => {
                self.raw_of(field).is_some_and(|v| v != "0")
            }
            _ => self.record.get(field_id).is_some(),
        }
    }

    fn raw(&self, field_id: &str) -> Option<&'a str> {
        match self.schema.field(field_id) {
            Some(field) => self.raw_of(field),
            None => self.record.get(field_id),
        }
    }

    fn raw_of(&self, field: &Field) -> Option<&'a str> {
        match (field.parent.as_deref(), field.option_code()) {
            (Some(parent), Some(code)) => self.record.option(parent, code),
            _ => self.record.get(&field.id),
        }
    }

    /// Raw value usable as a binding: unticked options count as empty
    fn bindable(&self, field: &Field) -> Option<&'a str> {
        let raw = self.raw_of(field)?;
        if field.field_type.is_option() && raw == "0" {
            None
        } else {
            Some(raw.trim())
        }
    }
}

fn compare(raw: &str, op: CompareOp, literal: &Literal) -> bool {
    let raw = raw.trim();
    let literal_text = match literal {
        Literal::String(s) => s.clone(),
        Literal::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
        Literal::Number(n) => n.to_string(),
    };
    let ordering = match (raw.parse::<f64>(), literal_text.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(raw.cmp(literal_text.as_str())),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Neq => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

/// One attribute binding of one resource being evaluated
struct Binding<'r, 'a> {
    run: &'r RecordRun<'a>,
    resource: &'a Resource,
    binding: &'a AttributeBinding,
    active_keys: &'r HashSet<String>,
}

impl Binding<'_, '_> {
    fn steps(&self) -> Vec<Step<'_>> {
        let mut prefix = String::new();
        self.binding
            .path
            .iter()
            .map(|segment| {
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(&segment.name);
                let list = self
                    .run
                    .resolved
                    .facts(&self.resource.resource_type, &prefix)
                    .is_some_and(|f| f.is_list());
                Step {
                    name: &segment.name,
                    index: segment.index,
                    list,
                }
            })
            .collect()
    }

    /// FHIR type of the bound attribute, when the target package reported one
    fn type_code(&self) -> Option<&str> {
        self.run
            .resolved
            .facts(&self.resource.resource_type, &self.binding.path_string())
            .and_then(|f| f.type_code.as_deref())
    }

    fn location(&self) -> Location {
        self.binding.value_location.clone()
    }

    /// JSON value to bind, `None` to leave the attribute unset
    fn evaluate(&self, codes: &mut Vec<EmittedCode>) -> Result<Option<Json>, ExecutionError> {
        let value = match &self.binding.value {
            Value::Boolean(b) => Some(json!(b)),
            Value::String(s) => Some(json!(s)),
            Value::Integer(n) => Some(json!(n)),
            Value::Decimal(d) => Some(Json::from(*d)),
            Value::Code(code) => Some(json!(code)),
            Value::Reference(target) => self.reference(target),
            Value::Concept(literal) => {
                let system = self
                    .run
                    .resolved
                    .document
                    .resolve_system(&literal.system)
                    .ok_or_else(|| self.unbound(format!("unknown alias {}", literal.system)))?;
                Some(self.concept(system, &literal.code, literal.display.as_deref(), codes))
            }
            Value::Field(field_value) => self.field_value(field_value, codes)?,
        };
        Ok(value)
    }

    fn reference(&self, target: &ResourceRef) -> Option<Json> {
        let key = target.key();
        let id = match self.run.resolved.instantiation(&key)? {
            Instantiation::Static if self.run.static_keys.contains(&key) => target.id.clone(),
            Instantiation::Static => return None,
            Instantiation::PerRecord => {
                if self.run.record_id.is_none() || !self.active_keys.contains(&key) {
                    return None;
                }
                self.run.instance_id(&target.id)
            }
        };
        Some(json!({ "reference": format!("{}/{}", target.resource_type, id) }))
    }

    fn concept(
        &self,
        system: &str,
        code: &str,
        display: Option<&str>,
        codes: &mut Vec<EmittedCode>,
    ) -> Json {
        self.emit(system, code, codes);

        let mut coding = Map::new();
        coding.insert("system".into(), json!(system));
        coding.insert("code".into(), json!(code));
        if let Some(display) = display.filter(|d| !d.is_empty()) {
            coding.insert("display".into(), json!(display));
        }

        let leaf = self
            .binding
            .path
            .last()
            .map(|s| s.name.as_str())
            .unwrap_or("");
        match self.type_code() {
            Some("code") => json!(code),
            Some("Coding") => Json::Object(coding),
            Some(_) => json!({ "coding": [coding] }),
            None if leaf == "coding" || leaf.ends_with("Coding") => Json::Object(coding),
            None => json!({ "coding": [coding] }),
        }
    }

    fn emit(&self, system: &str, code: &str, codes: &mut Vec<EmittedCode>) {
        codes.push(EmittedCode {
            system: system.to_string(),
            code: code.to_string(),
            location: self.location(),
        });
    }

    fn mapped_concept(
        &self,
        field_id: &str,
        codes: &mut Vec<EmittedCode>,
    ) -> Result<Json, ExecutionError> {
        let target = self.mapping(field_id)?;
        let system = self
            .run
            .resolved
            .document
            .resolve_system(&target.system)
            .ok_or_else(|| self.unbound(format!("unknown alias {}", target.system)))?;
        Ok(self.concept(system, &target.code, target.display.as_deref(), codes))
    }

    fn mapping(&self, field_id: &str) -> Result<&ConceptLiteral, ExecutionError> {
        self.run
            .resolved
            .document
            .mapping(field_id)
            .map(|m| &m.target)
            .ok_or_else(|| ExecutionError::MissingMapping {
                field_id: field_id.to_string(),
                record_id: self.run.record_id.unwrap_or_default().to_string(),
                location: self.location(),
            })
    }

    fn field_value(
        &self,
        value: &FieldValue,
        codes: &mut Vec<EmittedCode>,
    ) -> Result<Option<Json>, ExecutionError> {
        let FieldRef { id, .. } = &value.field;
        let Some(field) = self.run.schema.field(id) else {
            return Err(self.unbound(format!("field '{id}' is not in the schema")));
        };
        let Some(raw) = self.run.bindable(field) else {
            return Ok(None);
        };

        let json = match value.kind {
            FieldValueKind::Value => self.typed(field, raw, value.precision)?,
            FieldValueKind::Concept => {
                if field.validation == TextValidation::FhirTerminology {
                    self.terminology_value(field, raw, codes)?
                } else {
                    self.mapped_concept(&field.id, codes)?
                }
            }
            FieldValueKind::ConceptSelected => {
                self.mapped_concept(&format!("{}___{}", field.id, raw), codes)?
            }
            FieldValueKind::CodeSelected => {
                let target = self.mapping(&format!("{}___{}", field.id, raw))?;
                if let Some(system) = self.run.resolved.document.resolve_system(&target.system) {
                    self.emit(system, &target.code, codes);
                }
                json!(target.code)
            }
        };
        Ok(Some(json))
    }

    /// A `code|display|system` value written by a terminology-backed field
    fn terminology_value(
        &self,
        field: &Field,
        raw: &str,
        codes: &mut Vec<EmittedCode>,
    ) -> Result<Json, ExecutionError> {
        let parts: Vec<&str> = raw.split('|').map(str::trim).collect();
        match parts.as_slice() {
            [code, display, system] if !code.is_empty() && !system.is_empty() => {
                Ok(self.concept(system, code, Some(display), codes))
            }
            _ => Err(self.invalid(field, raw, "expected code|display|system")),
        }
    }

    fn typed(
        &self,
        field: &Field,
        raw: &str,
        precision: Option<DatePrecision>,
    ) -> Result<Json, ExecutionError> {
        let type_code = self.type_code();
        if let Some(layout) = DateLayout::for_validation(field.validation) {
            let mut parsed =
                dates::parse(raw, layout).map_err(|e| self.invalid(field, raw, e.to_string()))?;
            if let Some(precision) = precision {
                parsed = dates::truncate(parsed, precision);
            }
            let date_only = type_code == Some("date")
                || precision.is_some_and(|p| p <= DatePrecision::Day);
            return Ok(json!(dates::to_fhir(parsed, layout, date_only)));
        }

        let json = match (field.field_type, field.validation) {
            (FieldType::Text, TextValidation::Integer) => {
                let n: i64 = raw
                    .parse()
                    .map_err(|_| self.invalid(field, raw, "not an integer"))?;
                if precision == Some(DatePrecision::Year) {
                    json!(format!("{n:04}-01-01"))
                } else if type_code == Some("string") {
                    json!(raw)
                } else {
                    json!(n)
                }
            }
            (FieldType::Calc, _) | (FieldType::Text, TextValidation::Number) => {
                let n: f64 = raw
                    .parse()
                    .map_err(|_| self.invalid(field, raw, "not a number"))?;
                if type_code == Some("string") {
                    json!(raw)
                } else if let Ok(i) = raw.parse::<i64>() {
                    json!(i)
                } else {
                    Json::from(n)
                }
            }
            (FieldType::Text, TextValidation::Time) => {
                if raw.len() == 5 {
                    json!(format!("{raw}:00"))
                } else {
                    json!(raw)
                }
            }
            _ => json!(raw),
        };
        Ok(json)
    }

    fn invalid(&self, field: &Field, raw: &str, reason: impl Into<String>) -> ExecutionError {
        ExecutionError::InvalidValue {
            field_id: field.id.clone(),
            value: raw.to_string(),
            reason: reason.into(),
            location: self.location(),
        }
    }

    fn unbound(&self, reason: String) -> ExecutionError {
        ExecutionError::UnboundAttribute {
            resource: self.resource.key(),
            attribute: self.binding.path_string(),
            reason,
            location: self.location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::resolve;
    use crate::syntax::parse;
    use crate::terminology::{CodeSystem, Concept, InMemoryTerminology};
    use crate::testing::study_schema;

    fn resolved(rules: &str, mappings: &str) -> ResolvedDocument {
        let source = format!(
            "SCHEMA: 'study.json' (REDCAP)\nRULES: {{ {rules} }}\nMAPPINGS: {{ {mappings} }}"
        );
        let parsed = parse(&source);
        assert!(parsed.diagnostics.is_empty(), "{:#?}", parsed.diagnostics);
        resolve(&parsed.document, &study_schema()).document
    }

    fn run(rules: &str, mappings: &str, records: &[Record]) -> crate::Result<ExecutionOutput> {
        let document = resolved(rules, mappings);
        let schema = study_schema();
        Executor::new(&document, &schema).execute(records)
    }

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_static_resource_created_once() {
        let output = run(
            "TRUE { Organization<org>: * name = 'Clinic' }",
            "",
            &[record(&[("record_id", "1")]), record(&[("record_id", "2")])],
        )
        .unwrap();
        insta::assert_json_snapshot!(output.resources, @r###"
        [
          {
            "resourceType": "Organization",
            "id": "org",
            "name": "Clinic"
          }
        ]
        "###);
    }

    #[test]
    fn test_per_record_resources_and_references() {
        let output = run(
            "TRUE { Organization<org>: * name = 'Clinic' }
             NOTNULL(pat_dob) {
               Patient<p>: * birthDate = VALUE(pat_dob), * managingOrganization = REF(Organization<org>)
             }
             TRUE { Encounter<e>: * subject = REF(Patient<p>), * status = CODE(finished) }",
            "",
            &[
                record(&[("record_id", "1"), ("pat_dob", "2001-03-04")]),
                record(&[("record_id", "2"), ("pat_dob", "")]),
            ],
        )
        .unwrap();
        let ids: Vec<&str> = output
            .resources
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["org", "p-1", "e-1", "e-2"]);
        assert_eq!(output.resources[1]["birthDate"], "2001-03-04");
        assert_eq!(
            output.resources[1]["managingOrganization"]["reference"],
            "Organization/org"
        );
        assert_eq!(output.resources[2]["subject"]["reference"], "Patient/p-1");
        // No patient for record 2, so the reference is left unset
        assert!(output.resources[3].get("subject").is_none());
    }

    #[test]
    fn test_index_past_limit_is_an_execution_error() {
        let mut document = resolved(
            "TRUE { Patient<p>: * identifier[0].value = VALUE(record_id) }",
            "",
        );
        let crate::ast::BodyItem::Resource(resource) = &mut document.document.rules[0].body.items[0]
        else {
            panic!("expected a resource");
        };
        resource.attributes[0].path[0].index = Some(usize::MAX);

        let schema = study_schema();
        let err = Executor::new(&document, &schema)
            .execute(&[record(&[("record_id", "1")])])
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Execution);
        assert!(err.to_string().contains("maximum"), "{err}");
    }

    #[test]
    fn test_forward_reference() {
        let output = run(
            "TRUE { Encounter<e>: * subject = REF(Patient<p>) }
             NOTNULL(record_id) { Patient<p>: * active = TRUE }",
            "",
            &[record(&[("record_id", "9")])],
        )
        .unwrap();
        assert_eq!(output.resources[0]["subject"]["reference"], "Patient/p-9");
    }

    #[test]
    fn test_else_body() {
        let output = run(
            "VALUE(weight) > 100 { Observation<o>: * valueString = 'heavy' }
             ELSE { Observation<o>: * valueString = 'light' }",
            "",
            &[
                record(&[("record_id", "1"), ("weight", "120.5")]),
                record(&[("record_id", "2"), ("weight", "80")]),
                record(&[("record_id", "3")]),
            ],
        )
        .unwrap();
        let values: Vec<&str> = output
            .resources
            .iter()
            .map(|r| r["valueString"].as_str().unwrap())
            .collect();
        assert_eq!(values, vec!["heavy", "light", "light"]);
    }

    #[test]
    fn test_numeric_and_lexicographic_comparison() {
        assert!(compare("9", CompareOp::Lt, &Literal::Number(10.0)));
        assert!(compare("abc", CompareOp::Lt, &Literal::String("abd".into())));
        assert!(compare("2", CompareOp::Eq, &Literal::String("2.0".into())));
        assert!(!compare("x", CompareOp::Eq, &Literal::Number(1.0)));
    }

    #[test]
    fn test_checkbox_null_checks() {
        let rules = "NOTNULL(symptoms) { Condition<c>: * note[0].text = 'symptomatic' }
                     NULL(symptoms___2) { Observation<no-cough>: * status = CODE(final) }";
        let output = run(
            rules,
            "",
            &[
                record(&[("record_id", "1"), ("symptoms___1", "1"), ("symptoms___2", "0")]),
                record(&[("record_id", "2"), ("symptoms___1", "0"), ("symptoms___2", "1")]),
                record(&[("record_id", "3"), ("symptoms___1", "0"), ("symptoms___2", "0")]),
            ],
        )
        .unwrap();
        let ids: Vec<&str> = output
            .resources
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["c-1", "no-cough-1", "c-2", "no-cough-3"]);
    }

    #[test]
    fn test_typed_values() {
        let output = run(
            "TRUE { Observation<o>:
                      * valueQuantity.value = VALUE(weight),
                      * effectiveDateTime = VALUE(admitted),
                      * issued = VALUE(admitted, 'HOUR'),
                      * note[0].text = VALUE(onset_year, 'YEAR') }",
            "",
            &[record(&[
                ("record_id", "1"),
                ("weight", "71.5"),
                ("admitted", "2020-02-03 14:25"),
                ("onset_year", "2019"),
            ])],
        )
        .unwrap();
        let o = &output.resources[0];
        assert_eq!(o["valueQuantity"]["value"], 71.5);
        assert_eq!(o["effectiveDateTime"], "2020-02-03T14:25:00Z");
        assert_eq!(o["issued"], "2020-02-03T14:00:00Z");
        assert_eq!(o["note"][0]["text"], "2019-01-01");
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = run(
            "TRUE { Observation<o>: * valueQuantity.value = VALUE(weight) }",
            "",
            &[record(&[("record_id", "1"), ("weight", "heavy")])],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RedmatchError::Execution(ExecutionError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_selected_concepts_and_codes() {
        let output = run(
            "TRUE { Patient<p>: * gender = CODE_SELECTED(pat_sex),
                                * extension[0].valueCoding = CONCEPT_SELECTED(pat_sex) }",
            "pat_sex___1 -> http://hl7.org/fhir/administrative-gender|male|'Male';
             pat_sex___2 -> http://hl7.org/fhir/administrative-gender|female|'Female';",
            &[record(&[("record_id", "1"), ("pat_sex", "2")])],
        )
        .unwrap();
        let p = &output.resources[0];
        assert_eq!(p["gender"], "female");
        assert_eq!(
            p["extension"][0]["valueCoding"],
            json!({
                "system": "http://hl7.org/fhir/administrative-gender",
                "code": "female",
                "display": "Female"
            })
        );
    }

    #[test]
    fn test_concept_from_terminology_field_and_mapping() {
        let output = run(
            "TRUE { Condition<c>: * code = CONCEPT(diagnosis) }
             VALUE(smoker) = 1 { Observation<s>: * code = CONCEPT(smoker) }",
            "smoker -> http://snomed.info/sct|77176002|'Smoker';",
            &[record(&[
                ("record_id", "1"),
                ("diagnosis", "74400008|Appendicitis|http://snomed.info/sct"),
                ("smoker", "1"),
            ])],
        )
        .unwrap();
        assert_eq!(
            output.resources[0]["code"],
            json!({"coding": [{
                "system": "http://snomed.info/sct",
                "code": "74400008",
                "display": "Appendicitis"
            }]})
        );
        assert_eq!(output.resources[1]["code"]["coding"][0]["code"], "77176002");
    }

    #[test]
    fn test_missing_mapping_is_an_error() {
        let err = run(
            "TRUE { Patient<p>: * gender = CODE_SELECTED(pat_sex) }",
            "pat_sex___1 -> http://hl7.org/fhir/administrative-gender|male;",
            &[record(&[("record_id", "1"), ("pat_sex", "2")])],
        )
        .unwrap_err();
        match err {
            RedmatchError::Execution(ExecutionError::MissingMapping {
                field_id,
                record_id,
                ..
            }) => {
                assert_eq!(field_id, "pat_sex___2");
                assert_eq!(record_id, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_record_id() {
        let err = run(
            "NOTNULL(pat_dob) { Patient<p>: * birthDate = VALUE(pat_dob) }",
            "",
            &[record(&[("record_id", "1")]), record(&[("pat_dob", "2000-01-01")])],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RedmatchError::Execution(ExecutionError::MissingRecordId { row: 2, .. })
        ));
    }

    #[test]
    fn test_duplicate_records_merge() {
        let output = run(
            "NOTNULL(pat_dob) { Patient<p>: * birthDate = VALUE(pat_dob) }
             NOTNULL(weight) { Patient<p>: * extension[0].valueDecimal = VALUE(weight) }",
            "",
            &[
                record(&[("record_id", "1"), ("pat_dob", "2001-03-04")]),
                record(&[("record_id", "1"), ("weight", "60")]),
            ],
        )
        .unwrap();
        assert_eq!(output.len(), 1);
        assert_eq!(output.resources[0]["birthDate"], "2001-03-04");
        assert_eq!(output.resources[0]["extension"][0]["valueDecimal"], 60);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let rules = "NOTNULL(pat_dob) { Patient<p>: * birthDate = VALUE(pat_dob, 'MONTH') }
                     TRUE { Encounter<e>: * subject = REF(Patient<p>) }";
        let document = resolved(rules, "");
        let schema = study_schema();
        let records: Vec<Record> = (1..=200)
            .map(|i| {
                record(&[
                    ("record_id", &i.to_string()),
                    ("pat_dob", if i % 3 == 0 { "" } else { "1990-06-15" }),
                ])
            })
            .collect();

        let parallel = Executor::new(&document, &schema).execute(&records).unwrap();
        let sequential = Executor::new(&document, &schema)
            .with_options(ExecutionOptions { parallel: false })
            .execute(&records)
            .unwrap();
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.resources[0]["birthDate"], "1990-06-01");
    }

    #[test]
    fn test_write_ndjson_groups_by_type() {
        let output = run(
            "TRUE { Organization<org>: * name = 'Clinic' }
             NOTNULL(record_id) { Patient<p>: * active = TRUE }",
            "",
            &[record(&[("record_id", "1")]), record(&[("record_id", "2")])],
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let files = output.write_ndjson(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        let patients = std::fs::read_to_string(dir.path().join("Patient.ndjson")).unwrap();
        assert_eq!(patients.lines().count(), 2);
        assert!(patients.starts_with(r#"{"resourceType":"Patient","id":"p-1""#));
    }

    #[tokio::test]
    async fn test_batch_validation_rejects_unknown_code() {
        let document = resolved(
            "TRUE { Observation<s>: * code = CONCEPT(smoker) }",
            "smoker -> http://snomed.info/sct|00000;",
        );
        let schema = study_schema();
        let terminology = InMemoryTerminology::new().with_code_system(
            CodeSystem::new("http://snomed.info/sct").with_concept(Concept::new("77176002")),
        );
        let err = Executor::new(&document, &schema)
            .execute_validated(
                &[record(&[("record_id", "1"), ("smoker", "1")])],
                &terminology,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RedmatchError::Execution(ExecutionError::InvalidCode { ref code, .. }) if code == "00000"
        ));
    }
}
