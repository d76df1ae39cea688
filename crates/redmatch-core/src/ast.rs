//! Typed syntax tree of a rules document
//!
//! Every node can tell whether evaluating it depends on study data through
//! [`DataReference`]. The answer is folded structurally over the children so
//! the resolver and executor can match exhaustively on the variants.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::diagnostics::Location;

/// Whether evaluating a node depends on study data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataReference {
    /// Purely static
    No,
    /// Reads at least one field
    Yes,
    /// Static on its own but references other resources, whose status decides
    Resource,
}

impl DataReference {
    /// `Yes` wins over `Resource`, which wins over `No`
    pub fn combine(self, other: DataReference) -> DataReference {
        match (self, other) {
            (DataReference::Yes, _) | (_, DataReference::Yes) => DataReference::Yes,
            (DataReference::Resource, _) | (_, DataReference::Resource) => DataReference::Resource,
            _ => DataReference::No,
        }
    }

    /// Combine every item, starting from `No`
    pub fn fold<I: IntoIterator<Item = DataReference>>(items: I) -> DataReference {
        items.into_iter().fold(DataReference::No, DataReference::combine)
    }
}

/// A parsed rules document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub schema: Option<SchemaDecl>,
    pub target: Option<Spanned<String>>,
    pub server: Option<Spanned<String>>,
    pub aliases: Vec<Alias>,
    pub rules: Vec<Rule>,
    pub mappings: Vec<Mapping>,
    /// Location of the `MAPPINGS` section, when present
    pub mappings_location: Option<Location>,
}

impl Document {
    /// System url of a concept literal, following aliases
    pub fn resolve_system<'a>(&'a self, system: &'a SystemRef) -> Option<&'a str> {
        match system {
            SystemRef::Url(url) => Some(url),
            SystemRef::Alias(name) => self
                .aliases
                .iter()
                .find(|a| &a.name == name)
                .map(|a| a.system.as_str()),
        }
    }

    pub fn mapping(&self, field_id: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|m| m.field.id == field_id)
    }

    /// Every resource in the document with the conditions guarding it,
    /// outermost first, in declaration order
    pub fn resources(&self) -> Vec<GuardedResource<'_>> {
        let mut out = Vec::new();
        for rule in &self.rules {
            collect_resources(rule, &mut Vec::new(), &mut out);
        }
        out
    }

    pub fn data_reference(&self) -> DataReference {
        DataReference::fold(self.rules.iter().map(Rule::data_reference))
    }

    /// Every rule, nested ones included, in declaration order
    pub fn all_rules(&self) -> Vec<&Rule> {
        fn walk<'a>(rule: &'a Rule, out: &mut Vec<&'a Rule>) {
            out.push(rule);
            for nested in rule.body.rules().chain(rule.else_body.iter().flat_map(|b| b.rules())) {
                walk(nested, out);
            }
        }
        let mut out = Vec::new();
        for rule in &self.rules {
            walk(rule, &mut out);
        }
        out
    }
}

/// A resource and the conditions it is instantiated under
#[derive(Debug, Clone)]
pub struct GuardedResource<'a> {
    pub resource: &'a Resource,
    pub guards: Vec<Guard<'a>>,
}

impl GuardedResource<'_> {
    /// Data reference of the resource including its guarding conditions
    pub fn data_reference(&self) -> DataReference {
        DataReference::fold(
            self.guards
                .iter()
                .map(|g| g.condition.data_reference())
                .chain(std::iter::once(self.resource.data_reference())),
        )
    }
}

/// One enclosing condition; `negated` for `ELSE` bodies
#[derive(Debug, Clone, Copy)]
pub struct Guard<'a> {
    pub condition: &'a Condition,
    pub negated: bool,
}

fn collect_resources<'a>(
    rule: &'a Rule,
    guards: &mut Vec<Guard<'a>>,
    out: &mut Vec<GuardedResource<'a>>,
) {
    for (body, negated) in std::iter::once((&rule.body, false))
        .chain(rule.else_body.as_ref().map(|b| (b, true)))
    {
        guards.push(Guard {
            condition: &rule.condition,
            negated,
        });
        for item in &body.items {
            match item {
                BodyItem::Resource(resource) => out.push(GuardedResource {
                    resource,
                    guards: guards.clone(),
                }),
                BodyItem::Rule(nested) => collect_resources(nested, guards, out),
            }
        }
        guards.pop();
    }
}

/// A value together with where it appeared
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spanned<T> {
    pub value: T,
    pub location: Location,
}

impl<T> Spanned<T> {
    pub fn new(value: T, location: Location) -> Self {
        Self { value, location }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaKind {
    Redcap,
    Db,
}

/// `SCHEMA: 'path' (REDCAP)`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDecl {
    pub path: String,
    pub kind: SchemaKind,
    pub location: Location,
}

/// `$NAME: 'system'`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alias {
    pub name: String,
    pub system: String,
    pub location: Location,
}

/// A condition plus the body applied when it holds
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub condition: Condition,
    pub body: Body,
    pub else_body: Option<Body>,
    pub location: Location,
}

impl Rule {
    /// Combined data reference of the condition and both bodies
    pub fn data_reference(&self) -> DataReference {
        DataReference::fold(
            [self.condition.data_reference(), self.body.data_reference()]
                .into_iter()
                .chain(self.else_body.as_ref().map(Body::data_reference)),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Body {
    pub items: Vec<BodyItem>,
}

impl Body {
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.items.iter().filter_map(|item| match item {
            BodyItem::Resource(r) => Some(r),
            BodyItem::Rule(_) => None,
        })
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.items.iter().filter_map(|item| match item {
            BodyItem::Rule(r) => Some(r),
            BodyItem::Resource(_) => None,
        })
    }

    pub fn data_reference(&self) -> DataReference {
        DataReference::fold(self.items.iter().map(BodyItem::data_reference))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BodyItem {
    Resource(Resource),
    Rule(Rule),
}

impl BodyItem {
    pub fn data_reference(&self) -> DataReference {
        match self {
            BodyItem::Resource(resource) => resource.data_reference(),
            BodyItem::Rule(rule) => rule.data_reference(),
        }
    }
}

/// A reference to a study field, with the location of the id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldRef {
    pub id: String,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Gt,
    Le,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            CompareOp::Eq => "=",
            CompareOp::Neq => "!=",
            CompareOp::Lt => "<",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    String(String),
    Number(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Condition {
    Bool {
        value: bool,
        location: Location,
    },
    Null(FieldRef),
    NotNull(FieldRef),
    Compare {
        field: FieldRef,
        op: CompareOp,
        literal: Literal,
        location: Location,
    },
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn data_reference(&self) -> DataReference {
        match self {
            Condition::Bool { .. } => DataReference::No,
            Condition::Null(_) | Condition::NotNull(_) | Condition::Compare { .. } => {
                DataReference::Yes
            }
            Condition::Not(inner) => inner.data_reference(),
            Condition::And(left, right) | Condition::Or(left, right) => {
                left.data_reference().combine(right.data_reference())
            }
        }
    }

    /// Field references in evaluation order
    pub fn fields(&self) -> Vec<&FieldRef> {
        match self {
            Condition::Bool { .. } => Vec::new(),
            Condition::Null(field) | Condition::NotNull(field) => vec![field],
            Condition::Compare { field, .. } => vec![field],
            Condition::Not(inner) => inner.fields(),
            Condition::And(left, right) | Condition::Or(left, right) => {
                let mut fields = left.fields();
                fields.extend(right.fields());
                fields
            }
        }
    }
}

/// `Type<id>: * attr = value, ...`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_type: String,
    pub id: String,
    pub id_location: Location,
    pub attributes: Vec<AttributeBinding>,
    pub location: Location,
}

impl Resource {
    pub fn data_reference(&self) -> DataReference {
        DataReference::fold(self.attributes.iter().map(|a| a.value.data_reference()))
    }

    /// `Type<id>`, the key other resources reference this one by
    pub fn key(&self) -> String {
        format!("{}<{}>", self.resource_type, self.id)
    }
}

/// Largest index an attribute path step may carry
pub const MAX_ATTRIBUTE_INDEX: usize = 1024;

/// One step of an attribute path, `name` or `name[index]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PathSegment {
    pub name: String,
    pub index: Option<usize>,
}

/// `* path = value`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeBinding {
    pub path: Vec<PathSegment>,
    pub value: Value,
    pub path_location: Location,
    pub value_location: Location,
}

impl AttributeBinding {
    /// Dotted path without indices, e.g. `identifier.type`
    pub fn path_string(&self) -> String {
        self.path
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// `Type<id>` inside a `REF(...)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_type: String,
    pub id: String,
    pub location: Location,
}

impl ResourceRef {
    pub fn key(&self) -> String {
        format!("{}<{}>", self.resource_type, self.id)
    }
}

/// Coding system of a concept literal, written as a url or an alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum SystemRef {
    Url(String),
    Alias(String),
}

impl fmt::Display for SystemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemRef::Url(url) => f.write_str(url),
            SystemRef::Alias(name) => f.write_str(name),
        }
    }
}

/// `system|code|'display'`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConceptLiteral {
    pub system: SystemRef,
    pub code: String,
    pub display: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FieldValueKind {
    Value,
    Concept,
    ConceptSelected,
    CodeSelected,
}

impl fmt::Display for FieldValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            FieldValueKind::Value => "VALUE",
            FieldValueKind::Concept => "CONCEPT",
            FieldValueKind::ConceptSelected => "CONCEPT_SELECTED",
            FieldValueKind::CodeSelected => "CODE_SELECTED",
        };
        f.write_str(keyword)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatePrecision {
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl FromStr for DatePrecision {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "YEAR" => Ok(DatePrecision::Year),
            "MONTH" => Ok(DatePrecision::Month),
            "DAY" => Ok(DatePrecision::Day),
            "HOUR" => Ok(DatePrecision::Hour),
            "MINUTE" => Ok(DatePrecision::Minute),
            "SECOND" => Ok(DatePrecision::Second),
            _ => Err(()),
        }
    }
}

/// A value read from a field of the current record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FieldValue {
    pub kind: FieldValueKind,
    pub field: FieldRef,
    pub precision: Option<DatePrecision>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Boolean(bool),
    String(String),
    Integer(i64),
    Decimal(f64),
    Reference(ResourceRef),
    Concept(ConceptLiteral),
    Code(String),
    Field(FieldValue),
}

impl Value {
    pub fn data_reference(&self) -> DataReference {
        match self {
            Value::Field(_) => DataReference::Yes,
            Value::Reference(_) => DataReference::Resource,
            Value::Boolean(_)
            | Value::String(_)
            | Value::Integer(_)
            | Value::Decimal(_)
            | Value::Concept(_)
            | Value::Code(_) => DataReference::No,
        }
    }
}

/// `field 'label'? -> system|code|'display'`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mapping {
    pub field: FieldRef,
    pub label: Option<String>,
    pub target: ConceptLiteral,
    pub location: Location,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(id: &str) -> FieldRef {
        FieldRef {
            id: id.to_string(),
            location: Location::default(),
        }
    }

    fn binding(value: Value) -> AttributeBinding {
        AttributeBinding {
            path: vec![PathSegment {
                name: "a".to_string(),
                index: None,
            }],
            value,
            path_location: Location::default(),
            value_location: Location::default(),
        }
    }

    fn resource(values: Vec<Value>) -> Resource {
        Resource {
            resource_type: "Patient".to_string(),
            id: "p".to_string(),
            id_location: Location::default(),
            attributes: values.into_iter().map(binding).collect(),
            location: Location::default(),
        }
    }

    #[test]
    fn test_combine_precedence() {
        use DataReference::*;
        assert_eq!(No.combine(No), No);
        assert_eq!(No.combine(Resource), Resource);
        assert_eq!(Resource.combine(Yes), Yes);
        assert_eq!(Yes.combine(No), Yes);
    }

    #[test]
    fn test_condition_fold() {
        let static_cond = Condition::And(
            Box::new(Condition::Bool {
                value: true,
                location: Location::default(),
            }),
            Box::new(Condition::Not(Box::new(Condition::Bool {
                value: false,
                location: Location::default(),
            }))),
        );
        assert_eq!(static_cond.data_reference(), DataReference::No);

        let data_cond = Condition::Or(
            Box::new(static_cond),
            Box::new(Condition::NotNull(field("dob"))),
        );
        assert_eq!(data_cond.data_reference(), DataReference::Yes);
        assert_eq!(data_cond.fields().len(), 1);
    }

    #[test]
    fn test_resource_fold() {
        let literal = resource(vec![Value::Boolean(true), Value::String("x".into())]);
        assert_eq!(literal.data_reference(), DataReference::No);

        let referencing = resource(vec![Value::Reference(ResourceRef {
            resource_type: "Patient".into(),
            id: "q".into(),
            location: Location::default(),
        })]);
        assert_eq!(referencing.data_reference(), DataReference::Resource);

        let reading = resource(vec![Value::Field(FieldValue {
            kind: FieldValueKind::Value,
            field: field("dob"),
            precision: None,
        })]);
        assert_eq!(reading.data_reference(), DataReference::Yes);
    }

    #[test]
    fn test_guards_include_else_branch() {
        let rule = Rule {
            condition: Condition::Null(field("dob")),
            body: Body {
                items: vec![BodyItem::Resource(resource(vec![]))],
            },
            else_body: Some(Body {
                items: vec![BodyItem::Resource(resource(vec![]))],
            }),
            location: Location::default(),
        };
        let document = Document {
            rules: vec![rule],
            ..Default::default()
        };
        let resources = document.resources();
        assert_eq!(resources.len(), 2);
        assert!(!resources[0].guards[0].negated);
        assert!(resources[1].guards[0].negated);
        assert_eq!(resources[1].data_reference(), DataReference::Yes);
    }

    fn static_rule(body: Body, else_body: Option<Body>) -> Rule {
        Rule {
            condition: Condition::Bool {
                value: true,
                location: Location::default(),
            },
            body,
            else_body,
            location: Location::default(),
        }
    }

    fn reading_body() -> Body {
        Body {
            items: vec![BodyItem::Resource(resource(vec![Value::Field(FieldValue {
                kind: FieldValueKind::Value,
                field: field("dob"),
                precision: None,
            })]))],
        }
    }

    #[test]
    fn test_rule_fold_includes_body() {
        let rule = static_rule(reading_body(), None);
        assert_eq!(rule.condition.data_reference(), DataReference::No);
        assert_eq!(rule.data_reference(), DataReference::Yes);

        let literal = static_rule(
            Body {
                items: vec![BodyItem::Resource(resource(vec![Value::Boolean(true)]))],
            },
            None,
        );
        assert_eq!(literal.data_reference(), DataReference::No);
    }

    #[test]
    fn test_rule_fold_includes_else_body() {
        let rule = static_rule(Body::default(), Some(reading_body()));
        assert_eq!(rule.body.data_reference(), DataReference::No);
        assert_eq!(rule.data_reference(), DataReference::Yes);
    }

    #[test]
    fn test_document_fold_reaches_nested_rules() {
        let inner = static_rule(reading_body(), None);
        let outer = static_rule(
            Body {
                items: vec![BodyItem::Rule(inner)],
            },
            None,
        );
        assert_eq!(BodyItem::Rule(outer.clone()).data_reference(), DataReference::Yes);
        let document = Document {
            rules: vec![static_rule(Body::default(), None), outer],
            ..Default::default()
        };
        assert_eq!(document.data_reference(), DataReference::Yes);
        assert_eq!(Document::default().data_reference(), DataReference::No);
    }

    #[test]
    fn test_date_precision_is_case_insensitive() {
        assert_eq!("year".parse::<DatePrecision>(), Ok(DatePrecision::Year));
        assert_eq!("Minute".parse::<DatePrecision>(), Ok(DatePrecision::Minute));
        assert!("WEEK".parse::<DatePrecision>().is_err());
    }

    #[test]
    fn test_resolve_system_through_alias() {
        let document = Document {
            aliases: vec![Alias {
                name: "$SCT".to_string(),
                system: "http://snomed.info/sct".to_string(),
                location: Location::default(),
            }],
            ..Default::default()
        };
        assert_eq!(
            document.resolve_system(&SystemRef::Alias("$SCT".into())),
            Some("http://snomed.info/sct")
        );
        assert_eq!(document.resolve_system(&SystemRef::Alias("$LNC".into())), None);
    }
}
