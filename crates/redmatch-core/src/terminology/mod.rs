//! Terminology validation
//!
//! The resolver and executor only see the two-operation
//! [`TerminologyValidator`] capability. [`InMemoryTerminology`] serves
//! code systems loaded up front; [`FhirTerminologyClient`] asks a FHIR
//! terminology server.
//!
//! Attribute paths of a target package are validated the same way as codes:
//! the package is exposed as the code system `redmatch-<package>` whose codes
//! are paths such as `Observation.code.coding` with `min`, `max` and `type`
//! properties.

mod http;
mod memory;

pub use http::FhirTerminologyClient;
pub use memory::{CodeSystem, Concept, InMemoryTerminology};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TerminologyError;

/// Property codes carrying attribute facts
pub const PROPERTY_MIN: &str = "min";
pub const PROPERTY_MAX: &str = "max";
pub const PROPERTY_TYPE: &str = "type";

/// Code system serving the attribute paths of a FHIR package
pub fn package_system(package: &str) -> String {
    format!("redmatch-{}", package.replace('#', "-"))
}

#[async_trait]
pub trait TerminologyValidator: Send + Sync {
    /// Whether `code` (or one of its designations) is a concept of `system`.
    /// Fails with `Unsupported` when `system` is not served.
    async fn validate_code(&self, system: &str, code: &str) -> Result<bool, TerminologyError>;

    /// Properties of `code` restricted to `properties`. Fails with
    /// `Unsupported` for an unserved system and `NotFound` for an unknown code.
    async fn lookup(
        &self,
        system: &str,
        code: &str,
        properties: &[&str],
    ) -> Result<Vec<Property>, TerminologyError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PropertyValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Code(String),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) | PropertyValue::Code(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub code: String,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(code: impl Into<String>, value: PropertyValue) -> Self {
        Self {
            code: code.into(),
            value,
        }
    }
}

/// Upper cardinality bound of an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MaxCardinality {
    Bounded(u32),
    Unbounded,
}

/// What a target package says about one attribute path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttributeFacts {
    pub min: Option<u32>,
    pub max: Option<MaxCardinality>,
    pub type_code: Option<String>,
}

impl AttributeFacts {
    pub fn from_properties(properties: &[Property]) -> Self {
        let mut facts = AttributeFacts::default();
        for property in properties {
            match (property.code.as_str(), &property.value) {
                (PROPERTY_MIN, PropertyValue::Integer(n)) => facts.min = u32::try_from(*n).ok(),
                (PROPERTY_MIN, value) => {
                    facts.min = value.as_str().and_then(|s| s.parse().ok());
                }
                (PROPERTY_MAX, PropertyValue::Integer(n)) => {
                    facts.max = u32::try_from(*n).ok().map(MaxCardinality::Bounded);
                }
                (PROPERTY_MAX, value) => {
                    facts.max = match value.as_str() {
                        Some("*") => Some(MaxCardinality::Unbounded),
                        Some(s) => s.parse().ok().map(MaxCardinality::Bounded),
                        None => None,
                    };
                }
                (PROPERTY_TYPE, value) => facts.type_code = value.as_str().map(str::to_string),
                _ => {}
            }
        }
        facts
    }

    pub fn is_forbidden(&self) -> bool {
        self.max == Some(MaxCardinality::Bounded(0))
    }

    /// True when `index` is beyond the maximum cardinality
    pub fn index_out_of_bounds(&self, index: usize) -> bool {
        match self.max {
            Some(MaxCardinality::Bounded(max)) => index >= max as usize,
            _ => false,
        }
    }

    pub fn is_list(&self) -> bool {
        match self.max {
            Some(MaxCardinality::Unbounded) => true,
            Some(MaxCardinality::Bounded(max)) => max > 1,
            None => false,
        }
    }
}
