//! Terminology served from code systems held in memory

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Property, PropertyValue, TerminologyValidator};
use crate::error::{RedmatchError, TerminologyError};

/// A code system in the shape of a FHIR `CodeSystem` resource
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeSystem {
    pub url: String,
    #[serde(default, rename = "concept")]
    pub concepts: Vec<Concept>,
}

impl CodeSystem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            concepts: Vec::new(),
        }
    }

    pub fn with_concept(mut self, concept: Concept) -> Self {
        self.concepts.push(concept);
        self
    }

    fn find(&self, code: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.code == code)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Concept {
    pub code: String,
    #[serde(default)]
    pub display: Option<String>,
    #[serde(default, rename = "designation")]
    pub designations: Vec<Designation>,
    #[serde(default, rename = "property")]
    pub properties: Vec<ConceptProperty>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Designation {
    pub value: String,
}

/// A concept property as written in a `CodeSystem` (`valueX` fields)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptProperty {
    pub code: String,
    #[serde(default)]
    pub value_string: Option<String>,
    #[serde(default)]
    pub value_integer: Option<i64>,
    #[serde(default)]
    pub value_boolean: Option<bool>,
    #[serde(default)]
    pub value_code: Option<String>,
}

impl ConceptProperty {
    fn to_property(&self) -> Option<Property> {
        let value = if let Some(s) = &self.value_string {
            PropertyValue::String(s.clone())
        } else if let Some(n) = self.value_integer {
            PropertyValue::Integer(n)
        } else if let Some(b) = self.value_boolean {
            PropertyValue::Boolean(b)
        } else {
            PropertyValue::Code(self.value_code.clone()?)
        };
        Some(Property::new(self.code.clone(), value))
    }
}

impl Concept {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_designation(mut self, value: impl Into<String>) -> Self {
        self.designations.push(Designation {
            value: value.into(),
        });
        self
    }

    pub fn with_property(mut self, code: impl Into<String>, value: PropertyValue) -> Self {
        let mut property = ConceptProperty {
            code: code.into(),
            ..Default::default()
        };
        match value {
            PropertyValue::String(s) => property.value_string = Some(s),
            PropertyValue::Integer(n) => property.value_integer = Some(n),
            PropertyValue::Boolean(b) => property.value_boolean = Some(b),
            PropertyValue::Code(c) => property.value_code = Some(c),
        }
        self.properties.push(property);
        self
    }

    fn matches(&self, code: &str) -> bool {
        self.code == code
            || self.designations.iter().any(|d| d.value == code)
    }
}

/// Deterministic validator over a fixed set of code systems
#[derive(Debug, Clone, Default)]
pub struct InMemoryTerminology {
    systems: HashMap<String, CodeSystem>,
}

impl InMemoryTerminology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code_system(mut self, code_system: CodeSystem) -> Self {
        self.add_code_system(code_system);
        self
    }

    pub fn add_code_system(&mut self, code_system: CodeSystem) {
        debug!(
            "Loaded code system {} with {} concepts",
            code_system.url,
            code_system.concepts.len()
        );
        self.systems.insert(code_system.url.clone(), code_system);
    }

    /// Load a JSON array of code systems (or a single one)
    pub fn from_json(source: &str) -> crate::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(source).map_err(|e| {
            RedmatchError::config_error(format!("Invalid code system JSON: {e}"))
        })?;
        let systems: Vec<CodeSystem> = if value.is_array() {
            serde_json::from_value(value)
        } else {
            serde_json::from_value(value).map(|cs| vec![cs])
        }
        .map_err(|e| RedmatchError::config_error(format!("Invalid code system JSON: {e}")))?;

        let mut terminology = Self::new();
        for system in systems {
            terminology.add_code_system(system);
        }
        Ok(terminology)
    }

    pub fn supports(&self, system: &str) -> bool {
        self.systems.contains_key(system)
    }

    fn system(&self, system: &str) -> Result<&CodeSystem, TerminologyError> {
        self.systems
            .get(system)
            .ok_or_else(|| TerminologyError::Unsupported {
                system: system.to_string(),
            })
    }
}

#[async_trait]
impl TerminologyValidator for InMemoryTerminology {
    async fn validate_code(&self, system: &str, code: &str) -> Result<bool, TerminologyError> {
        let code_system = self.system(system)?;
        Ok(code_system.concepts.iter().any(|c| c.matches(code)))
    }

    async fn lookup(
        &self,
        system: &str,
        code: &str,
        properties: &[&str],
    ) -> Result<Vec<Property>, TerminologyError> {
        let concept = self
            .system(system)?
            .find(code)
            .ok_or_else(|| TerminologyError::NotFound {
                system: system.to_string(),
                code: code.to_string(),
            })?;
        Ok(concept
            .properties
            .iter()
            .filter(|p| properties.contains(&p.code.as_str()))
            .filter_map(ConceptProperty::to_property)
            .collect())
    }
}
