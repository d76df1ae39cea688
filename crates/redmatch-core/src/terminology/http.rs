//! Client for a FHIR terminology server (`$validate-code` and `$lookup`)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{Property, PropertyValue, TerminologyValidator};
use crate::error::{RedmatchError, TerminologyError};

/// FHIR `Parameters` resource, only the parts we read
#[derive(Debug, Default, Deserialize)]
struct Parameters {
    #[serde(default)]
    parameter: Vec<Parameter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Parameter {
    name: String,
    value_boolean: Option<bool>,
    value_string: Option<String>,
    value_code: Option<String>,
    value_integer: Option<i64>,
    #[serde(default)]
    part: Vec<Parameter>,
}

impl Parameter {
    fn value(&self) -> Option<PropertyValue> {
        if let Some(b) = self.value_boolean {
            Some(PropertyValue::Boolean(b))
        } else if let Some(n) = self.value_integer {
            Some(PropertyValue::Integer(n))
        } else if let Some(c) = &self.value_code {
            Some(PropertyValue::Code(c.clone()))
        } else {
            self.value_string.clone().map(PropertyValue::String)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OperationOutcome {
    #[serde(default)]
    issue: Vec<Issue>,
}

#[derive(Debug, Default, Deserialize)]
struct Issue {
    #[serde(default)]
    code: String,
}

/// Networked [`TerminologyValidator`]
#[derive(Debug, Clone)]
pub struct FhirTerminologyClient {
    client: reqwest::Client,
    base_url: String,
}

impl FhirTerminologyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                RedmatchError::config_error(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn operation_url(&self, operation: &str) -> String {
        format!("{}/CodeSystem/{}", self.base_url, operation)
    }

    async fn get(
        &self,
        operation: &str,
        query: &[(&str, &str)],
    ) -> Result<(StatusCode, String), TerminologyError> {
        let url = self.operation_url(operation);
        trace!("GET {} {:?}", url, query);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/fhir+json")
            .query(query)
            .send()
            .await
            .map_err(unavailable)?;
        let status = response.status();
        let body = response.text().await.map_err(unavailable)?;
        Ok((status, body))
    }
}

fn unavailable(err: reqwest::Error) -> TerminologyError {
    TerminologyError::Unavailable {
        message: err.to_string(),
    }
}

fn issue_codes(body: &str) -> Vec<String> {
    serde_json::from_str::<OperationOutcome>(body)
        .map(|o| o.issue.into_iter().map(|i| i.code).collect())
        .unwrap_or_default()
}

fn parse_parameters(body: &str) -> Result<Parameters, TerminologyError> {
    serde_json::from_str(body).map_err(|e| TerminologyError::Unavailable {
        message: format!("Invalid Parameters response: {e}"),
    })
}

#[async_trait]
impl TerminologyValidator for FhirTerminologyClient {
    async fn validate_code(&self, system: &str, code: &str) -> Result<bool, TerminologyError> {
        let (status, body) = self
            .get("$validate-code", &[("url", system), ("code", code)])
            .await?;

        if status == StatusCode::NOT_FOUND || issue_codes(&body).iter().any(|c| c == "not-supported")
        {
            return Err(TerminologyError::Unsupported {
                system: system.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TerminologyError::Unavailable {
                message: format!("$validate-code returned {status}"),
            });
        }

        let parameters = parse_parameters(&body)?;
        let result = parameters
            .parameter
            .iter()
            .find(|p| p.name == "result")
            .and_then(|p| p.value_boolean)
            .unwrap_or(false);
        debug!("{}|{} valid: {}", system, code, result);
        Ok(result)
    }

    async fn lookup(
        &self,
        system: &str,
        code: &str,
        properties: &[&str],
    ) -> Result<Vec<Property>, TerminologyError> {
        let mut query = vec![("system", system), ("code", code)];
        query.extend(properties.iter().map(|p| ("property", *p)));
        let (status, body) = self.get("$lookup", &query).await?;

        if !status.is_success() {
            let issues = issue_codes(&body);
            if issues.iter().any(|c| c == "not-supported") {
                return Err(TerminologyError::Unsupported {
                    system: system.to_string(),
                });
            }
            if status == StatusCode::NOT_FOUND
                || issues.iter().any(|c| c == "not-found" || c == "code-invalid")
            {
                return Err(TerminologyError::NotFound {
                    system: system.to_string(),
                    code: code.to_string(),
                });
            }
            return Err(TerminologyError::Unavailable {
                message: format!("$lookup returned {status}"),
            });
        }

        let parameters = parse_parameters(&body)?;
        Ok(parameters
            .parameter
            .iter()
            .filter(|p| p.name == "property")
            .filter_map(|p| {
                let code = p.part.iter().find(|part| part.name == "code")?;
                let code = code.value_code.clone().or_else(|| code.value_string.clone())?;
                if !properties.contains(&code.as_str()) {
                    return None;
                }
                let value = p.part.iter().find(|part| part.name == "value")?.value()?;
                Some(Property::new(code, value))
            })
            .collect())
    }
}
