//! Configuration types

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RedmatchError;

/// Seconds before a terminology request is abandoned
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedmatchConfig {
    #[serde(default)]
    pub terminology: TerminologyConfiguration,

    #[serde(default)]
    pub transform: TransformConfiguration,

    #[serde(default)]
    pub schema: SchemaConfiguration,
}

/// Terminology server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TerminologyConfiguration {
    /// Base url of a FHIR terminology server; no validation when unset
    pub url: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for TerminologyConfiguration {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl TerminologyConfiguration {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Transformation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransformConfiguration {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl Default for TransformConfiguration {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            parallel: true,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_parallel() -> bool {
    true
}

/// Schema settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaConfiguration {
    /// Schema export used when a command is not given one
    pub path: Option<PathBuf>,
}

impl RedmatchConfig {
    /// Parse a config file, choosing the format by extension
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| RedmatchError::io_error(path, e))?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> crate::Result<Self> {
        let fail = |message: String| {
            RedmatchError::config_error(format!(
                "Failed to load config from '{}': {message}",
                path.display()
            ))
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(content).map_err(|e| fail(e.to_string()))
            }
            Some("json") => serde_json::from_str(content).map_err(|e| fail(e.to_string())),
            Some("toml") => toml::from_str(content).map_err(|e| fail(e.to_string())),
            _ => Err(fail(
                "unsupported file extension (expected .json, .toml, .yaml or .yml)".to_string(),
            )),
        }
    }

    /// Render in the format implied by `path`
    pub fn render(&self, path: &Path) -> crate::Result<String> {
        let fail = |e: String| RedmatchError::config_error(format!("Failed to render config: {e}"));
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self).map_err(|e| fail(e.to_string())),
            Some("toml") => toml::to_string_pretty(self).map_err(|e| fail(e.to_string())),
            _ => serde_json::to_string_pretty(self).map_err(|e| fail(e.to_string())),
        }
    }
}
