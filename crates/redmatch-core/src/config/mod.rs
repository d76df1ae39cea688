//! Configuration for the `redmatch` tools
//!
//! Configuration is optional. When no file is given, the loader walks up
//! from the working directory looking for one of
//! [`CONFIG_FILE_NAMES`](loader::CONFIG_FILE_NAMES) and falls back to
//! defaults.
//!
//! ## Example Configuration
//!
//! ```yaml
//! terminology:
//!   url: https://tx.ontoserver.csiro.au/fhir
//!   timeoutSecs: 30
//! transform:
//!   outputDir: output
//!   parallel: true
//! schema:
//!   path: study-dictionary.json
//! ```

mod loader;
mod redmatch_config;

pub use loader::{CONFIG_FILE_NAMES, ConfigLoader};
pub use redmatch_config::{
    DEFAULT_TIMEOUT_SECS, RedmatchConfig, SchemaConfiguration, TerminologyConfiguration,
    TransformConfiguration,
};
