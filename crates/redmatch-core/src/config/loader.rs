//! Configuration file discovery and loading

use std::path::{Path, PathBuf};

use super::redmatch_config::RedmatchConfig;
use crate::error::RedmatchError;

/// Config file names in priority order
pub const CONFIG_FILE_NAMES: &[&str] = &[
    ".redmatchrc.json",
    ".redmatchrc.toml",
    "redmatch.yaml",
    "redmatch.yml",
    "redmatch.json",
];

/// Configuration loader for discovering and loading config files
pub struct ConfigLoader;

impl ConfigLoader {
    /// Auto-discover config file by traversing upward from start_path
    ///
    /// Each directory is searched for [`CONFIG_FILE_NAMES`] in order, moving
    /// up until a config is found or the filesystem root is reached.
    pub fn auto_discover(start_path: &Path) -> crate::Result<Option<PathBuf>> {
        let mut current = start_path
            .canonicalize()
            .map_err(|e| RedmatchError::config_error(format!("Invalid path: {e}")))?;

        loop {
            for filename in CONFIG_FILE_NAMES {
                let config_path = current.join(filename);
                if config_path.is_file() {
                    tracing::debug!("Found config: {}", config_path.display());
                    return Ok(Some(config_path));
                }
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }

        Ok(None)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> crate::Result<RedmatchConfig> {
        RedmatchConfig::load(path).map_err(|e| match e {
            RedmatchError::IoError { source, .. } => RedmatchError::config_error(format!(
                "Failed to read config '{}': {source}",
                path.display()
            )),
            other => other,
        })
    }

    /// Load config from path or auto-discover
    ///
    /// An explicit path must exist. Without one, the nearest config above
    /// `start_dir` (or the current directory) is used, and defaults apply
    /// when there is none.
    pub fn load(
        custom_path: Option<&Path>,
        start_dir: Option<&Path>,
    ) -> crate::Result<RedmatchConfig> {
        if let Some(path) = custom_path {
            if !path.exists() {
                return Err(RedmatchError::config_error(format!(
                    "Config file not found: {}. Run 'redmatch config init' to create one.",
                    path.display()
                )));
            }
            return Self::load_from_file(path);
        }

        let search_dir = start_dir.unwrap_or_else(|| Path::new("."));
        match Self::auto_discover(search_dir)? {
            Some(path) => Self::load_from_file(&path),
            None => {
                tracing::debug!("No config file found, using defaults");
                Ok(RedmatchConfig::default())
            }
        }
    }
}
