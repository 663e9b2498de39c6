//! Coverage run configuration
//!
//! Loaded from TOML. Every field has a default so a partial file is valid.

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Include/exclude wildcard patterns for modules and source files
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Modules to cover. Empty means every module.
    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(default)]
    pub excluded_modules: Vec<String>,

    /// Source files to cover. Empty means every file.
    #[serde(default)]
    pub sources: Vec<String>,

    #[serde(default)]
    pub excluded_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageConfig {
    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    /// Debug child processes as well
    #[serde(default)]
    pub cover_children: bool,

    /// Tolerate unhandled C++ exceptions in the target
    #[serde(default)]
    pub continue_after_cpp_exception: bool,

    /// Write the coverage tree as JSON to this path
    #[serde(default)]
    pub export_json: Option<PathBuf>,
}

impl CoverageConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoverageConfig::default();
        assert!(!config.cover_children);
        assert!(!config.continue_after_cpp_exception);
        assert!(config.filter.modules.is_empty());
        assert!(config.export_json.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            cover_children = true
            export_json = "out/coverage.json"

            [logging]
            level = "debug"

            [filter]
            modules = ["*\\app.exe"]
            excluded_sources = ["*\\third_party\\*"]
        "#;
        let config = CoverageConfig::from_toml(toml).unwrap();
        assert!(config.cover_children);
        assert!(!config.continue_after_cpp_exception);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.filter.modules, vec!["*\\app.exe".to_string()]);
        assert_eq!(config.filter.excluded_sources.len(), 1);
        assert_eq!(
            config.export_json,
            Some(PathBuf::from("out/coverage.json"))
        );
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        let err = CoverageConfig::from_toml("cover_children = \"yes\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = CoverageConfig::from_file("does/not/exist.toml").unwrap_err();
        assert!(err.to_string().contains("exist.toml"));
    }
}
