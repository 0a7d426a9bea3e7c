//! Configuration file parsing.
//!
//! The config file is JSON and optional; without one the built-in issues are
//! used. Precedence for the known-issue catalog:
//! - no `known_issues` key: built-in issues only
//! - `known_issues` given: those issues replace the built-ins
//! - `known_issues` given with `extend_defaults: true`: built-ins first, then
//!   the configured issues

use crate::catalog::{default_issues, CatalogError, IssueCatalog};
use crate::types::Issue;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Highest config schema version this build understands.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("unsupported config version {found} (max supported: {max})", max = CURRENT_VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("invalid known issue: {0}")]
    Catalog(#[from] CatalogError),
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    /// Configured issues; `None` means "use the built-ins".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_issues: Option<Vec<Issue>>,
    /// Append `known_issues` after the built-ins instead of replacing them.
    pub extend_defaults: bool,
    /// Gradle Enterprise server that build scan links must point at.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradle_enterprise_server: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            known_issues: None,
            extend_defaults: false,
            gradle_enterprise_server: None,
        }
    }
}

impl Config {
    /// Load config from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Load from an optional file, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    /// Parse config content and validate it.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the version and that every issue compiles.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.version > CURRENT_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
            });
        }
        self.catalog()?;
        Ok(())
    }

    /// Issues in priority order after applying the merge policy.
    pub fn resolved_issues(&self) -> Vec<Issue> {
        match &self.known_issues {
            None => default_issues(),
            Some(configured) if self.extend_defaults => {
                let mut issues = default_issues();
                issues.extend(configured.iter().cloned());
                issues
            }
            Some(configured) => configured.clone(),
        }
    }

    /// Build the issue catalog for this config.
    pub fn catalog(&self) -> Result<IssueCatalog, ConfigError> {
        Ok(IssueCatalog::new(self.resolved_issues())?)
    }
}
