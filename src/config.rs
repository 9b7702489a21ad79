//! Session configuration.
//!
//! Settings come from an optional `kiln.yaml` and are overridden by command
//! line flags. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{config_error, io_error, KilnError};

/// File looked up by [`SessionConfig::discover`].
pub const CONFIG_FILE: &str = "kiln.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Where unit artifacts and descriptors are written. Nothing is written
    /// when unset.
    pub destination: Option<PathBuf>,
    /// Directories searched for descriptors and units of earlier sessions.
    pub classpath: Vec<PathBuf>,
    /// Package prefix of generated extension units.
    pub package: String,
    /// Type that owns top-level script code.
    pub script_type: String,
    /// Log the text of every synthesized extension unit.
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            destination: None,
            classpath: Vec::new(),
            package: "kiln.macros".to_string(),
            script_type: "Script".to_string(),
            verbose: false,
        }
    }
}

impl SessionConfig {
    pub fn load(path: &Path) -> Result<Self, KilnError> {
        let text = std::fs::read_to_string(path).map_err(|e| io_error(path, &e))?;
        Self::from_yaml(&text).map_err(|e| e.with_help(format!("in {}", path.display())))
    }

    pub fn from_yaml(text: &str) -> Result<Self, KilnError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text).map_err(|e| config_error(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `kiln.yaml` from `dir` if present.
    pub fn discover(dir: &Path) -> Result<Option<Self>, KilnError> {
        let path = dir.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Self::load(&path).map(Some)
    }

    fn validate(&self) -> Result<(), KilnError> {
        let is_identifier = |s: &str| {
            s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !self.package.split('.').all(is_identifier) {
            return Err(config_error(format!("invalid package name '{}'", self.package)));
        }
        if !is_identifier(&self.script_type) {
            return Err(config_error(format!(
                "invalid script type name '{}'",
                self.script_type
            )));
        }
        Ok(())
    }
}
