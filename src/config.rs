//! Configuration for Lua script protection

use crate::{ProtectError, ProtectResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for Lua script protection
///
/// Only the driver is configurable. Cipher strength, decoy count, and
/// dead-code density are fixed by the pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectConfig {
    /// Files/patterns to exclude from protection
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Run the block-balance check on every generated program
    #[serde(default)]
    pub check_balance: bool,

    /// Emit the banner comment at the top of each program
    #[serde(default = "default_header")]
    pub header: bool,
}

fn default_exclude() -> Vec<String> {
    vec![
        "**/spec/**".to_string(),
        "**/*_spec.lua".to_string(),
        "**/test_*.lua".to_string(),
        "**/*.min.lua".to_string(),
    ]
}

fn default_header() -> bool {
    true
}

impl Default for ProtectConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
            check_balance: false,
            header: default_header(),
        }
    }
}

impl ProtectConfig {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(json: &str) -> ProtectResult<Self> {
        serde_json::from_str(json).map_err(|e| ProtectError::Config(e.to_string()))
    }

    /// Load a JSON config file
    pub fn from_file(path: &Path) -> ProtectResult<Self> {
        if !path.exists() {
            return Err(ProtectError::FileNotFound(path.display().to_string()));
        }
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Add exclude pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Drop every exclude pattern, including the defaults
    pub fn clear_exclude(mut self) -> Self {
        self.exclude.clear();
        self
    }

    /// Enable or disable the post-generation balance check
    pub fn check_balance(mut self, check: bool) -> Self {
        self.check_balance = check;
        self
    }

    /// Enable or disable the banner comment
    pub fn header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }
}
