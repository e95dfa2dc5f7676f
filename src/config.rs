// src/config.rs

//! Engine configuration
//!
//! Read from `<root>/var/pkg/engine.toml` (or `$IMAGEPKG_CONFIG`). Every key is
//! optional; a missing file means all defaults.
//!
//! ```toml
//! [solver]
//! max_steps = 200000
//! optimize = true
//! trace_depth = 64
//!
//! [plan]
//! fingerprint = "sha256"
//! parallel = true
//!
//! [catalog]
//! parallel = true
//!
//! [image]
//! lock_retries = 0
//! ```

use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::Config(e.to_string())
    }
}

/// Solver search limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Search steps before giving up (deterministic, unlike a timeout)
    pub max_steps: u64,
    /// Keep searching after the first solution for one with fewer changes
    pub optimize: bool,
    /// Longest chain retained for unsatisfiable explanations
    pub trace_depth: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_steps: 200_000,
            optimize: true,
            trace_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub fingerprint: HashAlgorithm,
    /// Fingerprint actions on the rayon pool
    pub parallel: bool,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            fingerprint: HashAlgorithm::Sha256,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Decode feeds on the rayon pool
    pub parallel: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self { parallel: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Extra attempts at the image lock before reporting contention
    pub lock_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub solver: SolverConfig,
    pub plan: PlanConfig,
    pub catalog: CatalogConfig,
    pub image: ImageSettings,
}

impl EngineConfig {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.solver.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "solver.max_steps must be positive".to_string(),
            ));
        }
        if self.solver.trace_depth == 0 {
            return Err(ConfigError::ValidationError(
                "solver.trace_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
