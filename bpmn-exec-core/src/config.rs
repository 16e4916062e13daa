//! Engine configuration.
//!
//! ```yaml
//! unhandled_error: end_silently
//! max_operations: 5000
//! fail_on_stuck_execution: true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What happens to a declarative BPMN error (error end event) that no
/// enclosing scope catches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledErrorPolicy {
    /// Fail the trigger with `EngineError::UnhandledError`.
    Fail,
    /// End the throwing execution like a none end event.
    EndSilently,
}

fn default_max_operations() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Required; there is no default policy.
    pub unhandled_error: UnhandledErrorPolicy,
    /// Upper bound on atomic operations while processing one trigger.
    #[serde(default = "default_max_operations")]
    pub max_operations: usize,
    /// Fail instead of silently ending when a non-end activity has no
    /// outgoing flow.
    #[serde(default)]
    pub fail_on_stuck_execution: bool,
}

impl EngineConfig {
    pub fn new(unhandled_error: UnhandledErrorPolicy) -> Self {
        Self {
            unhandled_error,
            max_operations: default_max_operations(),
            fail_on_stuck_execution: false,
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing engine config")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse engine config {}", path.display()))
    }
}
