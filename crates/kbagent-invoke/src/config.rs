//! Invoker configuration.

use crate::keynodes::ProtocolIdtfs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerConfig {
    /// Deadline for kinds the catalog does not cover
    pub default_timeout_ms: u64,
    /// Names of the protocol markers on the server
    pub protocol: ProtocolIdtfs,
    /// Check arguments against the catalog before writing
    pub validate_catalog: bool,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            protocol: ProtocolIdtfs::default(),
            validate_catalog: true,
        }
    }
}

impl InvokerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read invoker config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse invoker config {}", path.display()))?;
        anyhow::ensure!(
            config.default_timeout_ms > 0,
            "default_timeout_ms must be positive"
        );
        Ok(config)
    }
}
