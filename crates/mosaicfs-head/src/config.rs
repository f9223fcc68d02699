use serde::{Deserialize, Serialize};
use std::path::Path;

/// Head service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsConfig {
    /// Delete attempts per chunk when reverting a failed upload.
    pub compensation_attempts: u32,
    /// Delay between those attempts.
    pub compensation_delay_ms: u64,
}

impl Default for DfsConfig {
    fn default() -> Self {
        Self {
            compensation_attempts: 5,
            compensation_delay_ms: 200,
        }
    }
}

impl DfsConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }
}
