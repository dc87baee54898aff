use std::path::Path;

use serde::Deserialize;

/// On-disk overrides read from `.mcp-server-config.json` in the workspace
/// root. Every field is optional; a missing file is treated the same as an
/// empty one.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub interpreter: Option<String>,
    pub scanner_cmd: Option<Vec<String>>,
    pub patcher_cmd: Option<Vec<String>>,
    pub scan_timeout_s: Option<u64>,
    pub fix_timeout_s: Option<u64>,
    pub max_concurrent_subprocesses: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }
}
