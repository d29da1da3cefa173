pub mod pool;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One unit of work handed to a protocol plugin on stdin.
///
/// `credentials` is the decrypted, protocol-specific JSON object. The
/// optional correlation ids are echoed back by the plugin: `device_id` for
/// polling, `target` alone is enough for discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginTask {
    pub target: String,
    pub port: i32,
    pub credentials: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// One result read back from a plugin's stdout. The stdout array is
/// authoritative; the process exit code is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub target: String,
    pub port: i32,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Discovery mode only.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Polling mode only.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub device_id: Option<i64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// CLI flag switching a plugin binary into discovery mode.
pub const DISCOVERY_FLAG: &str = "-discovery";

/// Locates the plugin binary for a protocol tag. The layout is either a
/// flat file `<dir>/<protocol>` or a nested `<dir>/<protocol>/<protocol>`;
/// whichever exists and is executable wins.
pub fn resolve_plugin_binary(plugin_dir: &Path, protocol: &str) -> Option<PathBuf> {
    let flat = plugin_dir.join(protocol);
    let nested = plugin_dir.join(protocol).join(protocol);
    [flat, nested].into_iter().find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
