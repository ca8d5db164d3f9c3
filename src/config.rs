use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_EXPLORER_BINARY: &str = "/opt/container-explorer/bin/ce";
pub const DEFAULT_EXCLUDED_NAMESPACE: &str = "kube-system";

/// Runtime settings for a forensic task.
///
/// Every field has a default, so a config file only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Container Explorer binary used to read the containerd metadata store.
    pub explorer_binary: PathBuf,
    pub explorer_timeout_secs: u64,
    /// Directory under which private disk mount points are created.
    pub mount_base: PathBuf,
    /// Attempts made when no loop/NBD device is free.
    pub attach_attempts: u32,
    pub attach_retry_delay_ms: u64,
    /// Extra space added to exported disk images, as a fraction of the content size.
    pub image_slack_ratio: f64,
    pub image_min_slack_bytes: u64,
    pub excluded_namespaces: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            explorer_binary: PathBuf::from(DEFAULT_EXPLORER_BINARY),
            explorer_timeout_secs: 60,
            mount_base: std::env::temp_dir(),
            attach_attempts: 5,
            attach_retry_delay_ms: 2000,
            image_slack_ratio: 0.25,
            image_min_slack_bytes: 16 * 1024 * 1024,
            excluded_namespaces: vec![DEFAULT_EXCLUDED_NAMESPACE.to_string()],
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn explorer_timeout(&self) -> Duration {
        Duration::from_secs(self.explorer_timeout_secs)
    }

    pub fn attach_retry_delay(&self) -> Duration {
        Duration::from_millis(self.attach_retry_delay_ms)
    }
}
