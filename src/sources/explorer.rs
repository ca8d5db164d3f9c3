//! Structured containerd metadata from the Container Explorer tool.
//!
//! containerd keeps container and snapshot records in a BoltDB store. Rather than
//! parse it, discovery consumes the JSON that Container Explorer emits for
//! `list containers` and `list snapshots` through [`MetadataExtractor`].

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;

/// One container as reported by `list containers`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExplorerContainer {
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub container_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub snapshot_key: String,
    #[serde(default)]
    pub snapshotter: String,
}

/// One snapshot as reported by `list snapshots`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ExplorerSnapshot {
    #[serde(default)]
    pub namespace: String,
    pub key: String,
    #[serde(default)]
    pub parent: String,
    /// Directory name under the snapshotter's `snapshots/`. Emitted as a number
    /// by some versions and a string by others.
    #[serde(rename = "ID", deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

/// Source of containerd metadata for a storage root.
pub trait MetadataExtractor {
    fn containers(&self, containerd_root: &Path) -> Result<Vec<ExplorerContainer>>;
    fn snapshots(&self, containerd_root: &Path) -> Result<Vec<ExplorerSnapshot>>;
}

/// Runs the Container Explorer binary.
pub struct ContainerExplorer {
    binary: PathBuf,
    timeout: Duration,
}

impl ContainerExplorer {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.explorer_binary, config.explorer_timeout())
    }

    fn run_list(&self, containerd_root: &Path, what: &str) -> Result<String> {
        let scratch = tempfile::tempdir().context("Failed to create temporary directory")?;
        let output_file = scratch.path().join(format!("{what}.json"));
        let stderr_file = scratch.path().join(format!("{what}.stderr"));
        let stderr = File::create(&stderr_file)
            .with_context(|| format!("Failed to create {}", stderr_file.display()))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--containerd-root")
            .arg(containerd_root)
            .args(["--output", "json", "--output-file"])
            .arg(&output_file)
            .args(["list", what])
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        debug!("Running container explorer: {:?}", command);

        let mut child = command.spawn().with_context(|| {
            format!(
                "Failed to execute container explorer at {}",
                self.binary.display()
            )
        })?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .context("Failed to wait for container explorer")?
            {
                break status;
            }
            if started.elapsed() >= self.timeout {
                if let Err(e) = child.kill() {
                    warn!("Failed to kill container explorer: {}", e);
                }
                let _ = child.wait();
                return Err(anyhow!(
                    "container explorer timed out after {}s listing {}",
                    self.timeout.as_secs(),
                    what
                ));
            }
            thread::sleep(Duration::from_millis(50));
        };

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_file).unwrap_or_default();
            return Err(anyhow!(
                "container explorer failed listing {} ({}): {}",
                what,
                status,
                stderr.trim()
            ));
        }

        fs::read_to_string(&output_file).with_context(|| {
            format!(
                "Container explorer produced no output at {}",
                output_file.display()
            )
        })
    }
}

/// An empty or `null` document means nothing was found.
pub fn parse_list<T: for<'de> Deserialize<'de>>(json: &str) -> Result<Vec<T>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<T>> =
        serde_json::from_str(json).context("Failed to parse container explorer output")?;
    Ok(parsed.unwrap_or_default())
}

impl MetadataExtractor for ContainerExplorer {
    fn containers(&self, containerd_root: &Path) -> Result<Vec<ExplorerContainer>> {
        parse_list(&self.run_list(containerd_root, "containers")?)
    }

    fn snapshots(&self, containerd_root: &Path) -> Result<Vec<ExplorerSnapshot>> {
        parse_list(&self.run_list(containerd_root, "snapshots")?)
    }
}
