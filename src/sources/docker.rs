use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use oci_spec::image::ImageConfiguration;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::{Candidate, ContainerRecord, Layer, RecordDetails, DOCKER_NAMESPACE};
use crate::digest::prefixed;
use crate::layout::StorageRoot;

const OVERLAY2_DRIVER: &str = "overlay2";

/// The parts of `containers/<id>/config.v2.json` discovery needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    config: Option<RunConfig>,
    #[serde(default)]
    state: Option<RunState>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunConfig {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunState {
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
}

/// Docker writes `0001-01-01T00:00:00Z` for times that never happened.
pub(crate) fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value?).ok()?.with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}

fn read_trimmed(path: &Path) -> Result<String> {
    let value = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(value.trim().to_string())
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let value = read_trimmed(path)?;
    Ok((!value.is_empty()).then_some(value))
}

/// Reader for a Docker `overlay2` storage root.
pub struct DockerStore {
    root: StorageRoot,
}

impl DockerStore {
    pub fn new(root: StorageRoot) -> Self {
        Self { root }
    }

    fn path(&self) -> &Path {
        &self.root.path
    }

    fn layerdb(&self) -> PathBuf {
        self.path().join("image").join(OVERLAY2_DRIVER).join("layerdb")
    }

    fn overlay_diff(&self, cache_id: &str) -> PathBuf {
        self.path().join(OVERLAY2_DRIVER).join(cache_id).join("diff")
    }

    fn config(&self, id: &str) -> Result<ContainerConfig> {
        let path = self.path().join("containers").join(id).join("config.v2.json");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ContainerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if config.id != id {
            bail!("config.v2.json names container {} instead", config.id);
        }
        Ok(config)
    }

    /// Containers with a `config.v2.json`, sorted by ID.
    pub fn enumerate(&self) -> Result<Vec<Candidate>> {
        let containers_dir = self.path().join("containers");
        let mut candidates = Vec::new();
        for entry in fs::read_dir(&containers_dir)
            .with_context(|| format!("Failed to list {}", containers_dir.display()))?
        {
            let entry = entry?;
            if !entry.path().join("config.v2.json").is_file() {
                debug!("No config.v2.json in {}", entry.path().display());
                continue;
            }
            candidates.push(Candidate {
                namespace: DOCKER_NAMESPACE.to_string(),
                id: entry.file_name().to_string_lossy().into_owned(),
            });
        }
        candidates.sort();
        Ok(candidates)
    }

    /// Image layers walked back from the container's parent chain ID, then the
    /// init layer and the writable layer.
    pub fn layer_chain(&self, id: &str) -> Result<Vec<Layer>> {
        let config = self.config(id)?;
        if !config.driver.is_empty() && config.driver != OVERLAY2_DRIVER {
            bail!("unsupported storage driver {}", config.driver);
        }

        let mount_dir = self.layerdb().join("mounts").join(id);
        let mount_id = read_optional(&mount_dir.join("mount-id"))?
            .ok_or_else(|| anyhow!("missing mount-id in {}", mount_dir.display()))?;
        let init_id = read_optional(&mount_dir.join("init-id"))?;
        let mut parent = read_optional(&mount_dir.join("parent"))?;

        let mut image_layers = Vec::new();
        let mut seen = HashSet::new();
        while let Some(chain_ref) = parent {
            let chain_id = chain_ref
                .strip_prefix("sha256:")
                .unwrap_or(&chain_ref)
                .to_string();
            if !seen.insert(chain_id.clone()) {
                bail!("layer chain loops at {}", chain_ref);
            }
            let layer_dir = self.layerdb().join("sha256").join(&chain_id);
            if !layer_dir.is_dir() {
                bail!("broken layer chain: {} not found", chain_ref);
            }
            let cache_id = read_optional(&layer_dir.join("cache-id"))?
                .ok_or_else(|| anyhow!("missing cache-id for layer {}", chain_ref))?;
            image_layers.push(Layer {
                id: prefixed(&chain_id),
                path: self.overlay_diff(&cache_id),
            });
            parent = read_optional(&layer_dir.join("parent"))?;
        }
        image_layers.reverse();

        if let Some(init_id) = init_id {
            image_layers.push(Layer {
                path: self.overlay_diff(&init_id),
                id: init_id,
            });
        }
        image_layers.push(Layer {
            path: self.overlay_diff(&mount_id),
            id: mount_id,
        });
        Ok(image_layers)
    }

    fn image_labels(&self, image_id: &str) -> Option<HashMap<String, String>> {
        let hex = image_id.strip_prefix("sha256:").unwrap_or(image_id);
        if hex.is_empty() {
            return None;
        }
        let path = self
            .path()
            .join("image")
            .join(OVERLAY2_DRIVER)
            .join("imagedb/content/sha256")
            .join(hex);
        if !path.is_file() {
            return None;
        }
        match ImageConfiguration::from_file(&path) {
            Ok(config) => config.config().as_ref().and_then(|c| c.labels().clone()),
            Err(e) => {
                debug!("Unreadable image config {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Image labels overlaid with the container's own labels.
    pub fn labels(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let config = self.config(id)?;
        Ok(self.merged_labels(&config))
    }

    fn merged_labels(&self, config: &ContainerConfig) -> BTreeMap<String, String> {
        let mut labels: BTreeMap<String, String> = self
            .image_labels(&config.image)
            .map(|l| l.into_iter().collect())
            .unwrap_or_default();
        if let Some(own) = config.config.as_ref().and_then(|c| c.labels.as_ref()) {
            labels.extend(own.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        labels
    }

    pub fn record(
        &self,
        id: &str,
        layers: Vec<Layer>,
        labels: BTreeMap<String, String>,
    ) -> Result<ContainerRecord> {
        let config = self.config(id)?;
        let run_config = config.config.unwrap_or_default();
        let state = config.state.unwrap_or_default();

        let started = parse_time(state.started_at.as_deref());
        let finished = parse_time(state.finished_at.as_deref());
        let updated = started.max(finished);

        let merged = layers
            .last()
            .and_then(|rw| rw.path.parent())
            .map(|dir| dir.join("merged"))
            .filter(|merged| {
                fs::read_dir(merged)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false)
            });

        let image = if run_config.image.is_empty() {
            config.image
        } else {
            run_config.image
        };

        let details = RecordDetails {
            namespace: DOCKER_NAMESPACE.to_string(),
            labels,
            name: Some(config.name.trim_start_matches('/').to_string()).filter(|n| !n.is_empty()),
            hostname: Some(run_config.hostname).filter(|h| !h.is_empty()),
            image: Some(image).filter(|i| !i.is_empty()),
            created: parse_time(config.created.as_deref()),
            updated,
            merged_path: merged,
        };
        ContainerRecord::new(id, &self.root, layers, details)
    }
}
