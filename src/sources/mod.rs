//! Container discovery over Docker and containerd storage roots.
//!
//! Both runtimes are reduced to the same [`ContainerRecord`] shape: identity,
//! namespace, labels and an ordered chain of layer directories ending with the
//! container's writable layer.

pub mod containerd;
pub mod docker;
pub mod explorer;

pub use containerd::ContainerdStore;
pub use docker::DockerStore;
pub use explorer::{ContainerExplorer, ExplorerContainer, ExplorerSnapshot, MetadataExtractor};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::layout::{RuntimeKind, StorageRoot};
use crate::overlay::LayerStack;

/// Namespace Docker containers are reported under.
pub const DOCKER_NAMESPACE: &str = "moby";

/// One filesystem layer of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Layer {
    /// Digest, chain ID or snapshot key identifying the layer.
    pub id: String,
    /// Layer directory on the mounted disk.
    pub path: PathBuf,
}

/// Descriptive fields read from runtime metadata.
#[derive(Debug, Clone, Default)]
pub struct RecordDetails {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub image: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub merged_path: Option<PathBuf>,
}

/// A container found in a storage root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerRecord {
    id: String,
    runtime: RuntimeKind,
    namespace: String,
    labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    layers: Vec<Layer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merged_path: Option<PathBuf>,
    storage_root: PathBuf,
    source_disk: String,
}

impl ContainerRecord {
    /// `layers` run base-to-top and must end with the writable layer.
    pub fn new(
        id: impl Into<String>,
        root: &StorageRoot,
        layers: Vec<Layer>,
        details: RecordDetails,
    ) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            bail!("container has an empty ID");
        }
        if layers.is_empty() {
            bail!("container {} has no layers", id);
        }
        Ok(Self {
            id,
            runtime: root.kind,
            namespace: details.namespace,
            labels: details.labels,
            name: details.name,
            hostname: details.hostname,
            image: details.image,
            created: details.created,
            updated: details.updated,
            layers,
            merged_path: details.merged_path,
            storage_root: root.path.clone(),
            source_disk: root.source_disk.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    pub fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn updated(&self) -> Option<DateTime<Utc>> {
        self.updated
    }

    /// Base-to-top, writable layer last.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn writable_layer(&self) -> &Layer {
        // Non-empty by construction.
        &self.layers[self.layers.len() - 1]
    }

    pub fn base_layers(&self) -> &[Layer] {
        &self.layers[..self.layers.len() - 1]
    }

    pub fn merged_path(&self) -> Option<&Path> {
        self.merged_path.as_deref()
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn source_disk(&self) -> &str {
        &self.source_disk
    }

    /// Where this container's output files go under a destination directory:
    /// `<disk>/<runtime>/<namespace>`. Containers with the same ID on another
    /// disk, runtime or namespace never share it.
    pub fn artifact_dir(&self) -> PathBuf {
        let runtime = self.runtime.to_string();
        [self.source_disk.as_str(), runtime.as_str(), self.namespace.as_str()]
            .into_iter()
            .map(path_component)
            .collect()
    }

    /// The full container filesystem.
    pub fn layer_stack(&self) -> LayerStack {
        LayerStack::new(self.layers.iter().map(|l| l.path.clone()).collect())
    }

    /// The image the container was started from, without its writable layer.
    pub fn base_stack(&self) -> LayerStack {
        LayerStack::new(self.base_layers().iter().map(|l| l.path.clone()).collect())
    }
}

/// Identifies a container inside one storage root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub namespace: String,
    pub id: String,
}

/// A container that was found but could not be interpreted, or a storage root
/// whose metadata could not be read at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryWarning {
    pub storage_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub reason: String,
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container_id {
            Some(id) => write!(f, "container {}: {}", id, self.reason),
            None => write!(f, "{}: {}", self.storage_root.display(), self.reason),
        }
    }
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub records: Vec<ContainerRecord>,
    pub warnings: Vec<DiscoveryWarning>,
}

impl Discovery {
    pub fn extend(&mut self, other: Discovery) {
        self.records.extend(other.records);
        self.warnings.extend(other.warnings);
    }
}

/// The runtime-specific reader behind a storage root.
pub enum RuntimeSource {
    Docker(DockerStore),
    Containerd(ContainerdStore),
}

impl RuntimeSource {
    pub fn open(root: &StorageRoot, explorer: &dyn MetadataExtractor) -> Result<Self> {
        Ok(match root.kind {
            RuntimeKind::Docker => RuntimeSource::Docker(DockerStore::new(root.clone())),
            RuntimeKind::Containerd => {
                RuntimeSource::Containerd(ContainerdStore::load(root.clone(), explorer)?)
            }
        })
    }

    /// Every container in the root, sorted by namespace then ID.
    pub fn enumerate(&self) -> Result<Vec<Candidate>> {
        match self {
            RuntimeSource::Docker(store) => store.enumerate(),
            RuntimeSource::Containerd(store) => Ok(store.enumerate()),
        }
    }

    /// Base-to-top layers, writable layer last.
    pub fn layer_chain(&self, candidate: &Candidate) -> Result<Vec<Layer>> {
        match self {
            RuntimeSource::Docker(store) => store.layer_chain(&candidate.id),
            RuntimeSource::Containerd(store) => store.layer_chain(candidate),
        }
    }

    pub fn labels(&self, candidate: &Candidate) -> Result<BTreeMap<String, String>> {
        match self {
            RuntimeSource::Docker(store) => store.labels(&candidate.id),
            RuntimeSource::Containerd(store) => store.labels(candidate),
        }
    }

    /// Builds the record from the layer chain, labels and remaining metadata.
    pub fn record(&self, candidate: &Candidate) -> Result<ContainerRecord> {
        let layers = self.layer_chain(candidate)?;
        let labels = self.labels(candidate)?;
        match self {
            RuntimeSource::Docker(store) => store.record(&candidate.id, layers, labels),
            RuntimeSource::Containerd(store) => store.record(candidate, layers, labels),
        }
    }
}

/// A single path component for a name read from disk metadata.
fn path_component(name: &str) -> String {
    match name {
        "" | "." | ".." => "_".to_string(),
        _ => name.replace('/', "_"),
    }
}

/// True when `id` is selected by one of the requested ID prefixes. An empty
/// request selects everything.
pub fn id_selected(id: &str, requested: &[String]) -> bool {
    requested.is_empty()
        || requested
            .iter()
            .any(|prefix| !prefix.is_empty() && id.starts_with(prefix.as_str()))
}

/// Finds every interpretable container in a storage root.
///
/// Containers with malformed metadata are skipped and reported as warnings, as
/// is a root whose metadata cannot be read at all.
pub fn discover(
    root: &StorageRoot,
    explorer: &dyn MetadataExtractor,
    requested_ids: &[String],
) -> Discovery {
    let mut discovery = Discovery::default();
    let root_warning = |reason: String| DiscoveryWarning {
        storage_root: root.path.clone(),
        container_id: None,
        reason,
    };

    let source = match RuntimeSource::open(root, explorer) {
        Ok(source) => source,
        Err(e) => {
            warn!("Cannot read {} metadata at {}: {:#}", root.kind, root.path.display(), e);
            discovery.warnings.push(root_warning(format!("{e:#}")));
            return discovery;
        }
    };

    let candidates = match source.enumerate() {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("Cannot enumerate containers at {}: {:#}", root.path.display(), e);
            discovery.warnings.push(root_warning(format!("{e:#}")));
            return discovery;
        }
    };

    for candidate in candidates {
        if !id_selected(&candidate.id, requested_ids) {
            continue;
        }
        match source.record(&candidate) {
            Ok(record) => {
                debug!(
                    "Discovered {} container {}/{} with {} layers",
                    record.runtime(),
                    record.namespace(),
                    record.id(),
                    record.layers().len()
                );
                discovery.records.push(record);
            }
            Err(e) => {
                warn!("Skipping container {}: {:#}", candidate.id, e);
                discovery.warnings.push(DiscoveryWarning {
                    storage_root: root.path.clone(),
                    container_id: Some(candidate.id.clone()),
                    reason: format!("{e:#}"),
                });
            }
        }
    }

    info!(
        "Found {} {} containers at {}",
        discovery.records.len(),
        root.kind,
        root.path.display()
    );
    discovery
}
