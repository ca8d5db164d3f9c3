use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use super::docker::parse_time;
use super::explorer::{ExplorerContainer, ExplorerSnapshot, MetadataExtractor};
use super::{Candidate, ContainerRecord, Layer, RecordDetails};
use crate::layout::{StorageRoot, CONTAINERD_SNAPSHOTTER};

const OVERLAYFS_SNAPSHOTTER: &str = "overlayfs";

/// Reader for a containerd storage root, backed by explorer metadata.
pub struct ContainerdStore {
    root: StorageRoot,
    containers: BTreeMap<Candidate, ExplorerContainer>,
    /// Snapshots keyed by namespace, then snapshot key.
    snapshots: HashMap<String, HashMap<String, ExplorerSnapshot>>,
}

impl ContainerdStore {
    pub fn load(root: StorageRoot, extractor: &dyn MetadataExtractor) -> Result<Self> {
        let containers = extractor
            .containers(&root.path)
            .with_context(|| format!("Failed to list containers in {}", root.path.display()))?;
        let snapshots = extractor
            .snapshots(&root.path)
            .with_context(|| format!("Failed to list snapshots in {}", root.path.display()))?;
        Ok(Self::from_metadata(root, containers, snapshots))
    }

    pub fn from_metadata(
        root: StorageRoot,
        containers: Vec<ExplorerContainer>,
        snapshots: Vec<ExplorerSnapshot>,
    ) -> Self {
        let containers = containers
            .into_iter()
            .map(|c| {
                (
                    Candidate {
                        namespace: c.namespace.clone(),
                        id: c.id.clone(),
                    },
                    c,
                )
            })
            .collect();

        let mut by_namespace: HashMap<String, HashMap<String, ExplorerSnapshot>> = HashMap::new();
        for snapshot in snapshots {
            by_namespace
                .entry(snapshot.namespace.clone())
                .or_default()
                .insert(snapshot.key.clone(), snapshot);
        }

        Self {
            root,
            containers,
            snapshots: by_namespace,
        }
    }

    /// Namespaces in sorted order, containers sorted within each.
    pub fn enumerate(&self) -> Vec<Candidate> {
        self.containers.keys().cloned().collect()
    }

    fn container(&self, candidate: &Candidate) -> Result<&ExplorerContainer> {
        self.containers
            .get(candidate)
            .ok_or_else(|| anyhow!("unknown container {}/{}", candidate.namespace, candidate.id))
    }

    fn snapshot_fs(&self, snapshot: &ExplorerSnapshot) -> PathBuf {
        self.root
            .path
            .join(CONTAINERD_SNAPSHOTTER)
            .join("snapshots")
            .join(&snapshot.id)
            .join("fs")
    }

    /// Walks from the container's active snapshot back to the image base.
    pub fn layer_chain(&self, candidate: &Candidate) -> Result<Vec<Layer>> {
        let container = self.container(candidate)?;
        if !container.snapshotter.is_empty() && container.snapshotter != OVERLAYFS_SNAPSHOTTER {
            bail!("unsupported snapshotter {}", container.snapshotter);
        }
        if container.snapshot_key.is_empty() {
            bail!("no snapshot key recorded");
        }

        let empty = HashMap::new();
        let snapshots = self.snapshots.get(&candidate.namespace).unwrap_or(&empty);

        let mut layers = Vec::new();
        let mut seen = HashSet::new();
        let mut key = container.snapshot_key.clone();
        loop {
            if !seen.insert(key.clone()) {
                bail!("snapshot chain loops at {}", key);
            }
            let snapshot = snapshots
                .get(&key)
                .ok_or_else(|| anyhow!("snapshot {} not found", key))?;
            layers.push(Layer {
                id: snapshot.key.clone(),
                path: self.snapshot_fs(snapshot),
            });
            if snapshot.parent.is_empty() {
                break;
            }
            key = snapshot.parent.clone();
        }
        layers.reverse();
        Ok(layers)
    }

    pub fn labels(&self, candidate: &Candidate) -> Result<BTreeMap<String, String>> {
        Ok(self.container(candidate)?.labels.clone())
    }

    pub fn record(
        &self,
        candidate: &Candidate,
        layers: Vec<Layer>,
        labels: BTreeMap<String, String>,
    ) -> Result<ContainerRecord> {
        let container = self.container(candidate)?;
        let details = RecordDetails {
            namespace: container.namespace.clone(),
            labels,
            name: None,
            hostname: Some(container.hostname.clone()).filter(|h| !h.is_empty()),
            image: Some(container.image.clone()).filter(|i| !i.is_empty()),
            created: parse_time(container.created_at.as_deref()),
            updated: parse_time(container.updated_at.as_deref()),
            merged_path: None,
        };
        ContainerRecord::new(&container.id, &self.root, layers, details)
    }
}
