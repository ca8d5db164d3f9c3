//! Common utilities for integration tests
//!
//! Disk images are simulated: [`DirMounter`] "mounts" an image by handing out
//! a prepared directory as its filesystem root, and the storage layouts inside
//! are built by [`DockerFixture`] and [`ContainerdFixture`].

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use container_forensics::disk::{Attachment, DeviceKind, DiskImage, Mounter};
use container_forensics::sources::{ExplorerContainer, ExplorerSnapshot, MetadataExtractor};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const NGINX_IMAGE_ID: &str =
    "sha256:1a2b3c4d5e6f1a2b3c4d5e6f1a2b3c4d5e6f1a2b3c4d5e6f1a2b3c4d5e6f1a2b";

/// Creates an empty file named `name` in `dir` to stand in for a disk image.
pub fn disk_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"").unwrap();
    path
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Maps disk image file names to prepared filesystem roots.
#[derive(Default)]
pub struct DirMounter {
    roots: HashMap<String, PathBuf>,
    pub attached: Cell<u32>,
    pub detached: Cell<u32>,
    pub order: RefCell<Vec<String>>,
}

impl DirMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, image_name: &str, root: &Path) -> Self {
        self.roots.insert(image_name.to_string(), root.to_path_buf());
        self
    }
}

impl Mounter for DirMounter {
    fn attach(&self, image: &DiskImage) -> Result<Attachment> {
        let label = image.label();
        self.order.borrow_mut().push(label.clone());
        let root = self
            .roots
            .get(&label)
            .ok_or_else(|| anyhow!("no free loop device for {}", label))?;
        self.attached.set(self.attached.get() + 1);
        Ok(Attachment {
            device: PathBuf::from(format!("/dev/loop{}", self.attached.get())),
            kind: DeviceKind::Loop,
            mountpoints: vec![root.clone()],
        })
    }

    fn detach(&self, _attachment: &Attachment) -> Result<()> {
        self.detached.set(self.detached.get() + 1);
        Ok(())
    }
}

/// Builds `var/lib/docker` with the overlay2 driver under a filesystem root.
pub struct DockerFixture {
    pub root: PathBuf,
}

impl DockerFixture {
    pub fn create(fs_root: &Path) -> Self {
        let root = fs_root.join("var/lib/docker");
        for dir in [
            "image/overlay2/layerdb/mounts",
            "image/overlay2/layerdb/sha256",
            "image/overlay2/imagedb/content/sha256",
            "overlay2",
            "containers",
        ] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        Self { root }
    }

    fn diff(&self, cache_id: &str) -> PathBuf {
        let diff = self.root.join("overlay2").join(cache_id).join("diff");
        fs::create_dir_all(&diff).unwrap();
        diff
    }

    /// Registers an image layer and returns its `diff` directory.
    pub fn add_layer(&self, chain_id: &str, parent: Option<&str>, cache_id: &str) -> PathBuf {
        let dir = self.root.join("image/overlay2/layerdb/sha256").join(chain_id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cache-id"), cache_id).unwrap();
        if let Some(parent) = parent {
            fs::write(dir.join("parent"), format!("sha256:{parent}")).unwrap();
        }
        self.diff(cache_id)
    }

    pub fn add_image_config(&self, image_id: &str, labels: &[(&str, &str)]) {
        let labels: HashMap<&str, &str> = labels.iter().copied().collect();
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "config": { "Labels": labels },
            "rootfs": { "type": "layers", "diff_ids": [] },
        });
        let hex = image_id.trim_start_matches("sha256:");
        fs::write(
            self.root.join("image/overlay2/imagedb/content/sha256").join(hex),
            config.to_string(),
        )
        .unwrap();
    }

    /// Registers a running container on top of `top_layer` and returns its
    /// writable `diff` directory.
    pub fn add_container(&self, id: &str, top_layer: &str, labels: &[(&str, &str)]) -> PathBuf {
        let mount_id = format!("{id}-rw");
        let mounts = self.root.join("image/overlay2/layerdb/mounts").join(id);
        fs::create_dir_all(&mounts).unwrap();
        fs::write(mounts.join("mount-id"), &mount_id).unwrap();
        fs::write(mounts.join("init-id"), format!("{mount_id}-init")).unwrap();
        fs::write(mounts.join("parent"), format!("sha256:{top_layer}")).unwrap();
        self.diff(&format!("{mount_id}-init"));

        let labels: HashMap<&str, &str> = labels.iter().copied().collect();
        let config = json!({
            "ID": id,
            "Name": format!("/{}", &id[..6]),
            "Image": NGINX_IMAGE_ID,
            "Created": "2024-03-01T10:00:00.5Z",
            "Driver": "overlay2",
            "Config": {
                "Hostname": &id[..12],
                "Image": "nginx:1.25",
                "Labels": labels,
            },
            "State": {
                "StartedAt": "2024-03-01T10:00:01Z",
                "FinishedAt": "0001-01-01T00:00:00Z",
            },
        });
        let dir = self.root.join("containers").join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.v2.json"), config.to_string()).unwrap();

        self.diff(&mount_id)
    }
}

/// Builds `var/lib/containerd` with the overlayfs snapshotter and records the
/// metadata Container Explorer would report for it.
pub struct ContainerdFixture {
    pub root: PathBuf,
    containers: Vec<ExplorerContainer>,
    snapshots: Vec<ExplorerSnapshot>,
}

impl ContainerdFixture {
    pub fn create(fs_root: &Path) -> Self {
        let root = fs_root.join("var/lib/containerd");
        fs::create_dir_all(root.join("io.containerd.metadata.v1.bolt")).unwrap();
        fs::create_dir_all(root.join("io.containerd.snapshotter.v1.overlayfs/snapshots")).unwrap();
        Self {
            root,
            containers: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Registers a snapshot and returns its `fs` directory.
    pub fn add_snapshot(&mut self, namespace: &str, key: &str, parent: &str, id: u32) -> PathBuf {
        let fs_dir = self
            .root
            .join("io.containerd.snapshotter.v1.overlayfs/snapshots")
            .join(id.to_string())
            .join("fs");
        fs::create_dir_all(&fs_dir).unwrap();
        self.snapshots.push(ExplorerSnapshot {
            namespace: namespace.to_string(),
            key: key.to_string(),
            parent: parent.to_string(),
            id: id.to_string(),
            kind: if parent.is_empty() { "Committed" } else { "Active" }.to_string(),
            labels: Default::default(),
        });
        fs_dir
    }

    pub fn add_container(
        &mut self,
        namespace: &str,
        id: &str,
        snapshot_key: &str,
        labels: &[(&str, &str)],
    ) {
        self.containers.push(ExplorerContainer {
            namespace: namespace.to_string(),
            id: id.to_string(),
            hostname: format!("{id}-host"),
            image: "registry.k8s.io/pause:3.9".to_string(),
            container_type: "container".to_string(),
            created_at: Some("2024-04-02T08:30:00Z".to_string()),
            updated_at: Some("2024-04-02T08:31:00Z".to_string()),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            snapshot_key: snapshot_key.to_string(),
            snapshotter: "overlayfs".to_string(),
        });
    }

    pub fn explorer(&self) -> FixtureExplorer {
        FixtureExplorer {
            containers: self.containers.clone(),
            snapshots: self.snapshots.clone(),
        }
    }
}

/// Serves fixture metadata regardless of the root it is asked about.
#[derive(Default)]
pub struct FixtureExplorer {
    pub containers: Vec<ExplorerContainer>,
    pub snapshots: Vec<ExplorerSnapshot>,
}

impl MetadataExtractor for FixtureExplorer {
    fn containers(&self, _containerd_root: &Path) -> Result<Vec<ExplorerContainer>> {
        Ok(self.containers.clone())
    }

    fn snapshots(&self, _containerd_root: &Path) -> Result<Vec<ExplorerSnapshot>> {
        Ok(self.snapshots.clone())
    }
}
