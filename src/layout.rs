//! Locate Docker and containerd storage roots on a mounted filesystem.

use log::debug;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Containerd,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::Docker => write!(f, "docker"),
            RuntimeKind::Containerd => write!(f, "containerd"),
        }
    }
}

/// A runtime storage directory found on a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageRoot {
    pub kind: RuntimeKind,
    pub path: PathBuf,
    /// Label of the disk image this root was found on.
    pub source_disk: String,
}

pub const CONTAINERD_SNAPSHOTTER: &str = "io.containerd.snapshotter.v1.overlayfs";
pub const CONTAINERD_METADATA: &str = "io.containerd.metadata.v1.bolt";

/// Default runtime roots, relative to the filesystem root. The `lib/` variants
/// cover images where `/var` is a partition of its own.
const DEFAULT_ROOTS: &[&str] = &[
    "var/lib/docker",
    "var/lib/containerd",
    "lib/docker",
    "lib/containerd",
];

fn has_docker_layout(path: &Path) -> bool {
    path.join("image").is_dir() && path.join("overlay2").is_dir() && path.join("containers").is_dir()
}

fn has_containerd_layout(path: &Path) -> bool {
    path.join(CONTAINERD_SNAPSHOTTER).join("snapshots").is_dir()
        && path.join(CONTAINERD_METADATA).is_dir()
}

/// Matches the kernel's limit on nested symlink resolution.
const MAX_SYMLINK_HOPS: usize = 40;

/// Join `relative` onto the mounted root, resolving symlinks the way the
/// evidence system would: absolute targets restart at `root`, and `..` never
/// climbs above it. Returns `None` on a symlink loop.
fn resolve_under(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut pending: Vec<OsString> = relative
        .components()
        .rev()
        .filter_map(component_name)
        .collect();
    let mut out = root.to_path_buf();
    let mut hops = 0;

    while let Some(name) = pending.pop() {
        if name == ".." {
            if out != root {
                out.pop();
            }
            continue;
        }
        out.push(&name);

        let is_link = fs::symlink_metadata(&out)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            continue;
        }
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return None;
        }
        let target = fs::read_link(&out).ok()?;
        debug!("Following {} -> {}", out.display(), target.display());
        out.pop();
        if target.is_absolute() {
            out = root.to_path_buf();
        }
        pending.extend(target.components().rev().filter_map(component_name));
    }
    Some(out)
}

fn component_name(comp: Component<'_>) -> Option<OsString> {
    match comp {
        Component::Normal(c) => Some(c.to_os_string()),
        Component::ParentDir => Some(OsString::from("..")),
        Component::CurDir | Component::RootDir | Component::Prefix(_) => None,
    }
}

/// Classify one candidate directory. A directory may carry both layouts.
pub fn detect(path: &Path) -> Vec<RuntimeKind> {
    let mut kinds = Vec::new();
    if has_docker_layout(path) {
        kinds.push(RuntimeKind::Docker);
    }
    if has_containerd_layout(path) {
        kinds.push(RuntimeKind::Containerd);
    }
    kinds
}

/// Find storage roots under `mounted_root`.
///
/// `custom_paths` replace the default locations when non-empty. Paths matching
/// neither layout are skipped.
pub fn resolve(mounted_root: &Path, custom_paths: &[PathBuf], source_disk: &str) -> Vec<StorageRoot> {
    let requested: Vec<&Path> = if custom_paths.is_empty() {
        DEFAULT_ROOTS.iter().map(Path::new).collect()
    } else {
        custom_paths.iter().map(PathBuf::as_path).collect()
    };

    let mut roots = Vec::new();
    for path in requested {
        let Some(candidate) = resolve_under(mounted_root, path) else {
            debug!("Symlink loop resolving {} on {}", path.display(), source_disk);
            continue;
        };
        let kinds = detect(&candidate);
        if kinds.is_empty() {
            debug!("No container storage layout at {}", candidate.display());
            continue;
        }
        for kind in kinds {
            debug!("Found {} storage root at {}", kind, candidate.display());
            let root = StorageRoot {
                kind,
                path: candidate.clone(),
                source_disk: source_disk.to_string(),
            };
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
    }
    roots
}

/// Resolve several mounted filesystems independently and concatenate the results.
pub fn resolve_all<'a, I>(mounts: I, custom_paths: &[PathBuf]) -> Vec<StorageRoot>
where
    I: IntoIterator<Item = (&'a Path, &'a str)>,
{
    mounts
        .into_iter()
        .flat_map(|(root, disk)| resolve(root, custom_paths, disk))
        .collect()
}
