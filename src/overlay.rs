//! Overlay filesystem semantics over a chain of layer directories.
//!
//! Layers are given base-to-top. A path is resolved by querying layers from the
//! top down: the first layer that defines the path wins, and a whiteout or an
//! opaque directory in an upper layer hides whatever the lower layers hold.
//!
//! Whiteout forms understood here:
//! - `.wh.<name>` next to the hidden entry (OCI layer tarball convention)
//! - a `0:0` character device at the hidden path (overlayfs on-disk form)
//!
//! Opaque directories carry either a `.wh..wh..opq` marker file or the
//! `trusted.overlay.opaque=y` extended attribute.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::ops::Bound;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
const OPAQUE_XATTR: &str = "trusted.overlay.opaque";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Symlink,
    Directory,
    Other,
}

impl FileType {
    pub fn of(meta: &fs::Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_file() {
            FileType::File
        } else {
            FileType::Other
        }
    }

    pub fn is_dir(self) -> bool {
        self == FileType::Directory
    }
}

/// Strips root, `.` and `..` components so the result stays relative to a layer.
pub fn normalize_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// A `0:0` character device is how overlayfs records a deletion on disk.
pub fn is_whiteout_device(meta: &fs::Metadata) -> bool {
    meta.file_type().is_char_device() && meta.rdev() == 0
}

fn has_opaque_xattr(path: &Path) -> bool {
    let mut value = [0u8; 1];
    // Reading trusted.* needs CAP_SYS_ADMIN; without it only the marker file counts.
    matches!(
        rustix::fs::lgetxattr(path, OPAQUE_XATTR, &mut value[..]),
        Ok(1) if value[0] == b'y'
    )
}

pub fn is_opaque_dir(path: &Path) -> bool {
    path.join(OPAQUE_MARKER).symlink_metadata().is_ok() || has_opaque_xattr(path)
}

/// The contents of one layer directory, split by overlay meaning.
#[derive(Debug, Default)]
pub struct LayerScan {
    /// Paths this layer deletes from the layers below it.
    pub whiteouts: Vec<PathBuf>,
    /// Directories whose lower-layer contents are hidden.
    pub opaque_dirs: Vec<PathBuf>,
    /// Real entries, marker files excluded. Sorted by walk order.
    pub entries: Vec<(PathBuf, FileType)>,
}

/// Walks a layer directory and classifies every entry.
pub fn scan_layer(layer: &Path) -> Result<LayerScan> {
    let mut scan = LayerScan::default();

    for entry in WalkDir::new(layer)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("Failed to walk layer {}", layer.display()))?;
        let rel = entry
            .path()
            .strip_prefix(layer)
            .with_context(|| format!("Entry outside layer: {}", entry.path().display()))?
            .to_path_buf();
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

        if let Some(name) = entry.file_name().to_str() {
            if name == OPAQUE_MARKER {
                scan.opaque_dirs.push(parent);
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                scan.whiteouts.push(parent.join(hidden));
                continue;
            }
        }

        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if is_whiteout_device(&meta) {
            scan.whiteouts.push(rel);
            continue;
        }

        let file_type = FileType::of(&meta);
        if file_type.is_dir() && has_opaque_xattr(entry.path()) {
            scan.opaque_dirs.push(rel.clone());
        }
        scan.entries.push((rel, file_type));
    }

    Ok(scan)
}

/// Where a path of the merged view actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub source: PathBuf,
    pub file_type: FileType,
}

enum Probe {
    Found(ViewEntry),
    Hidden,
    Missing,
}

/// The merged contents of a layer stack, keyed by layer-relative path.
#[derive(Debug, Default)]
pub struct MergedView {
    entries: BTreeMap<PathBuf, ViewEntry>,
}

impl MergedView {
    pub fn get(&self, rel: &Path) -> Option<&ViewEntry> {
        self.entries.get(rel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &ViewEntry)> {
        self.entries.iter()
    }

    /// Everything strictly below `rel`.
    pub fn subtree<'a>(&'a self, rel: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a ViewEntry)> {
        self.entries
            .range::<Path, _>((Bound::Excluded(rel), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(rel))
    }

    /// `rel` and everything below it, keys unchanged. An empty `rel` keeps all.
    pub fn restricted_to(&self, rel: &Path) -> MergedView {
        let mut entries: BTreeMap<PathBuf, ViewEntry> = self
            .subtree(rel)
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        if let Some(own) = self.entries.get(rel) {
            entries.insert(rel.to_path_buf(), own.clone());
        }
        MergedView { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_subtree(&mut self, rel: &Path) {
        let doomed: Vec<PathBuf> = self.subtree(rel).map(|(p, _)| p.clone()).collect();
        for path in doomed {
            self.entries.remove(&path);
        }
    }

    fn apply(&mut self, layer: &Path, scan: LayerScan) {
        for hidden in &scan.whiteouts {
            self.entries.remove(hidden);
            self.remove_subtree(hidden);
        }
        for dir in &scan.opaque_dirs {
            self.remove_subtree(dir);
        }
        for (rel, file_type) in scan.entries {
            let replaces_dir = self
                .entries
                .get(&rel)
                .is_some_and(|existing| existing.file_type.is_dir() && !file_type.is_dir());
            if replaces_dir {
                self.remove_subtree(&rel);
            }
            let source = layer.join(&rel);
            self.entries.insert(rel, ViewEntry { source, file_type });
        }
    }
}

/// An ordered chain of layer directories, base first.
#[derive(Debug, Clone)]
pub struct LayerStack {
    layers: Vec<PathBuf>,
}

impl LayerStack {
    pub fn new(layers: Vec<PathBuf>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[PathBuf] {
        &self.layers
    }

    /// Resolves one path top-down. Returns `None` when no layer defines it or an
    /// upper layer hides it.
    pub fn lookup(&self, path: &Path) -> Result<Option<ViewEntry>> {
        let rel = normalize_path(path);
        let names: Vec<OsString> = rel.iter().map(|c| c.to_os_string()).collect();

        if names.is_empty() {
            return Ok(self.layers.last().map(|top| ViewEntry {
                source: top.clone(),
                file_type: FileType::Directory,
            }));
        }

        for layer in self.layers.iter().rev() {
            match probe(layer, &names)? {
                Probe::Found(entry) => return Ok(Some(entry)),
                Probe::Hidden => return Ok(None),
                Probe::Missing => {}
            }
        }
        Ok(None)
    }

    /// Replays every layer base-to-top into a single view.
    pub fn merged_view(&self) -> Result<MergedView> {
        let mut view = MergedView::default();
        for layer in &self.layers {
            if !layer.is_dir() {
                warn!("Layer directory missing, treating as empty: {}", layer.display());
                continue;
            }
            let scan = scan_layer(layer)?;
            debug!(
                "Layer {}: {} entries, {} whiteouts, {} opaque dirs",
                layer.display(),
                scan.entries.len(),
                scan.whiteouts.len(),
                scan.opaque_dirs.len()
            );
            view.apply(layer, scan);
        }
        Ok(view)
    }
}

fn probe(layer: &Path, names: &[OsString]) -> Result<Probe> {
    let mut dir = layer.to_path_buf();
    let mut under_opaque = false;

    for (i, name) in names.iter().enumerate() {
        let mut marker = OsString::from(WHITEOUT_PREFIX);
        marker.push(name);
        if dir.join(&marker).symlink_metadata().is_ok() {
            return Ok(Probe::Hidden);
        }

        let path = dir.join(name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(if under_opaque {
                    Probe::Hidden
                } else {
                    Probe::Missing
                });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
            }
        };

        if is_whiteout_device(&meta) {
            return Ok(Probe::Hidden);
        }

        if i + 1 == names.len() {
            return Ok(Probe::Found(ViewEntry {
                source: path,
                file_type: FileType::of(&meta),
            }));
        }

        // A non-directory in this layer shadows anything below it.
        if !meta.is_dir() {
            return Ok(Probe::Hidden);
        }
        if is_opaque_dir(&path) {
            under_opaque = true;
        }
        dir = path;
    }

    Ok(Probe::Missing)
}
