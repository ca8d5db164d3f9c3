//! Filesystem drift between a container's writable layer and its image.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::digest::content_digest;
use crate::error::ForensicsError;
use crate::layout::RuntimeKind;
use crate::overlay::{scan_layer, FileType, LayerScan, MergedView, ViewEntry};
use crate::sources::ContainerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftEntry {
    /// Absolute path inside the container.
    pub path: String,
    pub kind: DriftKind,
    pub file_type: FileType,
    /// Digest of the current version; absent for deletions and directories.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_sha256: Option<String>,
    pub mode: u32,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub container_id: String,
    pub runtime: RuntimeKind,
    pub namespace: String,
    pub source_disk: String,
    /// Sorted by path.
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn summary(&self) -> DriftSummary {
        let mut summary = DriftSummary::default();
        for entry in &self.entries {
            match entry.kind {
                DriftKind::Added => summary.added += 1,
                DriftKind::Modified => summary.modified += 1,
                DriftKind::Deleted => summary.deleted += 1,
            }
        }
        summary
    }
}

fn container_path(rel: &Path) -> String {
    Path::new("/").join(rel).to_string_lossy().into_owned()
}

struct Observed {
    mode: u32,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

fn observe(path: &Path) -> Result<Observed> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(Observed {
        mode: meta.mode(),
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
    })
}

fn entry(rel: &Path, kind: DriftKind, file_type: FileType, source: &Path) -> Result<DriftEntry> {
    let observed = observe(source)?;
    Ok(DriftEntry {
        path: container_path(rel),
        kind,
        file_type,
        sha256: None,
        base_sha256: None,
        mode: observed.mode,
        size: observed.size,
        modified: observed.modified,
    })
}

fn deleted(rel: &Path, base: &ViewEntry) -> Result<DriftEntry> {
    let mut e = entry(rel, DriftKind::Deleted, base.file_type, &base.source)?;
    e.base_sha256 = content_digest(&base.source, base.file_type)?;
    Ok(e)
}

/// Paths of the writable layer whose base version is hidden by the layer itself.
fn hidden_by_layer(rel: &Path, scan: &LayerScan) -> bool {
    scan.whiteouts.iter().any(|w| rel.starts_with(w))
        || scan
            .opaque_dirs
            .iter()
            .any(|d| rel != d.as_path() && rel.starts_with(d))
}

fn compare(
    base: &MergedView,
    writable: &Path,
    scan: &LayerScan,
) -> Result<BTreeMap<PathBuf, DriftEntry>> {
    let mut found = BTreeMap::new();
    let defined: HashSet<&PathBuf> = scan.entries.iter().map(|(p, _)| p).collect();

    for hidden in &scan.whiteouts {
        let Some(base_entry) = base.get(hidden) else {
            continue;
        };
        if base_entry.file_type.is_dir() {
            for (rel, sub) in base.subtree(hidden) {
                if !sub.file_type.is_dir() {
                    found.insert(rel.clone(), deleted(rel, sub)?);
                }
            }
        } else {
            found.insert(hidden.clone(), deleted(hidden, base_entry)?);
        }
    }

    for dir in &scan.opaque_dirs {
        for (rel, sub) in base.subtree(dir) {
            if !sub.file_type.is_dir() && !defined.contains(rel) {
                found.insert(rel.clone(), deleted(rel, sub)?);
            }
        }
    }

    for (rel, file_type) in &scan.entries {
        let source = writable.join(rel);
        let base_entry = if hidden_by_layer(rel, scan) {
            None
        } else {
            base.get(rel)
        };

        let drift = match (file_type, base_entry) {
            (FileType::Directory, Some(b)) if !b.file_type.is_dir() => {
                Some(entry(rel, DriftKind::Modified, *file_type, &source)?)
            }
            (FileType::Directory, _) => None,
            (_, None) => {
                let mut e = entry(rel, DriftKind::Added, *file_type, &source)?;
                e.sha256 = content_digest(&source, *file_type)?;
                Some(e)
            }
            (_, Some(b)) if b.file_type.is_dir() => {
                let mut e = entry(rel, DriftKind::Modified, *file_type, &source)?;
                e.sha256 = content_digest(&source, *file_type)?;
                Some(e)
            }
            (_, Some(b)) => {
                let current = content_digest(&source, *file_type)?;
                let previous = content_digest(&b.source, b.file_type)?;
                if *file_type != b.file_type || current != previous {
                    let mut e = entry(rel, DriftKind::Modified, *file_type, &source)?;
                    e.sha256 = current;
                    e.base_sha256 = previous;
                    Some(e)
                } else {
                    None
                }
            }
        };

        if let Some(drift) = drift {
            found.insert(rel.clone(), drift);
        }
    }

    Ok(found)
}

fn compute(record: &ContainerRecord) -> Result<DriftReport> {
    let writable = &record.writable_layer().path;
    if !writable.is_dir() {
        bail!("writable layer {} is missing", writable.display());
    }

    let base = record
        .base_stack()
        .merged_view()
        .context("Failed to assemble the image layers")?;
    let scan = scan_layer(writable)?;
    debug!(
        "Comparing {} writable entries of {} against {} base entries",
        scan.entries.len(),
        record.id(),
        base.len()
    );

    let entries = compare(&base, writable, &scan)?.into_values().collect();
    Ok(DriftReport {
        container_id: record.id().to_string(),
        runtime: record.runtime(),
        namespace: record.namespace().to_string(),
        source_disk: record.source_disk().to_string(),
        entries,
    })
}

/// Computes the drift of one container. The result depends only on the layer
/// contents, so repeated calls return identical reports.
pub fn detect_drift(record: &ContainerRecord) -> Result<DriftReport, ForensicsError> {
    compute(record).map_err(|e| ForensicsError::drift(record.id(), e))
}
