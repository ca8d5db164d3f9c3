//! Copy selected files and directories out of a container's filesystem.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::digest::sha256_file;
use crate::error::ForensicsError;
use crate::export::write_archive;
use crate::overlay::{normalize_path, FileType, LayerStack, ViewEntry};
use crate::sources::ContainerRecord;

/// Matches the kernel's limit on nested symlink resolution.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractedKind {
    File,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedFile {
    pub container_id: String,
    /// The path as requested.
    pub requested: String,
    pub kind: ExtractedKind,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub files: Vec<ExtractedFile>,
    pub errors: Vec<ForensicsError>,
}

/// File name fragment for a container path: `/var/log/nginx` becomes `var_log_nginx`.
pub fn sanitize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "root".to_string();
    }
    trimmed
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Resolves `rel` in the container, following symlinks inside the container
/// root only.
fn resolve(stack: &LayerStack, rel: &Path) -> Result<(PathBuf, ViewEntry)> {
    let mut current = normalize_path(rel);
    for _ in 0..MAX_SYMLINK_HOPS {
        let entry = stack
            .lookup(&current)?
            .ok_or_else(|| anyhow!("{} does not exist", Path::new("/").join(&current).display()))?;
        if entry.file_type != FileType::Symlink {
            return Ok((current, entry));
        }
        let target = fs::read_link(&entry.source)
            .with_context(|| format!("Failed to read symlink {}", entry.source.display()))?;
        debug!("Following /{} -> {}", current.display(), target.display());
        current = if target.is_absolute() {
            normalize_path(&target)
        } else {
            normalize_path(&current.parent().unwrap_or(Path::new("")).join(target))
        };
    }
    bail!("too many levels of symbolic links at {}", rel.display())
}

fn extract_one(
    record: &ContainerRecord,
    stack: &LayerStack,
    requested: &str,
    destination: &Path,
    mtime: u64,
) -> Result<ExtractedFile> {
    let (rel, entry) = resolve(stack, Path::new(requested))?;
    let container_dir = destination.join(record.artifact_dir());

    let (kind, path) = match entry.file_type {
        FileType::File => {
            let target = container_dir.join(record.id()).join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(&entry.source, &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.source.display(), target.display())
            })?;
            (ExtractedKind::File, target)
        }
        FileType::Directory => {
            let view = stack
                .merged_view()
                .context("Failed to assemble container filesystem")?
                .restricted_to(&rel);
            fs::create_dir_all(&container_dir)
                .with_context(|| format!("Failed to create {}", container_dir.display()))?;
            let target = container_dir.join(format!(
                "{}_{}.tar.gz",
                record.id(),
                sanitize(requested)
            ));
            write_archive(&view, &target, mtime)?;
            (ExtractedKind::Archive, target)
        }
        FileType::Symlink | FileType::Other => {
            bail!("{} is not a regular file or directory", requested)
        }
    };

    let size = fs::metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(ExtractedFile {
        container_id: record.id().to_string(),
        requested: requested.to_string(),
        kind,
        sha256: sha256_file(&path)?,
        path,
        size,
    })
}

/// Extracts each requested absolute path from the container's merged view.
/// Missing or unsupported paths are per-path errors.
pub fn extract_paths(
    record: &ContainerRecord,
    paths: &[String],
    destination: &Path,
    started_at: DateTime<Utc>,
) -> ExtractOutcome {
    let stack = record.layer_stack();
    let mtime = started_at.timestamp().max(0) as u64;
    let mut outcome = ExtractOutcome::default();

    for requested in paths {
        match extract_one(record, &stack, requested, destination, mtime) {
            Ok(file) => {
                info!(
                    "Extracted {} from container {} to {}",
                    requested,
                    record.id(),
                    file.path.display()
                );
                outcome.files.push(file);
            }
            Err(e) => {
                warn!("Cannot extract {} from {}: {:#}", requested, record.id(), e);
                outcome.errors.push(ForensicsError::Extract {
                    container_id: record.id().to_string(),
                    path: requested.clone(),
                    reason: format!("{e:#}"),
                });
            }
        }
    }
    outcome
}
