//! Replays a merged container view into a plain directory tree.

use anyhow::{Context, Result};
use log::{debug, warn};
use rustix::fs::{AtFlags, Mode, Timespec, Timestamps, CWD};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::overlay::{FileType, MergedView};

/// What a materialization wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub special: u64,
    pub skipped: u64,
    /// Sum of regular file sizes.
    pub bytes: u64,
}

impl MaterializeStats {
    pub fn entries(&self) -> u64 {
        self.files + self.directories + self.symlinks + self.special
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MaterializeOptions {
    /// Seconds since the epoch applied as atime and mtime to every entry.
    pub timestamp: Option<i64>,
}

fn set_times(path: &Path, seconds: i64) -> Result<()> {
    let at = Timespec {
        tv_sec: seconds,
        tv_nsec: 0,
    };
    let times = Timestamps {
        last_access: at,
        last_modification: at,
    };
    rustix::fs::utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW)
        .with_context(|| format!("Failed to set timestamps on {}", path.display()))
}

/// Ownership can only be carried over when running as root.
fn copy_owner(meta: &fs::Metadata, target: &Path) {
    if let Err(e) = std::os::unix::fs::lchown(target, Some(meta.uid()), Some(meta.gid())) {
        if e.kind() != ErrorKind::PermissionDenied {
            debug!("Failed to chown {}: {}", target.display(), e);
        }
    }
}

fn make_special(meta: &fs::Metadata, target: &Path) -> Result<()> {
    let mode = meta.mode();
    rustix::fs::mknodat(
        CWD,
        target,
        rustix::fs::FileType::from_raw_mode(mode),
        Mode::from_raw_mode(mode & 0o7777),
        meta.rdev(),
    )
    .with_context(|| format!("Failed to create special file {}", target.display()))
}

/// Writes every entry of `view` under `dest`, which must exist.
pub fn materialize(
    view: &MergedView,
    dest: &Path,
    options: MaterializeOptions,
) -> Result<MaterializeStats> {
    let mut stats = MaterializeStats::default();
    // Directory modes are applied last so read-only directories can still be filled.
    let mut directories: Vec<(PathBuf, u32)> = Vec::new();

    for (rel, entry) in view.iter() {
        let target = dest.join(rel);
        let meta = fs::symlink_metadata(&entry.source)
            .with_context(|| format!("Failed to stat {}", entry.source.display()))?;

        match entry.file_type {
            FileType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("Failed to create directory {}", target.display()))?;
                directories.push((target.clone(), meta.mode() & 0o7777));
                stats.directories += 1;
            }
            FileType::File => {
                fs::copy(&entry.source, &target).with_context(|| {
                    format!(
                        "Failed to copy {} to {}",
                        entry.source.display(),
                        target.display()
                    )
                })?;
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode() & 0o7777))
                    .with_context(|| format!("Failed to set mode on {}", target.display()))?;
                stats.files += 1;
                stats.bytes += meta.len();
            }
            FileType::Symlink => {
                let link = fs::read_link(&entry.source)
                    .with_context(|| format!("Failed to read symlink {}", entry.source.display()))?;
                std::os::unix::fs::symlink(&link, &target).with_context(|| {
                    format!("Failed to create symlink {}", target.display())
                })?;
                stats.symlinks += 1;
            }
            FileType::Other => {
                if let Err(e) = make_special(&meta, &target) {
                    warn!("Skipping {}: {:#}", rel.display(), e);
                    stats.skipped += 1;
                    continue;
                }
                stats.special += 1;
            }
        }

        copy_owner(&meta, &target);
        if let (Some(seconds), false) = (options.timestamp, entry.file_type.is_dir()) {
            set_times(&target, seconds)?;
        }
    }

    for (dir, mode) in directories.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(*mode))
            .with_context(|| format!("Failed to set mode on {}", dir.display()))?;
        if let Some(seconds) = options.timestamp {
            set_times(dir, seconds)?;
        }
    }

    debug!(
        "Materialized {} entries ({} bytes) into {}",
        stats.entries(),
        stats.bytes,
        dest.display()
    );
    Ok(stats)
}
