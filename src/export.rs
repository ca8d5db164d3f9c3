//! Export container filesystems as `.tar.gz` archives or `.raw` ext4 images.
//!
//! Every artifact is built from the container's merged view (image layers plus
//! writable layer). Archive entries carry the job start time as mtime, atime
//! and ctime so two exports of the same container from the same job are
//! byte-comparable regardless of when each entry was written.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::ProgressBar;
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::Command;
use tar_rs as tar;

use crate::config::Config;
use crate::digest::sha256_file;
use crate::error::ForensicsError;
use crate::filter::{self, LabelFilter};
use crate::materialize::{materialize, MaterializeOptions};
use crate::overlay::{FileType, MergedView};
use crate::sources::{id_selected, ContainerRecord};
use crate::task::CancelToken;

pub const ARCHIVE_EXTENSION: &str = "tar.gz";
pub const DISK_IMAGE_EXTENSION: &str = "raw";

/// Per-entry allowance for inode and directory block overhead in disk images.
const ENTRY_OVERHEAD_BYTES: u64 = 4096;
const IMAGE_ALIGNMENT: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportKind {
    Archive,
    DiskImage,
}

impl ExportKind {
    pub fn extension(self) -> &'static str {
        match self {
            ExportKind::Archive => ARCHIVE_EXTENSION,
            ExportKind::DiskImage => DISK_IMAGE_EXTENSION,
        }
    }
}

/// Requested output kinds. A disk image is produced when nothing is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportKinds {
    pub archive: bool,
    pub disk_image: bool,
}

impl ExportKinds {
    pub fn new(archive: bool, disk_image: bool) -> Self {
        Self {
            archive,
            disk_image: disk_image || !archive,
        }
    }

    pub fn iter(self) -> impl Iterator<Item = ExportKind> {
        [
            (self.archive, ExportKind::Archive),
            (self.disk_image, ExportKind::DiskImage),
        ]
        .into_iter()
        .filter_map(|(wanted, kind)| wanted.then_some(kind))
    }
}

impl Default for ExportKinds {
    fn default() -> Self {
        Self::new(false, false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Targets {
    #[default]
    All,
    /// ID prefixes.
    Ids(Vec<String>),
}

impl Targets {
    pub fn selects(&self, id: &str) -> bool {
        match self {
            Targets::All => true,
            Targets::Ids(ids) => !ids.is_empty() && id_selected(id, ids),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportJob {
    pub targets: Targets,
    pub kinds: ExportKinds,
    pub label_filter: LabelFilter,
    pub excluded_namespaces: Vec<String>,
    pub destination: PathBuf,
    /// Captured once; stamped on every archive entry and disk image inode.
    pub started_at: DateTime<Utc>,
    pub image_slack_ratio: f64,
    pub image_min_slack_bytes: u64,
}

impl ExportJob {
    pub fn new(destination: impl Into<PathBuf>, kinds: ExportKinds, config: &Config) -> Self {
        Self {
            targets: Targets::All,
            kinds,
            label_filter: LabelFilter::default(),
            excluded_namespaces: config.excluded_namespaces.clone(),
            destination: destination.into(),
            started_at: Utc::now(),
            image_slack_ratio: config.image_slack_ratio,
            image_min_slack_bytes: config.image_min_slack_bytes,
        }
    }

    pub fn with_targets(mut self, targets: Targets) -> Self {
        self.targets = targets;
        self
    }

    pub fn with_label_filter(mut self, filter: LabelFilter) -> Self {
        self.label_filter = filter;
        self
    }

    pub fn with_excluded_namespaces(mut self, namespaces: Vec<String>) -> Self {
        self.excluded_namespaces = namespaces;
        self
    }

    fn timestamp(&self) -> u64 {
        self.started_at.timestamp().max(0) as u64
    }

    /// `<destination>/<disk>/<runtime>/<namespace>/<id>.<ext>`
    pub fn artifact_path(&self, record: &ContainerRecord, kind: ExportKind) -> PathBuf {
        self.destination
            .join(record.artifact_dir())
            .join(format!("{}.{}", record.id(), kind.extension()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedArtifact {
    pub container_id: String,
    pub kind: ExportKind,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Default)]
pub struct ExportOutcome {
    pub artifacts: Vec<ExportedArtifact>,
    /// Containers excluded by namespace or label filter.
    pub skipped: Vec<String>,
    pub errors: Vec<ForensicsError>,
}

/// Image size for `content_bytes` of data: content plus slack, rounded up to 1 MiB.
pub fn image_size(content_bytes: u64, slack_ratio: f64, min_slack_bytes: u64) -> u64 {
    let slack = ((content_bytes as f64) * slack_ratio.max(0.0)).ceil() as u64;
    let total = content_bytes + slack.max(min_slack_bytes);
    total.div_ceil(IMAGE_ALIGNMENT) * IMAGE_ALIGNMENT
}

fn stamp(header: &mut tar::Header, seconds: u64) {
    header.set_mtime(seconds);
    if let Some(gnu) = header.as_gnu_mut() {
        gnu.set_atime(seconds);
        gnu.set_ctime(seconds);
    }
}

fn append_view<W: Write>(builder: &mut tar::Builder<W>, view: &MergedView, mtime: u64) -> Result<()> {
    for (rel, entry) in view.iter() {
        let meta = fs::symlink_metadata(&entry.source)
            .with_context(|| format!("Failed to stat {}", entry.source.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(meta.uid() as u64);
        header.set_gid(meta.gid() as u64);
        header.set_size(0);
        stamp(&mut header, mtime);

        match entry.file_type {
            FileType::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                builder
                    .append_data(&mut header, rel, io::empty())
                    .with_context(|| format!("Failed to archive {}", rel.display()))?;
            }
            FileType::File => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(meta.len());
                let content = File::open(&entry.source)
                    .with_context(|| format!("Failed to open {}", entry.source.display()))?;
                builder
                    .append_data(&mut header, rel, content)
                    .with_context(|| format!("Failed to archive {}", rel.display()))?;
            }
            FileType::Symlink => {
                let target = fs::read_link(&entry.source)
                    .with_context(|| format!("Failed to read symlink {}", entry.source.display()))?;
                header.set_entry_type(tar::EntryType::Symlink);
                builder
                    .append_link(&mut header, rel, &target)
                    .with_context(|| format!("Failed to archive {}", rel.display()))?;
            }
            FileType::Other => {
                let ft = meta.file_type();
                let kind = if ft.is_char_device() {
                    tar::EntryType::Char
                } else if ft.is_block_device() {
                    tar::EntryType::Block
                } else if ft.is_fifo() {
                    tar::EntryType::Fifo
                } else {
                    debug!("Not archiving socket {}", rel.display());
                    continue;
                };
                header.set_entry_type(kind);
                if kind != tar::EntryType::Fifo {
                    header.set_device_major(rustix::fs::major(meta.rdev()))?;
                    header.set_device_minor(rustix::fs::minor(meta.rdev()))?;
                }
                builder
                    .append_data(&mut header, rel, io::empty())
                    .with_context(|| format!("Failed to archive {}", rel.display()))?;
            }
        }
    }
    Ok(())
}

/// Writes `view` as a gzip-compressed tarball at `dest`.
///
/// The archive is staged next to `dest` and only renamed into place once it
/// is complete, so a failed write leaves nothing behind.
pub fn write_archive(view: &MergedView, dest: &Path, mtime: u64) -> Result<()> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let staged = tempfile::Builder::new()
        .prefix(".cf-archive")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create archive in {}", dir.display()))?;

    {
        let encoder = GzEncoder::new(BufWriter::new(staged.as_file()), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        append_view(&mut builder, view, mtime)?;

        let encoder = builder.into_inner().context("Failed to finish tar stream")?;
        let writer = encoder.finish().context("Failed to finish gzip stream")?;
        writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush {}: {}", dest.display(), e.error()))?;
    }

    staged
        .as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync {}", dest.display()))?;
    staged
        .persist(dest)
        .map_err(|e| anyhow!("Failed to write {}: {}", dest.display(), e.error))?;
    Ok(())
}

/// Builds an ext4 image at `dest` holding the contents of `view`.
///
/// The view is first copied into a staging directory next to `dest`, then
/// `mkfs.ext4 -d` populates the image from it, so no mount is needed.
pub fn write_disk_image(view: &MergedView, dest: &Path, job: &ExportJob) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("No parent directory for {}", dest.display()))?;
    let staging = tempfile::Builder::new()
        .prefix(".cf-stage")
        .tempdir_in(parent)
        .context("Failed to create staging directory")?;

    let seconds = job.started_at.timestamp();
    let stats = materialize(
        view,
        staging.path(),
        MaterializeOptions {
            timestamp: Some(seconds),
        },
    )?;

    let content = stats.bytes + (stats.entries() + 1) * ENTRY_OVERHEAD_BYTES;
    let size = image_size(content, job.image_slack_ratio, job.image_min_slack_bytes);
    debug!(
        "Disk image {}: {} content bytes, {} total",
        dest.display(),
        content,
        size
    );

    File::create(dest)
        .and_then(|f| f.set_len(size))
        .with_context(|| format!("Failed to allocate {}", dest.display()))?;

    let inodes = (stats.entries() + 1024).to_string();
    let output = Command::new("mkfs.ext4")
        .args(["-q", "-F", "-O", "^has_journal", "-N", inodes.as_str(), "-d"])
        .arg(staging.path())
        .arg(dest)
        .env("E2FSPROGS_FAKE_TIME", seconds.to_string())
        .output()
        .context("Failed to execute mkfs.ext4")?;
    if !output.status.success() {
        let _ = fs::remove_file(dest);
        return Err(anyhow!(
            "mkfs.ext4 failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

fn artifact(record: &ContainerRecord, kind: ExportKind, path: PathBuf) -> Result<ExportedArtifact> {
    let size = fs::metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(ExportedArtifact {
        container_id: record.id().to_string(),
        kind,
        sha256: sha256_file(&path)?,
        path,
        size,
    })
}

fn export_one(job: &ExportJob, record: &ContainerRecord) -> Result<Vec<ExportedArtifact>> {
    let view = record
        .layer_stack()
        .merged_view()
        .context("Failed to assemble container filesystem")?;

    let mut artifacts = Vec::new();
    for kind in job.kinds.iter() {
        let path = job.artifact_path(record, kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        match kind {
            ExportKind::Archive => write_archive(&view, &path, job.timestamp())?,
            ExportKind::DiskImage => write_disk_image(&view, &path, job)?,
        }
        info!("Exported container {} to {}", record.id(), path.display());
        artifacts.push(artifact(record, kind, path)?);
    }
    Ok(artifacts)
}

/// Exports one container regardless of filters.
pub fn export_record(
    job: &ExportJob,
    record: &ContainerRecord,
) -> Result<Vec<ExportedArtifact>, ForensicsError> {
    export_one(job, record).map_err(|e| ForensicsError::export(record.id(), e))
}

/// Runs the job over `records`: target selection, filters, then one artifact
/// per requested kind. Per-container failures are collected, not returned.
///
/// The job's destination directory must already exist.
pub fn export(
    job: &ExportJob,
    records: &[ContainerRecord],
    cancel: &CancelToken,
    progress: Option<&ProgressBar>,
) -> Result<ExportOutcome, ForensicsError> {
    let mut outcome = ExportOutcome::default();
    for record in records.iter().filter(|r| job.targets.selects(r.id())) {
        cancel.check()?;
        if let Some(pb) = progress {
            pb.set_message(record.short_id().to_string());
        }

        if !filter::matches(record, &job.label_filter, &job.excluded_namespaces) {
            debug!("Container {} excluded by filters", record.id());
            outcome.skipped.push(record.id().to_string());
        } else {
            match export_record(job, record) {
                Ok(artifacts) => outcome.artifacts.extend(artifacts),
                Err(e) => {
                    warn!("{}", e);
                    outcome.errors.push(e);
                }
            }
        }

        if let Some(pb) = progress {
            pb.inc(1);
        }
    }
    Ok(outcome)
}
