//! Batch orchestration over one or more disk images.
//!
//! A [`Task`] walks its disk images in order. For each image it checks the
//! format, mounts it, resolves storage roots on every mounted filesystem,
//! discovers containers and hands them to the requested operation. The mount
//! is always released before moving on, including when the operation fails or
//! the task is cancelled. Failures that affect a single image or container are
//! recorded in [`TaskResult::failures`] and the batch continues.

use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::disk::{self, DiskImage, Mounter};
use crate::drift::{detect_drift, DriftReport};
use crate::error::{Failure, ForensicsError};
use crate::export::{self, ExportJob, ExportedArtifact};
use crate::extract::{extract_paths, ExtractedFile};
use crate::layout;
use crate::notifier::Notifier;
use crate::report::TaskLog;
use crate::sources::{discover, ContainerRecord, Discovery, MetadataExtractor};

/// Shared cancellation flag, checked between containers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ForensicsError> {
        if self.is_cancelled() {
            Err(ForensicsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Successful results of a batch plus everything that was skipped.
#[derive(Debug, Serialize)]
pub struct TaskResult<T> {
    pub items: Vec<T>,
    /// Container IDs excluded by namespace or label filters.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    pub failures: Vec<Failure>,
}

impl<T> Default for TaskResult<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> TaskResult<T> {
    fn fail(&mut self, disk: &str, err: &ForensicsError) {
        self.failures.push(Failure::new(disk, err));
    }
}

pub struct Task<'a> {
    config: &'a Config,
    mounter: &'a dyn Mounter,
    explorer: &'a dyn MetadataExtractor,
    custom_paths: Vec<PathBuf>,
    container_ids: Vec<String>,
    cancel: CancelToken,
    notifier: Option<&'a Notifier>,
    log: TaskLog,
}

impl<'a> Task<'a> {
    pub fn new(
        config: &'a Config,
        mounter: &'a dyn Mounter,
        explorer: &'a dyn MetadataExtractor,
    ) -> Self {
        Self {
            config,
            mounter,
            explorer,
            custom_paths: Vec::new(),
            container_ids: Vec::new(),
            cancel: CancelToken::new(),
            notifier: None,
            log: TaskLog::disabled(),
        }
    }

    /// Storage root locations, relative to each mounted filesystem, that
    /// replace the default Docker and containerd locations.
    pub fn with_custom_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.custom_paths = paths;
        self
    }

    /// Restrict discovery to containers whose ID starts with one of `ids`.
    pub fn with_container_ids(mut self, ids: Vec<String>) -> Self {
        self.container_ids = ids;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_notifier(mut self, notifier: &'a Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_log(mut self, log: TaskLog) -> Self {
        self.log = log;
        self
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn info(&self, message: &str) {
        self.log.entry(message);
        match self.notifier {
            Some(notifier) => notifier.info(message),
            None => log::info!("{}", message),
        }
    }

    fn warn(&self, message: &str) {
        self.log.entry(message);
        match self.notifier {
            Some(notifier) => notifier.warn(message),
            None => log::warn!("{}", message),
        }
    }

    fn discover_all(&self, label: &str, mountpoints: &[PathBuf]) -> Option<Discovery> {
        let roots = layout::resolve_all(
            mountpoints.iter().map(|m| (m.as_path(), label)),
            &self.custom_paths,
        );
        if roots.is_empty() {
            self.warn(&format!("No container storage found on {}", label));
            return None;
        }

        let mut discovery = Discovery::default();
        for root in &roots {
            self.info(&format!(
                "Reading {} storage at {}",
                root.kind,
                root.path.display()
            ));
            discovery.extend(discover(root, self.explorer, &self.container_ids));
        }
        Some(discovery)
    }

    /// Runs `op` against the containers of every disk image in `disks`.
    fn for_each_disk<T, F>(&self, disks: &[PathBuf], mut op: F) -> Result<TaskResult<T>, ForensicsError>
    where
        F: FnMut(&str, &[ContainerRecord], &mut TaskResult<T>) -> Result<(), ForensicsError>,
    {
        let mut result = TaskResult::default();
        let mut mounted_any = false;
        let mut found_layout = false;

        for path in disks {
            self.cancel.check()?;

            let image = match DiskImage::open(path) {
                Ok(image) => image,
                Err(e) => {
                    self.warn(&e.to_string());
                    result.fail(&disk_label(path), &e);
                    continue;
                }
            };
            let label = image.label();
            self.info(&format!("Processing disk {}", label));

            let mut handle = match disk::mount(&image, self.mounter) {
                Ok(handle) => handle,
                Err(e) => {
                    self.warn(&e.to_string());
                    result.fail(&label, &e);
                    continue;
                }
            };
            mounted_any = true;

            let operated = match self.discover_all(&label, handle.mountpoints()) {
                Some(discovery) => {
                    found_layout = true;
                    for warning in &discovery.warnings {
                        self.warn(&warning.to_string());
                        let failure = match &warning.container_id {
                            Some(id) => {
                                let err = ForensicsError::discovery(id, &warning.reason);
                                Failure::new(&label, &err)
                            }
                            None => Failure {
                                disk: label.clone(),
                                container_id: None,
                                kind: "discovery".to_string(),
                                message: warning.to_string(),
                            },
                        };
                        result.failures.push(failure);
                    }
                    self.info(&format!(
                        "Found {} containers on {}",
                        discovery.records.len(),
                        label
                    ));
                    op(&label, &discovery.records, &mut result)
                }
                None => Ok(()),
            };

            if let Err(e) = handle.unmount() {
                self.warn(&e.to_string());
                result.fail(&label, &e);
            }
            operated?;
            self.info(&format!("Done processing disk {}", label));
        }

        if !mounted_any {
            return Err(ForensicsError::NoUsableImage);
        }
        if !found_layout {
            return Err(ForensicsError::NoStorageLayout);
        }
        Ok(result)
    }

    fn progress_bar(&self, len: usize, label: &str) -> Option<indicatif::ProgressBar> {
        self.notifier
            .and_then(|n| n.create_progress_bar(len as u64, label))
    }

    /// Lists every discovered container.
    pub fn run_list(&self, disks: &[PathBuf]) -> Result<TaskResult<ContainerRecord>, ForensicsError> {
        self.for_each_disk(disks, |_, records, result| {
            result.items.extend(records.iter().cloned());
            Ok(())
        })
    }

    /// Computes a drift report for every discovered container.
    pub fn run_drift(&self, disks: &[PathBuf]) -> Result<TaskResult<DriftReport>, ForensicsError> {
        self.for_each_disk(disks, |label, records, result| {
            let progress = self.progress_bar(records.len(), label);
            for record in records {
                self.cancel.check()?;
                match detect_drift(record) {
                    Ok(report) => {
                        let summary = report.summary();
                        self.info(&format!(
                            "Container {}: {} added, {} modified, {} deleted",
                            record.short_id(),
                            summary.added,
                            summary.modified,
                            summary.deleted
                        ));
                        result.items.push(report);
                    }
                    Err(e) => {
                        self.warn(&e.to_string());
                        result.fail(label, &e);
                    }
                }
                if let Some(pb) = &progress {
                    pb.inc(1);
                }
            }
            if let Some(pb) = progress {
                pb.finish_and_clear();
            }
            Ok(())
        })
    }

    /// Exports the containers selected by `job`. The destination directory
    /// must exist.
    pub fn run_export(
        &self,
        disks: &[PathBuf],
        job: &ExportJob,
    ) -> Result<TaskResult<ExportedArtifact>, ForensicsError> {
        self.for_each_disk(disks, |label, records, result| {
            let progress = self.progress_bar(records.len(), label);
            let outcome = export::export(job, records, &self.cancel, progress.as_ref());
            if let Some(pb) = progress {
                pb.finish_and_clear();
            }
            let outcome = outcome?;

            for artifact in &outcome.artifacts {
                self.info(&format!(
                    "Exported container output file {}",
                    artifact.path.display()
                ));
            }
            for e in &outcome.errors {
                self.warn(&e.to_string());
                result.fail(label, e);
            }
            result.items.extend(outcome.artifacts);
            result.skipped.extend(outcome.skipped);
            Ok(())
        })
    }

    /// Copies `paths` out of every discovered container into `destination`.
    pub fn run_extract(
        &self,
        disks: &[PathBuf],
        paths: &[String],
        destination: &Path,
    ) -> Result<TaskResult<ExtractedFile>, ForensicsError> {
        let started_at = Utc::now();
        self.for_each_disk(disks, |label, records, result| {
            for record in records {
                self.cancel.check()?;
                let outcome = extract_paths(record, paths, destination, started_at);
                for e in &outcome.errors {
                    self.warn(&e.to_string());
                    result.fail(label, e);
                }
                result.items.extend(outcome.files);
            }
            Ok(())
        })
    }
}

fn disk_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
