//! JSON outputs, markdown reports and the user-facing task log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::drift::{DriftKind, DriftReport};
use crate::error::Failure;
use crate::export::ExportedArtifact;
use crate::extract::ExtractedFile;
use crate::layout::RuntimeKind;
use crate::overlay::FileType;
use crate::sources::ContainerRecord;

/// One row of the container listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSummary {
    pub namespace: String,
    pub id: String,
    pub hostname: String,
    pub image: String,
    pub runtime: RuntimeKind,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
    pub storage_root: PathBuf,
    pub source_disk: String,
}

impl From<&ContainerRecord> for ContainerSummary {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            namespace: record.namespace().to_string(),
            id: record.id().to_string(),
            hostname: record.hostname().unwrap_or_default().to_string(),
            image: record.image().unwrap_or_default().to_string(),
            runtime: record.runtime(),
            created: record.created(),
            updated: record.updated(),
            labels: record.labels().clone(),
            storage_root: record.storage_root().to_path_buf(),
            source_disk: record.source_disk().to_string(),
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize report")?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

const DRIFT_CSV_HEADER: &[&str] = &[
    "source_disk",
    "runtime",
    "namespace",
    "container_id",
    "path",
    "kind",
    "file_type",
    "sha256",
    "base_sha256",
    "mode",
    "size",
    "modified",
];

/// One drift entry flattened with the container it belongs to.
#[derive(Serialize)]
struct DriftRow<'a> {
    source_disk: &'a str,
    runtime: RuntimeKind,
    namespace: &'a str,
    container_id: &'a str,
    path: &'a str,
    kind: DriftKind,
    file_type: FileType,
    sha256: Option<&'a str>,
    base_sha256: Option<&'a str>,
    mode: u32,
    size: u64,
    modified: Option<DateTime<Utc>>,
}

/// Writes every drift entry of every report as one CSV row. The header is
/// written even when nothing drifted.
pub fn write_drift_csv(path: &Path, reports: &[DriftReport]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer
        .write_record(DRIFT_CSV_HEADER)
        .context("Failed to write CSV header")?;

    for report in reports {
        for entry in &report.entries {
            writer
                .serialize(DriftRow {
                    source_disk: &report.source_disk,
                    runtime: report.runtime,
                    namespace: &report.namespace,
                    container_id: &report.container_id,
                    path: &entry.path,
                    kind: entry.kind,
                    file_type: entry.file_type,
                    sha256: entry.sha256.as_deref(),
                    base_sha256: entry.base_sha256.as_deref(),
                    mode: entry.mode,
                    size: entry.size,
                    modified: entry.modified,
                })
                .with_context(|| format!("Failed to write drift row for {}", entry.path))?;
        }
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn cell(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.replace('|', "\\|").replace('\n', " ")
    }
}

fn time_cell(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}

fn push_failures(markdown: &mut String, failures: &[Failure]) {
    if failures.is_empty() {
        return;
    }
    markdown.push_str("\n## Failures\n\n");
    markdown.push_str("| Disk | Container | Kind | Message |\n");
    markdown.push_str("|------|-----------|------|---------|\n");
    for failure in failures {
        markdown.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            cell(&failure.disk),
            cell(failure.container_id.as_deref().unwrap_or_default()),
            failure.kind,
            cell(&failure.message)
        ));
    }
}

pub fn listing_markdown(records: &[ContainerRecord], failures: &[Failure]) -> String {
    let mut markdown = String::from("# Container Listing\n\n");

    if records.is_empty() {
        markdown.push_str("No containers found.\n");
    } else {
        markdown.push_str(
            "| Namespace | ID | Hostname | Image | Container Runtime | Created | Updated |\n",
        );
        markdown.push_str(
            "|-----------|----|----------|-------|-------------------|---------|---------|\n",
        );
        for record in records {
            markdown.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                cell(record.namespace()),
                cell(record.id()),
                cell(record.hostname().unwrap_or_default()),
                cell(record.image().unwrap_or_default()),
                record.runtime(),
                time_cell(record.created()),
                time_cell(record.updated())
            ));
        }
    }

    push_failures(&mut markdown, failures);
    markdown
}

pub fn drift_markdown(reports: &[DriftReport], failures: &[Failure]) -> String {
    let mut markdown = String::from("# Container Drift Report\n\n");

    let total: usize = reports.iter().map(|r| r.entries.len()).sum();
    markdown.push_str(&format!("- {} containers checked\n", reports.len()));
    markdown.push_str(&format!("- {} files added, modified, or deleted\n", total));

    if !reports.is_empty() {
        markdown.push_str("\n## Summary\n\n");
        markdown.push_str("| Namespace | Container | Runtime | Added | Modified | Deleted |\n");
        markdown.push_str("|-----------|-----------|---------|-------|----------|---------|\n");
        for report in reports {
            let summary = report.summary();
            markdown.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                cell(&report.namespace),
                cell(&report.container_id),
                report.runtime,
                summary.added,
                summary.modified,
                summary.deleted
            ));
        }
    }

    push_failures(&mut markdown, failures);
    markdown
}

pub fn export_markdown(
    artifacts: &[ExportedArtifact],
    skipped: &[String],
    failures: &[Failure],
) -> String {
    let mut markdown = String::from("# Container Export Report\n\n");

    if artifacts.is_empty() {
        markdown.push_str("No container exported.\n");
    } else {
        for artifact in artifacts {
            markdown.push_str(&format!(
                "- Exported container output file {} ({} bytes, sha256 `{}`)\n",
                artifact.path.display(),
                artifact.size,
                artifact.sha256
            ));
        }
    }

    if !skipped.is_empty() {
        markdown.push_str(&format!(
            "\n{} containers skipped by namespace or label filter: {}\n",
            skipped.len(),
            skipped.join(", ")
        ));
    }

    push_failures(&mut markdown, failures);
    markdown
}

pub fn extract_markdown(files: &[ExtractedFile], failures: &[Failure]) -> String {
    let mut markdown = String::from("# Container File Extraction Report\n\n");
    markdown.push_str(&format!("- {} output files created\n", files.len()));
    for file in files {
        markdown.push_str(&format!(
            "- `{}` from container {} as {}\n",
            file.requested,
            file.container_id,
            file.path.display()
        ));
    }
    push_failures(&mut markdown, failures);
    markdown
}

/// Appends user-relevant lines to a log file. Write failures are logged and
/// otherwise ignored.
#[derive(Debug, Clone)]
pub struct TaskLog {
    path: Option<PathBuf>,
}

impl TaskLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// A log that discards every line.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entry(&self, message: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", message));
        if let Err(e) = written {
            error!("Failed to write to log file {}: {}", path.display(), e);
            info!("Original log message: {}", message);
        }
    }
}
