//! Error taxonomy shared by every stage of a forensic task.
//!
//! Internals propagate `anyhow::Error` with context; anything that has to be
//! reported to the caller as a recoverable (or fatal) condition is turned into a
//! [`ForensicsError`] at the stage boundary.
//!
//! - **Fatal for the whole task**: [`NoUsableImage`], [`NoStorageLayout`], [`Cancelled`]
//! - **Fatal for one image**: [`UnsupportedFormat`], [`Mount`]
//! - **Fatal for one container**: [`Discovery`], [`DriftComputation`], [`Export`], [`Extract`]
//!
//! [`NoUsableImage`]: ForensicsError::NoUsableImage
//! [`NoStorageLayout`]: ForensicsError::NoStorageLayout
//! [`Cancelled`]: ForensicsError::Cancelled
//! [`UnsupportedFormat`]: ForensicsError::UnsupportedFormat
//! [`Mount`]: ForensicsError::Mount
//! [`Discovery`]: ForensicsError::Discovery
//! [`DriftComputation`]: ForensicsError::DriftComputation
//! [`Export`]: ForensicsError::Export
//! [`Extract`]: ForensicsError::Extract

use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ForensicsError {
    /// The input does not carry one of the accepted disk image extensions.
    #[error("unsupported disk image format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    /// Attaching or mounting the disk image failed.
    #[error("failed to mount {}: {reason}", path.display())]
    Mount { path: PathBuf, reason: String },

    /// Per-container metadata could not be interpreted.
    #[error("container {container_id}: {reason}")]
    Discovery { container_id: String, reason: String },

    #[error("drift computation failed for container {container_id}: {reason}")]
    DriftComputation { container_id: String, reason: String },

    #[error("export failed for container {container_id}: {reason}")]
    Export { container_id: String, reason: String },

    #[error("extraction of {path} failed for container {container_id}: {reason}")]
    Extract {
        container_id: String,
        path: String,
        reason: String,
    },

    #[error("invalid label filter clause '{0}', expected key=value")]
    InvalidFilter(String),

    #[error("none of the supplied disk images could be mounted")]
    NoUsableImage,

    #[error("no Docker or containerd storage layout found on any disk image")]
    NoStorageLayout,

    #[error("task cancelled")]
    Cancelled,
}

impl ForensicsError {
    pub fn discovery(container_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ForensicsError::Discovery {
            container_id: container_id.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn drift(container_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ForensicsError::DriftComputation {
            container_id: container_id.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn export(container_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ForensicsError::Export {
            container_id: container_id.into(),
            reason: format!("{err:#}"),
        }
    }

    pub fn mount(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        ForensicsError::Mount {
            path: path.into(),
            reason: format!("{err:#}"),
        }
    }

    /// Short machine-readable name used in JSON task results.
    pub fn kind(&self) -> &'static str {
        match self {
            ForensicsError::UnsupportedFormat { .. } => "unsupported_format",
            ForensicsError::Mount { .. } => "mount",
            ForensicsError::Discovery { .. } => "discovery",
            ForensicsError::DriftComputation { .. } => "drift_computation",
            ForensicsError::Export { .. } => "export",
            ForensicsError::Extract { .. } => "extract",
            ForensicsError::InvalidFilter(_) => "invalid_filter",
            ForensicsError::NoUsableImage => "no_usable_image",
            ForensicsError::NoStorageLayout => "no_storage_layout",
            ForensicsError::Cancelled => "cancelled",
        }
    }
}

/// A recoverable failure recorded next to successful results.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Failure {
    pub disk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub kind: String,
    pub message: String,
}

impl Failure {
    pub fn new(disk: impl Into<String>, err: &ForensicsError) -> Self {
        let container_id = match err {
            ForensicsError::Discovery { container_id, .. }
            | ForensicsError::DriftComputation { container_id, .. }
            | ForensicsError::Export { container_id, .. }
            | ForensicsError::Extract { container_id, .. } => Some(container_id.clone()),
            _ => None,
        };
        Self {
            disk: disk.into(),
            container_id,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
