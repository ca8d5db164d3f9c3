//! SHA-256 content digests for files found in container layers.
//!
//! Regular files hash their bytes, symlinks hash their target path (never the
//! file they point at), directories and special files have no digest.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::overlay::FileType;

/// Hex encoded SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Digest of an entry as it appears in a layer, by type.
pub fn content_digest(path: &Path, file_type: FileType) -> Result<Option<String>> {
    match file_type {
        FileType::File => sha256_file(path).map(Some),
        FileType::Symlink => {
            let target = fs::read_link(path)
                .with_context(|| format!("Failed to read symlink {}", path.display()))?;
            Ok(Some(sha256_bytes(target.as_os_str().as_bytes())))
        }
        FileType::Directory | FileType::Other => Ok(None),
    }
}

/// `sha256:<hex>` form used for layer and image identifiers.
pub fn prefixed(hex_digest: &str) -> String {
    if hex_digest.starts_with("sha256:") {
        hex_digest.to_string()
    } else {
        format!("sha256:{}", hex_digest)
    }
}
