//! Pre-removal validation of installed files against an artefact archive.
//!
//! Before an artefact is deleted from a server directory every payload file
//! is compared with its archived copy, so files changed out-of-band (by an
//! admin or by the running server) are not thrown away blindly.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::archive::{read_entries, sha256_hex};
use crate::dispatcher::WorkerDispatcher;
use crate::manifest::{Equality, Manifest};

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub path: String,
    pub reason: FailureReason,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// Declared by the manifest but absent from the server directory.
    Missing,
    HashMismatch { expected: String, actual: String },
    /// Structural (JSON/YAML) comparison found a semantic difference.
    ContentMismatch,
    /// Structural comparison needs the archived copy, which is absent.
    NotInArchive,
    Unreadable(String),
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            FailureReason::Missing => write!(f, "{}: missing on disk", self.path),
            FailureReason::HashMismatch { expected, actual } => write!(
                f,
                "{}: hash mismatch (expected {}, found {})",
                self.path, expected, actual
            ),
            FailureReason::ContentMismatch => write!(f, "{}: content differs", self.path),
            FailureReason::NotInArchive => write!(f, "{}: not found in archive", self.path),
            FailureReason::Unreadable(e) => write!(f, "{}: unreadable ({})", self.path, e),
        }
    }
}

/// Compare one installed file with what the artefact shipped.
pub fn compare(
    equality: Equality,
    on_disk: &[u8],
    archived: Option<&[u8]>,
    expected_hash: &str,
) -> std::result::Result<(), FailureReason> {
    match equality {
        Equality::Noop => Ok(()),
        Equality::Hash => {
            let actual = sha256_hex(on_disk);
            if actual.eq_ignore_ascii_case(expected_hash) {
                Ok(())
            } else {
                Err(FailureReason::HashMismatch {
                    expected: expected_hash.to_string(),
                    actual,
                })
            }
        }
        Equality::Json => {
            let archived = archived.ok_or(FailureReason::NotInArchive)?;
            let disk: serde_json::Value = serde_json::from_slice(on_disk)
                .map_err(|e| FailureReason::Unreadable(e.to_string()))?;
            let shipped: serde_json::Value = serde_json::from_slice(archived)
                .map_err(|e| FailureReason::Unreadable(format!("archived copy: {}", e)))?;
            if disk == shipped {
                Ok(())
            } else {
                Err(FailureReason::ContentMismatch)
            }
        }
        Equality::Yaml => {
            let archived = archived.ok_or(FailureReason::NotInArchive)?;
            let disk: serde_yaml_ng::Value = serde_yaml_ng::from_slice(on_disk)
                .map_err(|e| FailureReason::Unreadable(e.to_string()))?;
            let shipped: serde_yaml_ng::Value = serde_yaml_ng::from_slice(archived)
                .map_err(|e| FailureReason::Unreadable(format!("archived copy: {}", e)))?;
            if disk == shipped {
                Ok(())
            } else {
                Err(FailureReason::ContentMismatch)
            }
        }
    }
}

/// Validate every payload file of `manifest` under `server_dir`.
///
/// Per-file comparisons run on `workers`. Returns all failures; an empty
/// list means the installed copy is untouched.
pub async fn validate_installed(
    workers: &WorkerDispatcher<Option<ValidationFailure>>,
    manifest: &Manifest,
    archive: &Path,
    server_dir: &Path,
) -> Result<Vec<ValidationFailure>> {
    let structural: BTreeSet<String> = manifest
        .payload_files()
        .filter(|p| matches!(manifest.equality_for(p), Equality::Json | Equality::Yaml))
        .map(str::to_string)
        .collect();
    let archived: HashMap<String, Vec<u8>> = if structural.is_empty() {
        HashMap::new()
    } else {
        let archive = archive.to_path_buf();
        tokio::task::spawn_blocking(move || read_entries(&archive, &structural))
            .await
            .context("archive reader task failed")??
    };
    let archived = Arc::new(archived);

    let mut handles = Vec::new();
    for (path, expected_hash) in &manifest.hashes {
        let equality = manifest.equality_for(path);
        let path = path.clone();
        let expected_hash = expected_hash.clone();
        let on_disk_path = server_dir.join(&path);
        let archived = archived.clone();
        let handle = workers
            .dispatch(move || async move {
                let on_disk = match tokio::fs::read(&on_disk_path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(Some(ValidationFailure {
                            path,
                            reason: FailureReason::Missing,
                        }));
                    }
                    Err(e) => {
                        return Ok(Some(ValidationFailure {
                            path,
                            reason: FailureReason::Unreadable(e.to_string()),
                        }));
                    }
                };
                let shipped = archived.get(&path).map(Vec::as_slice);
                Ok(compare(equality, &on_disk, shipped, &expected_hash)
                    .err()
                    .map(|reason| ValidationFailure { path, reason }))
            })
            .await?;
        handles.push(handle);
    }

    let mut failures = Vec::new();
    for handle in handles {
        if let Some(failure) = handle.await? {
            failures.push(failure);
        }
    }
    debug!(
        "Validated {} file(s) of {}: {} failure(s)",
        manifest.hashes.len(),
        manifest.label(),
        failures.len()
    );
    Ok(failures)
}
