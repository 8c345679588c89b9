//! Operator-side artefact swaps.
//!
//! One mismatch is applied in a fixed order: validate what is about to be
//! removed, fetch what is about to be installed, delete, unpack, report. A
//! failed unpack is rolled back on a best-effort basis and the controller is
//! only told about state that is already on disk.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::{self, normalize_entry_path};
use crate::container::ContainerRuntime;
use crate::controller_client::ControllerApi;
use crate::dispatcher::WorkerDispatcher;
use crate::download::{DownloadCoordinator, DownloadError};
use crate::manifest::Manifest;
use crate::model::{
    AppliedMismatch, ArtefactModel, ArtefactVersionMismatch, MismatchFailure, UpdateReport,
};
use crate::validation::{validate_installed, ValidationFailure};

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("server {server} is running, refusing changes that require a restart")]
    ServerRunning { server: Uuid },

    #[error("{} installed file(s) of {artefact} differ from the archive", .failures.len())]
    Validation {
        artefact: String,
        failures: Vec<ValidationFailure>,
    },

    #[error("manifest of {artefact} unavailable: {message}")]
    MissingManifest { artefact: String, message: String },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error("reading archive of {artefact} failed: {message}")]
    Archive { artefact: String, message: String },

    #[error("unpacking {artefact} failed: {message}")]
    Unpack { artefact: String, message: String },

    #[error("controller request failed: {0:#}")]
    Controller(anyhow::Error),

    #[error("container runtime failed: {0:#}")]
    Container(anyhow::Error),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct DeploymentUpdateExecutor {
    controller: Arc<dyn ControllerApi>,
    runtime: Arc<dyn ContainerRuntime>,
    downloads: Arc<DownloadCoordinator>,
    validators: WorkerDispatcher<Option<ValidationFailure>>,
    data_root: PathBuf,
    strict_validation: bool,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeploymentUpdateExecutor {
    pub fn new(
        controller: Arc<dyn ControllerApi>,
        runtime: Arc<dyn ContainerRuntime>,
        downloads: Arc<DownloadCoordinator>,
        validators: WorkerDispatcher<Option<ValidationFailure>>,
        data_root: impl Into<PathBuf>,
        strict_validation: bool,
    ) -> Self {
        Self {
            controller,
            runtime,
            downloads,
            validators,
            data_root: data_root.into(),
            strict_validation,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_directory(&self, server: Uuid) -> PathBuf {
        self.data_root.join(server.to_string())
    }

    /// Serializes every disk mutation of one server directory.
    async fn lock_server(&self, server: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(server).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Apply every outstanding mismatch of `server`.
    ///
    /// With `requires_restart` the server must be stopped and all mismatches
    /// are applied; without it only restart-free ones are. A failing mismatch
    /// is recorded in the report and does not stop the others.
    pub async fn reconcile(
        &self,
        server: Uuid,
        requires_restart: bool,
    ) -> Result<UpdateReport, UpdateError> {
        let _guard = self.lock_server(server).await;

        if requires_restart
            && self
                .runtime
                .is_running(server)
                .await
                .map_err(UpdateError::Container)?
        {
            return Err(UpdateError::ServerRunning { server });
        }

        let filter = if requires_restart { None } else { Some(false) };
        let mismatches = self
            .controller
            .mismatches(server, filter)
            .await
            .map_err(UpdateError::Controller)?;
        info!(
            "🔍 Server {}: {} mismatch(es) to apply (requires restart: {})",
            server,
            mismatches.len(),
            requires_restart
        );

        let dir = self.server_directory(server);
        let mut report = UpdateReport::default();
        for mismatch in &mismatches {
            let identifier = mismatch.identifier().to_string();
            match self.apply_locked(server, &dir, mismatch).await {
                Ok(installed) => report.applied.push(AppliedMismatch {
                    identifier,
                    installed,
                }),
                Err(e) => {
                    error!("❌ Server {}: {} not applied: {}", server, identifier, e);
                    report.failures.push(MismatchFailure {
                        identifier,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Apply a single mismatch. Returns the artefact now installed for its
    /// identifier, `None` after an uninstall.
    pub async fn apply(
        &self,
        server: Uuid,
        mismatch: &ArtefactVersionMismatch,
    ) -> Result<Option<Uuid>, UpdateError> {
        let _guard = self.lock_server(server).await;
        let dir = self.server_directory(server);
        self.apply_locked(server, &dir, mismatch).await
    }

    async fn apply_locked(
        &self,
        server: Uuid,
        dir: &Path,
        mismatch: &ArtefactVersionMismatch,
    ) -> Result<Option<Uuid>, UpdateError> {
        let to_install = mismatch.to_install();
        let to_uninstall = mismatch.to_uninstall();

        // 1. what is installed now must still match its archive
        let removal = match to_uninstall {
            Some(old) => Some((old, self.validate_removal(old, dir).await?)),
            None => None,
        };

        // 2. fetch the replacement before touching the disk
        let incoming = match to_install {
            Some(new) => Some((new, self.fetch_archive(new).await?)),
            None => None,
        };

        // 3. remove the old artefact
        if let Some((old, manifest)) = &removal {
            let removed = remove_artefact_files_blocking(dir, manifest).await?;
            info!("🗑️  Removed {} file(s) of {} from {}", removed, old.label(), dir.display());
        }

        // 4. unpack the new one
        if let Some((new, archive_path)) = &incoming {
            if let Err(message) = unpack_blocking(archive_path, dir).await {
                error!("❌ Unpacking {} into {} failed: {}", new.label(), dir.display(), message);
                self.rollback(dir, new, archive_path, removal.as_ref().map(|(old, _)| *old))
                    .await;
                return Err(UpdateError::Unpack {
                    artefact: new.label(),
                    message,
                });
            }
            info!("📦 Installed {} into {}", new.label(), dir.display());
        }

        // 5. disk is settled, tell the controller
        let installed = to_install.map(|a| a.uuid);
        self.controller
            .report_installed(server, mismatch.identifier(), installed)
            .await
            .map_err(UpdateError::Controller)?;
        info!(
            "✅ Server {}: IS {} -> {}",
            server,
            mismatch.identifier(),
            to_install.map_or("<none>".to_string(), |a| a.label())
        );
        Ok(installed)
    }

    async fn fetch_archive(&self, artefact: &ArtefactModel) -> Result<PathBuf, UpdateError> {
        let url = self.controller.download_url(artefact.uuid);
        let path = self
            .downloads
            .download(&url, &format!("{}.tar.gz", artefact.uuid))
            .await?;
        Ok(path)
    }

    async fn validate_removal(
        &self,
        artefact: &ArtefactModel,
        dir: &Path,
    ) -> Result<Manifest, UpdateError> {
        let archive_path = self.fetch_archive(artefact).await?;
        let manifest = self.controller.manifest(artefact.uuid).await.map_err(|e| {
            UpdateError::MissingManifest {
                artefact: artefact.label(),
                message: format!("{:#}", e),
            }
        })?;
        let failures = validate_installed(&self.validators, &manifest, &archive_path, dir)
            .await
            .map_err(|e| UpdateError::Archive {
                artefact: artefact.label(),
                message: format!("{:#}", e),
            })?;
        if !failures.is_empty() {
            if self.strict_validation {
                return Err(UpdateError::Validation {
                    artefact: artefact.label(),
                    failures,
                });
            }
            for failure in &failures {
                warn!("⚠️  {} validation: {} (removing anyway)", artefact.label(), failure);
            }
        }
        Ok(manifest)
    }

    /// Undo a failed unpack: drop what the new artefact managed to write and
    /// put the previous artefact back if one was removed. Errors are logged.
    async fn rollback(
        &self,
        dir: &Path,
        failed: &ArtefactModel,
        failed_archive: &Path,
        previous: Option<&ArtefactModel>,
    ) {
        warn!("🔙 Rolling back {} in {}", failed.label(), dir.display());
        let archive_path = failed_archive.to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || archive::read_manifest(&archive_path))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        match manifest {
            Ok(manifest) => match remove_artefact_files_blocking(dir, &manifest).await {
                Ok(removed) => info!("🔙 Removed {} partially written file(s)", removed),
                Err(e) => error!("❌ Cleaning up {} failed: {}", failed.label(), e),
            },
            Err(e) => error!(
                "❌ Cannot read manifest of {}, partial files stay: {:#}",
                failed.label(),
                e
            ),
        }

        let Some(previous) = previous else {
            return;
        };
        let restored = match self.fetch_archive(previous).await {
            Ok(archive_path) => unpack_blocking(&archive_path, dir).await,
            Err(e) => Err(e.to_string()),
        };
        match restored {
            Ok(()) => info!("🔙 Restored {} in {}", previous.label(), dir.display()),
            Err(e) => error!("❌ Restoring {} failed: {}", previous.label(), e),
        }
    }
}

async fn unpack_blocking(archive_path: &Path, dir: &Path) -> Result<(), String> {
    let archive_path = archive_path.to_path_buf();
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &dir))
        .await
        .map_err(|e| e.to_string())?
        .map(|_| ())
        .map_err(|e| format!("{:#}", e))
}

async fn remove_artefact_files_blocking(dir: &Path, manifest: &Manifest) -> Result<usize, UpdateError> {
    let dir = dir.to_path_buf();
    let manifest = manifest.clone();
    let context = format!("removing {} from {}", manifest.label(), dir.display());
    tokio::task::spawn_blocking(move || remove_artefact_files(&dir, &manifest))
        .await
        .map_err(|e| UpdateError::Io {
            context: context.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?
        .map_err(|source| UpdateError::Io { context, source })
}

/// Delete the payload files of `manifest` below `dir`, then prune parent
/// directories left empty, except protected ones and `dir` itself.
/// Files that are already gone are skipped. Returns the number deleted.
pub fn remove_artefact_files(dir: &Path, manifest: &Manifest) -> std::io::Result<usize> {
    let protected = manifest.protected_directories();
    let mut parents = BTreeSet::new();
    let mut removed = 0;

    for path in manifest.payload_files() {
        let Some(relative) = normalize_entry_path(Path::new(path)) else {
            continue;
        };
        let full = dir.join(&relative);
        match fs::symlink_metadata(&full) {
            Ok(metadata) if !metadata.is_dir() => {
                fs::remove_file(&full)?;
                removed += 1;
            }
            // a directory where a file was expected, or nothing at all
            Ok(_) | Err(_) => {}
        }
        for ancestor in relative.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() {
                parents.insert(ancestor.to_path_buf());
            }
        }
    }

    let mut candidates: Vec<PathBuf> = parents.into_iter().collect();
    candidates.sort_by_key(|p| Reverse(p.components().count()));
    for candidate in candidates {
        if protected.contains(&candidate) {
            continue;
        }
        let full = dir.join(&candidate);
        if !full.is_dir() {
            continue;
        }
        if fs::read_dir(&full)?.next().is_none() {
            fs::remove_dir(&full)?;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manifest(json: serde_json::Value) -> Manifest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn removal_prunes_empty_dirs_but_keeps_protected_and_foreign() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for (path, data) in [
            ("plugins/spellcore.jar", "jar"),
            ("plugins/spellcore/config.yml", "a: 1"),
            ("plugins/spellcore/lang/en.yml", "hi: hi"),
            ("plugins/other.jar", "foreign"),
            ("worlds/spawn/region.dat", "region"),
        ] {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, data).unwrap();
        }
        fs::create_dir_all(root.join("maps")).unwrap();

        let m = manifest(serde_json::json!({
            "identifier": "spellcore",
            "version": "1.0.0",
            "files": [
                { "target": "plugins/spellcore.jar" },
                { "target": "plugins/spellcore/" },
                { "target": "maps/spellcore/" }
            ],
            "hashes": {
                "plugins/spellcore.jar": "x",
                "plugins/spellcore/config.yml": "x",
                "plugins/spellcore/lang/en.yml": "x",
                "worlds/spawn/region.dat": "x",
                "maps/spellcore/arena.dat": "x"
            }
        }));

        let removed = remove_artefact_files(root, &m).unwrap();
        assert_eq!(removed, 4);
        assert!(!root.join("plugins/spellcore").exists());
        assert!(root.join("plugins/other.jar").exists());
        // worlds/ is not protected and became empty
        assert!(!root.join("worlds").exists());
        // maps/ is protected as a parent of a reference target
        assert!(root.join("maps").is_dir());
        assert!(root.exists());
    }

    #[test]
    fn removal_tolerates_missing_and_blocked_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("blocked"), "foreign file").unwrap();
        let m = manifest(serde_json::json!({
            "identifier": "maps",
            "version": "2.0.0",
            "hashes": { "blocked/data.txt": "x", "gone.txt": "x" }
        }));
        assert_eq!(remove_artefact_files(root, &m).unwrap(), 0);
        assert!(root.join("blocked").is_file());
    }

    #[test]
    fn validation_error_message_counts_failures() {
        let e = UpdateError::Validation {
            artefact: "spellcore@1.0.0".to_string(),
            failures: vec![ValidationFailure {
                path: "a".to_string(),
                reason: crate::validation::FailureReason::Missing,
            }],
        };
        assert_eq!(
            e.to_string(),
            "1 installed file(s) of spellcore@1.0.0 differ from the archive"
        );
    }
}
