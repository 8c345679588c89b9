#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use uuid::Uuid;

use fleetdeck::archive::{read_manifest_from_bytes, sha256_hex};
use fleetdeck::container::ContainerRuntime;
use fleetdeck::controller_client::ControllerApi;
use fleetdeck::dispatcher::WorkerDispatcher;
use fleetdeck::download::{DownloadCoordinator, Fetcher};
use fleetdeck::executor::DeploymentUpdateExecutor;
use fleetdeck::manifest::Manifest;
use fleetdeck::mismatch::compute_mismatches;
use fleetdeck::model::{ArtefactModel, ArtefactVersionMismatch, ServerModel, StateType};
use fleetdeck::store::{JsonStateStore, StateStore};

/// gzip'd tarball with `manifest.json` first, then `entries` in order.
pub fn build_archive(manifest: &serde_json::Value, entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let manifest = serde_json::to_vec(manifest).unwrap();
    let all = std::iter::once(("manifest.json", manifest.as_slice())).chain(entries.iter().copied());
    for (path, data) in all {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Manifest JSON listing `entries` with their real hashes.
pub fn manifest_for(
    identifier: &str,
    version: &str,
    requires_restart: bool,
    entries: &[(&str, &[u8])],
) -> serde_json::Value {
    let hashes: serde_json::Map<String, serde_json::Value> = entries
        .iter()
        .map(|(path, data)| (path.to_string(), sha256_hex(data).into()))
        .collect();
    serde_json::json!({
        "identifier": identifier,
        "version": version,
        "requiresRestart": requires_restart,
        "hashes": hashes,
    })
}

pub fn server_model(uuid: Uuid) -> ServerModel {
    ServerModel {
        uuid,
        environment: "test".to_string(),
        name: "survival-1".to_string(),
        operator: "host-a".to_string(),
        memory_limit: Some("4g".to_string()),
        cpu_limit: None,
        image: "games/survival:1".to_string(),
        networks: vec!["games".to_string()],
    }
}

/// Controller API served straight from a state store; archives live in memory.
pub struct InProcessController {
    pub store: Arc<dyn StateStore>,
    archives: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl InProcessController {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            archives: Mutex::new(HashMap::new()),
        }
    }

    pub fn archive(&self, artefact: Uuid) -> Result<Vec<u8>> {
        self.archives
            .lock()
            .unwrap()
            .get(&artefact)
            .cloned()
            .with_context(|| format!("no archive for {}", artefact))
    }

    /// Store `archive` and register its artefact. The metadata comes from
    /// the archive's own manifest.
    pub fn upload(&self, archive: Vec<u8>) -> ArtefactModel {
        let manifest = read_manifest_from_bytes(&archive).unwrap();
        let model = self
            .store
            .insert_artefact(ArtefactModel {
                uuid: Uuid::new_v4(),
                identifier: manifest.identifier,
                version: manifest.version,
                uploaded_at: Utc::now(),
                hash: sha256_hex(&archive),
                requires_restart: manifest.requires_restart,
            })
            .unwrap();
        self.archives.lock().unwrap().insert(model.uuid, archive);
        model
    }
}

#[async_trait]
impl ControllerApi for InProcessController {
    async fn server(&self, server: Uuid) -> Result<ServerModel> {
        Ok(self.store.get_server(server)?)
    }

    async fn mismatches(
        &self,
        server: Uuid,
        requires_restart: Option<bool>,
    ) -> Result<Vec<ArtefactVersionMismatch>> {
        Ok(compute_mismatches(self.store.as_ref(), server, requires_restart)?)
    }

    async fn manifest(&self, artefact: Uuid) -> Result<Manifest> {
        read_manifest_from_bytes(&self.archive(artefact)?)
    }

    fn download_url(&self, artefact: Uuid) -> String {
        format!("mem://{}", artefact)
    }

    async fn report_installed(
        &self,
        server: Uuid,
        identifier: &str,
        installed: Option<Uuid>,
    ) -> Result<()> {
        match installed {
            Some(artefact) => {
                self.store
                    .upsert_state(server, StateType::Is, identifier, artefact)?;
            }
            None => {
                self.store.remove_state(server, StateType::Is, identifier)?;
            }
        }
        Ok(())
    }
}

/// Resolves `mem://<uuid>` against the in-process controller.
pub struct MemoryFetcher {
    controller: Arc<InProcessController>,
    pub fetches: AtomicUsize,
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let uuid: Uuid = url
            .strip_prefix("mem://")
            .context("unexpected url scheme")?
            .parse()?;
        let bytes = self.controller.archive(uuid)?;
        tokio::fs::write(destination, bytes).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub running: AtomicBool,
    /// Containers ignore stop requests.
    pub stuck: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_running(&self, _server: Uuid) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn start(&self, _server: &ServerModel, _data_dir: &Path) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _server: Uuid) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.stuck.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// One operator host with a single registered server.
pub struct Fleet {
    pub dir: TempDir,
    pub store: Arc<dyn StateStore>,
    pub controller: Arc<InProcessController>,
    pub fetcher: Arc<MemoryFetcher>,
    pub runtime: Arc<FakeRuntime>,
    pub downloads: Arc<DownloadCoordinator>,
    pub executor: Arc<DeploymentUpdateExecutor>,
    pub server: Uuid,
}

impl Fleet {
    pub fn new(strict_validation: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::in_memory());
        let server = Uuid::new_v4();
        store.upsert_server(server_model(server)).unwrap();

        let controller = Arc::new(InProcessController::new(store.clone()));
        let fetcher = Arc::new(MemoryFetcher {
            controller: controller.clone(),
            fetches: AtomicUsize::new(0),
        });
        let runtime = Arc::new(FakeRuntime::default());
        let downloads = Arc::new(DownloadCoordinator::new(
            dir.path().join("cache"),
            fetcher.clone(),
            WorkerDispatcher::new("download", 2).unwrap(),
        ));
        let executor = Arc::new(DeploymentUpdateExecutor::new(
            controller.clone(),
            runtime.clone(),
            downloads.clone(),
            WorkerDispatcher::new("validate", 2).unwrap(),
            dir.path().join("data"),
            strict_validation,
        ));
        Self {
            dir,
            store,
            controller,
            fetcher,
            runtime,
            downloads,
            executor,
            server,
        }
    }

    pub fn server_dir(&self) -> PathBuf {
        self.executor.server_directory(self.server)
    }

    pub fn upload(
        &self,
        identifier: &str,
        version: &str,
        requires_restart: bool,
        entries: &[(&str, &[u8])],
    ) -> ArtefactModel {
        let manifest = manifest_for(identifier, version, requires_restart, entries);
        self.controller.upload(build_archive(&manifest, entries))
    }

    pub fn set_target(&self, artefact: &ArtefactModel) {
        self.store
            .upsert_state(self.server, StateType::Target, &artefact.identifier, artefact.uuid)
            .unwrap();
    }

    pub fn clear_target(&self, identifier: &str) {
        self.store
            .remove_state(self.server, StateType::Target, identifier)
            .unwrap();
    }

    /// Artefact the IS row of `identifier` points at.
    pub fn installed(&self, identifier: &str) -> Option<Uuid> {
        self.store
            .list_states(self.server, Some(StateType::Is))
            .unwrap()
            .into_iter()
            .find(|row| row.artefact_identifier == identifier)
            .map(|row| row.artefact_uuid)
    }

    pub fn read(&self, relative: &str) -> Option<String> {
        std::fs::read_to_string(self.server_dir().join(relative)).ok()
    }
}
