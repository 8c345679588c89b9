//! Deduplicated downloads into a local cache directory.
//!
//! All callers asking for the same URL while a transfer is in flight share
//! that one transfer and receive the same outcome. The in-flight map is the
//! only shared state; registration, fan-out and cache eviction all take the
//! same lock, and the lock is never held across network I/O.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::dispatcher::WorkerDispatcher;

/// Suffix of a file that is still being written.
const PARTIAL_SUFFIX: &str = ".part";

/// Performs the actual transfer of one URL to one local path.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<()>;
}

/// Streams an HTTP(S) body to disk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("downloading {}", url))?;

        let partial = partial_path(destination);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("creating {}", partial.display()))?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.with_context(|| format!("reading body of {}", url))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("moving {} into place", partial.display()))?;
        Ok(())
    }
}

pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Outcome shared by every listener of one transfer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("download of {url} failed: {message}")]
pub struct DownloadError {
    pub url: String,
    pub message: String,
}

impl DownloadError {
    fn new(url: &str, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

type Outcome = std::result::Result<PathBuf, DownloadError>;

struct InFlight {
    filename: String,
    listeners: Vec<oneshot::Sender<Outcome>>,
}

type InFlightMap = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<String, InFlight>> {
    // Bookkeeping stays consistent even if a holder panicked.
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DownloadCoordinator {
    cache_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    workers: Arc<WorkerDispatcher<PathBuf>>,
    in_flight: InFlightMap,
}

impl DownloadCoordinator {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        workers: WorkerDispatcher<PathBuf>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            fetcher,
            workers: Arc::new(workers),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch `url` into `<cache>/<filename>` and return the local path.
    ///
    /// Joins a transfer already in flight for `url` instead of starting a
    /// second one.
    pub async fn download(&self, url: &str, filename: &str) -> Outcome {
        if filename.is_empty() || filename.contains(&['/', '\\'][..]) || filename.starts_with('.') {
            return Err(DownloadError::new(url, format!("invalid cache filename '{}'", filename)));
        }

        let (tx, rx) = oneshot::channel();
        let first = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.get_mut(url) {
                Some(entry) => {
                    debug!("Joining in-flight download of {}", url);
                    entry.listeners.push(tx);
                    false
                }
                None => {
                    in_flight.insert(
                        url.to_string(),
                        InFlight {
                            filename: filename.to_string(),
                            listeners: vec![tx],
                        },
                    );
                    true
                }
            }
        };

        if first {
            self.start_transfer(url.to_string(), self.cache_dir.join(filename));
        }

        rx.await
            .unwrap_or_else(|_| Err(DownloadError::new(url, "transfer was abandoned")))
    }

    /// Runs detached so that a cancelled first caller cannot strand the
    /// other listeners.
    fn start_transfer(&self, url: String, destination: PathBuf) {
        let fetcher = self.fetcher.clone();
        let workers = self.workers.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            info!("📥 Downloading {} -> {}", url, destination.display());
            let work_url = url.clone();
            let dispatched = workers
                .dispatch(move || async move {
                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    fetcher.fetch(&work_url, &destination).await?;
                    Ok(destination)
                })
                .await;

            let outcome = match dispatched {
                Ok(handle) => handle
                    .await
                    .map_err(|e| DownloadError::new(&url, format!("{:#}", e))),
                Err(e) => Err(DownloadError::new(&url, e.to_string())),
            };
            match &outcome {
                Ok(path) => info!("✅ Downloaded {} -> {}", url, path.display()),
                Err(e) => warn!("❌ {}", e),
            }

            let listeners = lock(&in_flight)
                .remove(&url)
                .map(|entry| entry.listeners)
                .unwrap_or_default();
            for listener in listeners {
                // A listener that went away simply misses the outcome.
                let _ = listener.send(outcome.clone());
            }
        });
    }

    /// Delete cached files older than `max_age`, skipping files that belong
    /// to a transfer still in flight. Returns the number of files removed.
    pub fn clean_local_cache(&self, max_age: Duration) -> Result<usize> {
        let in_flight = lock(&self.in_flight);
        let busy: Vec<String> = in_flight.values().map(|e| e.filename.clone()).collect();

        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("listing cache directory {}", self.cache_dir.display())
                })
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if busy
                .iter()
                .any(|f| name == *f || name == format!("{}{}", f, PARTIAL_SUFFIX))
            {
                debug!("Keeping {}: download in flight", name);
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            // an age beyond the representable range never expires anything
            let expired = modified
                .checked_add(max_age)
                .map_or(false, |expiry| expiry < now);
            if expired {
                fs::remove_file(entry.path())
                    .with_context(|| format!("removing cached file {}", name))?;
                debug!("Evicted cached file {}", name);
                removed += 1;
            }
        }
        drop(in_flight);

        info!("🧹 Cache cleanup removed {} file(s) older than {:?}", removed, max_age);
        Ok(removed)
    }
}
