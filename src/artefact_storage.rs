//! Where uploaded artefact archives are kept.

use std::path::PathBuf;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::info;
use uuid::Uuid;

use crate::controller_config::{ArtefactStorageConfig, BucketConfig, ControllerConfig};
use crate::s3_retry::RetryPolicy;

pub enum ArtefactStorage {
    Local {
        directory: PathBuf,
    },
    S3 {
        client: Client,
        bucket: BucketConfig,
        retry: RetryPolicy,
    },
}

fn create_s3_client(config: &BucketConfig) -> Client {
    let credentials = Credentials::new(&config.access_key, &config.secret_key, None, None, "static");
    let s3_config = Builder::new()
        .region(Region::new("us-east-1"))
        .endpoint_url(&config.endpoint)
        .credentials_provider(credentials)
        .force_path_style(config.path_style)
        .behavior_version(BehaviorVersion::latest())
        .build();
    Client::from_conf(s3_config)
}

impl ArtefactStorage {
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        match &config.artefact_storage {
            ArtefactStorageConfig::Local { directory } => {
                std::fs::create_dir_all(directory).with_context(|| {
                    format!("Failed to create artefact directory {}", directory.display())
                })?;
                info!("📦 Artefacts stored in {}", directory.display());
                Ok(Self::Local {
                    directory: directory.clone(),
                })
            }
            ArtefactStorageConfig::S3(bucket) => {
                info!(
                    "📦 Artefacts stored in s3://{}/{} at {}",
                    bucket.bucket, bucket.prefix, bucket.endpoint
                );
                Ok(Self::S3 {
                    client: create_s3_client(bucket),
                    bucket: bucket.clone(),
                    retry: RetryPolicy::new(config.s3_retry_count, config.s3_retry_delay_ms),
                })
            }
        }
    }

    pub fn local(directory: impl Into<PathBuf>) -> Self {
        Self::Local {
            directory: directory.into(),
        }
    }

    /// Storage key of an artefact archive.
    pub fn key_for(uuid: Uuid) -> String {
        format!("artefacts/{}.tar.gz", uuid)
    }

    pub async fn put(&self, uuid: Uuid, bytes: Vec<u8>) -> Result<()> {
        let key = Self::key_for(uuid);
        match self {
            Self::Local { directory } => {
                let path = directory.join(&key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))
            }
            Self::S3 {
                client,
                bucket,
                retry,
            } => {
                let full_key = bucket.full_key(&key);
                retry
                    .run("put_object", || {
                        client
                            .put_object()
                            .bucket(&bucket.bucket)
                            .key(&full_key)
                            .body(ByteStream::from(bytes.clone()))
                            .send()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("S3 put {} failed: {:?}", full_key, e))?;
                Ok(())
            }
        }
    }

    pub async fn get(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let key = Self::key_for(uuid);
        match self {
            Self::Local { directory } => {
                let path = directory.join(&key);
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))
            }
            Self::S3 {
                client,
                bucket,
                retry,
            } => {
                let full_key = bucket.full_key(&key);
                let output = retry
                    .run("get_object", || {
                        client
                            .get_object()
                            .bucket(&bucket.bucket)
                            .key(&full_key)
                            .send()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("S3 get {} failed: {:?}", full_key, e))?;
                let data = output
                    .body
                    .collect()
                    .await
                    .with_context(|| format!("Failed to read body of {}", full_key))?;
                Ok(data.into_bytes().to_vec())
            }
        }
    }

    pub async fn delete(&self, uuid: Uuid) -> Result<()> {
        let key = Self::key_for(uuid);
        match self {
            Self::Local { directory } => {
                let path = directory.join(&key);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
                }
            }
            Self::S3 {
                client,
                bucket,
                retry,
            } => {
                let full_key = bucket.full_key(&key);
                retry
                    .run("delete_object", || {
                        client
                            .delete_object()
                            .bucket(&bucket.bucket)
                            .key(&full_key)
                            .send()
                    })
                    .await
                    .map_err(|e| anyhow::anyhow!("S3 delete {} failed: {:?}", full_key, e))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_round_trip() {
        let dir = tempdir().unwrap();
        let storage = ArtefactStorage::local(dir.path());
        let uuid = Uuid::new_v4();
        storage.put(uuid, b"archive".to_vec()).await.unwrap();
        assert!(dir.path().join(ArtefactStorage::key_for(uuid)).exists());
        assert_eq!(storage.get(uuid).await.unwrap(), b"archive");
        storage.delete(uuid).await.unwrap();
        storage.delete(uuid).await.unwrap();
        assert!(storage.get(uuid).await.is_err());
    }
}
