//! HTTP client the operator uses to talk to the controller.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::manifest::Manifest;
use crate::model::{ArtefactVersionMismatch, ServerModel};

/// Controller operations the operator relies on.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    async fn server(&self, server: Uuid) -> Result<ServerModel>;
    async fn mismatches(
        &self,
        server: Uuid,
        requires_restart: Option<bool>,
    ) -> Result<Vec<ArtefactVersionMismatch>>;
    async fn manifest(&self, artefact: Uuid) -> Result<Manifest>;
    /// Where the raw archive of `artefact` can be fetched.
    fn download_url(&self, artefact: Uuid) -> String;
    /// Record what is now installed for `identifier`; `None` clears IS.
    async fn report_installed(
        &self,
        server: Uuid,
        identifier: &str,
        installed: Option<Uuid>,
    ) -> Result<()>;
}

/// Body of `PATCH`/`DELETE /server/{uuid}/state/{type}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub artefact_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artefact_uuid: Option<Uuid>,
}

pub struct HttpControllerClient {
    client: Client,
    base_url: String,
}

impl HttpControllerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        if response.status().is_success() {
            response.json().await.context("Failed to parse controller response")
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("controller error ({status}): {body}")
        }
    }
}

#[async_trait]
impl ControllerApi for HttpControllerClient {
    async fn server(&self, server: Uuid) -> Result<ServerModel> {
        let url = format!("{}/server/{}", self.base_url, server);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach controller")?;
        Self::json(response).await
    }

    async fn mismatches(
        &self,
        server: Uuid,
        requires_restart: Option<bool>,
    ) -> Result<Vec<ArtefactVersionMismatch>> {
        let url = format!("{}/server/{}/state/update", self.base_url, server);
        let mut req = self.client.get(&url);
        if let Some(flag) = requires_restart {
            req = req.query(&[("requiresRestart", flag)]);
        }
        let response = req.send().await.context("Failed to reach controller")?;
        Self::json(response).await
    }

    async fn manifest(&self, artefact: Uuid) -> Result<Manifest> {
        let url = format!("{}/artefact/{}/download/manifest", self.base_url, artefact);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach controller")?;
        Self::json(response).await
    }

    fn download_url(&self, artefact: Uuid) -> String {
        format!("{}/artefact/{}/download", self.base_url, artefact)
    }

    async fn report_installed(
        &self,
        server: Uuid,
        identifier: &str,
        installed: Option<Uuid>,
    ) -> Result<()> {
        let url = format!("{}/server/{}/state/IS", self.base_url, server);
        let body = StateChange {
            artefact_identifier: identifier.to_string(),
            artefact_uuid: installed,
        };
        let req = match installed {
            Some(_) => self.client.patch(&url),
            None => self.client.delete(&url),
        };
        let response = req
            .json(&body)
            .send()
            .await
            .context("Failed to reach controller")?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("controller rejected IS report ({status}): {body}")
        }
    }
}
