//! HTTP client the controller uses to reach operators.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::lifecycle::OperatorGateway;
use crate::model::{ActionReport, LifecycleAction, ServerModel};

pub struct HttpOperatorGateway {
    client: Client,
    /// Operator id -> base URL.
    operators: BTreeMap<String, String>,
}

impl HttpOperatorGateway {
    pub fn new(operators: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, operators })
    }

    fn base_url(&self, operator: &str) -> Result<&str> {
        self.operators
            .get(operator)
            .map(|url| url.trim_end_matches('/'))
            .with_context(|| format!("operator '{}' is not configured", operator))
    }
}

#[async_trait]
impl OperatorGateway for HttpOperatorGateway {
    async fn execute(&self, server: &ServerModel, action: LifecycleAction) -> Result<ActionReport> {
        let url = format!(
            "{}/server/{}/{}",
            self.base_url(&server.operator)?,
            server.uuid,
            action
        );
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach operator {}", server.operator))?;

        if response.status().is_success() {
            response.json().await.context("Failed to parse operator response")
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("operator {} answered {} for {}: {}", server.operator, status, action, body)
        }
    }

    async fn clear_caches(&self, max_age: Duration) -> Result<()> {
        let age = humantime::format_duration(max_age).to_string();
        let mut failed = Vec::new();
        for (operator, base) in &self.operators {
            let url = format!("{}/cron/cache/clear", base.trim_end_matches('/'));
            let outcome = self
                .client
                .post(&url)
                .query(&[("age", age.as_str())])
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match outcome {
                Ok(_) => info!("🧹 Operator {} cleared cache entries older than {}", operator, age),
                Err(e) => {
                    warn!("⚠️  Cache clear on operator {} failed: {}", operator, e);
                    failed.push(operator.as_str());
                }
            }
        }
        if !failed.is_empty() {
            anyhow::bail!("cache clear failed on operator(s): {}", failed.join(", "));
        }
        Ok(())
    }
}
