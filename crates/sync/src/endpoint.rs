use crate::client::{build_http_client, endpoint_host};
use aimatch_core::config::SyncConfig;
use aimatch_core::{Error, Result, TaskId, TaskStatus};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// A task as the server hands it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: TaskId,
    pub url: String,
    pub client_url: String,
}

/// One verdict report. The server calls the status field `tracking`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: TaskId,
    pub tracking: TaskStatus,
}

/// The remote coordination server.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    /// Authoritative list of tasks the server wants processed.
    async fn fetch_tasks(&self) -> Result<Vec<RemoteTask>>;

    /// Report statuses. Must be safe to repeat.
    async fn post_statuses(&self, updates: &[StatusUpdate]) -> Result<()>;
}

/// `GET`/`POST <url>?token=<token>` against the sync server.
pub struct HttpSyncEndpoint {
    client: Client,
    url: String,
    token: String,
}

impl HttpSyncEndpoint {
    pub fn new(url: &str, token: &str, proxy: Option<&str>, timeout: Duration) -> Self {
        let url = url.trim_end_matches('/').to_string();
        let client = build_http_client(proxy, &url, timeout);
        Self {
            client,
            url,
            token: token.to_string(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            &config.url,
            &config.token,
            config.proxy.as_deref(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SyncEndpoint for HttpSyncEndpoint {
    async fn fetch_tasks(&self) -> Result<Vec<RemoteTask>> {
        debug!(host = %endpoint_host(&self.url), "Fetching tasks from sync server");
        let response = self
            .client
            .get(&self.url)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(|e| Error::Sync(format!("Request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Sync server rejected task fetch");
            return Err(Error::Sync(format!("GET returned {}: {}", status, raw_body)));
        }

        serde_json::from_str(&raw_body)
            .map_err(|e| Error::Sync(format!("Malformed task list: {}", e)))
    }

    async fn post_statuses(&self, updates: &[StatusUpdate]) -> Result<()> {
        debug!(
            host = %endpoint_host(&self.url),
            count = updates.len(),
            "Posting statuses to sync server"
        );
        let response = self
            .client
            .post(&self.url)
            .query(&[("token", self.token.as_str())])
            .json(updates)
            .send()
            .await
            .map_err(|e| Error::Sync(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let raw_body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %raw_body, "Sync server rejected status push");
            return Err(Error::Sync(format!("POST returned {}: {}", status, raw_body)));
        }
        Ok(())
    }
}
