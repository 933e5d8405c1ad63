//! Tokens from the GCE metadata server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;

use super::{TokenCache, TokenProvider, TokenResponse};
use crate::error::{Error, Result};

const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const METADATA_FLAVOR: &str = "Metadata-Flavor";
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const PROJECT_PATH: &str = "/computeMetadata/v1/project/project-id";

/// Default service account of the GCE/GKE/Cloud Run instance we run on.
pub struct MetadataServerProvider {
    client: Client,
    base_url: String,
    project_id: Option<String>,
    cache: TokenCache,
}

impl MetadataServerProvider {
    /// `host` is `GCE_METADATA_HOST` when set; defaults to `metadata.google.internal`.
    pub fn new(client: Client, host: Option<String>) -> Self {
        let host = host.unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self {
            client,
            base_url: format!("http://{host}"),
            project_id: None,
            cache: TokenCache::default(),
        }
    }

    /// True when a metadata server answers with the Google flavor header.
    pub async fn probe(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .header(METADATA_FLAVOR, "Google")
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) => response
                .headers()
                .get(METADATA_FLAVOR)
                .is_some_and(|value| value == "Google"),
            Err(err) => {
                tracing::debug!(error = %err, "Metadata server not reachable");
                false
            }
        }
    }

    /// Ask the metadata server which project the instance belongs to.
    pub async fn with_detected_project(mut self) -> Self {
        match self.get_text(PROJECT_PATH).await {
            Ok(project) if !project.trim().is_empty() => {
                self.project_id = Some(project.trim().to_string());
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "Could not read project id from metadata server"),
        }
        self
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(METADATA_FLAVOR, "Google")
            .send()
            .await
            .map_err(|err| Error::Auth(format!("metadata server request failed: {err}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| Error::Auth(format!("failed to read metadata response: {err}")))?;
        if !status.is_success() {
            return Err(Error::Auth(format!(
                "metadata server returned HTTP {status}: {}",
                body.trim()
            )));
        }
        Ok(body)
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let body = self.get_text(TOKEN_PATH).await?;
        serde_json::from_str(&body)
            .map_err(|err| Error::Auth(format!("failed to parse metadata token: {err}")))
    }
}

#[async_trait]
impl TokenProvider for MetadataServerProvider {
    async fn access_token(&self) -> Result<SecretString> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }

    fn project_id(&self) -> Option<String> {
        self.project_id.clone()
    }

    fn name(&self) -> &str {
        "metadata"
    }
}
