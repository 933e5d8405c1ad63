//! Google Application Default Credentials.
//!
//! Resolves an OAuth2 access token source the same way Google's client
//! libraries do:
//!
//! 1. `GOOGLE_OAUTH_ACCESS_TOKEN` (a ready-made token)
//! 2. `GOOGLE_APPLICATION_CREDENTIALS` (path to a credentials JSON file)
//! 3. the gcloud well-known file `application_default_credentials.json`
//! 4. the GCE metadata server
//!
//! Credential files may be `authorized_user` (gcloud user login) or
//! `service_account` keys.

mod credentials_file;
mod metadata;
mod oauth;

pub use credentials_file::CredentialsFile;
pub use metadata::MetadataServerProvider;
pub use oauth::{AuthorizedUserProvider, ServiceAccountProvider};

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// OAuth2 scope granting access to KMS and Datastore.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const ADC_FILE_NAME: &str = "application_default_credentials.json";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// A source of bearer tokens for Google APIs.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a valid access token, fetching or refreshing as needed.
    async fn access_token(&self) -> Result<SecretString>;

    /// Project associated with the credentials, if they name one.
    fn project_id(&self) -> Option<String> {
        None
    }

    fn name(&self) -> &str;
}

/// A fixed token, e.g. from `gcloud auth print-access-token`.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<SecretString> {
        Ok(SecretString::new(self.token.expose_secret().into()))
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Token endpoint / metadata server response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now,
            None => true,
        }
    }
}

/// Holds the last token fetched by a provider.
#[derive(Default)]
pub(crate) struct TokenCache {
    cached: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<SecretString>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenResponse>>,
    {
        let mut guard = self.cached.lock().await;
        let now = Utc::now();
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh(now) {
                return Ok(SecretString::new(cached.token.as_str().into()));
            }
        }

        let response = fetch().await?;
        if response.access_token.is_empty() {
            return Err(Error::Auth("token endpoint returned an empty access token".to_string()));
        }

        let token = SecretString::new(response.access_token.as_str().into());
        *guard = Some(CachedToken {
            token: response.access_token,
            expires_at: response.expires_in.map(|secs| now + Duration::seconds(secs)),
        });
        tracing::debug!(expires_in = ?response.expires_in, "Fetched access token");
        Ok(token)
    }
}

/// Locate credentials following the Application Default Credentials order.
///
/// `env` looks up environment variables; callers pass `std::env::var(..).ok()`
/// in production and a fixed map in tests.
pub async fn discover(
    client: &Client,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn TokenProvider>> {
    if let Some(token) = env("GOOGLE_OAUTH_ACCESS_TOKEN").filter(|t| !t.trim().is_empty()) {
        tracing::debug!("Using access token from GOOGLE_OAUTH_ACCESS_TOKEN");
        return Ok(Arc::new(StaticTokenProvider::new(SecretString::new(
            token.trim().into(),
        ))));
    }

    if let Some(path) = env("GOOGLE_APPLICATION_CREDENTIALS").filter(|p| !p.is_empty()) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(Error::Auth(format!(
                "File {} was not found (set by GOOGLE_APPLICATION_CREDENTIALS)",
                path.display()
            )));
        }
        tracing::debug!(path = %path.display(), "Using GOOGLE_APPLICATION_CREDENTIALS");
        return CredentialsFile::load(&path)?.into_provider(client.clone());
    }

    if let Some(path) = well_known_file(&env) {
        if path.exists() {
            tracing::debug!(path = %path.display(), "Using gcloud application default credentials");
            return CredentialsFile::load(&path)?.into_provider(client.clone());
        }
    }

    let skip_gce = env("NO_GCE_CHECK")
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false);
    if !skip_gce {
        let provider = MetadataServerProvider::new(client.clone(), env("GCE_METADATA_HOST"));
        if provider.probe().await {
            tracing::debug!("Using GCE metadata server credentials");
            return Ok(Arc::new(provider.with_detected_project().await));
        }
    }

    Err(Error::Auth(
        "Could not automatically determine credentials. Set GOOGLE_APPLICATION_CREDENTIALS or run `gcloud auth application-default login`."
            .to_string(),
    ))
}

/// Path of gcloud's `application_default_credentials.json`.
fn well_known_file(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let gcloud_dir = env("CLOUDSDK_CONFIG")
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|dir| dir.join("gcloud")))?;
    Some(gcloud_dir.join(ADC_FILE_NAME))
}

/// Expose a token for a request header.
pub(crate) fn bearer(token: &SecretString) -> String {
    format!("Bearer {}", token.expose_secret())
}
