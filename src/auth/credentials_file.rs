//! Credential JSON files (`authorized_user` and `service_account`).

use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use secrecy::SecretString;
use serde::Deserialize;

use super::oauth::{AuthorizedUserProvider, ServiceAccountProvider};
use super::TokenProvider;
use crate::error::{Error, Result};

/// Parsed contents of a Google credentials file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialsFile {
    /// Written by `gcloud auth application-default login`.
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        quota_project_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
    },
    /// A downloaded service account key.
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
    },
}

impl CredentialsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::Auth(format!(
                "Failed to read credentials file {}: {err}",
                path.display()
            ))
        })?;
        Self::parse(&content).map_err(|err| match err {
            Error::Auth(msg) => Error::Auth(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|err| Error::Auth(format!("invalid credentials file: {err}")))
    }

    pub fn into_provider(self, client: Client) -> Result<Arc<dyn TokenProvider>> {
        match self {
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                quota_project_id,
                token_uri,
            } => {
                let mut provider = AuthorizedUserProvider::new(
                    client,
                    client_id,
                    SecretString::new(client_secret.into()),
                    SecretString::new(refresh_token.into()),
                )
                .with_project_id(quota_project_id);
                if let Some(token_uri) = token_uri {
                    provider = provider.with_token_url(token_uri);
                }
                Ok(Arc::new(provider))
            }
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                private_key_id,
                project_id,
                token_uri,
            } => {
                let mut provider = ServiceAccountProvider::new(
                    client,
                    client_email,
                    SecretString::new(private_key.into()),
                )?
                .with_key_id(private_key_id)
                .with_project_id(project_id);
                if let Some(token_uri) = token_uri {
                    provider = provider.with_token_url(token_uri);
                }
                Ok(Arc::new(provider))
            }
        }
    }
}
