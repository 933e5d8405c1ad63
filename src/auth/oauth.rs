//! OAuth2 token exchange for user and service account credentials.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{TokenCache, TokenProvider, TokenResponse, CLOUD_PLATFORM_SCOPE, DEFAULT_TOKEN_URL};
use crate::error::{Error, Result};

/// Lifetime requested for service account assertions.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// POST a form to the token endpoint.
async fn exchange(client: &Client, token_url: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
    let response = client
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|err| Error::Auth(format!("token request failed: {err}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| Error::Auth(format!("failed to read token response: {err}")))?;

    if !status.is_success() {
        let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(TokenErrorResponse {
                error,
                error_description: Some(description),
            }) => format!("{error}: {description}"),
            Ok(TokenErrorResponse { error, .. }) => error,
            Err(_) => format!("HTTP {status}: {}", body.trim()),
        };
        return Err(Error::Auth(message));
    }

    serde_json::from_str(&body)
        .map_err(|err| Error::Auth(format!("failed to parse token response: {err}")))
}

/// Credentials from `gcloud auth application-default login`.
pub struct AuthorizedUserProvider {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    project_id: Option<String>,
    token_url: String,
    cache: TokenCache,
}

impl AuthorizedUserProvider {
    pub fn new(
        client: Client,
        client_id: String,
        client_secret: SecretString,
        refresh_token: SecretString,
    ) -> Self {
        Self {
            client,
            client_id,
            client_secret,
            refresh_token,
            project_id: None,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            cache: TokenCache::default(),
        }
    }

    /// Override the token endpoint (useful for tests).
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id;
        self
    }

    async fn refresh(&self) -> Result<TokenResponse> {
        exchange(
            &self.client,
            &self.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", self.refresh_token.expose_secret()),
            ],
        )
        .await
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUserProvider {
    async fn access_token(&self) -> Result<SecretString> {
        self.cache.get_or_fetch(|| self.refresh()).await
    }

    fn project_id(&self) -> Option<String> {
        self.project_id.clone()
    }

    fn name(&self) -> &str {
        "authorized_user"
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Service account key exchanged for tokens via a signed JWT assertion.
pub struct ServiceAccountProvider {
    client: Client,
    client_email: String,
    key_id: Option<String>,
    signing_key: EncodingKey,
    project_id: Option<String>,
    token_url: String,
    cache: TokenCache,
}

impl ServiceAccountProvider {
    /// Fails with an auth error when the private key is not a valid RSA PEM.
    pub fn new(client: Client, client_email: String, private_key: SecretString) -> Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(private_key.expose_secret().as_bytes())
            .map_err(|err| Error::Auth(format!("invalid service account private key: {err}")))?;

        Ok(Self {
            client,
            client_email,
            key_id: None,
            signing_key,
            project_id: None,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            cache: TokenCache::default(),
        })
    }

    /// Override the token endpoint (useful for tests).
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    pub fn with_key_id(mut self, key_id: Option<String>) -> Self {
        self.key_id = key_id;
        self
    }

    pub fn with_project_id(mut self, project_id: Option<String>) -> Self {
        self.project_id = project_id;
        self
    }

    fn assertion(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_url,
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key_id.clone();

        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|err| Error::Auth(format!("failed to sign token assertion: {err}")))
    }

    async fn fetch(&self) -> Result<TokenResponse> {
        let assertion = self.assertion()?;
        exchange(
            &self.client,
            &self.token_url,
            &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
        )
        .await
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountProvider {
    async fn access_token(&self) -> Result<SecretString> {
        self.cache.get_or_fetch(|| self.fetch()).await
    }

    fn project_id(&self) -> Option<String> {
        self.project_id.clone()
    }

    fn name(&self) -> &str {
        "service_account"
    }
}
