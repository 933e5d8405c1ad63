//! Authenticated JSON transport shared by the KMS and Datastore clients.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::auth::{bearer, TokenProvider};
use crate::error::{Error, Result};

/// Build the HTTP client used for every Google API call.
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("gcredstash/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| Error::Config(format!("failed to build HTTP client: {err}")))
}

/// Sends JSON requests to one Google API with a bearer token attached.
#[derive(Clone)]
pub struct ApiClient {
    service: &'static str,
    base_url: String,
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub fn new(
        service: &'static str,
        base_url: impl Into<String>,
        client: Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            service,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            tokens,
        }
    }

    /// Point the client at another endpoint (emulators, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// POST `body` to `{base_url}{path}` and decode the JSON answer.
    pub async fn post<B, T>(&self, path: &str, query: &[(&str, &str)], body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let token = self.tokens.access_token().await?;

        tracing::debug!(service = self.service, %url, "POST");
        let response = self
            .client
            .post(&url)
            .query(query)
            .header(reqwest::header::AUTHORIZATION, bearer(&token))
            .json(body)
            .send()
            .await
            .map_err(|err| Error::service(self.service, format!("HTTP request failed: {err}")))?;

        let status = response.status();
        let body_text = response.text().await.map_err(|err| {
            Error::service(self.service, format!("failed to read response body: {err}"))
        })?;

        if !status.is_success() {
            return Err(Error::from_google_response(
                self.service,
                status.as_u16(),
                &body_text,
            ));
        }

        serde_json::from_str(&body_text).map_err(|err| {
            Error::service(self.service, format!("failed to parse JSON response: {err}"))
        })
    }
}
