//! Error taxonomy shared by the key store, KMS and auth layers.

use serde::Deserialize;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource (credential record, key ring, crypto key) does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same id already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Credentials are missing, malformed or were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network, permission or other failure reported by a remote service.
    #[error("{service} request failed: {message}")]
    Service { service: String, message: String },

    #[error("invalid credential name {0:?}: names must be non-empty")]
    InvalidName(String),

    /// A payload could not be decoded (bad base64, non-UTF-8 plaintext).
    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Map a failed Google API response to the taxonomy.
    ///
    /// Google APIs answer with `{"error": {"code", "message", "status"}}`. When the
    /// body does not parse, the HTTP status alone decides.
    pub fn from_google_response(service: &str, status: u16, body: &str) -> Self {
        let parsed = serde_json::from_str::<GoogleErrorBody>(body).ok();
        let (code, message) = match parsed {
            Some(GoogleErrorBody { error }) => (
                error.status.unwrap_or_default(),
                error.message.unwrap_or_else(|| body.trim().to_string()),
            ),
            None => (String::new(), body.trim().to_string()),
        };

        match (code.as_str(), status) {
            ("NOT_FOUND", _) | (_, 404) => Self::NotFound(message),
            ("ALREADY_EXISTS", _) | (_, 409) => Self::AlreadyExists(message),
            ("UNAUTHENTICATED", _) | (_, 401) => Self::Auth(message),
            _ if code.is_empty() => Self::service(service, format!("HTTP {status}: {message}")),
            _ => Self::service(service, format!("{code} ({status}): {message}")),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}
