//! Cloud KMS resource references and the resources KMS returns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies a KeyRing: `projects/{p}/locations/{l}/keyRings/{r}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRingRef {
    pub project_id: String,
    pub location_id: String,
    pub key_ring_id: String,
}

impl KeyRingRef {
    pub fn new(
        project_id: impl Into<String>,
        location_id: impl Into<String>,
        key_ring_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: location_id.into(),
            key_ring_id: key_ring_id.into(),
        }
    }

    /// The location that owns this ring: `projects/{p}/locations/{l}`.
    pub fn parent(&self) -> String {
        format!(
            "projects/{}/locations/{}",
            self.project_id, self.location_id
        )
    }

    pub fn name(&self) -> String {
        format!("{}/keyRings/{}", self.parent(), self.key_ring_id)
    }

    pub fn crypto_key(&self, key_id: impl Into<String>) -> CryptoKeyRef {
        CryptoKeyRef {
            key_ring: self.clone(),
            key_id: key_id.into(),
        }
    }
}

impl fmt::Display for KeyRingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Identifies a CryptoKey inside a KeyRing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CryptoKeyRef {
    pub key_ring: KeyRingRef,
    pub key_id: String,
}

impl CryptoKeyRef {
    pub fn name(&self) -> String {
        format!("{}/cryptoKeys/{}", self.key_ring.name(), self.key_id)
    }
}

impl fmt::Display for CryptoKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A KeyRing as returned by KMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRing {
    pub name: String,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}

/// A CryptoKey as returned by KMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoKey {
    pub name: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
}
