use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::Error;
use crate::resource::{CryptoKeyRef, KeyRingRef};

pub const DEFAULT_LOCATION_ID: &str = "global";
pub const DEFAULT_KEY_RING_ID: &str = "gcredstash";
pub const DEFAULT_CRYPTO_KEY_ID: &str = "gcredstash";
pub const DEFAULT_DATASTORE_KIND: &str = "Credential";
pub const DEFAULT_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";
pub const DEFAULT_DATASTORE_ENDPOINT: &str = "https://datastore.googleapis.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variables consulted for the project id, in order.
pub const PROJECT_ENV_VARS: [&str; 2] = ["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];

const CONFIG_FILE_NAME: &str = "gcredstash.toml";

/// Service endpoint overrides (emulators, private endpoints, tests).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub kms: Option<String>,
    pub datastore: Option<String>,
}

/// Contents of `gcredstash.toml`. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_id: Option<String>,
    pub location_id: Option<String>,
    pub keyring_id: Option<String>,
    pub key_id: Option<String>,

    /// Datastore kind holding credential records.
    pub kind: Option<String>,

    /// Per-request HTTP timeout, e.g. "30s" or "2m".
    #[serde(deserialize_with = "deserialize_timeout_opt", skip_serializing)]
    pub timeout: Option<Duration>,

    pub endpoints: EndpointsConfig,
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Per-request HTTP timeout, falling back to [`DEFAULT_TIMEOUT`].
    pub fn request_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Load config from a file, or return default config if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub project_id: Option<String>,
    pub location_id: Option<String>,
    pub keyring_id: Option<String>,
    pub key_id: Option<String>,
    pub kind: Option<String>,
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub project_id: String,
    pub location_id: String,
    pub key_ring_id: String,
    pub key_id: String,
    pub kind: String,
    pub kms_endpoint: String,
    pub datastore_endpoint: String,
}

impl ResolvedConfig {
    /// Merge flags, environment, config file and defaults, in that order.
    ///
    /// `fallback_project` is the project attached to the discovered credentials,
    /// used only when nothing else names one.
    pub fn resolve(
        config: Config,
        overrides: ConfigOverrides,
        env: impl Fn(&str) -> Option<String>,
        fallback_project: Option<String>,
    ) -> Result<Self, Error> {
        let env_project = PROJECT_ENV_VARS
            .iter()
            .find_map(|name| env(name).filter(|v| !v.trim().is_empty()));

        let project_id = overrides
            .project_id
            .or(env_project)
            .or(config.project_id)
            .or(fallback_project)
            .ok_or_else(|| {
                Error::Config(
                    "no project id: pass --project-id, set GOOGLE_CLOUD_PROJECT, or set project_id in the config file"
                        .to_string(),
                )
            })?;

        Ok(Self {
            project_id,
            location_id: pick(overrides.location_id, config.location_id, DEFAULT_LOCATION_ID),
            key_ring_id: pick(overrides.keyring_id, config.keyring_id, DEFAULT_KEY_RING_ID),
            key_id: pick(overrides.key_id, config.key_id, DEFAULT_CRYPTO_KEY_ID),
            kind: pick(overrides.kind, config.kind, DEFAULT_DATASTORE_KIND),
            kms_endpoint: config
                .endpoints
                .kms
                .unwrap_or_else(|| DEFAULT_KMS_ENDPOINT.to_string()),
            datastore_endpoint: config
                .endpoints
                .datastore
                .unwrap_or_else(|| DEFAULT_DATASTORE_ENDPOINT.to_string()),
        })
    }

    pub fn key_ring(&self) -> KeyRingRef {
        KeyRingRef::new(&self.project_id, &self.location_id, &self.key_ring_id)
    }

    pub fn crypto_key(&self) -> CryptoKeyRef {
        self.key_ring().crypto_key(&self.key_id)
    }
}

fn pick(flag: Option<String>, file: Option<String>, default: &str) -> String {
    flag.or(file).unwrap_or_else(|| default.to_string())
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./gcredstash.toml` if it exists in current directory
/// 2. `~/.config/gcredstash/gcredstash.toml` (XDG config directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from(CONFIG_FILE_NAME);
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("gcredstash").join(CONFIG_FILE_NAME);
    }

    local_config
}

/// Parse a timeout like "500ms", "30s" or "2m".
pub fn parse_timeout(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let (num, millis_per_unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else {
        anyhow::bail!("Timeout must end with ms, s, or m");
    };

    let num: u64 = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid number in timeout: {s}"))?;
    let millis = num
        .checked_mul(millis_per_unit)
        .context("Timeout is too large")?;
    if millis == 0 {
        anyhow::bail!("Timeout must be greater than zero");
    }

    Ok(Duration::from_millis(millis))
}

fn deserialize_timeout_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    raw.map(|s| parse_timeout(&s).map_err(de::Error::custom))
        .transpose()
}
