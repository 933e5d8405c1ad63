//! Cloud Datastore (Firestore in Datastore mode) over its v1 REST API.
//!
//! Each credential is one entity keyed by `[{kind, name}]` in the project's
//! default partition, with a `name` string property and an unindexed
//! `ciphertext` blob property.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{validate_name, KeyStore, Records};
use crate::api::ApiClient;
use crate::auth::TokenProvider;
use crate::config::DEFAULT_DATASTORE_ENDPOINT;
use crate::error::{Error, Result};

const SERVICE: &str = "datastore";
const NAME_PROPERTY: &str = "name";
const CIPHERTEXT_PROPERTY: &str = "ciphertext";

/// Default upper bound on query pages.
const QUERY_MAX_PAGES: usize = 1000;

/// Lookups answered with `deferred` keys are retried this many times.
const LOOKUP_MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionId {
    project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathElement {
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Key {
    partition_id: PartitionId,
    path: Vec<PathElement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Value {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blob_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude_from_indexes: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entity {
    #[serde(default)]
    key: Option<Key>,
    #[serde(default)]
    properties: HashMap<String, Value>,
}

impl Entity {
    /// The record name: the last key path element, else the `name` property.
    fn record_name(&self) -> Option<String> {
        self.key
            .as_ref()
            .and_then(|key| key.path.last())
            .and_then(|element| element.name.clone())
            .or_else(|| {
                self.properties
                    .get(NAME_PROPERTY)
                    .and_then(|value| value.string_value.clone())
            })
    }

    /// Placeholder name for an entity keyed by numeric id or not keyed at all.
    fn unnamed_label(&self, index: usize) -> String {
        match self
            .key
            .as_ref()
            .and_then(|key| key.path.last())
            .and_then(|element| element.id.as_deref())
        {
            Some(id) => format!("<id {id}>"),
            None => format!("<unnamed entity {index}>"),
        }
    }

    /// Decode the ciphertext property.
    ///
    /// Blobs are the native encoding; string values holding base64 ciphertext
    /// are accepted too.
    fn ciphertext(&self) -> Result<Vec<u8>> {
        let value = self.properties.get(CIPHERTEXT_PROPERTY).ok_or_else(|| {
            Error::Decode(format!("entity has no {CIPHERTEXT_PROPERTY:?} property"))
        })?;
        let encoded = value
            .blob_value
            .as_deref()
            .or(value.string_value.as_deref())
            .ok_or_else(|| {
                Error::Decode(format!("{CIPHERTEXT_PROPERTY:?} property is not a blob or string"))
            })?;
        STANDARD
            .decode(encoded)
            .map_err(|err| Error::Decode(format!("invalid base64 ciphertext: {err}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Mutation {
    Upsert(Entity),
}

#[derive(Serialize)]
struct CommitRequest {
    mode: &'static str,
    mutations: Vec<Mutation>,
}

#[derive(Serialize)]
struct LookupRequest {
    keys: Vec<Key>,
}

#[derive(Deserialize)]
struct EntityResult {
    entity: Entity,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
    /// Keys the server did not get to; they must be looked up again.
    #[serde(default)]
    deferred: Vec<Key>,
}

#[derive(Serialize)]
struct KindExpression<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Query<'a> {
    kind: Vec<KindExpression<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunQueryRequest<'a> {
    partition_id: PartitionId,
    query: Query<'a>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    more_results: Option<String>,
}

#[derive(Deserialize)]
struct RunQueryResponse {
    batch: QueryResultBatch,
}

/// Key store backed by Cloud Datastore.
#[derive(Clone)]
pub struct DatastoreKeyStore {
    project_id: String,
    api: ApiClient,
    max_pages: usize,
}

impl DatastoreKeyStore {
    pub fn new(project_id: impl Into<String>, client: Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            project_id: project_id.into(),
            api: ApiClient::new(SERVICE, DEFAULT_DATASTORE_ENDPOINT, client, tokens),
            max_pages: QUERY_MAX_PAGES,
        }
    }

    /// Override API base URL (useful for tests and the Datastore emulator).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = self.api.with_base_url(base_url);
        self
    }

    /// Cap the number of query pages `get_all` will follow.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    fn partition(&self) -> PartitionId {
        PartitionId {
            project_id: self.project_id.clone(),
            namespace_id: None,
        }
    }

    fn key(&self, kind: &str, name: &str) -> Key {
        Key {
            partition_id: self.partition(),
            path: vec![PathElement {
                kind: kind.to_string(),
                name: Some(name.to_string()),
                id: None,
            }],
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("/v1/projects/{}:{method}", self.project_id)
    }

    async fn run_query_page(&self, kind: &str, cursor: Option<&str>) -> Result<QueryResultBatch> {
        let response: RunQueryResponse = self
            .api
            .post(
                &self.endpoint("runQuery"),
                &[],
                &RunQueryRequest {
                    partition_id: self.partition(),
                    query: Query {
                        kind: vec![KindExpression { name: kind }],
                        start_cursor: cursor,
                    },
                },
            )
            .await?;
        Ok(response.batch)
    }
}

#[async_trait]
impl KeyStore for DatastoreKeyStore {
    async fn put(&self, kind: &str, name: &str, ciphertext: &[u8]) -> Result<()> {
        validate_name(name)?;

        let mut properties = HashMap::new();
        properties.insert(
            NAME_PROPERTY.to_string(),
            Value {
                string_value: Some(name.to_string()),
                ..Default::default()
            },
        );
        properties.insert(
            CIPHERTEXT_PROPERTY.to_string(),
            Value {
                blob_value: Some(STANDARD.encode(ciphertext)),
                exclude_from_indexes: Some(true),
                ..Default::default()
            },
        );

        let request = CommitRequest {
            mode: "NON_TRANSACTIONAL",
            mutations: vec![Mutation::Upsert(Entity {
                key: Some(self.key(kind, name)),
                properties,
            })],
        };

        let _: serde_json::Value = self.api.post(&self.endpoint("commit"), &[], &request).await?;
        tracing::debug!(kind, name, "Upserted credential entity");
        Ok(())
    }

    async fn get(&self, kind: &str, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;

        for attempt in 1..=LOOKUP_MAX_ATTEMPTS {
            let response: LookupResponse = self
                .api
                .post(
                    &self.endpoint("lookup"),
                    &[],
                    &LookupRequest {
                        keys: vec![self.key(kind, name)],
                    },
                )
                .await?;

            if let Some(found) = response.found.into_iter().next() {
                return found.entity.ciphertext();
            }
            if response.deferred.is_empty() {
                return Err(Error::NotFound(format!(
                    "credential {name:?} in kind {kind:?}"
                )));
            }
            tracing::debug!(kind, name, attempt, "Lookup deferred, retrying");
        }

        Err(Error::service(
            SERVICE,
            format!("lookup of {name:?} was still deferred after {LOOKUP_MAX_ATTEMPTS} attempts"),
        ))
    }

    async fn get_all(&self, kind: &str) -> Result<Records> {
        let mut records = Records::new();
        let mut cursor: Option<String> = None;

        for page in 0..self.max_pages {
            let batch = self.run_query_page(kind, cursor.as_deref()).await?;
            tracing::debug!(
                kind,
                page,
                results = batch.entity_results.len(),
                more = ?batch.more_results,
                "Fetched query page"
            );

            for result in batch.entity_results {
                let entity = result.entity;
                let (name, ciphertext) = match entity.record_name() {
                    Some(name) => (name, entity.ciphertext()),
                    None => (
                        entity.unnamed_label(records.len()),
                        Err(Error::Decode("entity has no name".to_string())),
                    ),
                };
                if let Err(err) = &ciphertext {
                    tracing::debug!(kind, name = %name, error = %err, "Unreadable entity");
                }
                records.insert(name, ciphertext);
            }

            let finished = matches!(batch.more_results.as_deref(), None | Some("NO_MORE_RESULTS"));
            if finished {
                return Ok(records);
            }
            match batch.end_cursor {
                Some(end) if Some(end.as_str()) != cursor.as_deref() => cursor = Some(end),
                _ => {
                    return Err(Error::service(
                        SERVICE,
                        format!(
                            "query for kind {kind:?} reported more results without advancing its cursor"
                        ),
                    ))
                }
            }
        }

        Err(Error::service(
            SERVICE,
            format!(
                "query for kind {kind:?} did not finish after {} pages",
                self.max_pages
            ),
        ))
    }

    fn name(&self) -> &str {
        "datastore"
    }
}
