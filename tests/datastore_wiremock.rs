use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gcredstash::auth::StaticTokenProvider;
use gcredstash::error::Error;
use gcredstash::keystore::{DatastoreKeyStore, KeyStore};
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn store(server: &MockServer) -> DatastoreKeyStore {
    let tokens = Arc::new(StaticTokenProvider::new(SecretString::new("test-token".into())));
    DatastoreKeyStore::new("acme", reqwest::Client::new(), tokens).with_base_url(server.uri())
}

fn entity(name: &str, ciphertext: &[u8]) -> serde_json::Value {
    json!({
        "entity": {
            "key": {
                "partitionId": {"projectId": "acme"},
                "path": [{"kind": "Credential", "name": name}]
            },
            "properties": {
                "name": {"stringValue": name},
                "ciphertext": {"blobValue": STANDARD.encode(ciphertext), "excludeFromIndexes": true}
            }
        },
        "version": "1"
    })
}

#[tokio::test]
async fn datastore_put_upserts_entity() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:commit"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({
            "mode": "NON_TRANSACTIONAL",
            "mutations": [{
                "upsert": {
                    "key": {
                        "partitionId": {"projectId": "acme"},
                        "path": [{"kind": "Credential", "name": "db_password"}]
                    },
                    "properties": {
                        "name": {"stringValue": "db_password"},
                        "ciphertext": {"blobValue": STANDARD.encode([9, 8, 7]), "excludeFromIndexes": true}
                    }
                }
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "mutationResults": [{"version": "1"}],
            "indexUpdates": 2
        })))
        .expect(1)
        .mount(&server)
        .await;

    store(&server).put("Credential", "db_password", &[9, 8, 7]).await?;

    Ok(())
}

#[tokio::test]
async fn datastore_get_decodes_found_entity() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:lookup"))
        .and(body_json(json!({
            "keys": [{
                "partitionId": {"projectId": "acme"},
                "path": [{"kind": "Credential", "name": "db_password"}]
            }]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"found": [entity("db_password", b"ct")]})),
        )
        .mount(&server)
        .await;

    let ciphertext = store(&server).get("Credential", "db_password").await?;
    assert_eq!(ciphertext, b"ct");

    Ok(())
}

#[tokio::test]
async fn datastore_get_missing_is_not_found() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:lookup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "missing": [{"entity": {"key": {"partitionId": {"projectId": "acme"}, "path": [{"kind": "Credential", "name": "nope"}]}}}]
        })))
        .mount(&server)
        .await;

    let err = store(&server).get("Credential", "nope").await.unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");

    Ok(())
}

#[tokio::test]
async fn datastore_get_all_follows_cursor() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .and(body_partial_json(json!({"query": {"startCursor": "cursor-1"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "FULL",
                "entityResults": [entity("c", b"3")],
                "endCursor": "cursor-2",
                "moreResults": "NO_MORE_RESULTS"
            }
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .and(body_partial_json(json!({
            "partitionId": {"projectId": "acme"},
            "query": {"kind": [{"name": "Credential"}]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResultType": "FULL",
                "entityResults": [entity("b", b"2"), entity("a", b"1")],
                "endCursor": "cursor-1",
                "moreResults": "MORE_RESULTS_AFTER_LIMIT"
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let records = store(&server).get_all("Credential").await?;
    let names: Vec<&str> = records.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(records["c"].as_deref().ok(), Some(&b"3"[..]));
    assert!(records.values().all(Result::is_ok));

    Ok(())
}

#[tokio::test]
async fn datastore_get_all_empty_kind() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {"entityResultType": "FULL", "moreResults": "NO_MORE_RESULTS"}
        })))
        .mount(&server)
        .await;

    assert!(store(&server).get_all("Credential").await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn datastore_permission_denied_is_service_error() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:commit"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {
                "code": 403,
                "message": "Missing or insufficient permissions.",
                "status": "PERMISSION_DENIED"
            }
        })))
        .mount(&server)
        .await;

    let err = store(&server).put("Credential", "x", b"y").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("datastore"), "{message}");
    assert!(message.contains("PERMISSION_DENIED"), "{message}");

    Ok(())
}

#[tokio::test]
async fn datastore_get_all_keeps_unreadable_records() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResults": [
                    entity("good", b"ct"),
                    {
                        "entity": {
                            "key": {
                                "partitionId": {"projectId": "acme"},
                                "path": [{"kind": "Credential", "name": "broken"}]
                            },
                            "properties": {"ciphertext": {"stringValue": "not base64!!"}}
                        }
                    },
                    {
                        "entity": {
                            "key": {
                                "partitionId": {"projectId": "acme"},
                                "path": [{"kind": "Credential", "id": "5629499534213120"}]
                            },
                            "properties": {"ciphertext": {"blobValue": "AQID"}}
                        }
                    }
                ],
                "moreResults": "NO_MORE_RESULTS"
            }
        })))
        .mount(&server)
        .await;

    let records = store(&server).get_all("Credential").await?;
    let names: Vec<&str> = records.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["<id 5629499534213120>", "broken", "good"]);
    assert_eq!(records["good"].as_deref().ok(), Some(&b"ct"[..]));
    assert!(matches!(records["broken"], Err(Error::Decode(_))));
    assert!(matches!(records["<id 5629499534213120>"], Err(Error::Decode(_))));

    Ok(())
}

#[tokio::test]
async fn datastore_get_all_rejects_stuck_cursor() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResults": [entity("a", b"1")],
                "endCursor": "cursor-1",
                "moreResults": "NOT_FINISHED"
            }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let err = store(&server).get_all("Credential").await.unwrap_err();
    assert!(matches!(err, Error::Service { .. }), "got {err:?}");
    assert!(err.to_string().contains("cursor"), "{err}");

    Ok(())
}

#[tokio::test]
async fn datastore_get_all_rejects_missing_cursor() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch": {"entityResults": [], "moreResults": "NOT_FINISHED"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = store(&server).get_all("Credential").await.unwrap_err();
    assert!(matches!(err, Error::Service { .. }), "got {err:?}");

    Ok(())
}

/// Serves a fresh cursor on every page and never finishes.
struct EndlessPages {
    served: AtomicUsize,
}

impl Respond for EndlessPages {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let page = self.served.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_json(json!({
            "batch": {
                "entityResults": [],
                "endCursor": format!("cursor-{page}"),
                "moreResults": "NOT_FINISHED"
            }
        }))
    }
}

#[tokio::test]
async fn datastore_get_all_stops_at_page_limit() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:runQuery"))
        .respond_with(EndlessPages {
            served: AtomicUsize::new(0),
        })
        .expect(3)
        .mount(&server)
        .await;

    let err = store(&server)
        .with_max_pages(3)
        .get_all("Credential")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Service { .. }), "got {err:?}");
    assert!(err.to_string().contains("3 pages"), "{err}");

    Ok(())
}

#[tokio::test]
async fn datastore_get_retries_deferred_lookup() -> Result<()> {
    let server = MockServer::start().await;
    let key = json!({
        "partitionId": {"projectId": "acme"},
        "path": [{"kind": "Credential", "name": "db_password"}]
    });

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:lookup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deferred": [key]})))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:lookup"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"found": [entity("db_password", b"ct")]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ciphertext = store(&server).get("Credential", "db_password").await?;
    assert_eq!(ciphertext, b"ct");

    Ok(())
}

#[tokio::test]
async fn datastore_get_always_deferred_is_service_error() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme:lookup"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "deferred": [{
                "partitionId": {"projectId": "acme"},
                "path": [{"kind": "Credential", "name": "db_password"}]
            }]
        })))
        .expect(5)
        .mount(&server)
        .await;

    let err = store(&server).get("Credential", "db_password").await.unwrap_err();
    assert!(matches!(err, Error::Service { .. }), "got {err:?}");
    assert!(!err.is_not_found());

    Ok(())
}
