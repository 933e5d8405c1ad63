use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use gcredstash::auth::StaticTokenProvider;
use gcredstash::error::Error;
use gcredstash::kms::{CloudKms, KeyManagement};
use gcredstash::resource::KeyRingRef;
use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY_PATH: &str = "/v1/projects/acme/locations/global/keyRings/gcredstash/cryptoKeys/gcredstash";

fn kms(server: &MockServer) -> CloudKms {
    let tokens = Arc::new(StaticTokenProvider::new(SecretString::new("test-token".into())));
    CloudKms::new(reqwest::Client::new(), tokens).with_base_url(server.uri())
}

fn ring() -> KeyRingRef {
    KeyRingRef::new("acme", "global", "gcredstash")
}

#[tokio::test]
async fn kms_encrypt_sends_base64_plaintext() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{KEY_PATH}:encrypt")))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({"plaintext": STANDARD.encode("s3cr3t")})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme/locations/global/keyRings/gcredstash/cryptoKeys/gcredstash/cryptoKeyVersions/1",
            "ciphertext": STANDARD.encode([0xde, 0xad, 0xbe, 0xef]),
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ciphertext = kms(&server)
        .encrypt(&ring().crypto_key("gcredstash"), b"s3cr3t")
        .await?;
    assert_eq!(ciphertext, vec![0xde, 0xad, 0xbe, 0xef]);

    Ok(())
}

#[tokio::test]
async fn kms_decrypt_returns_plaintext_bytes() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{KEY_PATH}:decrypt")))
        .and(body_json(json!({"ciphertext": STANDARD.encode([1, 2, 3])})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"plaintext": STANDARD.encode("s3cr3t")})),
        )
        .mount(&server)
        .await;

    let plaintext = kms(&server)
        .decrypt(&ring().crypto_key("gcredstash"), &[1, 2, 3])
        .await?;
    assert_eq!(plaintext, b"s3cr3t");

    Ok(())
}

#[tokio::test]
async fn kms_decrypt_failure_is_service_error() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{KEY_PATH}:decrypt")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {
                "code": 400,
                "message": "Decryption failed: the ciphertext is invalid.",
                "status": "INVALID_ARGUMENT"
            }
        })))
        .mount(&server)
        .await;

    let err = kms(&server)
        .decrypt(&ring().crypto_key("gcredstash"), b"garbage")
        .await
        .unwrap_err();
    match err {
        Error::Service { service, message } => {
            assert_eq!(service, "kms");
            assert!(message.contains("INVALID_ARGUMENT"));
            assert!(message.contains("ciphertext is invalid"));
        }
        other => panic!("expected service error, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn kms_create_key_ring_posts_id_as_query() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme/locations/global/keyRings"))
        .and(query_param("keyRingId", "gcredstash"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme/locations/global/keyRings/gcredstash",
            "createTime": "2024-01-15T10:00:00.123456Z"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let ring = kms(&server).create_key_ring(&ring()).await?;
    assert_eq!(ring.name, "projects/acme/locations/global/keyRings/gcredstash");
    assert!(ring.create_time.is_some());

    Ok(())
}

#[tokio::test]
async fn kms_create_crypto_key_requests_encrypt_decrypt() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme/locations/global/keyRings/gcredstash/cryptoKeys"))
        .and(query_param("cryptoKeyId", "app"))
        .and(body_json(json!({"purpose": "ENCRYPT_DECRYPT"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "projects/acme/locations/global/keyRings/gcredstash/cryptoKeys/app",
            "purpose": "ENCRYPT_DECRYPT"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let key = kms(&server).create_crypto_key(&ring().crypto_key("app")).await?;
    assert_eq!(
        key.name,
        "projects/acme/locations/global/keyRings/gcredstash/cryptoKeys/app"
    );
    assert_eq!(key.purpose.as_deref(), Some("ENCRYPT_DECRYPT"));

    Ok(())
}

#[tokio::test]
async fn kms_conflict_is_already_exists() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/projects/acme/locations/global/keyRings"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {
                "code": 409,
                "message": "KeyRing projects/acme/locations/global/keyRings/gcredstash already exists.",
                "status": "ALREADY_EXISTS"
            }
        })))
        .mount(&server)
        .await;

    let err = kms(&server).create_key_ring(&ring()).await.unwrap_err();
    assert!(err.is_already_exists(), "got {err:?}");

    Ok(())
}

#[tokio::test]
async fn kms_missing_key_is_not_found() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{KEY_PATH}:encrypt")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": 404, "message": "CryptoKey not found.", "status": "NOT_FOUND"}
        })))
        .mount(&server)
        .await;

    let err = kms(&server)
        .encrypt(&ring().crypto_key("gcredstash"), b"x")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "got {err:?}");

    Ok(())
}
