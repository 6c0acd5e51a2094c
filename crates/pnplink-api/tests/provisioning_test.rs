// Integration tests for the provisioning handshake using wiremock.

#![allow(clippy::unwrap_used)]

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pnplink_api::{Identity, ProvisioningClient, ProvisioningConfig, ProvisioningError};

const SCOPE: &str = "0ne00000000";
const REGISTER_PATH: &str = "/0ne00000000/registrations/gw-01/register";
const MODEL_ID: &str = "dtmi:pnplink:gateway;1";

// ── Helpers ─────────────────────────────────────────────────────────

fn identity(server: &MockServer) -> Identity {
    Identity::new(
        MODEL_ID,
        "gw-01",
        SCOPE,
        SecretString::from("MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=".to_string()),
    )
    .with_endpoint(server.uri())
}

fn client(timeout: Duration) -> ProvisioningClient {
    ProvisioningClient::with_client(
        reqwest::Client::new(),
        ProvisioningConfig {
            timeout,
            ..ProvisioningConfig::default()
        },
    )
}

fn assigned() -> serde_json::Value {
    json!({
        "operationId": "4.0a1b2c",
        "status": "assigned",
        "registrationState": {
            "registrationId": "gw-01",
            "assignedHub": "hub-01.example.net",
            "deviceId": "gw-01",
            "status": "assigned"
        }
    })
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_assigned_immediately() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .and(query_param("api-version", "2021-06-01"))
        .and(header_exists("authorization"))
        .and(body_partial_json(json!({
            "registrationId": "gw-01",
            "payload": { "modelId": MODEL_ID }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .expect(1)
        .mount(&server)
        .await;

    let registration = client(Duration::from_secs(10))
        .register(&identity(&server))
        .await
        .unwrap();

    assert_eq!(registration.endpoint, "hub-01.example.net");
    assert_eq!(registration.device_id, "gw-01");
}

#[tokio::test]
async fn test_register_polls_until_assigned() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("retry-after", "1")
                .set_body_json(json!({"operationId": "4.0a1b2c", "status": "assigning"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/0ne00000000/registrations/gw-01/operations/4.0a1b2c"))
        .and(query_param("api-version", "2021-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .expect(1)
        .mount(&server)
        .await;

    let registration = client(Duration::from_secs(10))
        .register(&identity(&server))
        .await
        .unwrap();
    assert_eq!(registration.endpoint, "hub-01.example.net");
}

// ── Failures ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_register_failed_status_is_not_assigned() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operationId": "4.0a1b2c",
            "status": "failed",
            "registrationState": { "status": "failed", "errorMessage": "enrollment disabled" }
        })))
        .mount(&server)
        .await;

    let err = client(Duration::from_secs(10))
        .register(&identity(&server))
        .await
        .unwrap_err();
    match err {
        ProvisioningError::NotAssigned { status } => assert_eq!(status, "failed"),
        other => panic!("expected NotAssigned, got {other:?}"),
    }
}

#[tokio::test]
async fn test_register_unassigned_with_operation_is_terminal() {
    let server = MockServer::start().await;
    let unassigned = json!({"operationId": "4.1", "status": "unassigned"});

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(unassigned.clone()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(unassigned))
        .expect(0)
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let err = client(Duration::from_secs(4))
        .register(&identity(&server))
        .await
        .unwrap_err();
    match err {
        ProvisioningError::NotAssigned { status } => assert_eq!(status, "unassigned"),
        other => panic!("expected NotAssigned, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_register_unauthorized() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client(Duration::from_secs(10))
        .register(&identity(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Unauthorized { status: 401 }));
}

#[tokio::test]
async fn test_register_server_error_carries_message() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({"message": "service unavailable"})),
        )
        .mount(&server)
        .await;

    let err = client(Duration::from_secs(10))
        .register(&identity(&server))
        .await
        .unwrap_err();
    match err {
        ProvisioningError::Rejected { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "service unavailable");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_register_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(assigned())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let err = client(Duration::from_millis(300))
        .register(&identity(&server))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Timeout { .. }));
}

#[tokio::test]
async fn test_register_invalid_key() {
    let server = MockServer::start().await;
    let mut identity = identity(&server);
    identity.symmetric_key = SecretString::from("%%% not base64".to_string());

    let err = client(Duration::from_secs(10))
        .register(&identity)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::InvalidKey(_)));
}
