//! Handshake client against a misbehaving peer.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use irn_core::messages::OpenChannelResponse;
use irn_core::{Cipher, ErrorCode, ErrorEnvelope, KeyExchangeAlgorithm, PROTOCOL_VERSION};
use irn_node::{ClientConfig, HandshakeClient, NodeCredentials, NodeError};
use irn_store::{ChannelStore, MemoryChannelStore};
use irn_testkit::TestIdentity;

fn client_with_timeout(timeout: Duration) -> (HandshakeClient, Arc<MemoryChannelStore>) {
    let identity = TestIdentity::node_b();
    let credentials = NodeCredentials::new(
        identity.node_id,
        identity.name.clone(),
        &identity.certificate,
        identity.signer.clone(),
    );
    let config = ClientConfig {
        request_timeout: timeout,
        ..ClientConfig::default()
    };
    let channels = Arc::new(MemoryChannelStore::new());
    let client = HandshakeClient::new(credentials, config, channels.clone()).unwrap();
    (client, channels)
}

fn client() -> (HandshakeClient, Arc<MemoryChannelStore>) {
    client_with_timeout(Duration::from_secs(5))
}

fn open_response(ephemeral_public_key: String) -> OpenChannelResponse {
    OpenChannelResponse {
        protocol_version: PROTOCOL_VERSION.to_string(),
        ephemeral_public_key,
        key_exchange_algorithm: KeyExchangeAlgorithm::default().as_str().to_string(),
        selected_cipher: Cipher::Aes256Gcm.as_str().to_string(),
        timestamp: Utc::now(),
        nonce: STANDARD.encode([7u8; 32]),
    }
}

#[tokio::test]
async fn test_server_error_envelope_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channel/open"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(ErrorEnvelope::new(ErrorCode::Internal, "internal error", true)),
        )
        .mount(&server)
        .await;

    let (client, channels) = client();
    let err = client.connect(&server.uri()).await.unwrap_err();
    assert!(
        matches!(&err, NodeError::Remote { status: 500, code: ErrorCode::Internal, .. }),
        "expected remote internal error, got {err:?}"
    );
    assert!(err.is_retryable());
    assert_eq!(channels.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_bare_not_found_maps_to_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channel/open"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (client, _) = client();
    let err = client.open_channel(&server.uri()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_missing_channel_header_fails_handshake() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channel/open"))
        .respond_with(ResponseTemplate::new(200).set_body_json(open_response(STANDARD.encode([4u8; 97]))))
        .mount(&server)
        .await;

    let (client, channels) = client();
    let err = client.open_channel(&server.uri()).await.unwrap_err();
    assert!(matches!(&err, NodeError::Handshake(_)), "got {err:?}");
    assert_eq!(err.code(), ErrorCode::HandshakeFailed);
    assert_eq!(channels.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_peer_key_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channel/open"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-channel-id", "mock-channel")
                .set_body_json(open_response(STANDARD.encode([4u8; 97]))),
        )
        .mount(&server)
        .await;

    let (client, channels) = client();
    let err = client.open_channel(&server.uri()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidEphemeralKey, "got {err:?}");
    assert!(!err.is_retryable());
    assert_eq!(channels.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_slow_peer_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/channel/open"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;

    let (client, _) = client_with_timeout(Duration::from_millis(100));
    let err = client.open_channel(&server.uri()).await.unwrap_err();
    assert!(matches!(err, NodeError::Timeout), "got {err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unreachable_peer_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (client, _) = client();
    let err = client.connect(&format!("http://{addr}")).await.unwrap_err();
    assert!(matches!(err, NodeError::Transport(_)), "got {err:?}");
    assert!(err.is_retryable());
}
