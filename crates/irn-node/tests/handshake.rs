//! Two nodes on loopback: handshake, pull, push and error responses.

use std::net::SocketAddr;

use bytes::Bytes;
use chrono::{Duration, Utc};
use reqwest::Method;
use tokio::net::TcpListener;

use irn_core::messages::RegistrationOutcome;
use irn_core::{AccessLevel, ErrorCode, ErrorEnvelope, NodeId, RateLimitPolicy, SessionToken};
use irn_node::{NodeCredentials, NodeError, NodeOptions, NodeStores, ResearchNode};
use irn_store::EntityKind;
use irn_sync::{Manifest, ManifestRequest};
use irn_testkit::{sample_payload, TestIdentity};

fn credentials(identity: &TestIdentity) -> NodeCredentials {
    NodeCredentials::new(
        identity.node_id,
        identity.name.clone(),
        &identity.certificate,
        identity.signer.clone(),
    )
}

fn node(identity: &TestIdentity, stores: NodeStores, options: NodeOptions) -> ResearchNode {
    ResearchNode::new(credentials(identity), stores, options).unwrap()
}

async fn spawn(node: &ResearchNode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = node.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// `local` records `peer` as reachable at `addr`.
async fn add_peer(local: &ResearchNode, peer: &TestIdentity, addr: Option<SocketAddr>, level: AccessLevel, approve: bool) {
    let mut registration = peer.registration(level);
    if let Some(addr) = addr {
        registration.node_url = Some(format!("http://{addr}"));
    }
    let result = local.register_peer(&registration).await.unwrap();
    assert!(result.success, "{}", result.message);
    if approve {
        local.approve(&peer.node_id, Some(level)).await.unwrap();
    }
}

struct Pair {
    a: ResearchNode,
    a_stores: NodeStores,
    a_addr: SocketAddr,
    b: ResearchNode,
    id_a: TestIdentity,
    id_b: TestIdentity,
}

/// A serves; B knows A as authorized. A's view of B is up to the caller.
async fn pair(a_options: NodeOptions, b_on_a: Option<AccessLevel>) -> Pair {
    let id_a = TestIdentity::node_a();
    let id_b = TestIdentity::node_b();

    let a_stores = NodeStores::memory();
    let a = node(&id_a, a_stores.clone(), a_options);
    let a_addr = spawn(&a).await;

    let b = node(&id_b, NodeStores::memory(), NodeOptions::default());
    add_peer(&b, &id_a, Some(a_addr), AccessLevel::ReadOnly, true).await;

    match b_on_a {
        Some(level) => add_peer(&a, &id_b, None, level, true).await,
        None => add_peer(&a, &id_b, None, AccessLevel::ReadOnly, false).await,
    }

    Pair {
        a,
        a_stores,
        a_addr,
        b,
        id_a,
        id_b,
    }
}

async fn seed(pair: &Pair) {
    pair.a
        .importer()
        .import(NodeId::new(), sample_payload(NodeId::new(), Utc::now() - Duration::minutes(5)))
        .await
        .unwrap();
    pair.a_stores
        .blobs
        .upload("sess-1.edf", Bytes::from_static(b"EDF+C"), "application/edf")
        .await
        .unwrap();
}

async fn open_channels(node: &ResearchNode) -> usize {
    node.services().channels.count().await.unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Pull
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pull_copies_everything_over_the_wire() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    seed(&pair).await;

    let report = pair.b.pull(&pair.id_a.node_id, None).await.unwrap();
    assert_eq!(report.counts.sessions, 2);
    assert_eq!(report.files_uploaded, 1);
    assert_eq!(open_channels(&pair.a).await, 0);

    let session = pair
        .b
        .entities()
        .get(EntityKind::RecordSession, "sess-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.owner_node_id, Some(pair.id_b.node_id));
    for kind in [EntityKind::Volunteer, EntityKind::TargetArea, EntityKind::ResearchVolunteer] {
        assert_eq!(
            pair.b.entities().summary(kind, None).await.unwrap().count,
            pair.a_stores.entities.summary(kind, None).await.unwrap().count,
            "{kind}"
        );
    }

    let again = pair.b.pull(&pair.id_a.node_id, None).await.unwrap();
    assert_eq!(again.written(), 0);

    let logs = pair.b.sync_logs(Some(&pair.id_a.node_id)).await.unwrap();
    assert_eq!(logs.len(), 2);

    let node = pair.a.identity().get_by_id(&pair.id_b.node_id).await.unwrap().unwrap();
    assert!(node.last_authenticated_at.is_some());
}

#[tokio::test]
async fn test_pending_node_cannot_authenticate() {
    let pair = pair(NodeOptions::default(), None).await;

    let err = pair.b.pull(&pair.id_a.node_id, None).await.unwrap_err();
    assert!(matches!(err, NodeError::AuthenticationFailed(_)), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(open_channels(&pair.a).await, 0);
}

#[tokio::test]
async fn test_pull_from_unknown_node_fails_locally() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let err = pair.b.pull(&NodeId::new(), None).await.unwrap_err();
    assert!(matches!(err, NodeError::Sync(irn_sync::SyncError::NodeNotFound(_))), "{err}");
    assert_eq!(open_channels(&pair.a).await, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forged_session_is_rejected() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let client = pair.b.client();

    let session = client.connect(&format!("http://{}", pair.a_addr)).await.unwrap();
    let mut forged = session.clone();
    forged.session_token = SessionToken::from("not-a-session");

    let err = client
        .invoke::<_, Manifest>(&forged, Method::POST, "/api/sync/manifest", Some(&ManifestRequest { since: None }))
        .await
        .unwrap_err();
    match err {
        NodeError::Remote { status, code, .. } => {
            assert_eq!(status, 401);
            assert_eq!(code, ErrorCode::InvalidSession);
        }
        other => panic!("unexpected {other}"),
    }

    let manifest: Manifest = client
        .invoke(&session, Method::POST, "/api/sync/manifest", Some(&ManifestRequest { since: None }))
        .await
        .unwrap();
    assert_eq!(manifest.node_id, pair.id_a.node_id);
    client.close(&session).await;
    assert_eq!(open_channels(&pair.a).await, 0);
}

#[tokio::test]
async fn test_standard_endpoints_are_rate_limited() {
    let mut options = NodeOptions::default();
    options.session.standard = RateLimitPolicy::per_minute(1);
    let pair = pair(options, Some(AccessLevel::ReadOnly)).await;
    let client = pair.b.client();
    let session = client.connect(&format!("http://{}", pair.a_addr)).await.unwrap();

    let request = ManifestRequest { since: None };
    client
        .invoke::<_, Manifest>(&session, Method::POST, "/api/sync/manifest", Some(&request))
        .await
        .unwrap();
    let err = client
        .invoke::<_, Manifest>(&session, Method::POST, "/api/sync/manifest", Some(&request))
        .await
        .unwrap_err();
    match &err {
        NodeError::Remote { status, code, .. } => {
            assert_eq!(*status, 429);
            assert_eq!(*code, ErrorCode::RateLimitExceeded);
        }
        other => panic!("unexpected {other}"),
    }
    assert!(err.is_retryable());

    // Pages use the sync limit.
    let page: serde_json::Value = client
        .invoke::<(), _>(&session, Method::GET, "/api/sync/volunteers?page=1&pageSize=10", None)
        .await
        .unwrap();
    assert_eq!(page["page"], 1);
    client.close(&session).await;
}

#[tokio::test]
async fn test_revoked_node_loses_its_sessions() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let client = pair.b.client();
    let session = client.connect(&format!("http://{}", pair.a_addr)).await.unwrap();

    assert_eq!(pair.a.revoke(&pair.id_b.node_id).await.unwrap(), 1);

    let err = client
        .invoke::<_, Manifest>(&session, Method::POST, "/api/sync/manifest", Some(&ManifestRequest { since: None }))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::Remote { code: ErrorCode::InvalidSession, .. }), "{err}");
    client.close(&session).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Push
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_push_requires_read_write() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let payload = sample_payload(pair.id_b.node_id, Utc::now() - Duration::minutes(1));

    let err = pair.b.push_to(&pair.id_a.node_id, &payload).await.unwrap_err();
    assert!(
        matches!(err, NodeError::Remote { status: 403, code: ErrorCode::InsufficientPermissions, .. }),
        "{err}"
    );
    assert_eq!(open_channels(&pair.a).await, 0);

    pair.a
        .approve(&pair.id_b.node_id, Some(AccessLevel::ReadWrite))
        .await
        .unwrap();
    let report = pair.b.push_to(&pair.id_a.node_id, &payload).await.unwrap();
    assert_eq!(report.counts.sessions, 2);

    let session = pair
        .a_stores
        .entities
        .get(EntityKind::RecordSession, "sess-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.owner_node_id, Some(pair.id_a.node_id));
    let logs = pair.a.sync_logs(Some(&pair.id_b.node_id)).await.unwrap();
    assert_eq!(logs.len(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw requests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_error_envelopes_for_malformed_requests() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let http = reqwest::Client::new();
    let base = format!("http://{}", pair.a_addr);

    let response = http
        .post(format!("{base}/api/node/identify"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, ErrorCode::MissingChannelId);
    assert!(!envelope.error.retryable);

    let response = http
        .post(format!("{base}/api/node/identify"))
        .header("x-channel-id", "no-such-channel")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, ErrorCode::InvalidChannel);

    let response = http
        .post(format!("{base}/api/channel/open"))
        .body("")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, ErrorCode::EmptyBody);

    let health = http.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_register_with_records_pending_peer() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let id_c = TestIdentity::node_c();
    let c = node(&id_c, NodeStores::memory(), NodeOptions::default());

    let result = c
        .register_with(&format!("http://{}", pair.a_addr), AccessLevel::ReadOnly)
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(result.node_id, Some(id_c.node_id));

    let recorded = pair.a.identity().get_by_id(&id_c.node_id).await.unwrap().unwrap();
    assert_eq!(recorded.status, irn_core::AuthorizationStatus::Pending);
    assert_eq!(open_channels(&pair.a).await, 0);
}

#[tokio::test]
async fn test_register_cannot_take_over_authorized_peer() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let id_c = TestIdentity::node_c();

    // node-c's key and certificate, claiming node-b's id.
    let impostor = NodeCredentials::new(pair.id_b.node_id, "node-b", &id_c.certificate, id_c.signer.clone());
    let impostor = ResearchNode::new(
        impostor,
        NodeStores::memory(),
        NodeOptions {
            public_url: Some("https://elsewhere.irn.test".into()),
            ..NodeOptions::default()
        },
    )
    .unwrap();

    let result = impostor
        .register_with(&format!("http://{}", pair.a_addr), AccessLevel::Admin)
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.outcome, RegistrationOutcome::Rejected);

    let recorded = pair.a.identity().get_by_id(&pair.id_b.node_id).await.unwrap().unwrap();
    assert_eq!(recorded.status, irn_core::AuthorizationStatus::Authorized);
    assert_eq!(recorded.certificate_fingerprint, pair.id_b.certificate.fingerprint());
    assert_eq!(recorded.access_level, AccessLevel::ReadOnly);

    let session = pair.b.client().connect(&format!("http://{}", pair.a_addr)).await.unwrap();
    pair.b.client().close(&session).await;
}

#[tokio::test]
async fn test_rotation_countersigned_by_previous_key() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let id_c = TestIdentity::node_c();

    let rotated = NodeCredentials::new(pair.id_b.node_id, "node-b", &id_c.certificate, id_c.signer.clone())
        .with_previous_signer(pair.id_b.signer.clone());
    let rotated = ResearchNode::new(rotated, NodeStores::memory(), NodeOptions::default()).unwrap();

    let result = rotated
        .register_with(&format!("http://{}", pair.a_addr), AccessLevel::ReadOnly)
        .await
        .unwrap();
    assert!(result.success, "{}", result.message);
    assert_eq!(result.outcome, RegistrationOutcome::Updated);
    assert_eq!(result.status, irn_core::AuthorizationStatus::Pending);

    let recorded = pair.a.identity().get_by_id(&pair.id_b.node_id).await.unwrap().unwrap();
    assert_eq!(recorded.certificate_fingerprint, id_c.certificate.fingerprint());
}

#[tokio::test]
async fn test_large_bodies_only_accepted_by_import() {
    let pair = pair(NodeOptions::default(), Some(AccessLevel::ReadOnly)).await;
    let http = reqwest::Client::new();
    let base = format!("http://{}", pair.a_addr);
    let oversized = vec![b' '; irn_node::server::MAX_REQUEST_BYTES + 1];

    for path in ["/api/channel/open", "/api/node/register"] {
        let response = http
            .post(format!("{base}{path}"))
            .body(oversized.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 413, "{path}");
    }

    // Read in full; rejected for the missing channel, not the size.
    let response = http
        .post(format!("{base}/api/sync/import"))
        .body(oversized)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let envelope: ErrorEnvelope = response.json().await.unwrap();
    assert_eq!(envelope.error.code, ErrorCode::MissingChannelId);
}
