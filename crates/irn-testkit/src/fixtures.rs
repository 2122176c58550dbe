//! Test fixtures and helpers.
//!
//! Identities backed by checked-in RSA keys and certificates, a sample sync
//! payload, and an in-memory sync node.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use irn_core::messages::{
    challenge_message, identity_message, registration_message, AuthenticateRequest, IdentifyRequest,
    NodeRegistration, RegisterRequest,
};
use irn_core::{AccessLevel, ChannelId, NodeCertificate, NodeContact, NodeId, NodeSigner};
use irn_store::{MemoryBlobStore, MemoryEntityStore};
use irn_sync::{
    Device, ImportConfig, Record, RecordChannel, RecordSession, Research, ResearchDevice, ResearchResearcher,
    ResearchVolunteer, Researcher, SnomedBodyRegion, SnomedClinicalCondition, SnomedLaterality, SyncExporter,
    SyncImportPayload, SyncImporter, TargetArea, Volunteer, VolunteerCondition,
};

// ─────────────────────────────────────────────────────────────────────────────
// Identities
// ─────────────────────────────────────────────────────────────────────────────

/// A node identity with a valid certificate and its private key.
///
/// Certificates are RSA-2048, `O=IRN Test Institution`, valid until 2124.
pub struct TestIdentity {
    pub name: String,
    pub node_id: NodeId,
    /// Base64 DER, as sent on the wire.
    pub certificate_b64: String,
    pub certificate: NodeCertificate,
    pub signer: Arc<NodeSigner>,
}

impl TestIdentity {
    pub fn node_a() -> Self {
        Self::load(
            "node-a",
            0xA,
            include_str!("../data/node-a.cert.b64"),
            include_str!("../data/node-a.key.b64"),
        )
    }

    pub fn node_b() -> Self {
        Self::load(
            "node-b",
            0xB,
            include_str!("../data/node-b.cert.b64"),
            include_str!("../data/node-b.key.b64"),
        )
    }

    pub fn node_c() -> Self {
        Self::load(
            "node-c",
            0xC,
            include_str!("../data/node-c.cert.b64"),
            include_str!("../data/node-c.key.b64"),
        )
    }

    /// node-a's key pair in a certificate that expired in 2021.
    pub fn expired_certificate_b64() -> String {
        include_str!("../data/node-a-expired.cert.b64").trim().to_string()
    }

    fn load(name: &str, id: u128, cert_b64: &str, key_b64: &str) -> Self {
        let certificate_b64 = cert_b64.trim().to_string();
        let certificate = NodeCertificate::from_base64(&certificate_b64).expect("fixture certificate parses");
        let signer = NodeSigner::from_base64(key_b64.trim()).expect("fixture key parses");
        Self {
            name: name.to_string(),
            node_id: NodeId(Uuid::from_u128(id)),
            certificate_b64,
            certificate,
            signer: Arc::new(signer),
        }
    }

    fn sign(&self, message: &str) -> String {
        self.signer.sign_base64(message.as_bytes()).expect("fixture key signs")
    }

    /// A signed Phase 2 identify request.
    pub fn identify_request(&self, channel_id: &ChannelId, timestamp: DateTime<Utc>) -> IdentifyRequest {
        IdentifyRequest {
            channel_id: channel_id.clone(),
            node_id: self.node_id,
            node_name: self.name.clone(),
            certificate: self.certificate_b64.clone(),
            timestamp,
            signature: self.sign(&identity_message(channel_id, &self.node_id, &timestamp)),
        }
    }

    /// A signed Phase 3 response to `challenge`.
    pub fn authenticate_request(
        &self,
        channel_id: &ChannelId,
        challenge: &str,
        timestamp: DateTime<Utc>,
    ) -> AuthenticateRequest {
        AuthenticateRequest {
            channel_id: channel_id.clone(),
            node_id: self.node_id,
            challenge_data: challenge.to_string(),
            signature: self.sign(&challenge_message(challenge, channel_id, &self.node_id, &timestamp)),
            timestamp,
        }
    }

    /// Registration details for this identity, unsigned.
    pub fn registration(&self, requested_access_level: AccessLevel) -> NodeRegistration {
        NodeRegistration {
            node_id: self.node_id,
            node_name: self.name.clone(),
            certificate: self.certificate_b64.clone(),
            node_url: Some(format!("https://{}.irn.test", self.name)),
            contact: NodeContact {
                contact_name: Some("Test Operator".into()),
                contact_email: Some(format!("ops@{}.irn.test", self.name)),
                institution_name: Some("IRN Test Institution".into()),
                institution_details: None,
            },
            requested_access_level,
        }
    }

    /// `registration` sent on `channel_id`, signed with this identity's key
    /// over the fingerprint of whatever certificate it presents.
    pub fn signed_registration(&self, channel_id: &ChannelId, registration: NodeRegistration) -> RegisterRequest {
        let fingerprint = NodeCertificate::from_base64(&registration.certificate)
            .map(|cert| cert.fingerprint().to_string())
            .unwrap_or_default();
        let timestamp = Utc::now();
        let message = registration_message(channel_id, &registration.node_id, &fingerprint, &timestamp);
        RegisterRequest {
            channel_id: channel_id.clone(),
            registration,
            timestamp,
            signature: self.sign(&message),
            rotation_signature: None,
        }
    }

    /// A signed registration for this identity.
    pub fn register_request(&self, channel_id: &ChannelId, requested_access_level: AccessLevel) -> RegisterRequest {
        self.signed_registration(channel_id, self.registration(requested_access_level))
    }

    /// Countersign `request` with this identity's key, as the holder of the
    /// certificate currently on record.
    pub fn countersign_rotation(&self, request: &mut RegisterRequest) {
        let fingerprint = NodeCertificate::from_base64(&request.registration.certificate)
            .map(|cert| cert.fingerprint().to_string())
            .unwrap_or_default();
        request.rotation_signature = Some(self.sign(&request.signed_message(&fingerprint)));
    }
}

/// Identities for multi-node tests.
pub fn all_identities() -> Vec<TestIdentity> {
    vec![TestIdentity::node_a(), TestIdentity::node_b(), TestIdentity::node_c()]
}

// ─────────────────────────────────────────────────────────────────────────────
// Entities
// ─────────────────────────────────────────────────────────────────────────────

fn attrs(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn device(id: &str, updated_at: DateTime<Utc>) -> Device {
    Device {
        id: id.into(),
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        attributes: attrs(json!({ "deviceName": format!("EEG {id}"), "manufacturer": "Acme" })),
    }
}

pub fn researcher(id: &str, updated_at: DateTime<Utc>) -> Researcher {
    Researcher {
        id: id.into(),
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        attributes: attrs(json!({ "name": format!("Researcher {id}"), "role": "chief" })),
    }
}

pub fn volunteer(id: &str, updated_at: DateTime<Utc>) -> Volunteer {
    Volunteer {
        id: id.into(),
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        conditions: vec![VolunteerCondition {
            id: format!("{id}-cond"),
            created_at: updated_at,
            updated_at,
            attributes: attrs(json!({ "snomedCode": "38341003" })),
        }],
        allergies: vec![],
        medications: vec![],
        clinical_events: vec![],
        attributes: attrs(json!({ "bloodType": "O+", "gender": "unspecified" })),
    }
}

pub fn research(id: &str, updated_at: DateTime<Utc>) -> Research {
    Research {
        id: id.into(),
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        applications: vec![],
        devices: vec![],
        researchers: vec![],
        volunteers: vec![],
        attributes: attrs(json!({ "title": format!("Study {id}"), "status": "active" })),
    }
}

/// A session with one record and one channel; the channel references
/// `{id}.edf` when `with_file` is set.
pub fn session(id: &str, research_id: &str, updated_at: DateTime<Utc>, with_file: bool) -> RecordSession {
    RecordSession {
        id: id.into(),
        created_at: updated_at,
        updated_at,
        owner_node_id: None,
        research_id: research_id.into(),
        volunteer_id: None,
        records: vec![Record {
            id: format!("{id}-rec"),
            created_at: updated_at,
            updated_at,
            channels: vec![RecordChannel {
                id: format!("{id}-ch"),
                created_at: updated_at,
                updated_at,
                file_url: with_file.then(|| format!("https://files.irn.test/recordings/{id}.edf")),
                target_areas: vec![TargetArea {
                    id: format!("{id}-area"),
                    created_at: updated_at,
                    updated_at,
                    attributes: attrs(json!({ "region": "frontal" })),
                }],
                attributes: attrs(json!({ "samplingRate": 256 })),
            }],
            attributes: attrs(json!({ "recordType": "eeg" })),
        }],
        attributes: attrs(json!({ "startAt": updated_at })),
    }
}

/// A payload touching every group: catalog, volunteers, researchers, devices,
/// research with all link kinds, and two sessions (one with a file).
pub fn sample_payload(source: NodeId, updated_at: DateTime<Utc>) -> SyncImportPayload {
    let mut payload = SyncImportPayload::new(source, updated_at + Duration::seconds(1));

    payload.snomed.body_regions.push(SnomedBodyRegion {
        id: "snomed-region-head".into(),
        created_at: updated_at,
        updated_at,
        attributes: attrs(json!({ "snomedCode": "69536005", "displayName": "Head" })),
    });
    payload.snomed.lateralities.push(SnomedLaterality {
        id: "snomed-lat-left".into(),
        created_at: updated_at,
        updated_at,
        attributes: attrs(json!({ "snomedCode": "7771000", "displayName": "Left" })),
    });
    payload.snomed.clinical_conditions.push(SnomedClinicalCondition {
        id: "snomed-cond-epilepsy".into(),
        created_at: updated_at,
        updated_at,
        attributes: attrs(json!({ "snomedCode": "84757009", "displayName": "Epilepsy" })),
    });

    payload.volunteers.push(volunteer("vol-1", updated_at));
    payload.researchers.push(researcher("res-1", updated_at));
    payload.devices.push(device("dev-1", updated_at));

    let mut study = research("study-1", updated_at);
    study.devices.push(ResearchDevice {
        id: "study-1-dev-1".into(),
        created_at: updated_at,
        updated_at,
        device_id: "dev-1".into(),
        attributes: Map::new(),
    });
    study.researchers.push(ResearchResearcher {
        id: "study-1-res-1".into(),
        created_at: updated_at,
        updated_at,
        researcher_id: "res-1".into(),
        attributes: Map::new(),
    });
    study.volunteers.push(ResearchVolunteer {
        id: "study-1-vol-1".into(),
        created_at: updated_at,
        updated_at,
        volunteer_id: "vol-1".into(),
        attributes: Map::new(),
    });
    payload.research.push(study);

    let mut with_volunteer = session("sess-1", "study-1", updated_at, true);
    with_volunteer.volunteer_id = Some("vol-1".into());
    payload.sessions.push(with_volunteer);
    payload.sessions.push(session("sess-2", "study-1", updated_at, false));

    payload
}

/// Number of rows `sample_payload` writes, children included.
pub const SAMPLE_PAYLOAD_ROWS: u64 = 3 + 2 + 1 + 1 + 4 + 2 * 4;

// ─────────────────────────────────────────────────────────────────────────────
// Sync nodes
// ─────────────────────────────────────────────────────────────────────────────

/// An in-memory node with an exporter and an importer over the same store.
pub struct SyncNode {
    pub node_id: NodeId,
    pub store: Arc<MemoryEntityStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub exporter: Arc<SyncExporter>,
    pub importer: Arc<SyncImporter>,
}

impl SyncNode {
    pub fn new(node_id: NodeId, name: &str) -> Self {
        let store = Arc::new(MemoryEntityStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let exporter = SyncExporter::new(store.clone(), blobs.clone(), node_id, name);
        let importer = SyncImporter::new(store.clone(), blobs.clone(), node_id, ImportConfig::default());
        Self {
            node_id,
            store,
            blobs,
            exporter: Arc::new(exporter),
            importer: Arc::new(importer),
        }
    }

    /// Load a payload as if it had been imported from an unrelated node.
    pub async fn seed(&self, payload: SyncImportPayload) {
        self.importer
            .import(NodeId::new(), payload)
            .await
            .expect("seed payload imports");
    }
}
