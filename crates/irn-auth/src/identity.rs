//! Node identity: certificate verification and the registration lifecycle.
//!
//! A node is known by the fingerprint of its certificate. Registration creates
//! a `Pending` record that an operator must approve; identify reports the
//! current status of the presenting certificate.
//!
//! Registrations arriving over a channel are signed with the presented
//! certificate's key and bound to that channel. Operators enroll peers
//! directly with [`NodeIdentityService::enroll`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use irn_core::messages::{
    IdentifyRequest, IdentifyResponse, NodeRegistration, RegisterRequest, RegistrationOutcome, RegistrationResult,
    PHASE_CHALLENGE,
};
use irn_core::{AccessLevel, AuthorizationStatus, NodeCertificate, NodeId, RegisteredNode};
use irn_store::NodeRegistry;

use crate::error::Result;

/// Default tolerance between a signed timestamp and local time.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Identity service configuration.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Signed timestamps further than this from local time are rejected.
    pub max_clock_skew: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_clock_skew: Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
        }
    }
}

/// Whether `timestamp` is within `max_skew` of `now`, in either direction.
pub fn within_skew(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_skew: Duration) -> bool {
    let drift = now - timestamp;
    drift <= max_skew && -drift <= max_skew
}

/// Outcome of checking a signed identify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityCheck {
    /// Signature verified; carries the parsed certificate.
    Verified(NodeCertificate),
    /// The certificate could not be decoded or is not an accepted RSA key.
    InvalidCertificate(String),
    /// The certificate is outside its validity period.
    CertificateExpired,
    /// The signed timestamp is too far from local time.
    ClockSkew,
    /// The signature does not verify.
    BadSignature,
}

impl IdentityCheck {
    pub fn is_verified(&self) -> bool {
        matches!(self, IdentityCheck::Verified(_))
    }
}

/// Registry-backed identity service.
pub struct NodeIdentityService {
    registry: Arc<dyn NodeRegistry>,
    config: IdentityConfig,
}

impl NodeIdentityService {
    pub fn new(registry: Arc<dyn NodeRegistry>, config: IdentityConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Signatures
    // ─────────────────────────────────────────────────────────────────────────

    /// Check an identify request's certificate, timestamp and signature.
    pub fn check_identity(&self, request: &IdentifyRequest, now: DateTime<Utc>) -> IdentityCheck {
        let cert = match NodeCertificate::from_base64(&request.certificate) {
            Ok(cert) => cert,
            Err(e) => return IdentityCheck::InvalidCertificate(e.to_string()),
        };
        if !cert.is_valid_at(now) {
            return IdentityCheck::CertificateExpired;
        }
        if !within_skew(request.timestamp, now, self.config.max_clock_skew) {
            return IdentityCheck::ClockSkew;
        }
        if !cert.verify_base64(request.signed_message().as_bytes(), &request.signature) {
            return IdentityCheck::BadSignature;
        }
        IdentityCheck::Verified(cert)
    }

    /// Whether an identify request carries a valid signature from its certificate.
    pub fn verify_signature(&self, request: &IdentifyRequest) -> bool {
        let check = self.check_identity(request, Utc::now());
        if !check.is_verified() {
            tracing::warn!(node = %request.node_id, channel = %request.channel_id, ?check, "identify signature rejected");
        }
        check.is_verified()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identify
    // ─────────────────────────────────────────────────────────────────────────

    /// Report the authorization status of a verified certificate.
    ///
    /// The certificate must be registered to the node id the request claims.
    pub async fn identify(&self, request: &IdentifyRequest, cert: &NodeCertificate) -> Result<IdentifyResponse> {
        let node = match self.registry.get_by_fingerprint(cert.fingerprint()).await? {
            Some(node) if node.id == request.node_id => node,
            Some(node) => {
                tracing::warn!(claimed = %request.node_id, actual = %node.id, "certificate registered to another node");
                return Ok(unknown("certificate is registered to a different node"));
            }
            None => return Ok(unknown("node is not registered")),
        };

        let authorized = node.is_authorized();
        tracing::info!(node = %node.id, status = node.status.as_str(), "node identified");
        Ok(IdentifyResponse {
            status: node.status,
            node_id: Some(node.id),
            access_level: authorized.then_some(node.access_level),
            next_phase: authorized.then(|| PHASE_CHALLENGE.to_string()),
            message: (!authorized).then(|| format!("node status is {}", node.status.as_str())),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a node from a signed request received over a channel.
    ///
    /// The signature must verify against the presented certificate. Replacing
    /// the certificate already on record for the node id also needs a
    /// `rotation_signature` from the key on record. See [`Self::enroll`] for the
    /// rest of the rules.
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegistrationResult> {
        self.register_at(request, Utc::now()).await
    }

    pub async fn register_at(&self, request: &RegisterRequest, now: DateTime<Utc>) -> Result<RegistrationResult> {
        let registration = &request.registration;
        let cert = match admit(registration, now) {
            Ok(cert) => cert,
            Err(rejected) => return Ok(rejected),
        };
        if !within_skew(request.timestamp, now, self.config.max_clock_skew) {
            return Ok(RegistrationResult::rejected("registration timestamp is outside the allowed clock skew"));
        }
        let message = request.signed_message(cert.fingerprint());
        if !cert.verify_base64(message.as_bytes(), &request.signature) {
            tracing::warn!(node = %registration.node_id, channel = %request.channel_id, "registration signature rejected");
            return Ok(RegistrationResult::rejected("registration signature does not verify"));
        }

        let proves_current_key = |existing: &RegisteredNode| {
            request.rotation_signature.as_deref().is_some_and(|signature| {
                NodeCertificate::from_base64(&existing.certificate)
                    .is_ok_and(|current| current.verify_base64(message.as_bytes(), signature))
            })
        };
        self.apply(registration, &cert, now, proves_current_key).await
    }

    /// Record a node on an operator's behalf. No proof of key possession.
    ///
    /// - Same fingerprint and node id: mutable fields updated in place.
    /// - Same node id, new certificate: certificate rotated, status `Pending`.
    /// - Fingerprint bound to another node id: rejected.
    /// - Otherwise: inserted as `Pending`.
    ///
    /// Requesting more access than currently granted resets status to
    /// `Pending`. A `Revoked` node stays `Revoked`.
    pub async fn enroll(&self, registration: &NodeRegistration) -> Result<RegistrationResult> {
        self.enroll_at(registration, Utc::now()).await
    }

    pub async fn enroll_at(&self, registration: &NodeRegistration, now: DateTime<Utc>) -> Result<RegistrationResult> {
        let cert = match admit(registration, now) {
            Ok(cert) => cert,
            Err(rejected) => return Ok(rejected),
        };
        self.apply(registration, &cert, now, |_| true).await
    }

    async fn apply(
        &self,
        registration: &NodeRegistration,
        cert: &NodeCertificate,
        now: DateTime<Utc>,
        may_rotate: impl FnOnce(&RegisteredNode) -> bool,
    ) -> Result<RegistrationResult> {
        if let Some(existing) = self.registry.get_by_fingerprint(cert.fingerprint()).await? {
            if existing.id != registration.node_id {
                tracing::warn!(
                    requested = %registration.node_id,
                    bound = %existing.id,
                    "registration rejected: certificate bound to another node"
                );
                return Ok(RegistrationResult::rejected("certificate is already registered to another node"));
            }
            let updated = apply_update(existing, registration, cert, now, false);
            return self.store_update(updated).await;
        }

        if let Some(existing) = self.registry.get_by_id(&registration.node_id).await? {
            if !may_rotate(&existing) {
                tracing::warn!(node = %existing.id, "registration rejected: certificate change without proof of the current key");
                return Ok(RegistrationResult::rejected(
                    "node id is registered with another certificate; rotation must be signed by the current key",
                ));
            }
            tracing::info!(node = %existing.id, "rotating node certificate");
            let updated = apply_update(existing, registration, cert, now, true);
            return self.store_update(updated).await;
        }

        let node = RegisteredNode {
            id: registration.node_id,
            node_name: registration.node_name.clone(),
            certificate: cert.to_base64(),
            certificate_fingerprint: cert.fingerprint().to_string(),
            node_url: registration.node_url.clone(),
            contact: registration.contact.clone(),
            status: AuthorizationStatus::Pending,
            access_level: registration.requested_access_level,
            registered_at: now,
            updated_at: now,
            last_authenticated_at: None,
        };
        self.registry.insert(&node).await?;
        tracing::info!(node = %node.id, name = %node.node_name, "registered node, pending approval");

        Ok(RegistrationResult {
            success: true,
            outcome: RegistrationOutcome::Created,
            node_id: Some(node.id),
            status: node.status,
            message: "registration received, pending approval".into(),
        })
    }

    async fn store_update(&self, node: RegisteredNode) -> Result<RegistrationResult> {
        self.registry.update(&node).await?;
        tracing::info!(node = %node.id, status = node.status.as_str(), "updated node registration");
        Ok(RegistrationResult {
            success: true,
            outcome: RegistrationOutcome::Updated,
            node_id: Some(node.id),
            status: node.status,
            message: match node.status {
                AuthorizationStatus::Pending => "registration updated, pending approval".into(),
                AuthorizationStatus::Revoked => "registration updated, node remains revoked".into(),
                _ => "registration updated".into(),
            },
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Set a node's status and optionally its access level.
    ///
    /// Returns whether the node exists.
    pub async fn update_status(
        &self,
        id: &NodeId,
        status: AuthorizationStatus,
        access_level: Option<AccessLevel>,
    ) -> Result<bool> {
        let found = self.registry.set_status(id, status, access_level).await?;
        if found {
            tracing::info!(node = %id, status = status.as_str(), "node status changed");
        }
        Ok(found)
    }

    pub async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredNode>> {
        Ok(self.registry.get_by_fingerprint(fingerprint).await?)
    }

    pub async fn get_by_id(&self, id: &NodeId) -> Result<Option<RegisteredNode>> {
        Ok(self.registry.get_by_id(id).await?)
    }

    pub async fn list_all(&self) -> Result<Vec<RegisteredNode>> {
        Ok(self.registry.list_all().await?)
    }

    pub async fn mark_authenticated(&self, id: &NodeId, at: DateTime<Utc>) -> Result<()> {
        Ok(self.registry.mark_authenticated(id, at).await?)
    }
}

fn unknown(message: &str) -> IdentifyResponse {
    IdentifyResponse {
        status: AuthorizationStatus::Unknown,
        node_id: None,
        access_level: None,
        next_phase: None,
        message: Some(message.to_string()),
    }
}

/// Name present, certificate decodes and is currently valid.
fn admit(registration: &NodeRegistration, now: DateTime<Utc>) -> std::result::Result<NodeCertificate, RegistrationResult> {
    if registration.node_name.trim().is_empty() {
        return Err(RegistrationResult::rejected("node name is required"));
    }
    let cert = NodeCertificate::from_base64(&registration.certificate)
        .map_err(|e| RegistrationResult::rejected(e.to_string()))?;
    if !cert.is_valid_at(now) {
        return Err(RegistrationResult::rejected("certificate is expired or not yet valid"));
    }
    Ok(cert)
}

fn apply_update(
    mut node: RegisteredNode,
    registration: &NodeRegistration,
    cert: &NodeCertificate,
    now: DateTime<Utc>,
    rotated: bool,
) -> RegisteredNode {
    node.node_name = registration.node_name.clone();
    node.certificate = cert.to_base64();
    node.certificate_fingerprint = cert.fingerprint().to_string();
    if registration.node_url.is_some() {
        node.node_url = registration.node_url.clone();
    }
    node.contact = registration.contact.clone();
    node.updated_at = now;

    if node.status == AuthorizationStatus::Revoked {
        return node;
    }
    let escalating = registration.requested_access_level > node.access_level;
    if escalating {
        node.access_level = registration.requested_access_level;
    }
    if escalating || rotated {
        node.status = AuthorizationStatus::Pending;
    }
    node
}
