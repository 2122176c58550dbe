//! Identity records for known peer nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AccessLevel, AuthorizationStatus, NodeId};

/// Contact and institution details supplied at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeContact {
    pub contact_name: Option<String>,
    pub contact_email: Option<String>,
    pub institution_name: Option<String>,
    pub institution_details: Option<String>,
}

/// A node in the identity registry.
///
/// `certificate_fingerprint` is unique across the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredNode {
    pub id: NodeId,
    pub node_name: String,
    /// Base64 DER certificate.
    pub certificate: String,
    pub certificate_fingerprint: String,
    pub node_url: Option<String>,
    #[serde(flatten)]
    pub contact: NodeContact,
    pub status: AuthorizationStatus,
    pub access_level: AccessLevel,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
}

impl RegisteredNode {
    pub fn is_authorized(&self) -> bool {
        self.status == AuthorizationStatus::Authorized
    }
}
