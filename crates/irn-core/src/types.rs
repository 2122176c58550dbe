//! Strong type definitions for IRN.
//!
//! Identifiers are newtypes so a channel id can never be passed where a
//! session token is expected.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a registered research node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub Uuid);

impl NodeId {
    /// Generate a new random node id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the canonical hyphenated form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Opaque identifier of an encrypted channel.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Generate a fresh, unguessable channel id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An opaque, unguessable session token.
///
/// `Debug` and `Display` only reveal the first eight characters.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(pub String);

impl SessionToken {
    /// Generate a token from 32 bytes of OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Borrow the full token.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A short prefix that is safe to log.
    pub fn prefix(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({}…)", self.prefix())
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", self.prefix())
    }
}

impl From<&str> for SessionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Capability level granted to a node.
///
/// The variant order is the capability order: `ReadOnly < ReadWrite < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    ReadOnly,
    ReadWrite,
    Admin,
}

impl AccessLevel {
    /// Whether this level satisfies an endpoint's minimum requirement.
    pub fn satisfies(self, required: AccessLevel) -> bool {
        self >= required
    }

    /// Stable string form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::ReadOnly => "ReadOnly",
            AccessLevel::ReadWrite => "ReadWrite",
            AccessLevel::Admin => "Admin",
        }
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ReadOnly" => Ok(AccessLevel::ReadOnly),
            "ReadWrite" => Ok(AccessLevel::ReadWrite),
            "Admin" => Ok(AccessLevel::Admin),
            other => Err(format!("unknown access level: {other}")),
        }
    }
}

/// Authorization state of a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Unknown,
    Pending,
    Authorized,
    Revoked,
}

impl AuthorizationStatus {
    /// Stable string form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthorizationStatus::Unknown => "Unknown",
            AuthorizationStatus::Pending => "Pending",
            AuthorizationStatus::Authorized => "Authorized",
            AuthorizationStatus::Revoked => "Revoked",
        }
    }
}

impl FromStr for AuthorizationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(AuthorizationStatus::Unknown),
            "Pending" => Ok(AuthorizationStatus::Pending),
            "Authorized" => Ok(AuthorizationStatus::Authorized),
            "Revoked" => Ok(AuthorizationStatus::Revoked),
            other => Err(format!("unknown authorization status: {other}")),
        }
    }
}

/// Which side of the handshake created a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Initiator,
    Responder,
}

/// Format a timestamp the way it appears inside signed strings.
///
/// RFC 3339, millisecond precision, `Z` suffix.
pub fn signing_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time truncated to millisecond precision.
///
/// Timestamps that end up inside signed strings are truncated so the value
/// survives a JSON round trip unchanged.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_ordering() {
        assert!(AccessLevel::ReadOnly < AccessLevel::ReadWrite);
        assert!(AccessLevel::ReadWrite < AccessLevel::Admin);
        assert!(AccessLevel::Admin.satisfies(AccessLevel::ReadWrite));
        assert!(AccessLevel::ReadWrite.satisfies(AccessLevel::ReadWrite));
        assert!(!AccessLevel::ReadOnly.satisfies(AccessLevel::ReadWrite));
    }

    #[test]
    fn test_access_level_string_roundtrip() {
        for level in [AccessLevel::ReadOnly, AccessLevel::ReadWrite, AccessLevel::Admin] {
            assert_eq!(level.as_str().parse::<AccessLevel>().unwrap(), level);
        }
        assert!("Root".parse::<AccessLevel>().is_err());
    }

    #[test]
    fn test_session_token_debug_is_redacted() {
        let token = SessionToken::generate();
        let debug = format!("{:?}", token);
        assert!(!debug.contains(token.as_str()));
        assert_eq!(token.prefix().len(), 8);
    }

    #[test]
    fn test_session_tokens_are_unique() {
        assert_ne!(SessionToken::generate(), SessionToken::generate());
    }

    #[test]
    fn test_signing_timestamp_survives_json() {
        let ts = now_millis();
        let json = serde_json::to_string(&ts).unwrap();
        let back: DateTime<Utc> = serde_json::from_str(&json).unwrap();
        assert_eq!(signing_timestamp(&ts), signing_timestamp(&back));
        assert!(signing_timestamp(&ts).ends_with('Z'));
    }
}
