//! Node configuration
//!
//! Read from `irn-node.toml`. Every field has a default, so an empty file is
//! a valid (if anonymous) configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use irn_auth::{ChallengeConfig, IdentityConfig, SessionConfig};
use irn_core::{Cipher, KeyExchangeAlgorithm, NodeContact, NodeId, RateLimitPolicy, PROTOCOL_VERSION};
use irn_sync::{ImportConfig, PullConfig};

use crate::channel::ChannelConfig;
use crate::client::ClientConfig;
use crate::error::{NodeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub challenge: ChallengeSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub client: ClientSection,
}

/// This node's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Stable node id. Required to serve or pull.
    #[serde(default)]
    pub id: Option<NodeId>,

    #[serde(default = "default_node_name")]
    pub name: String,

    /// URL peers use to reach this node
    #[serde(default)]
    pub public_url: Option<String>,

    /// X.509 certificate, PEM or base64 DER
    #[serde(default = "default_certificate_path")]
    pub certificate_path: PathBuf,

    /// PKCS#8 RSA key, PEM or base64 DER
    #[serde(default = "default_private_key_path")]
    pub private_key_path: PathBuf,

    /// Key of the certificate being replaced; countersigns registrations
    #[serde(default)]
    pub previous_private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub institution: Option<String>,

    #[serde(default)]
    pub contact_name: Option<String>,

    #[serde(default)]
    pub contact_email: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            id: None,
            name: default_node_name(),
            public_url: None,
            certificate_path: default_certificate_path(),
            private_key_path: default_private_key_path(),
            previous_private_key_path: None,
            institution: None,
            contact_name: None,
            contact_email: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    #[serde(default = "default_channel_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_key_exchange")]
    pub key_exchange_algorithm: String,

    /// Preference order
    #[serde(default = "default_ciphers")]
    pub supported_ciphers: Vec<String>,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(default = "default_clock_skew")]
    pub max_clock_skew_secs: u64,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_channel_ttl(),
            key_exchange_algorithm: default_key_exchange(),
            supported_ciphers: default_ciphers(),
            protocol_version: default_protocol_version(),
            max_clock_skew_secs: default_clock_skew(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// Limit for bulk sync endpoints
    #[serde(default = "default_sync_rate_limit")]
    pub sync_rate_limit_per_minute: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            rate_limit_per_minute: default_rate_limit(),
            sync_rate_limit_per_minute: default_sync_rate_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeSection {
    #[serde(default = "default_challenge_ttl")]
    pub ttl_secs: u64,
}

impl Default for ChallengeSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_challenge_ttl(),
        }
    }
}

/// Where channels, sessions and challenges live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// In-process maps. Single instance only.
    #[default]
    Memory,
    /// Shared Redis, for several instances behind one URL.
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: CacheBackend,

    #[serde(default)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite database for the registry and entities
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Recording files
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            blob_dir: default_blob_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            page_size: default_page_size(),
        }
    }
}

// Defaults
fn default_node_name() -> String { "irn-node".to_string() }
fn default_certificate_path() -> PathBuf { PathBuf::from("certs/node.crt") }
fn default_private_key_path() -> PathBuf { PathBuf::from("certs/node.key") }
fn default_listen_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8443)) }
fn default_channel_ttl() -> u64 { 30 * 60 }
fn default_key_exchange() -> String { KeyExchangeAlgorithm::default().as_str().to_string() }
fn default_ciphers() -> Vec<String> { Cipher::ALL.iter().map(|c| c.as_str().to_string()).collect() }
fn default_protocol_version() -> String { PROTOCOL_VERSION.to_string() }
fn default_clock_skew() -> u64 { 300 }
fn default_session_ttl() -> u64 { 60 * 60 }
fn default_rate_limit() -> u32 { 60 }
fn default_sync_rate_limit() -> u32 { 600 }
fn default_challenge_ttl() -> u64 { 300 }
fn default_database_path() -> PathBuf { PathBuf::from("data/irn.db") }
fn default_blob_dir() -> PathBuf { PathBuf::from("data/recordings") }
fn default_request_timeout() -> u64 { 30 }
fn default_page_size() -> u32 { 100 }

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

impl NodeConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))
    }

    /// Load from a TOML file if it exists, else use defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn node_id(&self) -> Result<NodeId> {
        self.node
            .id
            .ok_or_else(|| NodeError::Config("node.id is not set".into()))
    }

    pub fn contact(&self) -> NodeContact {
        NodeContact {
            contact_name: self.node.contact_name.clone(),
            contact_email: self.node.contact_email.clone(),
            institution_name: self.node.institution.clone(),
            institution_details: None,
        }
    }

    pub fn channel_config(&self) -> Result<ChannelConfig> {
        let key_exchange: KeyExchangeAlgorithm = self
            .channel
            .key_exchange_algorithm
            .parse()
            .map_err(|e| NodeError::Config(format!("channel.key_exchange_algorithm: {e}")))?;
        let ciphers = self
            .channel
            .supported_ciphers
            .iter()
            .map(|name| name.parse::<Cipher>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NodeError::Config(format!("channel.supported_ciphers: {e}")))?;
        if ciphers.is_empty() {
            return Err(NodeError::Config("channel.supported_ciphers is empty".into()));
        }
        Ok(ChannelConfig {
            ttl: secs(self.channel.ttl_secs),
            key_exchange,
            ciphers,
            protocol_version: self.channel.protocol_version.clone(),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: secs(self.session.ttl_secs),
            standard: RateLimitPolicy::per_minute(self.session.rate_limit_per_minute),
            sync: RateLimitPolicy::per_minute(self.session.sync_rate_limit_per_minute),
        }
    }

    pub fn challenge_config(&self) -> ChallengeConfig {
        ChallengeConfig {
            ttl: secs(self.challenge.ttl_secs),
            max_clock_skew: secs(self.channel.max_clock_skew_secs),
        }
    }

    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            max_clock_skew: secs(self.channel.max_clock_skew_secs),
        }
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        Ok(ClientConfig {
            request_timeout: StdDuration::from_secs(self.client.request_timeout_secs),
            channel: self.channel_config()?,
        })
    }

    pub fn pull_config(&self) -> PullConfig {
        PullConfig {
            page_size: self.client.page_size,
            ..PullConfig::default()
        }
    }

    pub fn import_config(&self) -> ImportConfig {
        ImportConfig::default()
    }
}
