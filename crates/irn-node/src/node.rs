//! The research node: stores, responder services, client and puller in one
//! place.

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use reqwest::Method;
use tokio::net::TcpListener;

use irn_auth::{
    ChallengeAuth, ChallengeConfig, IdentityConfig, NodeIdentityService, SessionConfig, SessionManager,
};
use irn_core::messages::{NodeRegistration, RegistrationResult};
use irn_core::{AccessLevel, AuthorizationStatus, NodeContact, NodeId, RegisteredNode};
use irn_store::{
    BlobStore, ChallengeStore, ChannelStore, EntityStore, FsBlobStore, MemoryBlobStore, MemoryChallengeStore,
    MemoryChannelStore, MemoryEntityStore, MemoryNodeRegistry, MemorySessionStore, NodeRegistry,
    RedisChallengeStore, RedisChannelStore, RedisSessionStore, SessionStore, SqliteStore, SyncLog,
};
use irn_sync::{
    ImportConfig, ImportReport, PullConfig, SyncError, SyncExporter, SyncImportPayload, SyncImporter, SyncPuller,
};

use crate::channel::{ChannelConfig, ChannelManager};
use crate::client::{load_signer, ClientConfig, HandshakeClient, NodeCredentials};
use crate::config::{CacheBackend, NodeConfig};
use crate::error::{NodeError, Result};
use crate::remote::RemoteSource;
use crate::server::{self, AppState, NodeServices};

// ─────────────────────────────────────────────────────────────────────────────
// Stores
// ─────────────────────────────────────────────────────────────────────────────

/// Every backend the node needs.
#[derive(Clone)]
pub struct NodeStores {
    pub channels: Arc<dyn ChannelStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub registry: Arc<dyn NodeRegistry>,
    pub entities: Arc<dyn EntityStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl NodeStores {
    /// All in memory. Used by tests and throwaway nodes.
    pub fn memory() -> Self {
        Self {
            channels: Arc::new(MemoryChannelStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            challenges: Arc::new(MemoryChallengeStore::new()),
            registry: Arc::new(MemoryNodeRegistry::new()),
            entities: Arc::new(MemoryEntityStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
        }
    }

    /// SQLite for the registry and entities, a directory for recordings,
    /// and the configured cache backend for channels, sessions and
    /// challenges.
    pub async fn open(config: &NodeConfig) -> Result<Self> {
        let db_path = &config.storage.database_path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let sqlite = Arc::new(SqliteStore::open(db_path)?);
        let blobs = Arc::new(FsBlobStore::open(config.storage.blob_dir.clone()).await?);

        let cache = match config.cache.backend {
            CacheBackend::Memory => CacheStores {
                channels: Arc::new(MemoryChannelStore::new()),
                sessions: Arc::new(MemorySessionStore::new()),
                challenges: Arc::new(MemoryChallengeStore::new()),
            },
            CacheBackend::Redis => {
                let url = config
                    .cache
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| NodeError::Config("cache.redis_url is required for the redis backend".into()))?;
                let conn = irn_store::cache::connect(url).await?;
                CacheStores {
                    channels: Arc::new(RedisChannelStore::new(conn.clone())),
                    sessions: Arc::new(RedisSessionStore::new(conn.clone())),
                    challenges: Arc::new(RedisChallengeStore::new(conn)),
                }
            }
        };
        tracing::info!(
            database = %db_path.display(),
            blobs = %config.storage.blob_dir.display(),
            cache = ?config.cache.backend,
            "stores opened"
        );

        Ok(Self {
            channels: cache.channels,
            sessions: cache.sessions,
            challenges: cache.challenges,
            registry: sqlite.clone(),
            entities: sqlite,
            blobs,
        })
    }
}

struct CacheStores {
    channels: Arc<dyn ChannelStore>,
    sessions: Arc<dyn SessionStore>,
    challenges: Arc<dyn ChallengeStore>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for every component.
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub channel: ChannelConfig,
    pub session: SessionConfig,
    pub challenge: ChallengeConfig,
    pub identity: IdentityConfig,
    pub client: ClientConfig,
    pub pull: PullConfig,
    pub import: ImportConfig,
    /// URL advertised when registering with peers.
    pub public_url: Option<String>,
    pub contact: NodeContact,
}

impl NodeOptions {
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        Ok(Self {
            channel: config.channel_config()?,
            session: config.session_config(),
            challenge: config.challenge_config(),
            identity: config.identity_config(),
            client: config.client_config()?,
            pull: config.pull_config(),
            import: config.import_config(),
            public_url: config.node.public_url.clone(),
            contact: config.contact(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Node
// ─────────────────────────────────────────────────────────────────────────────

/// A research node.
///
/// Serves the four-phase handshake and sync endpoints, and pulls from or
/// pushes to registered peers.
pub struct ResearchNode {
    services: AppState,
    client: Arc<HandshakeClient>,
    puller: SyncPuller,
    entities: Arc<dyn EntityStore>,
    public_url: Option<String>,
    contact: NodeContact,
}

impl ResearchNode {
    pub fn new(credentials: NodeCredentials, stores: NodeStores, options: NodeOptions) -> Result<Self> {
        let node_id = credentials.node_id;
        let node_name = credentials.node_name.clone();

        let sessions = Arc::new(SessionManager::new(stores.sessions, options.session));
        let challenges = ChallengeAuth::new(stores.challenges, sessions, options.challenge);
        let identity = NodeIdentityService::new(stores.registry.clone(), options.identity);
        let exporter = Arc::new(SyncExporter::new(
            stores.entities.clone(),
            stores.blobs.clone(),
            node_id,
            node_name.clone(),
        ));
        let importer = Arc::new(SyncImporter::new(
            stores.entities.clone(),
            stores.blobs,
            node_id,
            options.import,
        ));
        let puller = SyncPuller::new(
            stores.registry,
            stores.entities.clone(),
            importer.clone(),
            options.pull,
        );

        // Initiator channels live apart from the ones this node serves.
        let client = Arc::new(HandshakeClient::new(
            credentials,
            options.client,
            Arc::new(MemoryChannelStore::new()),
        )?);

        let services = Arc::new(NodeServices {
            node_id,
            node_name,
            channels: ChannelManager::new(stores.channels, options.channel),
            identity,
            challenges,
            exporter,
            importer,
        });

        Ok(Self {
            services,
            client,
            puller,
            entities: stores.entities,
            public_url: options.public_url,
            contact: options.contact,
        })
    }

    /// Open the configured stores and load credentials from disk.
    pub async fn from_config(config: &NodeConfig) -> Result<Self> {
        let mut credentials = NodeCredentials::load(
            config.node_id()?,
            config.node.name.clone(),
            &config.node.certificate_path,
            &config.node.private_key_path,
        )?;
        if let Some(path) = &config.node.previous_private_key_path {
            credentials = credentials.with_previous_signer(Arc::new(load_signer(path)?));
        }
        let stores = NodeStores::open(config).await?;
        Self::new(credentials, stores, NodeOptions::from_config(config)?)
    }

    pub fn node_id(&self) -> NodeId {
        self.services.node_id
    }

    pub fn name(&self) -> &str {
        &self.services.node_name
    }

    pub fn services(&self) -> &AppState {
        &self.services
    }

    pub fn client(&self) -> &Arc<HandshakeClient> {
        &self.client
    }

    pub fn identity(&self) -> &NodeIdentityService {
        &self.services.identity
    }

    pub fn entities(&self) -> &Arc<dyn EntityStore> {
        &self.entities
    }

    pub fn importer(&self) -> &Arc<SyncImporter> {
        &self.services.importer
    }

    pub fn router(&self) -> Router {
        server::router(self.services.clone())
    }

    /// Serve until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(node = %self.node_id(), %addr, "serving");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Pull everything newer than `since` from `remote` and import it.
    ///
    /// With no `since`, resumes from the last completed pull.
    pub async fn pull(&self, remote: &NodeId, since: Option<DateTime<Utc>>) -> Result<ImportReport> {
        let target = self.puller.resolve_target(remote).await?;
        let since = self.puller.resolve_since(remote, since).await?;
        let url = target.node_url.ok_or(SyncError::MissingNodeUrl(*remote))?;
        tracing::info!(remote = %remote, url = %url, since = ?since, "pull starting");

        let session = self.client.connect(&url).await?;
        let mut source = RemoteSource::new(self.client.clone(), session);
        let report = self.puller.pull_from(&mut source, *remote, since).await?;
        tracing::info!(remote = %remote, written = report.written(), "pull finished");
        Ok(report)
    }

    /// Push a payload to `remote`'s import endpoint.
    pub async fn push_to(&self, remote: &NodeId, payload: &SyncImportPayload) -> Result<ImportReport> {
        let target = self.puller.resolve_target(remote).await?;
        let url = target.node_url.ok_or(SyncError::MissingNodeUrl(*remote))?;

        let session = self.client.connect(&url).await?;
        let result = self
            .client
            .invoke(&session, Method::POST, "/api/sync/import", Some(payload))
            .await;
        self.client.close(&session).await;
        result
    }

    /// Sync history, newest first.
    pub async fn sync_logs(&self, remote: Option<&NodeId>) -> Result<Vec<SyncLog>> {
        Ok(self.entities.list_sync_logs(remote).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the node at `base_url` to register us.
    pub async fn register_with(&self, base_url: &str, access_level: AccessLevel) -> Result<RegistrationResult> {
        let registration =
            self.client
                .credentials()
                .registration(self.public_url.clone(), self.contact.clone(), access_level);
        let result = self.client.register(base_url, &registration).await?;
        tracing::info!(peer = base_url, outcome = ?result.outcome, status = ?result.status, "registration sent");
        Ok(result)
    }

    /// Record a peer locally on the operator's word, as `Pending`.
    pub async fn register_peer(&self, registration: &NodeRegistration) -> Result<RegistrationResult> {
        Ok(self.services.identity.enroll(registration).await?)
    }

    /// Authorize a peer, optionally changing its access level.
    pub async fn approve(&self, id: &NodeId, access_level: Option<AccessLevel>) -> Result<()> {
        let found = self
            .services
            .identity
            .update_status(id, AuthorizationStatus::Authorized, access_level)
            .await?;
        if !found {
            return Err(NodeError::NodeNotFound(*id));
        }
        Ok(())
    }

    /// Revoke a peer and end its live sessions.
    pub async fn revoke(&self, id: &NodeId) -> Result<usize> {
        let found = self
            .services
            .identity
            .update_status(id, AuthorizationStatus::Revoked, None)
            .await?;
        if !found {
            return Err(NodeError::NodeNotFound(*id));
        }

        let sessions = self.services.challenges.sessions();
        let mut ended = 0;
        for session in sessions.list_by_node(id).await? {
            if sessions.revoke(&session.token).await? {
                ended += 1;
            }
        }
        tracing::info!(node = %id, sessions = ended, "node revoked");
        Ok(ended)
    }

    pub async fn list_nodes(&self) -> Result<Vec<RegisteredNode>> {
        Ok(self.services.identity.list_all().await?)
    }
}
