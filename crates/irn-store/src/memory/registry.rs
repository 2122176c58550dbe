use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use irn_core::{AccessLevel, AuthorizationStatus, NodeId, RegisteredNode};

use super::{read, write};
use crate::error::{Result, StoreError};
use crate::traits::NodeRegistry;

/// In-memory node registry.
///
/// Nodes are owned by the `nodes` map; `by_fingerprint` is an index into it.
#[derive(Default)]
pub struct MemoryNodeRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    nodes: HashMap<NodeId, RegisteredNode>,
    by_fingerprint: HashMap<String, NodeId>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn insert(&self, node: &RegisteredNode) -> Result<()> {
        let mut inner = write(&self.inner)?;
        if inner.nodes.contains_key(&node.id) {
            return Err(StoreError::Conflict(format!("node {} already registered", node.id)));
        }
        if inner.by_fingerprint.contains_key(&node.certificate_fingerprint) {
            return Err(StoreError::Conflict(format!(
                "fingerprint {} already registered",
                node.certificate_fingerprint
            )));
        }
        inner.by_fingerprint.insert(node.certificate_fingerprint.clone(), node.id);
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn update(&self, node: &RegisteredNode) -> Result<()> {
        let mut inner = write(&self.inner)?;
        let old_fingerprint = match inner.nodes.get(&node.id) {
            Some(existing) => existing.certificate_fingerprint.clone(),
            None => return Err(StoreError::NotFound(format!("node {}", node.id))),
        };

        if let Some(owner) = inner.by_fingerprint.get(&node.certificate_fingerprint) {
            if *owner != node.id {
                return Err(StoreError::Conflict(format!(
                    "fingerprint {} belongs to node {owner}",
                    node.certificate_fingerprint
                )));
            }
        }

        inner.by_fingerprint.remove(&old_fingerprint);
        inner.by_fingerprint.insert(node.certificate_fingerprint.clone(), node.id);
        inner.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &NodeId) -> Result<Option<RegisteredNode>> {
        Ok(read(&self.inner)?.nodes.get(id).cloned())
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Result<Option<RegisteredNode>> {
        let inner = read(&self.inner)?;
        Ok(inner
            .by_fingerprint
            .get(fingerprint)
            .and_then(|id| inner.nodes.get(id))
            .cloned())
    }

    async fn list_all(&self) -> Result<Vec<RegisteredNode>> {
        let mut nodes: Vec<RegisteredNode> = read(&self.inner)?.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| (n.registered_at, n.id));
        Ok(nodes)
    }

    async fn set_status(
        &self,
        id: &NodeId,
        status: AuthorizationStatus,
        access_level: Option<AccessLevel>,
    ) -> Result<bool> {
        let mut inner = write(&self.inner)?;
        match inner.nodes.get_mut(id) {
            Some(node) => {
                node.status = status;
                if let Some(level) = access_level {
                    node.access_level = level;
                }
                node.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_authenticated(&self, id: &NodeId, at: DateTime<Utc>) -> Result<()> {
        if let Some(node) = write(&self.inner)?.nodes.get_mut(id) {
            node.last_authenticated_at = Some(at);
        }
        Ok(())
    }
}
