use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use irn_core::{ChannelId, NodeId};

use super::write;
use crate::error::Result;
use crate::traits::{ChallengeStore, StoredChallenge};

/// In-memory challenge store keyed by (channel, node).
#[derive(Default)]
pub struct MemoryChallengeStore {
    challenges: RwLock<HashMap<(ChannelId, NodeId), StoredChallenge>>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn put(&self, channel_id: &ChannelId, node_id: &NodeId, challenge: &StoredChallenge) -> Result<()> {
        write(&self.challenges)?.insert((channel_id.clone(), *node_id), challenge.clone());
        Ok(())
    }

    async fn take(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<Option<StoredChallenge>> {
        Ok(write(&self.challenges)?.remove(&(channel_id.clone(), *node_id)))
    }

    async fn remove(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<bool> {
        Ok(self.take(channel_id, node_id).await?.is_some())
    }
}
