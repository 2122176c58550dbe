use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use irn_core::{ChannelContext, ChannelId, ChannelKey, ChannelMetadata};

use super::{read, write};
use crate::error::Result;
use crate::traits::ChannelStore;

/// In-memory channel store.
///
/// Metadata and keys live in separate maps under one lock.
#[derive(Default)]
pub struct MemoryChannelStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    meta: HashMap<ChannelId, ChannelMetadata>,
    keys: HashMap<ChannelId, ChannelKey>,
}

impl Inner {
    fn evict(&mut self, id: &ChannelId) -> bool {
        let had_meta = self.meta.remove(id).is_some();
        let had_key = self.keys.remove(id).is_some();
        had_meta || had_key
    }
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn put(&self, ctx: &ChannelContext) -> Result<()> {
        let mut inner = write(&self.inner)?;
        let id = ctx.id().clone();
        inner.meta.insert(id.clone(), ctx.meta.clone());
        inner.keys.insert(id, ctx.key.clone());
        Ok(())
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelContext>> {
        {
            let inner = read(&self.inner)?;
            match (inner.meta.get(id), inner.keys.get(id)) {
                (Some(meta), Some(key)) if meta.expires_at > Utc::now() && !key.is_blank() => {
                    return Ok(Some(ChannelContext::from_parts(meta.clone(), key.clone())));
                }
                (None, None) => return Ok(None),
                _ => {}
            }
        }

        // Expired, keyless or half-written: evict.
        write(&self.inner)?.evict(id);
        tracing::debug!(channel_id = %id, "evicted stale channel");
        Ok(None)
    }

    async fn remove(&self, id: &ChannelId) -> Result<bool> {
        Ok(write(&self.inner)?.evict(id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(read(&self.inner)?.meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use irn_core::aead::random_bytes;
    use irn_core::{ChannelRole, Cipher};

    fn ctx(ttl: Duration) -> ChannelContext {
        ChannelContext::new(
            ChannelId::generate(),
            ChannelKey::from_bytes(random_bytes::<32>()),
            Cipher::Aes256Gcm,
            vec![1; 32],
            vec![2; 32],
            ChannelRole::Responder,
            ttl,
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryChannelStore::new();
        let c = ctx(Duration::minutes(30));

        store.put(&c).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.is_valid(c.id()).await.unwrap());

        let got = store.get(c.id()).await.unwrap().unwrap();
        assert_eq!(got.meta, c.meta);
        assert_eq!(got.key, c.key);

        assert!(store.remove(c.id()).await.unwrap());
        assert!(!store.remove(c.id()).await.unwrap());
        assert!(store.get(c.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_channel_is_evicted_on_read() {
        let store = MemoryChannelStore::new();
        let c = ctx(Duration::milliseconds(-1));
        store.put(&c).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        assert!(store.get(c.id()).await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blank_key_is_rejected() {
        let store = MemoryChannelStore::new();
        let mut c = ctx(Duration::minutes(5));
        c.key = ChannelKey::from_bytes([0u8; 32]);
        store.put(&c).await.unwrap();
        assert!(!store.is_valid(c.id()).await.unwrap());
    }
}
