use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::chain::RevertKind;
use crate::adapters::traits::EscrowSnapshot;

/// Chain observation with the time it was read
#[derive(Debug, Clone)]
pub struct CachedChainStatus {
    pub snapshot: EscrowSnapshot,
    pub revert: Option<RevertKind>,
    pub synced_at: DateTime<Utc>,
}

impl CachedChainStatus {
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.synced_at < ttl
    }
}

/// Per-intent cache of escrow observations
pub struct ChainStatusCache {
    entries: Arc<RwLock<HashMap<Uuid, CachedChainStatus>>>,
    ttl: Duration,
}

impl ChainStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn get(&self, intent_id: Uuid, now: DateTime<Utc>) -> Option<CachedChainStatus> {
        let entries = self.entries.read().await;
        match entries.get(&intent_id) {
            Some(entry) if entry.is_fresh(self.ttl, now) => {
                debug!("✓ Chain status cache hit: {}", intent_id);
                Some(entry.clone())
            }
            Some(_) => {
                debug!("⚠ Chain status cache stale: {}", intent_id);
                None
            }
            None => None,
        }
    }

    /// Latest entry regardless of age
    pub async fn last_known(&self, intent_id: Uuid) -> Option<CachedChainStatus> {
        self.entries.read().await.get(&intent_id).cloned()
    }

    pub async fn put(&self, intent_id: Uuid, entry: CachedChainStatus) {
        self.entries.write().await.insert(intent_id, entry);
        debug!("💾 Cached chain status for {}", intent_id);
    }

    pub async fn invalidate(&self, intent_id: Uuid) {
        self.entries.write().await.remove(&intent_id);
    }

    /// Drop entries past their TTL
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.is_fresh(ttl, now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(synced_at: DateTime<Utc>) -> CachedChainStatus {
        CachedChainStatus {
            snapshot: EscrowSnapshot::default(),
            revert: None,
            synced_at,
        }
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = ChainStatusCache::new(Duration::minutes(2));
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        cache.put(id, entry(t0)).await;

        assert!(cache.get(id, t0 + Duration::seconds(119)).await.is_some());
        assert!(cache.get(id, t0 + Duration::seconds(120)).await.is_none());
        assert_eq!(cache.evict_stale(t0 + Duration::minutes(3)).await, 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_still_last_known() {
        let cache = ChainStatusCache::new(Duration::minutes(2));
        let id = Uuid::new_v4();
        let t0 = Utc::now() - Duration::minutes(10);
        cache.put(id, entry(t0)).await;

        assert!(cache.get(id, Utc::now()).await.is_none());
        assert_eq!(cache.last_known(id).await.map(|e| e.synced_at), Some(t0));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = ChainStatusCache::new(Duration::minutes(2));
        let id = Uuid::new_v4();
        cache.put(id, entry(Utc::now())).await;
        cache.invalidate(id).await;
        assert!(cache.get(id, Utc::now()).await.is_none());
    }
}
