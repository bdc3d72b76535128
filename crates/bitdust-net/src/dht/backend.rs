//! Storage seam of the DHT service.
//!
//! The in-memory backend doubles as the shared "network" in tests: every
//! node holds the same `Arc<MemoryDhtBackend>`. The production backend in
//! [`super::kad`] speaks real Kademlia through libp2p.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{NetError, Result};

/// A value stored under a key by one publisher. Values from different
/// publishers coexist under the same key; reads return the union.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub publisher: String,
    /// Set by the original publisher, never bumped by replica refreshes.
    pub original_ts: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait DhtBackend: Send + Sync {
    /// Store `value` under `key`. `original_ts` carries the original
    /// publish time on replica refreshes; `None` means this publisher is
    /// the original and the timestamp is now.
    async fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        publisher: String,
        expire: Duration,
        original_ts: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// All unexpired values stored under `key`.
    async fn get(&self, key: Vec<u8>) -> Result<Vec<StoredValue>>;
}

#[derive(Default)]
pub struct MemoryDhtBackend {
    // key -> publisher -> value
    store: Mutex<HashMap<Vec<u8>, HashMap<String, StoredValue>>>,
}

impl MemoryDhtBackend {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Drop every record, simulating full DHT data loss.
    pub fn clear(&self) {
        self.store.lock().expect("dht lock").clear();
    }
}

#[async_trait]
impl DhtBackend for MemoryDhtBackend {
    async fn put(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        publisher: String,
        expire: Duration,
        original_ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(expire)
                .map_err(|e| NetError::Dht(format!("bad expire: {e}")))?;
        let mut store = self.store.lock().expect("dht lock");
        let slot = store.entry(key).or_default();
        let original_ts = match original_ts {
            Some(ts) => ts,
            None => slot
                .get(&publisher)
                .map(|v| v.original_ts)
                .unwrap_or(now),
        };
        slot.insert(
            publisher.clone(),
            StoredValue {
                value,
                publisher,
                original_ts,
                expires_at,
            },
        );
        Ok(())
    }

    async fn get(&self, key: Vec<u8>) -> Result<Vec<StoredValue>> {
        let now = Utc::now();
        let mut store = self.store.lock().expect("dht lock");
        let Some(slot) = store.get_mut(&key) else {
            return Ok(Vec::new());
        };
        slot.retain(|_, v| v.expires_at > now);
        Ok(slot.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn values_from_two_publishers_coexist() {
        let backend = MemoryDhtBackend::new();
        backend
            .put(b"k".to_vec(), b"a".to_vec(), "alice".into(), Duration::from_secs(60), None)
            .await
            .unwrap();
        backend
            .put(b"k".to_vec(), b"b".to_vec(), "bob".into(), Duration::from_secs(60), None)
            .await
            .unwrap();

        let values = backend.get(b"k".to_vec()).await.unwrap();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn expired_values_disappear() {
        let backend = MemoryDhtBackend::new();
        backend
            .put(b"k".to_vec(), b"a".to_vec(), "alice".into(), Duration::from_millis(5), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.get(b"k".to_vec()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replica_refresh_keeps_original_timestamp() {
        let backend = MemoryDhtBackend::new();
        backend
            .put(b"k".to_vec(), b"a".to_vec(), "alice".into(), Duration::from_secs(60), None)
            .await
            .unwrap();
        let original = backend.get(b"k".to_vec()).await.unwrap()[0].original_ts;

        tokio::time::sleep(Duration::from_millis(10)).await;
        backend
            .put(
                b"k".to_vec(),
                b"a".to_vec(),
                "alice".into(),
                Duration::from_secs(60),
                Some(original),
            )
            .await
            .unwrap();
        let after = backend.get(b"k".to_vec()).await.unwrap()[0].original_ts;
        assert_eq!(original, after);
    }
}
