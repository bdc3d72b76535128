//! DHT service: typed record operations over a pluggable backend plus the
//! republish loop.
//!
//! Keys are deterministic blake3 derivations of record names, so every
//! node computes the same key for `suppliers:<idurl>:<pos>` without
//! coordination. The original publisher refreshes its records every 24 h;
//! a node holding someone else's record replicates it hourly without
//! bumping the original publish timestamp.

pub mod backend;
pub mod kad;
pub mod records;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use bitdust_shared::constants::{
    DHT_RECORD_EXPIRE_SECS, DHT_REPUBLISH_ORIGINAL_SECS, DHT_REPUBLISH_REPLICA_SECS,
    TIMER_JITTER_RATIO,
};
use bitdust_shared::crypto::dht_key;
use bitdust_shared::types::IdUrl;

use crate::error::{NetError, Result};
use backend::{DhtBackend, StoredValue};
use records::{
    brokers_key, merge_slate, merge_triple, rotate_key, suppliers_key, BrokerRecord, DhtLayer,
    PresenceRecord, RotateRecord, SlateView, SupplierRecord, TripleView,
};

const PRESENCE_BUCKETS: u32 = 8;

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub record_expire: Duration,
    pub republish_original: Duration,
    pub republish_replica: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            record_expire: Duration::from_secs(DHT_RECORD_EXPIRE_SECS),
            republish_original: Duration::from_secs(DHT_REPUBLISH_ORIGINAL_SECS),
            republish_replica: Duration::from_secs(DHT_REPUBLISH_REPLICA_SECS),
        }
    }
}

struct Tracked {
    key: Vec<u8>,
    value: Vec<u8>,
    original: bool,
    original_ts: DateTime<Utc>,
    last_push: DateTime<Utc>,
}

/// Cloneable front of the DHT service.
#[derive(Clone)]
pub struct DhtHandle {
    backend: Arc<dyn DhtBackend>,
    config: DhtConfig,
    publisher: String,
    tracked: Arc<Mutex<Vec<Tracked>>>,
}

impl DhtHandle {
    /// Wrap a backend and start the republish loop.
    pub fn spawn(backend: Arc<dyn DhtBackend>, publisher: &str, config: DhtConfig) -> Self {
        let handle = Self {
            backend,
            config,
            publisher: publisher.to_string(),
            tracked: Arc::new(Mutex::new(Vec::new())),
        };
        let worker = handle.clone();
        tokio::spawn(async move { worker.republish_loop().await });
        handle
    }

    // -- generic operations -------------------------------------------------

    /// Publish a JSON value under a named record. The service keeps
    /// republishing it until the record is overwritten or dropped.
    pub async fn put_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value)
            .map_err(|e| NetError::Dht(format!("encode {name}: {e}")))?;
        let key = dht_key(name);
        self.backend
            .put(
                key.clone(),
                raw.clone(),
                self.publisher.clone(),
                self.config.record_expire,
                None,
            )
            .await?;
        self.track(key, raw, true, Utc::now());
        Ok(())
    }

    /// All values published under a named record, JSON-decoded; undecodable
    /// values are skipped.
    pub async fn get_json<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>> {
        let values = self.backend.get(dht_key(name)).await?;
        Ok(values
            .iter()
            .filter_map(|v| serde_json::from_slice(&v.value).ok())
            .collect())
    }

    /// Hold someone else's record for replication; the original publish
    /// timestamp is preserved on every refresh.
    pub async fn hold_replica(&self, name: &str, value: &StoredValue) -> Result<()> {
        let key = dht_key(name);
        self.backend
            .put(
                key.clone(),
                value.value.clone(),
                value.publisher.clone(),
                self.config.record_expire,
                Some(value.original_ts),
            )
            .await?;
        self.track(key, value.value.clone(), false, value.original_ts);
        Ok(())
    }

    /// Raw values under a named record, with publisher metadata.
    pub async fn get_raw(&self, name: &str) -> Result<Vec<StoredValue>> {
        self.backend.get(dht_key(name)).await
    }

    // -- supplier slates ----------------------------------------------------

    /// Advertise a slate, one record per position, all at `revision`.
    pub async fn publish_slate(
        &self,
        customer: &IdUrl,
        ecc_map: &str,
        suppliers: &[Option<IdUrl>],
        revision: u64,
    ) -> Result<()> {
        for (position, supplier) in suppliers.iter().enumerate() {
            let record = SupplierRecord {
                customer: customer.clone(),
                position: position as u32,
                supplier: supplier.clone(),
                ecc_map: ecc_map.to_string(),
                revision,
            };
            self.put_json(&suppliers_key(customer, position as u32), &record)
                .await?;
        }
        debug!(customer = %customer, revision, "slate advertised");
        Ok(())
    }

    /// Read and merge a customer's slate.
    pub async fn read_slate(&self, customer: &IdUrl) -> Result<Option<SlateView>> {
        let mut records: Vec<SupplierRecord> = Vec::new();
        for position in 0..bitdust_shared::ecc::EccMap::Ecc18x18.suppliers_count() as u32 {
            let mut found: Vec<SupplierRecord> =
                self.get_json(&suppliers_key(customer, position)).await?;
            if position > 0 && found.is_empty() && records.is_empty() {
                // No slate at all; avoid probing every position.
                break;
            }
            records.append(&mut found);
        }
        Ok(merge_slate(records))
    }

    // -- broker triples -----------------------------------------------------

    pub async fn publish_triple(
        &self,
        owner: &IdUrl,
        queue_alias: &str,
        brokers: &[(u32, IdUrl)],
        revision: u64,
    ) -> Result<()> {
        for (position, broker) in brokers {
            let record = BrokerRecord {
                owner: owner.clone(),
                queue_alias: queue_alias.to_string(),
                position: *position,
                broker: broker.clone(),
                revision,
            };
            self.put_json(&brokers_key(owner, queue_alias, *position), &record)
                .await?;
        }
        debug!(owner = %owner, queue = %queue_alias, revision, "broker triple advertised");
        Ok(())
    }

    pub async fn read_triple(&self, owner: &IdUrl, queue_alias: &str) -> Result<Option<TripleView>> {
        let mut records: Vec<BrokerRecord> = Vec::new();
        for position in 0..bitdust_shared::constants::BROKERS_PER_GROUP as u32 {
            let mut found: Vec<BrokerRecord> =
                self.get_json(&brokers_key(owner, queue_alias, position)).await?;
            records.append(&mut found);
        }
        Ok(merge_triple(records))
    }

    // -- rotation records ---------------------------------------------------

    pub async fn publish_rotation(&self, record: &RotateRecord) -> Result<()> {
        self.put_json(&rotate_key(&record.old), record).await
    }

    /// The rotation record for `old`, if a verifiable one exists.
    pub async fn read_rotation(
        &self,
        old: &IdUrl,
        old_public_key: &[u8; 32],
    ) -> Result<Option<RotateRecord>> {
        let records: Vec<RotateRecord> = self.get_json(&rotate_key(old)).await?;
        Ok(records
            .into_iter()
            .find(|r| r.verify(old_public_key).is_ok()))
    }

    // -- presence / random users -------------------------------------------

    fn presence_bucket(idurl: &IdUrl) -> u32 {
        let hash = blake3::hash(idurl.as_str().as_bytes());
        u32::from_be_bytes(hash.as_bytes()[..4].try_into().expect("hash slice")) % PRESENCE_BUCKETS
    }

    fn presence_key(layer: DhtLayer, bucket: u32) -> String {
        format!("presence:{layer}:{bucket}")
    }

    /// Announce this node as active on a layer (e.g. available supplier).
    pub async fn announce_user(&self, layer: DhtLayer, idurl: &IdUrl) -> Result<()> {
        let bucket = Self::presence_bucket(idurl);
        self.put_json(
            &Self::presence_key(layer, bucket),
            &PresenceRecord {
                idurl: idurl.clone(),
            },
        )
        .await
    }

    /// Up to `count` random announced users of a layer.
    pub async fn user_random(&self, layer: DhtLayer, count: usize) -> Result<Vec<IdUrl>> {
        let mut buckets: Vec<u32> = (0..PRESENCE_BUCKETS).collect();
        buckets.shuffle(&mut rand::thread_rng());

        let mut users = Vec::new();
        for bucket in buckets {
            let found: Vec<PresenceRecord> =
                self.get_json(&Self::presence_key(layer, bucket)).await?;
            for record in found {
                if !users.contains(&record.idurl) {
                    users.push(record.idurl);
                }
            }
            if users.len() >= count {
                break;
            }
        }
        users.shuffle(&mut rand::thread_rng());
        users.truncate(count);
        Ok(users)
    }

    // -- republish ----------------------------------------------------------

    fn track(&self, key: Vec<u8>, value: Vec<u8>, original: bool, original_ts: DateTime<Utc>) {
        let mut tracked = self.tracked.lock().expect("dht tracked lock");
        tracked.retain(|t| t.key != key);
        tracked.push(Tracked {
            key,
            value,
            original,
            original_ts,
            last_push: Utc::now(),
        });
    }

    async fn republish_loop(self) {
        // Wake at the replica cadence; originals are pushed when their own
        // longer interval elapses.
        loop {
            let base = self.config.republish_replica;
            tokio::time::sleep(jittered(base)).await;

            let due: Vec<(Vec<u8>, Vec<u8>, bool, DateTime<Utc>)> = {
                let now = Utc::now();
                let mut tracked = self.tracked.lock().expect("dht tracked lock");
                tracked
                    .iter_mut()
                    .filter(|t| {
                        let interval = if t.original {
                            self.config.republish_original
                        } else {
                            self.config.republish_replica
                        };
                        now.signed_duration_since(t.last_push).to_std().unwrap_or_default()
                            >= interval
                    })
                    .map(|t| {
                        t.last_push = now;
                        (t.key.clone(), t.value.clone(), t.original, t.original_ts)
                    })
                    .collect()
            };

            for (key, value, original, original_ts) in due {
                let ts = if original { None } else { Some(original_ts) };
                if let Err(e) = self
                    .backend
                    .put(
                        key,
                        value,
                        self.publisher.clone(),
                        self.config.record_expire,
                        ts,
                    )
                    .await
                {
                    warn!(error = %e, "dht republish failed");
                }
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-TIMER_JITTER_RATIO..TIMER_JITTER_RATIO);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::backend::MemoryDhtBackend;

    fn idurl(n: &str) -> IdUrl {
        IdUrl::for_user("id.example.com", 8084, n)
    }

    fn handle(backend: &Arc<MemoryDhtBackend>, publisher: &str) -> DhtHandle {
        DhtHandle::spawn(
            backend.clone() as Arc<dyn DhtBackend>,
            publisher,
            DhtConfig::default(),
        )
    }

    #[tokio::test]
    async fn slate_round_trip() {
        let backend = MemoryDhtBackend::new();
        let dht = handle(&backend, "alice");

        let suppliers = vec![Some(idurl("s1")), Some(idurl("s2"))];
        dht.publish_slate(&idurl("alice"), "ecc/2x2", &suppliers, 1)
            .await
            .unwrap();

        let view = dht.read_slate(&idurl("alice")).await.unwrap().unwrap();
        assert_eq!(view.revision, 1);
        assert_eq!(view.suppliers, suppliers);
    }

    #[tokio::test]
    async fn newer_slate_revision_wins_across_publishers() {
        let backend = MemoryDhtBackend::new();
        let alice = handle(&backend, "alice");
        let other = handle(&backend, "replica-holder");

        alice
            .publish_slate(&idurl("alice"), "ecc/2x2", &[Some(idurl("s1")), Some(idurl("s2"))], 1)
            .await
            .unwrap();
        other
            .publish_slate(&idurl("alice"), "ecc/2x2", &[Some(idurl("s9")), Some(idurl("s2"))], 2)
            .await
            .unwrap();

        let view = alice.read_slate(&idurl("alice")).await.unwrap().unwrap();
        assert_eq!(view.revision, 2);
        assert_eq!(view.suppliers[0], Some(idurl("s9")));
    }

    #[tokio::test]
    async fn triple_round_trip() {
        let backend = MemoryDhtBackend::new();
        let dht = handle(&backend, "alice");

        dht.publish_triple(
            &idurl("alice"),
            "group_ab",
            &[(0, idurl("b0")), (1, idurl("b1")), (2, idurl("b2"))],
            1,
        )
        .await
        .unwrap();

        let view = dht.read_triple(&idurl("alice"), "group_ab").await.unwrap().unwrap();
        assert_eq!(view.brokers[0], Some(idurl("b0")));
        assert_eq!(view.brokers[2], Some(idurl("b2")));
    }

    #[tokio::test]
    async fn random_users_come_from_announcements() {
        let backend = MemoryDhtBackend::new();
        let dht = handle(&backend, "seed");
        for name in ["s1", "s2", "s3"] {
            dht.announce_user(DhtLayer::Suppliers, &idurl(name)).await.unwrap();
        }

        let users = dht.user_random(DhtLayer::Suppliers, 2).await.unwrap();
        assert_eq!(users.len(), 2);
        for u in users {
            assert!([idurl("s1"), idurl("s2"), idurl("s3")].contains(&u));
        }
    }

    #[tokio::test]
    async fn rotation_record_round_trip() {
        let backend = MemoryDhtBackend::new();
        let dht = handle(&backend, "r");
        let identity = bitdust_shared::identity::LocalIdentity::generate();

        let record = RotateRecord::create(idurl("old"), idurl("new"), &identity);
        dht.publish_rotation(&record).await.unwrap();

        let found = dht
            .read_rotation(&idurl("old"), &identity.public_key_bytes())
            .await
            .unwrap();
        assert_eq!(found, Some(record));

        let wrong_key = bitdust_shared::identity::LocalIdentity::generate();
        let none = dht
            .read_rotation(&idurl("old"), &wrong_key.public_key_bytes())
            .await
            .unwrap();
        assert!(none.is_none());
    }
}
