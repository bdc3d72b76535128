//! Identity registry: the cache every signature check goes through.
//!
//! Documents are verified once on insert and cached under every source
//! URL they list, so any equivalent IDURL resolves to the same entry. A
//! packet that fails verification against the cached key invalidates the
//! entry (the key may have rotated behind the URL) and the next use
//! refetches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bitdust_net::transport::{ContactAddress, ContactResolver};
use bitdust_shared::identity::IdentityDoc;
use bitdust_shared::types::IdUrl;

use crate::error::{IdError, Result};
use crate::server_client::IdServerClient;

#[derive(Clone)]
struct Cached {
    doc: IdentityDoc,
    public_key: [u8; 32],
    cached_at: DateTime<Utc>,
}

pub struct IdentityRegistry {
    cache: Mutex<HashMap<IdUrl, Cached>>,
    servers: Arc<dyn IdServerClient>,
}

impl IdentityRegistry {
    pub fn new(servers: Arc<dyn IdServerClient>) -> Arc<Self> {
        Arc::new(Self {
            cache: Mutex::new(HashMap::new()),
            servers,
        })
    }

    /// Verify and cache a document under every source URL it lists.
    pub fn put(&self, doc: IdentityDoc) -> Result<()> {
        doc.verify()?;
        let public_key = doc.public_key_bytes()?;
        let mut cache = self.cache.lock().expect("registry lock");
        for source in &doc.sources {
            // Never replace a newer revision with an older one.
            if let Some(existing) = cache.get(source) {
                if existing.public_key == public_key && existing.doc.revision > doc.revision {
                    continue;
                }
            }
            cache.insert(
                source.clone(),
                Cached {
                    doc: doc.clone(),
                    public_key,
                    cached_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    pub fn get_cached(&self, idurl: &IdUrl) -> Option<IdentityDoc> {
        self.cache
            .lock()
            .expect("registry lock")
            .get(idurl)
            .map(|c| c.doc.clone())
    }

    pub fn public_key_cached(&self, idurl: &IdUrl) -> Option<[u8; 32]> {
        self.cache
            .lock()
            .expect("registry lock")
            .get(idurl)
            .map(|c| c.public_key)
    }

    pub fn cached_at(&self, idurl: &IdUrl) -> Option<DateTime<Utc>> {
        self.cache
            .lock()
            .expect("registry lock")
            .get(idurl)
            .map(|c| c.cached_at)
    }

    /// Resolve an IDURL, fetching from its server on a miss or when
    /// `refresh` is set.
    pub async fn get(&self, idurl: &IdUrl, refresh: bool) -> Result<IdentityDoc> {
        if !refresh {
            if let Some(doc) = self.get_cached(idurl) {
                return Ok(doc);
            }
        }
        let doc = self.servers.fetch(idurl).await?;
        self.put(doc.clone())?;
        Ok(doc)
    }

    pub fn forget(&self, idurl: &IdUrl) {
        let removed = {
            let mut cache = self.cache.lock().expect("registry lock");
            cache.remove(idurl)
        };
        if let Some(entry) = removed {
            // Drop the sibling source entries of the same document too.
            let mut cache = self.cache.lock().expect("registry lock");
            for source in &entry.doc.sources {
                cache.remove(source);
            }
        }
    }

    pub fn known(&self) -> Vec<IdUrl> {
        self.cache
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Two IDURLs are the same entity iff their documents carry the same
    /// public key.
    pub async fn same_entity(&self, a: &IdUrl, b: &IdUrl) -> bool {
        let ka = match self.get(a, false).await {
            Ok(doc) => doc.publickey,
            Err(_) => return false,
        };
        let kb = match self.get(b, false).await {
            Ok(doc) => doc.publickey,
            Err(_) => return false,
        };
        ka == kb
    }

    /// Peer-side rotation acceptance: dereference the claimed new IDURL,
    /// require the same public key as the cached old one, then remap.
    /// Anything else is discarded.
    pub async fn apply_rotation(&self, old: &IdUrl, claimed_new: &IdUrl) -> Result<IdentityDoc> {
        let old_key = self
            .public_key_cached(old)
            .ok_or_else(|| IdError::NotFound(old.to_string()))?;
        let new_doc = self.servers.fetch(claimed_new).await?;
        if new_doc.public_key_bytes()? != old_key {
            warn!(old = %old, new = %claimed_new, "rotation notice with foreign key discarded");
            return Err(IdError::RotationRejected(
                "new document carries a different public key".into(),
            ));
        }
        self.put(new_doc.clone())?;
        debug!(old = %old, new = %claimed_new, "peer rotation accepted");
        Ok(new_doc)
    }

    // -- cache persistence --------------------------------------------------

    /// Dump the cached documents to a JSON file so restarts skip the
    /// initial fetch round.
    pub fn dump(&self, path: &Path) -> Result<()> {
        let docs: Vec<IdentityDoc> = {
            let cache = self.cache.lock().expect("registry lock");
            let mut seen = Vec::new();
            let mut docs = Vec::new();
            for entry in cache.values() {
                if !seen.contains(&entry.doc.publickey) {
                    seen.push(entry.doc.publickey.clone());
                    docs.push(entry.doc.clone());
                }
            }
            docs
        };
        let raw = serde_json::to_vec_pretty(&docs)
            .map_err(|e| IdError::Malformed(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    pub fn load(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read(path)?;
        let docs: Vec<IdentityDoc> =
            serde_json::from_slice(&raw).map_err(|e| IdError::Malformed(e.to_string()))?;
        let mut loaded = 0;
        for doc in docs {
            if self.put(doc).is_ok() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

#[async_trait]
impl ContactResolver for IdentityRegistry {
    async fn contacts(&self, idurl: &IdUrl) -> Option<Vec<ContactAddress>> {
        let doc = self.get(idurl, false).await.ok()?;
        let contacts: Vec<ContactAddress> = doc
            .contacts
            .iter()
            .filter_map(|c| ContactAddress::parse(c).ok())
            .collect();
        Some(contacts)
    }

    async fn public_key(&self, idurl: &IdUrl) -> Option<[u8; 32]> {
        if let Some(key) = self.public_key_cached(idurl) {
            return Some(key);
        }
        self.get(idurl, false)
            .await
            .ok()
            .and_then(|doc| doc.public_key_bytes().ok())
    }

    async fn invalidate(&self, idurl: &IdUrl) {
        self.forget(idurl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server_client::MemoryIdServers;
    use bitdust_shared::identity::LocalIdentity;

    fn setup() -> (Arc<MemoryIdServers>, Arc<IdentityRegistry>) {
        let servers = MemoryIdServers::new();
        servers.add_server("id-a.example.com", 8084);
        servers.add_server("id-b.example.com", 8084);
        let registry = IdentityRegistry::new(servers.clone() as Arc<dyn IdServerClient>);
        (servers, registry)
    }

    fn make_doc(name: &str, host: &str) -> (LocalIdentity, IdentityDoc) {
        let local = LocalIdentity::generate();
        let doc = local.make_document(
            name,
            vec![IdUrl::for_user(host, 8084, name)],
            vec!["memory://mailbox".into()],
            1,
        );
        (local, doc)
    }

    #[tokio::test]
    async fn fetch_on_miss_and_cache() {
        let (servers, registry) = setup();
        let (_, doc) = make_doc("alice", "id-a.example.com");
        servers.publish("id-a.example.com", 8084, &doc).await.unwrap();

        let idurl = IdUrl::for_user("id-a.example.com", 8084, "alice");
        assert!(registry.get_cached(&idurl).is_none());
        let fetched = registry.get(&idurl, false).await.unwrap();
        assert_eq!(fetched, doc);
        assert!(registry.get_cached(&idurl).is_some());

        // Served from cache even if the server dies.
        servers.kill_server("id-a.example.com", 8084);
        assert!(registry.get(&idurl, false).await.is_ok());
        assert!(registry.get(&idurl, true).await.is_err());
    }

    #[tokio::test]
    async fn stale_revision_does_not_clobber_cache() {
        let (_, registry) = setup();
        let local = LocalIdentity::generate();
        let idurl = IdUrl::for_user("id-a.example.com", 8084, "alice");
        let v2 = local.make_document("alice", vec![idurl.clone()], vec![], 2);
        let v1 = local.make_document("alice", vec![idurl.clone()], vec![], 1);

        registry.put(v2.clone()).unwrap();
        registry.put(v1).unwrap();
        assert_eq!(registry.get_cached(&idurl).unwrap().revision, 2);
    }

    #[tokio::test]
    async fn rotation_with_same_key_accepted() {
        let (servers, registry) = setup();
        let (local, doc) = make_doc("rob", "id-a.example.com");
        registry.put(doc.clone()).unwrap();

        let old = IdUrl::for_user("id-a.example.com", 8084, "rob");
        let new = IdUrl::for_user("id-b.example.com", 8084, "rob");
        let rotated = local.rotate_document(&doc, new.clone(), &old);
        servers.publish("id-b.example.com", 8084, &rotated).await.unwrap();

        let accepted = registry.apply_rotation(&old, &new).await.unwrap();
        assert_eq!(accepted.revision, doc.revision + 1);
        // Both URLs now resolve to the same cached entity.
        assert!(registry.same_entity(&old, &new).await);
    }

    #[tokio::test]
    async fn rotation_with_foreign_key_discarded() {
        let (servers, registry) = setup();
        let (_, doc) = make_doc("rob", "id-a.example.com");
        registry.put(doc).unwrap();

        let (_, impostor) = make_doc("rob", "id-b.example.com");
        servers.publish("id-b.example.com", 8084, &impostor).await.unwrap();

        let old = IdUrl::for_user("id-a.example.com", 8084, "rob");
        let new = IdUrl::for_user("id-b.example.com", 8084, "rob");
        assert!(matches!(
            registry.apply_rotation(&old, &new).await,
            Err(IdError::RotationRejected(_))
        ));
    }

    #[tokio::test]
    async fn dump_and_load() {
        let (_, registry) = setup();
        let (_, doc) = make_doc("alice", "id-a.example.com");
        registry.put(doc).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identitycache.json");
        registry.dump(&path).unwrap();

        let (_, fresh) = setup();
        assert_eq!(fresh.load(&path).unwrap(), 1);
        assert_eq!(fresh.known().len(), 1);
    }

    #[tokio::test]
    async fn resolver_contacts_come_from_document() {
        let (_, registry) = setup();
        let (_, doc) = make_doc("alice", "id-a.example.com");
        registry.put(doc).unwrap();

        let idurl = IdUrl::for_user("id-a.example.com", 8084, "alice");
        let contacts = registry.contacts(&idurl).await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].host, "mailbox");
    }
}
