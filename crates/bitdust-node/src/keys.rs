//! Share/Key manager: per-share symmetric keys, grants and audits.
//!
//! Key material lives in two places. The `keys` table of the message
//! database maps a key id to its compact `local_key_id` (what the
//! history tables reference). The `keys/` directory holds the actual
//! material, each file encrypted with the database key derived from the
//! local identity. Renaming a key after rotation touches the table row
//! and the file, never the message rows.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use bitdust_id::MyIdentity;
use bitdust_shared::crypto::{self, SymmetricKey};
use bitdust_shared::ecc::EccMap;
use bitdust_shared::identity::verify_signature;
use bitdust_shared::payloads::KeyGrant;
use bitdust_shared::types::{GlobalId, GlobalUser, IdUrl};
use bitdust_store::Database;

use crate::error::{NodeError, Result};

/// One share key held locally.
#[derive(Debug, Clone)]
pub struct ShareKey {
    pub key_id: GlobalId,
    pub label: String,
    pub ecc_map: EccMap,
    pub symmetric_key: SymmetricKey,
    pub active: bool,
    pub local_key_id: i64,
}

/// On-disk form of a share key; the material is sealed with the database
/// key so a copied data directory leaks nothing.
#[derive(Serialize, Deserialize)]
struct KeyFile {
    key_id: String,
    label: String,
    ecc_map: String,
    active: bool,
    sealed_key: String,
}

pub struct KeyManager {
    my_id: Arc<MyIdentity>,
    db: Arc<Mutex<Database>>,
    keys_dir: PathBuf,
    keys: Mutex<HashMap<GlobalId, ShareKey>>,
    db_key: [u8; 32],
}

impl KeyManager {
    pub fn new(
        my_id: Arc<MyIdentity>,
        db: Arc<Mutex<Database>>,
        data_dir: &std::path::Path,
    ) -> Result<Arc<Self>> {
        let keys_dir = data_dir.join("keys");
        std::fs::create_dir_all(&keys_dir)?;
        let db_key = my_id.local().derive_db_key();

        let manager = Arc::new(Self {
            my_id,
            db,
            keys_dir,
            keys: Mutex::new(HashMap::new()),
            db_key,
        });
        manager.ensure_master_registered()?;
        let loaded = manager.load_key_files()?;
        if loaded > 0 {
            info!(count = loaded, "share keys loaded");
        }
        Ok(manager)
    }

    /// The master key of this node is implicit; make sure its table row
    /// exists so history rows can reference it.
    fn ensure_master_registered(&self) -> Result<i64> {
        let master = self.my_id.master_id()?;
        let pubkey = self.my_id.local().public_key_hex();
        let db = self.db.lock().expect("db lock");
        Ok(db.register_key(&master.to_string(), &pubkey)?)
    }

    /// Local key id of this node's master key.
    pub fn my_local_key_id(&self) -> Result<i64> {
        self.ensure_master_registered()
    }

    /// Register a peer's master key (their Ed25519 public key).
    pub fn register_peer(&self, global_id: &GlobalId, public_key_hex: &str) -> Result<i64> {
        let db = self.db.lock().expect("db lock");
        Ok(db.register_key(&global_id.to_string(), public_key_hex)?)
    }

    /// Synthetic unique column value for a symmetric key: the table's
    /// `public_key` column must be unique per row and stable under
    /// rename, which the key hash is and the owner's pubkey is not.
    fn symmetric_fingerprint(key: &SymmetricKey) -> String {
        hex::encode(blake3::hash(key).as_bytes())
    }

    // -- share lifecycle ----------------------------------------------------

    /// Create a fresh share (or group) owned by this node.
    pub fn share_create(&self, label: &str, ecc_map: EccMap, group: bool) -> Result<ShareKey> {
        let user = self.my_id.user()?;
        let key_id = if group {
            GlobalId::new_group(user)
        } else {
            GlobalId {
                key_alias: format!("share_{}", hex::encode(&uuid::Uuid::new_v4().as_bytes()[..6])),
                user,
            }
        };
        let symmetric_key = crypto::generate_symmetric_key();
        self.install_key(key_id, label, ecc_map, symmetric_key, true)
    }

    /// Install a key (created locally or received in a grant).
    pub fn install_key(
        &self,
        key_id: GlobalId,
        label: &str,
        ecc_map: EccMap,
        symmetric_key: SymmetricKey,
        active: bool,
    ) -> Result<ShareKey> {
        let local_key_id = {
            let db = self.db.lock().expect("db lock");
            db.register_key(
                &key_id.to_string(),
                &Self::symmetric_fingerprint(&symmetric_key),
            )?
        };
        let share = ShareKey {
            key_id: key_id.clone(),
            label: label.to_string(),
            ecc_map,
            symmetric_key,
            active,
            local_key_id,
        };
        self.save_key_file(&share)?;
        self.keys
            .lock()
            .expect("keys lock")
            .insert(key_id.clone(), share.clone());
        debug!(key = %key_id, local = local_key_id, "key installed");
        Ok(share)
    }

    pub fn get(&self, key_id: &GlobalId) -> Option<ShareKey> {
        self.keys.lock().expect("keys lock").get(key_id).cloned()
    }

    pub fn list(&self) -> Vec<ShareKey> {
        let mut keys: Vec<ShareKey> = self.keys.lock().expect("keys lock").values().cloned().collect();
        keys.sort_by(|a, b| a.key_id.to_string().cmp(&b.key_id.to_string()));
        keys
    }

    pub fn erase(&self, key_id: &GlobalId) -> Result<bool> {
        let removed = self.keys.lock().expect("keys lock").remove(key_id);
        if removed.is_none() {
            return Ok(false);
        }
        let path = self.key_file_path(key_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let db = self.db.lock().expect("db lock");
        db.erase_key(&key_id.to_string())?;
        Ok(true)
    }

    // -- grants -------------------------------------------------------------

    /// Wrap a share key for a trusted user. The caller ships the result
    /// in a Message packet and awaits the Ack.
    pub fn build_grant(
        &self,
        key_id: &GlobalId,
        recipient_pubkey: &ed25519_dalek::VerifyingKey,
        brokers: Vec<(u32, IdUrl)>,
        brokers_revision: u64,
    ) -> Result<KeyGrant> {
        let share = self
            .get(key_id)
            .ok_or_else(|| NodeError::UnknownKey(key_id.to_string()))?;
        let wrapped_key = crypto::wrap_key_for(recipient_pubkey, &share.symmetric_key)?;
        Ok(KeyGrant {
            key_id: share.key_id,
            label: share.label,
            ecc_map: share.ecc_map.name().to_string(),
            wrapped_key,
            brokers,
            brokers_revision,
        })
    }

    /// Recipient side of a grant: unwrap and install.
    pub fn accept_grant(&self, grant: &KeyGrant) -> Result<ShareKey> {
        let material = crypto::unwrap_key_with(
            &self.my_id.local().dh_scalar_bytes(),
            &self.my_id.local().verifying_key(),
            &grant.wrapped_key,
        )?;
        let symmetric_key: SymmetricKey = material
            .as_slice()
            .try_into()
            .map_err(|_| NodeError::Crypto(bitdust_shared::error::CryptoError::InvalidKeyLength))?;
        let ecc_map = EccMap::parse(&grant.ecc_map)
            .ok_or_else(|| NodeError::Config(format!("unknown ecc map {}", grant.ecc_map)))?;
        self.install_key(
            grant.key_id.clone(),
            &grant.label,
            ecc_map,
            symmetric_key,
            true,
        )
    }

    // -- membership and audit ----------------------------------------------

    /// Prove membership of a share: sign its key id with the node key.
    pub fn sign_membership(&self, key_id: &GlobalId) -> Vec<u8> {
        self.my_id
            .local()
            .sign(key_id.to_string().as_bytes())
            .to_bytes()
            .to_vec()
    }

    /// Broker-side check of a consumer's membership signature.
    pub fn verify_membership(
        key_id: &GlobalId,
        consumer_pubkey: &[u8; 32],
        signature: &[u8],
    ) -> bool {
        verify_signature(consumer_pubkey, key_id.to_string().as_bytes(), signature).is_ok()
    }

    /// Answer an audit challenge: sign the nonce iff we hold the key.
    pub fn audit_response(&self, key_id: &GlobalId, nonce: &[u8]) -> Option<Vec<u8>> {
        self.get(key_id)?;
        Some(self.my_id.local().sign(nonce).to_bytes().to_vec())
    }

    /// Verify an audit response against the audited user's public key.
    pub fn audit_verify(untrusted_pubkey: &[u8; 32], nonce: &[u8], signature: &[u8]) -> bool {
        verify_signature(untrusted_pubkey, nonce, signature).is_ok()
    }

    // -- rotation -----------------------------------------------------------

    /// Rotation rename: every key id embedding `old_user` moves to
    /// `new_user`. Symmetric bytes and local key ids are untouched.
    pub fn rename_for_user(&self, old_user: &GlobalUser, new_user: &GlobalUser) -> Result<usize> {
        let old_part = old_user.to_string();
        let new_part = new_user.to_string();

        {
            let db = self.db.lock().expect("db lock");
            db.rename_keys_for_user(&old_part, &new_part)?;
        }

        let mut keys = self.keys.lock().expect("keys lock");
        let to_rename: Vec<GlobalId> = keys
            .keys()
            .filter(|k| k.user == *old_user)
            .cloned()
            .collect();

        for old_id in &to_rename {
            if let Some(mut share) = keys.remove(old_id) {
                let new_id = old_id.rebase(new_user.clone());
                share.key_id = new_id.clone();
                self.save_key_file(&share)?;
                let old_path = self.key_file_path(old_id);
                if old_path.exists() {
                    std::fs::remove_file(old_path)?;
                }
                keys.insert(new_id, share);
            }
        }
        info!(count = to_rename.len(), "keys renamed after rotation");
        Ok(to_rename.len())
    }

    // -- persistence --------------------------------------------------------

    fn key_file_path(&self, key_id: &GlobalId) -> PathBuf {
        self.keys_dir.join(key_id.to_string())
    }

    fn save_key_file(&self, share: &ShareKey) -> Result<()> {
        let sealed = crypto::encrypt(&self.db_key, &share.symmetric_key)?;
        let file = KeyFile {
            key_id: share.key_id.to_string(),
            label: share.label.clone(),
            ecc_map: share.ecc_map.name().to_string(),
            active: share.active,
            sealed_key: hex::encode(sealed),
        };
        let raw = serde_json::to_vec_pretty(&file)
            .map_err(|e| NodeError::Config(e.to_string()))?;
        std::fs::write(self.key_file_path(&share.key_id), raw)?;
        Ok(())
    }

    fn load_key_files(&self) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.keys_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let raw = std::fs::read(entry.path())?;
            let Ok(file) = serde_json::from_slice::<KeyFile>(&raw) else {
                continue;
            };
            let Ok(key_id) = GlobalId::parse(&file.key_id) else {
                continue;
            };
            let Ok(sealed) = hex::decode(&file.sealed_key) else {
                continue;
            };
            let Ok(material) = crypto::decrypt(&self.db_key, &sealed) else {
                continue;
            };
            let Ok(symmetric_key) = <SymmetricKey>::try_from(material.as_slice()) else {
                continue;
            };
            let Some(ecc_map) = EccMap::parse(&file.ecc_map) else {
                continue;
            };
            let local_key_id = {
                let db = self.db.lock().expect("db lock");
                db.register_key(&file.key_id, &Self::symmetric_fingerprint(&symmetric_key))?
            };
            self.keys.lock().expect("keys lock").insert(
                key_id.clone(),
                ShareKey {
                    key_id,
                    label: file.label,
                    ecc_map,
                    symmetric_key,
                    active: file.active,
                    local_key_id,
                },
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &std::path::Path) -> Arc<KeyManager> {
        let me = Arc::new(MyIdentity::create("alice", "id-a.example.com", 8084, vec![]));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        KeyManager::new(me, db, dir).unwrap()
    }

    #[test]
    fn create_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(dir.path());

        let share = km.share_create("files", EccMap::Ecc2x2, false).unwrap();
        assert!(share.key_id.key_alias.starts_with("share_"));
        assert!(!share.key_id.is_group());

        let group = km.share_create("chat", EccMap::Ecc2x2, true).unwrap();
        assert!(group.key_id.is_group());

        assert_eq!(km.list().len(), 2);
        assert_eq!(
            km.get(&share.key_id).unwrap().symmetric_key,
            share.symmetric_key
        );
    }

    #[test]
    fn grant_round_trip() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let alice = manager(dir_a.path());

        let bob_id = Arc::new(MyIdentity::create("bob", "id-b.example.com", 8084, vec![]));
        let bob_db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let bob = KeyManager::new(bob_id.clone(), bob_db, dir_b.path()).unwrap();

        let share = alice.share_create("chat", EccMap::Ecc2x2, true).unwrap();
        let grant = alice
            .build_grant(&share.key_id, &bob_id.local().verifying_key(), vec![], 0)
            .unwrap();

        let accepted = bob.accept_grant(&grant).unwrap();
        assert_eq!(accepted.symmetric_key, share.symmetric_key);
        assert_eq!(accepted.key_id, share.key_id);
    }

    #[test]
    fn rotation_preserves_key_bytes_and_local_ids() {
        let dir = tempfile::tempdir().unwrap();
        let km = manager(dir.path());
        let share = km.share_create("chat", EccMap::Ecc2x2, true).unwrap();

        let old_user = share.key_id.user.clone();
        let new_user = GlobalUser {
            nickname: "alice".into(),
            host: "id-b.example.com".into(),
            port: 8084,
        };
        km.rename_for_user(&old_user, &new_user).unwrap();

        assert!(km.get(&share.key_id).is_none());
        let renamed = km.get(&share.key_id.rebase(new_user)).unwrap();
        assert_eq!(renamed.symmetric_key, share.symmetric_key);
        assert_eq!(renamed.local_key_id, share.local_key_id);
    }

    #[test]
    fn keys_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let me = Arc::new(MyIdentity::create("alice", "id-a.example.com", 8084, vec![]));

        let share = {
            let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
            let km = KeyManager::new(me.clone(), db, dir.path()).unwrap();
            km.share_create("chat", EccMap::Ecc2x2, true).unwrap()
        };

        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let km = KeyManager::new(me, db, dir.path()).unwrap();
        let reloaded = km.get(&share.key_id).unwrap();
        assert_eq!(reloaded.symmetric_key, share.symmetric_key);
    }

    #[test]
    fn membership_signature_checks() {
        let dir = tempfile::tempdir().unwrap();
        let me = Arc::new(MyIdentity::create("alice", "id-a.example.com", 8084, vec![]));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let km = KeyManager::new(me.clone(), db, dir.path()).unwrap();

        let group = km.share_create("chat", EccMap::Ecc2x2, true).unwrap();
        let signature = km.sign_membership(&group.key_id);
        assert!(KeyManager::verify_membership(
            &group.key_id,
            &me.local().public_key_bytes(),
            &signature
        ));

        let stranger = bitdust_shared::identity::LocalIdentity::generate();
        assert!(!KeyManager::verify_membership(
            &group.key_id,
            &stranger.public_key_bytes(),
            &signature
        ));
    }

    #[test]
    fn audit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let me = Arc::new(MyIdentity::create("alice", "id-a.example.com", 8084, vec![]));
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let km = KeyManager::new(me.clone(), db, dir.path()).unwrap();

        let share = km.share_create("files", EccMap::Ecc2x2, false).unwrap();
        let nonce = b"challenge-nonce";

        let response = km.audit_response(&share.key_id, nonce).unwrap();
        assert!(KeyManager::audit_verify(
            &me.local().public_key_bytes(),
            nonce,
            &response
        ));

        let unknown = GlobalId::parse("share_ffffff$ghost@id-x_8084").unwrap();
        assert!(km.audit_response(&unknown, nonce).is_none());
    }
}
