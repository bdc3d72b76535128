//! Identity documents and the local signing identity.
//!
//! An [`IdentityDoc`] is the record an identity server hands out for an
//! IDURL: the node's public key, the ordered list of equivalent source
//! URLs, contact methods for the transports, and a revision counter. The
//! signature covers a canonical byte serialization with fixed field order,
//! so two documents with the same fields always hash identically.
//!
//! Rotation mints a new document with the *same* key pair: a fresh source
//! is prepended, the dead one dropped, revision bumped, and the document
//! re-signed. [`same_entity`] is therefore a public-key comparison, never
//! a URL comparison.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{PUBKEY_SIZE, SIGNATURE_SIZE};
use crate::error::IdentityError;
use crate::types::{GlobalUser, IdUrl};

/// A signed identity document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityDoc {
    /// Nickname the document is filed under on its servers.
    pub name: String,
    /// Ed25519 public key, hex encoded.
    pub publickey: String,
    /// Ordered list of equivalent IDURLs; the first is the current primary.
    pub sources: Vec<IdUrl>,
    /// Contact methods, `proto://host:port` strings in preference order.
    pub contacts: Vec<String>,
    /// Monotone revision, bumped on every change.
    pub revision: u64,
    /// Ed25519 signature over the canonical bytes, hex encoded.
    pub signature: String,
}

impl IdentityDoc {
    /// Canonical byte serialization the signature covers: every field in
    /// declaration order, each piece length-prefixed big-endian.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_field(&mut buf, self.name.as_bytes());
        put_field(&mut buf, self.publickey.as_bytes());
        buf.put_u32(self.sources.len() as u32);
        for s in &self.sources {
            put_field(&mut buf, s.as_str().as_bytes());
        }
        buf.put_u32(self.contacts.len() as u32);
        for c in &self.contacts {
            put_field(&mut buf, c.as_bytes());
        }
        buf.put_u64(self.revision);
        buf.to_vec()
    }

    /// SHA-256 digest of the canonical bytes.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_bytes()).into()
    }

    pub fn public_key_bytes(&self) -> Result<[u8; PUBKEY_SIZE], IdentityError> {
        let bytes = hex::decode(&self.publickey).map_err(|_| IdentityError::InvalidKeyBytes)?;
        bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.public_key_bytes()?)
            .map_err(|_| IdentityError::InvalidKeyBytes)
    }

    /// Check the document's signature against its own embedded key.
    pub fn verify(&self) -> Result<(), IdentityError> {
        let sig_bytes: [u8; SIGNATURE_SIZE] = hex::decode(&self.signature)
            .map_err(|_| IdentityError::InvalidSignature)?
            .try_into()
            .map_err(|_| IdentityError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_bytes);
        self.verifying_key()?
            .verify(&self.digest(), &signature)
            .map_err(|_| IdentityError::InvalidSignature)
    }

    /// The primary IDURL (first source).
    pub fn idurl(&self) -> Result<&IdUrl, IdentityError> {
        self.sources.first().ok_or(IdentityError::NoSources)
    }

    /// The `nickname@host_port` user part of the primary source.
    pub fn user(&self) -> Result<GlobalUser, IdentityError> {
        self.idurl()?
            .user()
            .map_err(|e| IdentityError::MalformedSource(e.to_string()))
    }
}

fn put_field(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Two documents describe the same entity iff their public keys match.
pub fn same_entity(a: &IdentityDoc, b: &IdentityDoc) -> bool {
    a.publickey == b.publickey
}

/// Short fingerprint of a public key, used in rotation records.
pub fn key_fingerprint(pubkey_bytes: &[u8]) -> String {
    let hash = blake3::hash(pubkey_bytes);
    hex::encode(&hash.as_bytes()[..16])
}

// ---------------------------------------------------------------------------
// LocalIdentity
// ---------------------------------------------------------------------------

/// The node's own long-lived Ed25519 key pair plus its current document.
#[derive(Clone)]
pub struct LocalIdentity {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting the local key.
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn from_export(export: &IdentityExport) -> Self {
        Self::from_secret_bytes(&export.secret_key)
    }

    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Clamped X25519 scalar for unwrapping keys sealed to this identity.
    pub fn dh_scalar_bytes(&self) -> [u8; 32] {
        self.signing_key.to_scalar_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Derive the local database encryption key from the secret key.
    pub fn derive_db_key(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(crate::constants::KDF_CONTEXT_DB_KEY);
        hasher.update(self.signing_key.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize().as_bytes()[..32]);
        key
    }

    /// Mint a signed document for this key pair.
    pub fn make_document(
        &self,
        name: &str,
        sources: Vec<IdUrl>,
        contacts: Vec<String>,
        revision: u64,
    ) -> IdentityDoc {
        let mut doc = IdentityDoc {
            name: name.to_string(),
            publickey: self.public_key_hex(),
            sources,
            contacts,
            revision,
            signature: String::new(),
        };
        let signature = self.sign(&doc.digest());
        doc.signature = hex::encode(signature.to_bytes());
        doc
    }

    /// Mint the successor document during rotation: `new_source` prepended,
    /// `dead_source` removed, revision bumped, same key pair.
    pub fn rotate_document(
        &self,
        current: &IdentityDoc,
        new_source: IdUrl,
        dead_source: &IdUrl,
    ) -> IdentityDoc {
        let kept: Vec<IdUrl> = current
            .sources
            .iter()
            .filter(|s| *s != dead_source && **s != new_source)
            .cloned()
            .collect();
        let mut sources = vec![new_source];
        sources.extend(kept);
        self.make_document(
            &current.name,
            sources,
            current.contacts.clone(),
            current.revision + 1,
        )
    }
}

/// Verify an Ed25519 signature against raw public key bytes.
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let sig_bytes: [u8; SIGNATURE_SIZE] = signature_bytes
        .try_into()
        .map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| IdentityError::InvalidSignature)
}

/// UTC timestamp helper shared by packet and record builders.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_doc(id: &LocalIdentity) -> IdentityDoc {
        id.make_document(
            "alice",
            vec![IdUrl::for_user("id-a.example.com", 8084, "alice")],
            vec!["tcp://10.0.0.1:7771".into()],
            1,
        )
    }

    #[test]
    fn document_signature_verifies() {
        let id = LocalIdentity::generate();
        let doc = make_doc(&id);
        assert!(doc.verify().is_ok());
    }

    #[test]
    fn tampered_document_rejected() {
        let id = LocalIdentity::generate();
        let mut doc = make_doc(&id);
        doc.revision += 1;
        assert!(doc.verify().is_err());
    }

    #[test]
    fn canonical_bytes_stable() {
        let id = LocalIdentity::generate();
        let doc = make_doc(&id);
        assert_eq!(doc.canonical_bytes(), doc.clone().canonical_bytes());
        assert_eq!(doc.digest(), doc.digest());
    }

    #[test]
    fn rotation_keeps_key_and_bumps_revision() {
        let id = LocalIdentity::generate();
        let doc = make_doc(&id);
        let dead = doc.sources[0].clone();
        let fresh = IdUrl::for_user("id-b.example.com", 8084, "alice");
        let rotated = id.rotate_document(&doc, fresh.clone(), &dead);

        assert!(rotated.verify().is_ok());
        assert!(same_entity(&doc, &rotated));
        assert_eq!(rotated.revision, doc.revision + 1);
        assert_eq!(rotated.sources[0], fresh);
        assert!(!rotated.sources.contains(&dead));
    }

    #[test]
    fn export_round_trip() {
        let id = LocalIdentity::generate();
        let restored = LocalIdentity::from_export(&id.to_export());
        assert_eq!(id.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn different_keys_are_different_entities() {
        let a = LocalIdentity::generate();
        let b = LocalIdentity::generate();
        assert!(!same_entity(&make_doc(&a), &make_doc(&b)));
    }
}
