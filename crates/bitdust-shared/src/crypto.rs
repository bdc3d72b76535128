//! Symmetric encryption and key wrapping.
//!
//! Share payloads are encrypted with XChaCha20-Poly1305 under a per-share
//! symmetric key; granting a share wraps that key for the recipient with an
//! ephemeral X25519 exchange against the recipient's Ed25519 key converted
//! to Montgomery form.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_KEY_WRAP, NONCE_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

// ---------------------------------------------------------------------------
// Key wrapping (share grants)
// ---------------------------------------------------------------------------

fn derive_wrap_key(shared: &[u8; 32], eph_pub: &[u8; 32], recipient_mont: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_KEY_WRAP);
    hasher.update(shared);
    hasher.update(eph_pub);
    hasher.update(recipient_mont);
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize().as_bytes()[..32]);
    key
}

/// Wrap `material` so that only the holder of the Ed25519 secret behind
/// `recipient` can recover it. Output layout:
/// `ephemeral X25519 public (32) || nonce || ciphertext`.
pub fn wrap_key_for(recipient: &VerifyingKey, material: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let recipient_mont: [u8; 32] = recipient.to_montgomery().to_bytes();

    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pub: [u8; 32] = PublicKey::from(&ephemeral).to_bytes();
    let shared: [u8; 32] = ephemeral
        .diffie_hellman(&PublicKey::from(recipient_mont))
        .to_bytes();

    let wrap_key = derive_wrap_key(&shared, &eph_pub, &recipient_mont);
    let sealed = encrypt(&wrap_key, material)?;

    let mut output = Vec::with_capacity(32 + sealed.len());
    output.extend_from_slice(&eph_pub);
    output.extend_from_slice(&sealed);
    Ok(output)
}

/// Recover material wrapped with [`wrap_key_for`]. `dh_scalar` is the
/// clamped X25519 scalar of the recipient's Ed25519 key
/// ([`crate::identity::LocalIdentity::dh_scalar_bytes`]).
pub fn unwrap_key_with(
    dh_scalar: &[u8; 32],
    recipient: &VerifyingKey,
    wrapped: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if wrapped.len() < 32 + NONCE_SIZE {
        return Err(CryptoError::UnwrapFailed);
    }
    let (eph_pub_bytes, sealed) = wrapped.split_at(32);
    let eph_pub: [u8; 32] = eph_pub_bytes.try_into().map_err(|_| CryptoError::UnwrapFailed)?;

    let recipient_mont: [u8; 32] = recipient.to_montgomery().to_bytes();
    let shared = x25519_dalek::x25519(*dh_scalar, eph_pub);

    let wrap_key = derive_wrap_key(&shared, &eph_pub, &recipient_mont);
    decrypt(&wrap_key, sealed).map_err(|_| CryptoError::UnwrapFailed)
}

/// Deterministic 20-byte DHT key for a named record.
pub fn dht_key(name: &str) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new_derive_key(crate::constants::KDF_CONTEXT_DHT_KEY);
    hasher.update(name.as_bytes());
    hasher.finalize().as_bytes()[..20].to_vec()
}
