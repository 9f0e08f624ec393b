//! Whole-buffer authenticated encryption with per-file key derivation.
//!
//! Output layout: `IV(12) || TAG(16) || CIPHERTEXT(n)`, self-describing, so
//! decryption needs nothing but the blob and the master key.

use aead::Payload;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use tracing::instrument;
use zeroize::{Zeroize, Zeroizing};

use crate::ENCRYPTION_OVERHEAD;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HKDF_INFO: &[u8] = b"DiscordFS-FileKey-v1";

/// 32 random bytes, persisted as base64, loaded once per process lifetime.
#[derive(Clone)]
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// 32 cryptographically random bytes.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MasterKey").field(&"<redacted>").finish()
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The blob is too short to contain an IV and tag, or the GCM tag
    /// failed to verify.
    #[error("corrupted ciphertext: authentication failed")]
    Corrupted,
}

/// Per-file authenticated encryption.
///
/// Each call to [`Crypto::encrypt`] draws a fresh random IV and uses it both
/// as the GCM nonce and as the salt for an HKDF-SHA-256 derivation of a
/// one-time file subkey from the master key. The derived subkey is zeroed
/// immediately after use.
#[derive(Clone)]
pub struct Crypto {
    master_key: MasterKey,
}

impl Crypto {
    #[must_use]
    pub fn new(master_key: MasterKey) -> Self {
        Self { master_key }
    }

    /// Always succeeds; output length is `plaintext.len() + ENCRYPTION_OVERHEAD`.
    #[instrument(skip_all, fields(plaintext_len = plaintext.len()))]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut subkey = derive_subkey(self.master_key.as_bytes(), &iv);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
        let nonce = Nonce::from_slice(&iv);

        // aes-gcm returns ciphertext||tag; we want tag immediately after the
        // IV so the wire layout is IV || TAG || CIPHERTEXT.
        let sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
            .expect("AES-256-GCM encryption of an in-memory buffer cannot fail");
        subkey.zeroize();

        let ct_len = sealed.len() - TAG_LEN;
        let (ciphertext, tag) = sealed.split_at(ct_len);

        let mut out = Vec::with_capacity(IV_LEN + TAG_LEN + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        out
    }

    /// Fails with [`CryptoError::Corrupted`] if `blob` is too short or the
    /// GCM tag does not verify. Returns `blob.len() - ENCRYPTION_OVERHEAD`
    /// plaintext bytes otherwise.
    #[instrument(skip_all, fields(blob_len = blob.len()))]
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < ENCRYPTION_OVERHEAD {
            return Err(CryptoError::Corrupted);
        }
        let (iv, rest) = blob.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut subkey = derive_subkey(self.master_key.as_bytes(), iv);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&subkey));
        let nonce = Nonce::from_slice(iv);

        // Reassemble ciphertext||tag, the order aes-gcm's `Aead` expects.
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let result = cipher
            .decrypt(nonce, Payload { msg: &sealed, aad: &[] })
            .map_err(|_| CryptoError::Corrupted);
        subkey.zeroize();
        result
    }
}

/// 32-byte HKDF-SHA-256 subkey derivation, salted with the per-file IV.
fn derive_subkey(master_key: &[u8; 32], iv: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(iv), master_key);
    let mut out = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, out.as_mut())
        .expect("32 bytes is a valid HKDF-SHA-256 output length");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::new(MasterKey::generate())
    }

    #[test]
    fn round_trips_arbitrary_buffers() {
        let c = crypto();
        for input in [&b""[..], b"hello world", &[0u8; 1024], &[7u8; 9 * 1024 * 1024]] {
            let ct = c.encrypt(input);
            assert_eq!(ct.len(), input.len() + ENCRYPTION_OVERHEAD);
            let pt = c.decrypt(&ct).unwrap();
            assert_eq!(pt, input);
        }
    }

    #[test]
    fn tamper_detected() {
        let c = crypto();
        let mut ct = c.encrypt(b"sensitive");
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(c.decrypt(&ct), Err(CryptoError::Corrupted)));
    }

    #[test]
    fn short_blob_rejected() {
        let c = crypto();
        assert!(matches!(c.decrypt(&[0u8; 10]), Err(CryptoError::Corrupted)));
    }

    #[test]
    fn different_master_keys_cannot_decrypt_each_other() {
        let a = Crypto::new(MasterKey::generate());
        let b = Crypto::new(MasterKey::generate());
        let ct = a.encrypt(b"secret");
        assert!(matches!(b.decrypt(&ct), Err(CryptoError::Corrupted)));
    }

    #[test]
    fn iv_is_unique_per_call() {
        let c = crypto();
        let a = c.encrypt(b"same input");
        let b = c.encrypt(b"same input");
        assert_ne!(a[..12], b[..12], "IVs should not collide across calls");
        assert_ne!(a, b, "ciphertext should differ even for identical plaintext");
    }
}
