//! Authenticated symmetric encryption for the store (spec §4.A).
//!
//! Grounded in `enterprise::crypto::symmetric::{Aes256GcmCipher,
//! ChaCha20Poly1305Cipher}`: both algorithms are AEAD, both use 96-bit
//! nonces, and nonces are freshly randomized per call rather than reused —
//! reuse with the same key is a critical AES-GCM/ChaCha20-Poly1305 security
//! violation.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};

use crate::error::StoreError;
use crate::types::EncryptionAlgorithm;

/// Nonce size in bytes, identical for both supported algorithms.
pub const NONCE_SIZE: usize = 12;

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key` with the given algorithm, returning
/// `nonce || ciphertext` (ciphertext includes the authentication tag).
pub fn encrypt(algorithm: EncryptionAlgorithm, key: &[u8; 32], plaintext: &[u8]) -> StoreResult<Vec<u8>> {
    let nonce_bytes = random_nonce();
    let ciphertext = match algorithm {
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| StoreError::Corrupted(format!("invalid AES-256-GCM key: {e}")))?;
            let nonce = AesNonce::from_slice(&nonce_bytes);
            cipher
                .encrypt(nonce, Payload { msg: plaintext, aad: b"" })
                .map_err(|_| StoreError::Corrupted("AES-256-GCM encryption failed".into()))?
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| StoreError::Corrupted(format!("invalid ChaCha20-Poly1305 key: {e}")))?;
            let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
            cipher
                .encrypt(nonce, Payload { msg: plaintext, aad: b"" })
                .map_err(|_| StoreError::Corrupted("ChaCha20-Poly1305 encryption failed".into()))?
        }
    };

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce || ciphertext` produced by [`encrypt`]. Authentication
/// failure or truncated input surfaces as [`StoreError::Corrupted`].
pub fn decrypt(algorithm: EncryptionAlgorithm, key: &[u8; 32], blob: &[u8]) -> StoreResult<Vec<u8>> {
    if blob.len() < NONCE_SIZE {
        return Err(StoreError::Corrupted("ciphertext shorter than nonce".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);

    match algorithm {
        EncryptionAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| StoreError::Corrupted(format!("invalid AES-256-GCM key: {e}")))?;
            let nonce = AesNonce::from_slice(nonce_bytes);
            cipher
                .decrypt(nonce, Payload { msg: ciphertext, aad: b"" })
                .map_err(|_| StoreError::Corrupted("AES-256-GCM authentication failed".into()))
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| StoreError::Corrupted(format!("invalid ChaCha20-Poly1305 key: {e}")))?;
            let nonce = chacha20poly1305::Nonce::from_slice(nonce_bytes);
            cipher
                .decrypt(nonce, Payload { msg: ciphertext, aad: b"" })
                .map_err(|_| StoreError::Corrupted("ChaCha20-Poly1305 authentication failed".into()))
        }
    }
}

use crate::error::StoreResult;
