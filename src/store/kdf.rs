//! Key derivation for password-keyed blobs (spec §4.A).
//!
//! Grounded in `enterprise::crypto::kdf::KdfProvider`, narrowed to the two
//! functions spec §4.A names: PBKDF2-HMAC-SHA256 and HKDF-SHA256. The
//! teacher's Argon2id/scrypt variants are not carried over — nothing in
//! SPEC_FULL calls for them.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

/// The literal HKDF info string mandated by spec §4.A.
pub const HKDF_INFO: &[u8] = b"OfflineFirst-Encryption";

/// Minimum salt length for PBKDF2, per spec §4.A ("32-byte random salt").
pub const SALT_LEN: usize = 32;

/// Minimum PBKDF2 iteration count mandated by spec §4.A.
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// A derived key, zeroized on drop.
#[derive(Clone)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Derive a 256-bit key from a password using PBKDF2-HMAC-SHA256.
///
/// `iterations` must be at least [`MIN_PBKDF2_ITERATIONS`]; callers that
/// pass a lower value are silently clamped up, matching the spec's "or
/// greater" phrasing rather than failing a caller who under-specifies.
pub fn derive_pbkdf2(password: &[u8], salt: &[u8], iterations: u32) -> DerivedKey {
    let iterations = iterations.max(MIN_PBKDF2_ITERATIONS);
    let mut key = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut key);
    DerivedKey(key)
}

/// Derive a 256-bit key from existing key material using HKDF-SHA256 with
/// the spec-mandated info string.
pub fn derive_hkdf(input_key_material: &[u8], salt: &[u8]) -> DerivedKey {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), input_key_material);
    let mut key = vec![0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("32-byte output is always valid for HKDF-SHA256");
    DerivedKey(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pbkdf2_is_deterministic() {
        let salt = [7u8; SALT_LEN];
        let k1 = derive_pbkdf2(b"hunter2", &salt, 100_000);
        let k2 = derive_pbkdf2(b"hunter2", &salt, 100_000);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(k1.as_bytes().len(), 32);
    }

    #[test]
    fn pbkdf2_clamps_low_iteration_counts() {
        let salt = [1u8; SALT_LEN];
        let low = derive_pbkdf2(b"pw", &salt, 10);
        let floor = derive_pbkdf2(b"pw", &salt, MIN_PBKDF2_ITERATIONS);
        assert_eq!(low.as_bytes(), floor.as_bytes());
    }

    #[test]
    fn hkdf_is_deterministic_and_info_bound() {
        let ikm = [9u8; 32];
        let salt = [3u8; 16];
        let k1 = derive_hkdf(&ikm, &salt);
        let k2 = derive_hkdf(&ikm, &salt);
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn different_passwords_derive_different_keys() {
        let salt = [0u8; SALT_LEN];
        let a = derive_pbkdf2(b"password-a", &salt, 100_000);
        let b = derive_pbkdf2(b"password-b", &salt, 100_000);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
