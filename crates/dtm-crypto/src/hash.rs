//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - Fast cryptographic hashing
//! - Context-specific KDF used to turn KEM shared secrets into key material

use crate::aead::KeyMaterial;
use crate::{IV_SIZE, KEY_SIZE};
use zeroize::Zeroize;

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Auth-stage symmetric key context
    pub const AUTH: Self = Self::new("dtm 2024 auth-stage key");

    /// Primary-stage session key context
    pub const PRIMARY: Self = Self::new("dtm 2024 primary-stage session key");

    /// X25519 KEM shared secret context
    pub const X25519_KEM: Self = Self::new("dtm 2024 x25519 kem");

    /// Create a KDF with a specific context string.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);

        let mut reader = hasher.finalize_xof();
        reader.fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }

    /// Derive a full [`KeyMaterial`] (key and IV) from input key material.
    #[must_use]
    pub fn derive_material(&self, ikm: &[u8]) -> KeyMaterial {
        let mut okm = [0u8; KEY_SIZE + IV_SIZE];
        self.derive(ikm, &mut okm);

        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        iv.copy_from_slice(&okm[KEY_SIZE..]);
        okm.zeroize();

        KeyMaterial::new(key, iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_context_separation() {
        let ikm = [0x42u8; 32];
        let auth = Kdf::AUTH.derive_key(&ikm);
        let primary = Kdf::PRIMARY.derive_key(&ikm);
        assert_ne!(auth, primary);
    }

    #[test]
    fn test_kdf_deterministic() {
        let ikm = b"shared secret";
        let a = Kdf::PRIMARY.derive_material(ikm);
        let b = Kdf::PRIMARY.derive_material(ikm);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_hash_known_length() {
        assert_eq!(hash(b"dtm").len(), 32);
        assert_ne!(hash(b"dtm"), hash(b"dtn"));
    }
}
