//! Symmetric AEAD ciphers behind the [`SymmetricCipher`] capability.
//!
//! Every cipher is keyed by a [`KeyMaterial`] (32-byte key plus 16-byte IV).
//! Nonces are never stored: each seal/open call supplies a counter (the
//! packet sequence), and the nonce is derived from counter and IV. A counter
//! must never be reused under the same key.
//!
//! ## Engines
//!
//! - `XChaCha20-Poly1305`: nonce = `counter_le(8) || iv(16)`
//! - `ChaCha20-Poly1305`: nonce = `counter_le(8) || iv[..4]`
//!
//! Both produce `plaintext.len() + 16` bytes of output.

use crate::{CryptoError, IV_SIZE, KEY_SIZE, TAG_SIZE};
use chacha20poly1305::{
    ChaCha20Poly1305, XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const XNONCE_SIZE: usize = 24;

/// ChaCha20-Poly1305 nonce size (12 bytes / 96 bits).
pub const NONCE_SIZE: usize = 12;

/// Serialized size of [`KeyMaterial`].
pub const KEY_MATERIAL_SIZE: usize = KEY_SIZE + IV_SIZE;

/// Symmetric key and IV for one direction of a channel.
///
/// Zeroized on drop. [`KeyMaterial::fingerprint`] exposes a one-way digest
/// so that key agreement can be checked without touching raw bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl KeyMaterial {
    /// Create key material from raw parts.
    #[must_use]
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Generate fresh random key material.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self {
            key: crate::random::random_32()?,
            iv: crate::random::random_16()?,
        })
    }

    /// Parse key material from its serialized form (`key || iv`).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `bytes` is not
    /// [`KEY_MATERIAL_SIZE`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_MATERIAL_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_MATERIAL_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        let mut iv = [0u8; IV_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        iv.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(Self { key, iv })
    }

    /// Serialize as `key || iv`. The returned buffer zeroizes on drop.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(KEY_MATERIAL_SIZE));
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.iv);
        out
    }

    /// One-way digest of the key material.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key("dtm 2024 key fingerprint");
        hasher.update(&self.key);
        hasher.update(&self.iv);
        *hasher.finalize().as_bytes()
    }

    /// Check whether every byte of the material is zero.
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.key.iter().chain(self.iv.iter()).all(|&b| b == 0)
    }

    fn xnonce(&self, counter: u64) -> [u8; XNONCE_SIZE] {
        let mut nonce = [0u8; XNONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        nonce[8..].copy_from_slice(&self.iv);
        nonce
    }

    fn nonce(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&counter.to_le_bytes());
        nonce[8..].copy_from_slice(&self.iv[..4]);
        nonce
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Symmetric engine selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherEngine {
    /// XChaCha20-Poly1305 (192-bit nonce)
    XChaCha20Poly1305,
    /// ChaCha20-Poly1305 (96-bit nonce)
    ChaCha20Poly1305,
}

impl CipherEngine {
    /// Wire identifier
    #[must_use]
    pub fn id(self) -> u8 {
        match self {
            Self::XChaCha20Poly1305 => 1,
            Self::ChaCha20Poly1305 => 2,
        }
    }

    /// Parse a wire identifier
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownAlgorithm`] for unassigned values.
    pub fn from_id(id: u8) -> Result<Self, CryptoError> {
        match id {
            1 => Ok(Self::XChaCha20Poly1305),
            2 => Ok(Self::ChaCha20Poly1305),
            other => Err(CryptoError::UnknownAlgorithm(u32::from(other))),
        }
    }

    /// Key size in bytes
    #[must_use]
    pub fn key_size(self) -> usize {
        KEY_SIZE
    }
}

/// Symmetric encryption capability bound to one key.
///
/// Implementations derive their nonce from `counter`; callers guarantee a
/// counter is used at most once per key (the DTM sequence numbers do).
pub trait SymmetricCipher: Send + Sync {
    /// Engine implemented by this cipher
    fn engine(&self) -> CipherEngine;

    /// Encrypt `plaintext`, authenticating `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the AEAD fails.
    fn encrypt(&self, counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Decrypt `ciphertext` (with appended tag), verifying `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    fn decrypt(&self, counter: u64, ciphertext: &[u8], aad: &[u8])
    -> Result<Vec<u8>, CryptoError>;

    /// Swap in new key material, returning the previous material.
    ///
    /// The caller owns the returned value and is expected to zeroize it.
    fn replace_key(&mut self, material: KeyMaterial) -> KeyMaterial;

    /// Fingerprint of the current key material
    fn fingerprint(&self) -> [u8; 32];
}

/// ChaCha20-Poly1305 family cipher.
#[derive(ZeroizeOnDrop)]
pub struct AeadCipher {
    #[zeroize(skip)]
    engine: CipherEngine,
    material: KeyMaterial,
}

impl AeadCipher {
    /// Create a cipher for `engine` keyed with `material`.
    #[must_use]
    pub fn new(engine: CipherEngine, material: KeyMaterial) -> Self {
        Self { engine, material }
    }
}

impl SymmetricCipher for AeadCipher {
    fn engine(&self) -> CipherEngine {
        self.engine
    }

    fn encrypt(&self, counter: u64, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        match self.engine {
            CipherEngine::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new((&self.material.key).into());
                let nonce = self.material.xnonce(counter);
                cipher.encrypt(chacha20poly1305::XNonce::from_slice(&nonce), payload)
            }
            CipherEngine::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new((&self.material.key).into());
                let nonce = self.material.nonce(counter);
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
            }
        }
        .map_err(|_| CryptoError::EncryptionFailed)
    }

    fn decrypt(
        &self,
        counter: u64,
        ciphertext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        match self.engine {
            CipherEngine::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new((&self.material.key).into());
                let nonce = self.material.xnonce(counter);
                cipher.decrypt(chacha20poly1305::XNonce::from_slice(&nonce), payload)
            }
            CipherEngine::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new((&self.material.key).into());
                let nonce = self.material.nonce(counter);
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload)
            }
        }
        .map_err(|_| CryptoError::DecryptionFailed)
    }

    fn replace_key(&mut self, material: KeyMaterial) -> KeyMaterial {
        std::mem::replace(&mut self.material, material)
    }

    fn fingerprint(&self) -> [u8; 32] {
        self.material.fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material(seed: u8) -> KeyMaterial {
        KeyMaterial::new([seed; KEY_SIZE], [seed.wrapping_add(1); IV_SIZE])
    }

    #[test]
    fn test_seal_open_both_engines() {
        for engine in [CipherEngine::XChaCha20Poly1305, CipherEngine::ChaCha20Poly1305] {
            let cipher = AeadCipher::new(engine, material(9));
            let ct = cipher.encrypt(7, b"hello dtm", b"header").unwrap();
            assert_eq!(ct.len(), b"hello dtm".len() + TAG_SIZE);

            let pt = cipher.decrypt(7, &ct, b"header").unwrap();
            assert_eq!(pt, b"hello dtm");
        }
    }

    #[test]
    fn test_wrong_counter_fails() {
        let cipher = AeadCipher::new(CipherEngine::XChaCha20Poly1305, material(1));
        let ct = cipher.encrypt(1, b"payload", b"").unwrap();
        assert_eq!(
            cipher.decrypt(2, &ct, b""),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_aad_fails() {
        let cipher = AeadCipher::new(CipherEngine::ChaCha20Poly1305, material(1));
        let ct = cipher.encrypt(1, b"payload", b"aad-1").unwrap();
        assert!(cipher.decrypt(1, &ct, b"aad-2").is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = AeadCipher::new(CipherEngine::XChaCha20Poly1305, material(3));
        let mut ct = cipher.encrypt(0, b"payload", b"").unwrap();
        ct[0] ^= 0x80;
        assert!(cipher.decrypt(0, &ct, b"").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let cipher = AeadCipher::new(CipherEngine::XChaCha20Poly1305, material(3));
        assert_eq!(
            cipher.decrypt(0, &[0u8; TAG_SIZE - 1], b""),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_replace_key_returns_previous() {
        let mut cipher = AeadCipher::new(CipherEngine::XChaCha20Poly1305, material(1));
        let before = cipher.fingerprint();
        let old = cipher.replace_key(material(2));

        assert_eq!(old.fingerprint(), before);
        assert_ne!(cipher.fingerprint(), before);
    }

    #[test]
    fn test_key_material_serialization() {
        let m = material(5);
        let bytes = m.to_bytes();
        assert_eq!(bytes.len(), KEY_MATERIAL_SIZE);

        let parsed = KeyMaterial::from_slice(&bytes).unwrap();
        assert_eq!(parsed.fingerprint(), m.fingerprint());
        assert!(KeyMaterial::from_slice(&bytes[1..]).is_err());
    }

    #[test]
    fn test_key_material_zeroize() {
        let mut m = material(5);
        assert!(!m.is_zeroed());
        m.zeroize();
        assert!(m.is_zeroed());
    }

    #[test]
    fn test_engine_ids() {
        for engine in [CipherEngine::XChaCha20Poly1305, CipherEngine::ChaCha20Poly1305] {
            assert_eq!(CipherEngine::from_id(engine.id()).unwrap(), engine);
        }
        assert!(CipherEngine::from_id(0).is_err());
    }
}
