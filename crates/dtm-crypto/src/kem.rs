//! Key encapsulation capability.
//!
//! The exchange engine never touches KEM internals: it generates a key pair,
//! ships the public key, encapsulates to the peer's public key and
//! decapsulates the peer's ciphertext. Keys and ciphertexts travel as opaque
//! byte strings.

use crate::{CryptoError, SHARED_SECRET_SIZE};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// KEM algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KemAlgorithm {
    /// Diffie-Hellman KEM over Curve25519
    X25519,
    /// ML-KEM-512 (FIPS 203, category 1)
    MlKem512,
    /// ML-KEM-768 (FIPS 203, category 3)
    MlKem768,
    /// ML-KEM-1024 (FIPS 203, category 5)
    MlKem1024,
}

impl KemAlgorithm {
    /// Every known algorithm
    pub const ALL: [Self; 4] = [Self::X25519, Self::MlKem512, Self::MlKem768, Self::MlKem1024];

    /// Parameter OID carried on the wire during negotiation.
    #[must_use]
    pub fn oid(self) -> u32 {
        match self {
            Self::X25519 => 0x0101_0001,
            Self::MlKem512 => 0x0203_0001,
            Self::MlKem768 => 0x0203_0002,
            Self::MlKem1024 => 0x0203_0003,
        }
    }

    /// Resolve a parameter OID.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnknownAlgorithm`] for unassigned OIDs.
    pub fn from_oid(oid: u32) -> Result<Self, CryptoError> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.oid() == oid)
            .ok_or(CryptoError::UnknownAlgorithm(oid))
    }

    /// Classical-equivalent security level in bits.
    #[must_use]
    pub fn security_level(self) -> u32 {
        match self {
            Self::X25519 | Self::MlKem512 => 128,
            Self::MlKem768 => 192,
            Self::MlKem1024 => 256,
        }
    }

    /// Human-readable name
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::X25519 => "X25519",
            Self::MlKem512 => "ML-KEM-512",
            Self::MlKem768 => "ML-KEM-768",
            Self::MlKem1024 => "ML-KEM-1024",
        }
    }
}

impl std::fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// KEM key pair. The secret half zeroizes on drop.
pub struct KemKeyPair {
    /// Serialized public key
    pub public: Vec<u8>,
    /// Serialized secret key
    pub secret: Zeroizing<Vec<u8>>,
}

impl KemKeyPair {
    /// Assemble a key pair from serialized halves.
    #[must_use]
    pub fn new(public: Vec<u8>, secret: Vec<u8>) -> Self {
        Self {
            public,
            secret: Zeroizing::new(secret),
        }
    }
}

/// KEM shared secret (32 bytes), zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    /// Wrap raw shared secret bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SHARED_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the shared secret bytes.
    ///
    /// The secret should be fed through [`crate::hash::Kdf`] before use.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}

/// Key encapsulation capability.
pub trait KeyExchangeAlgorithm: Send + Sync {
    /// Algorithm implemented
    fn algorithm(&self) -> KemAlgorithm;

    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyGeneration`] if the backend fails.
    fn generate_keypair(&self) -> Result<KemKeyPair, CryptoError>;

    /// Encapsulate a fresh shared secret to `public_key`.
    ///
    /// Returns `(ciphertext, shared_secret)`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] for malformed keys.
    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), CryptoError>;

    /// Recover the shared secret from `ciphertext` using our key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidCiphertext`] or
    /// [`CryptoError::Decapsulation`] on failure.
    fn decapsulate(
        &self,
        keypair: &KemKeyPair,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, CryptoError>;
}
