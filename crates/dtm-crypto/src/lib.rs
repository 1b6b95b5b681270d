//! # DTM Crypto
//!
//! Cryptographic capabilities consumed by the DTM exchange and session engine.
//!
//! The protocol core only depends on two capabilities:
//! - [`KeyExchangeAlgorithm`]: key pairs, encapsulation and decapsulation
//! - [`SymmetricCipher`]: sealing and opening byte buffers under a key and IV
//!
//! Both are obtained through a [`CryptoProvider`], so an embedding can swap
//! in its own primitives. [`DefaultProvider`] wires in the backends below.
//!
//! ## Reference Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | KEM | X25519 (DH-KEM) | 128-bit |
//! | KEM | ML-KEM-512 / 768 / 1024 | 128 / 192 / 256-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | AEAD | ChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 keyed derivation | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod kem;
pub mod mlkem;
pub mod random;
pub mod x25519;

pub use aead::{AeadCipher, CipherEngine, KeyMaterial, SymmetricCipher};
pub use error::CryptoError;
pub use kem::{KemAlgorithm, KemKeyPair, KeyExchangeAlgorithm, SharedSecret};

/// Symmetric key size for every supported AEAD engine
pub const KEY_SIZE: usize = 32;

/// IV (nonce salt) size carried in [`KeyMaterial`]
pub const IV_SIZE: usize = 16;

/// AEAD authentication tag size
pub const TAG_SIZE: usize = 16;

/// KEM shared secret size
pub const SHARED_SECRET_SIZE: usize = 32;

/// Source of the cryptographic capabilities used by a session.
pub trait CryptoProvider: Send + Sync {
    /// Instantiate a key exchange algorithm.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] if the provider has no
    /// backend for `algorithm`.
    fn key_exchange(
        &self,
        algorithm: KemAlgorithm,
    ) -> Result<Box<dyn KeyExchangeAlgorithm>, CryptoError>;

    /// Instantiate a symmetric cipher keyed with `material`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::UnsupportedAlgorithm`] if the provider has no
    /// backend for `engine`.
    fn cipher(
        &self,
        engine: CipherEngine,
        material: KeyMaterial,
    ) -> Result<Box<dyn SymmetricCipher>, CryptoError>;
}

/// Provider backed by the crates bundled in this workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProvider;

impl CryptoProvider for DefaultProvider {
    fn key_exchange(
        &self,
        algorithm: KemAlgorithm,
    ) -> Result<Box<dyn KeyExchangeAlgorithm>, CryptoError> {
        Ok(match algorithm {
            KemAlgorithm::X25519 => Box::new(x25519::X25519Kem),
            KemAlgorithm::MlKem512 => Box::new(mlkem::MlKem512),
            KemAlgorithm::MlKem768 => Box::new(mlkem::MlKem768),
            KemAlgorithm::MlKem1024 => Box::new(mlkem::MlKem1024),
        })
    }

    fn cipher(
        &self,
        engine: CipherEngine,
        material: KeyMaterial,
    ) -> Result<Box<dyn SymmetricCipher>, CryptoError> {
        Ok(Box::new(AeadCipher::new(engine, material)))
    }
}

/// Session keys produced by a completed exchange.
///
/// `forward` keys the channel we send on, `ret` the channel we receive on.
/// The peer holds the same two values with the roles swapped.
pub struct SessionKeys {
    /// Key material for the send direction
    pub forward: KeyMaterial,
    /// Key material for the receive direction
    pub ret: KeyMaterial,
    /// Negotiated symmetric engine
    pub engine: CipherEngine,
}

impl SessionKeys {
    /// Derive a session identifier that both peers compute identically.
    #[must_use]
    pub fn session_id(&self, initiator: bool) -> [u8; 16] {
        let (first, second) = if initiator {
            (&self.forward, &self.ret)
        } else {
            (&self.ret, &self.forward)
        };
        let mut hasher = blake3::Hasher::new_derive_key("dtm 2024 session id");
        hasher.update(&first.fingerprint());
        hasher.update(&second.fingerprint());
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        id
    }
}
