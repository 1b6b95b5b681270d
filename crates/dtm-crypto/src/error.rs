//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid KEM ciphertext
    #[error("invalid ciphertext: expected {expected} bytes, got {actual}")]
    InvalidCiphertext {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Encapsulation failed
    #[error("encapsulation failed: {0}")]
    Encapsulation(String),

    /// Decapsulation failed
    #[error("decapsulation failed: {0}")]
    Decapsulation(String),

    /// Nonce overflow (counter exhausted)
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Unknown algorithm identifier
    #[error("unknown algorithm identifier: {0:#x}")]
    UnknownAlgorithm(u32),

    /// Algorithm has no backend in this provider
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,
}
