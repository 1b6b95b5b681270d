//! X25519 Diffie-Hellman KEM (RFC 7748).
//!
//! Encapsulation generates an ephemeral key pair; the ciphertext is the
//! ephemeral public key and the shared secret is
//! `KDF(dh || ephemeral_public || recipient_public)`.
//!
//! Low-order points (all-zero DH output) are rejected.

use crate::hash::Kdf;
use crate::kem::{KemAlgorithm, KemKeyPair, KeyExchangeAlgorithm, SharedSecret};
use crate::CryptoError;
use rand_core::OsRng;
use zeroize::Zeroize;

/// X25519 key size (public, secret and ciphertext)
pub const X25519_KEY_SIZE: usize = 32;

/// X25519 DH-KEM.
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Kem;

fn to_array(bytes: &[u8]) -> Option<[u8; X25519_KEY_SIZE]> {
    bytes.try_into().ok()
}

fn combine(
    dh: &x25519_dalek::SharedSecret,
    ephemeral: &[u8; X25519_KEY_SIZE],
    recipient: &[u8; X25519_KEY_SIZE],
) -> Result<SharedSecret, CryptoError> {
    // Check for low-order points
    if dh.as_bytes() == &[0u8; X25519_KEY_SIZE] {
        return Err(CryptoError::InvalidPublicKey);
    }

    let mut ikm = [0u8; 3 * X25519_KEY_SIZE];
    ikm[..32].copy_from_slice(dh.as_bytes());
    ikm[32..64].copy_from_slice(ephemeral);
    ikm[64..].copy_from_slice(recipient);
    let secret = SharedSecret::from_bytes(Kdf::X25519_KEM.derive_key(&ikm));
    ikm.zeroize();

    Ok(secret)
}

impl KeyExchangeAlgorithm for X25519Kem {
    fn algorithm(&self) -> KemAlgorithm {
        KemAlgorithm::X25519
    }

    fn generate_keypair(&self) -> Result<KemKeyPair, CryptoError> {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(KemKeyPair::new(
            public.as_bytes().to_vec(),
            secret.to_bytes().to_vec(),
        ))
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
        let recipient = to_array(public_key).ok_or(CryptoError::InvalidPublicKey)?;

        let ephemeral = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = *x25519_dalek::PublicKey::from(&ephemeral).as_bytes();
        let dh = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(recipient));

        let secret = combine(&dh, &ephemeral_public, &recipient)?;
        Ok((ephemeral_public.to_vec(), secret))
    }

    fn decapsulate(
        &self,
        keypair: &KemKeyPair,
        ciphertext: &[u8],
    ) -> Result<SharedSecret, CryptoError> {
        let ephemeral = to_array(ciphertext).ok_or(CryptoError::InvalidCiphertext {
            expected: X25519_KEY_SIZE,
            actual: ciphertext.len(),
        })?;
        let mut secret_bytes = to_array(&keypair.secret).ok_or(CryptoError::InvalidKeyLength {
            expected: X25519_KEY_SIZE,
            actual: keypair.secret.len(),
        })?;
        let recipient = to_array(&keypair.public).ok_or(CryptoError::InvalidPublicKey)?;

        let secret = x25519_dalek::StaticSecret::from(secret_bytes);
        secret_bytes.zeroize();
        let dh = secret.diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral));

        combine(&dh, &ephemeral, &recipient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x25519_key_generation() {
        let pair = X25519Kem.generate_keypair().unwrap();
        assert_eq!(pair.public.len(), X25519_KEY_SIZE);
        assert_eq!(pair.secret.len(), X25519_KEY_SIZE);
        assert_ne!(pair.public, vec![0u8; 32]);
    }

    #[test]
    fn test_x25519_encapsulation_agrees() {
        let pair = X25519Kem.generate_keypair().unwrap();
        let (ct, ss_sender) = X25519Kem.encapsulate(&pair.public).unwrap();
        let ss_receiver = X25519Kem.decapsulate(&pair, &ct).unwrap();
        assert_eq!(ss_sender.as_bytes(), ss_receiver.as_bytes());
    }

    #[test]
    fn test_x25519_wrong_keypair_disagrees() {
        let pair = X25519Kem.generate_keypair().unwrap();
        let other = X25519Kem.generate_keypair().unwrap();
        let (ct, ss_sender) = X25519Kem.encapsulate(&pair.public).unwrap();
        let ss_other = X25519Kem.decapsulate(&other, &ct).unwrap();
        assert_ne!(ss_sender.as_bytes(), ss_other.as_bytes());
    }

    #[test]
    fn test_x25519_low_order_point_rejected() {
        // The all-zero point has order 1
        assert_eq!(
            X25519Kem.encapsulate(&[0u8; 32]).err(),
            Some(CryptoError::InvalidPublicKey)
        );
    }

    #[test]
    fn test_x25519_bad_lengths() {
        let pair = X25519Kem.generate_keypair().unwrap();
        assert!(X25519Kem.encapsulate(&[1u8; 31]).is_err());
        assert!(matches!(
            X25519Kem.decapsulate(&pair, &[1u8; 33]),
            Err(CryptoError::InvalidCiphertext { .. })
        ));
    }
}
