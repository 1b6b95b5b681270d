//! Zeroization validation tests
//!
//! Verifies that key material handed back by ciphers can be wiped and that
//! wiping is observable through the public API.

use dtm_crypto::hash::Kdf;
use dtm_crypto::{AeadCipher, CipherEngine, KemAlgorithm, KeyMaterial, SymmetricCipher};
use dtm_crypto::{CryptoProvider, DefaultProvider};
use zeroize::Zeroize;

#[test]
fn test_replaced_key_material_can_be_wiped() {
    let mut cipher = AeadCipher::new(
        CipherEngine::XChaCha20Poly1305,
        KeyMaterial::new([0x42; 32], [0x24; 16]),
    );

    let mut old = cipher.replace_key(KeyMaterial::new([0x99; 32], [0x98; 16]));
    assert!(!old.is_zeroed());

    old.zeroize();
    assert!(old.is_zeroed());

    // The live cipher keeps working with the new key
    let ct = cipher.encrypt(0, b"after rekey", b"").unwrap();
    assert_eq!(cipher.decrypt(0, &ct, b"").unwrap(), b"after rekey");
}

#[test]
fn test_derived_material_is_not_zero() {
    let material = Kdf::PRIMARY.derive_material(&[7u8; 32]);
    assert!(!material.is_zeroed());
}

#[test]
fn test_old_key_cannot_open_new_traffic() {
    let old_material = KeyMaterial::new([1; 32], [2; 16]);
    let mut cipher = AeadCipher::new(CipherEngine::ChaCha20Poly1305, old_material.clone());
    let _ = cipher.replace_key(KeyMaterial::new([3; 32], [4; 16]));

    let ct = cipher.encrypt(5, b"fresh", b"").unwrap();
    let stale = AeadCipher::new(CipherEngine::ChaCha20Poly1305, old_material);
    assert!(stale.decrypt(5, &ct, b"").is_err());
}

#[test]
fn test_kem_secret_halves_are_populated() {
    let provider = DefaultProvider;
    for alg in KemAlgorithm::ALL {
        let kem = provider.key_exchange(alg).unwrap();
        let pair = kem.generate_keypair().unwrap();
        assert!(!pair.secret.iter().all(|&b| b == 0), "{alg} secret key is empty");
    }
}
