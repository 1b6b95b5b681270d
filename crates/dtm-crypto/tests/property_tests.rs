//! Property-based tests for the symmetric layer
//!
//! Nonce binding, tag coverage and KDF context separation over arbitrary
//! inputs.

use dtm_crypto::hash::Kdf;
use dtm_crypto::{AeadCipher, CipherEngine, KeyMaterial, SymmetricCipher, TAG_SIZE};
use proptest::prelude::*;

fn engine() -> impl Strategy<Value = CipherEngine> {
    prop_oneof![
        Just(CipherEngine::XChaCha20Poly1305),
        Just(CipherEngine::ChaCha20Poly1305),
    ]
}

fn cipher(engine: CipherEngine, key: [u8; 32], iv: [u8; 16]) -> AeadCipher {
    AeadCipher::new(engine, KeyMaterial::new(key, iv))
}

proptest! {
    /// Ciphertext only opens under the counter it was sealed with
    #[test]
    fn counter_is_bound(
        engine in engine(),
        key in any::<[u8; 32]>(),
        iv in any::<[u8; 16]>(),
        counter in any::<u64>(),
        other in any::<u64>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        prop_assume!(counter != other);
        let cipher = cipher(engine, key, iv);
        let sealed = cipher.encrypt(counter, &plaintext, b"header").unwrap();
        prop_assert_eq!(sealed.len(), plaintext.len() + TAG_SIZE);
        prop_assert_eq!(cipher.decrypt(counter, &sealed, b"header").unwrap(), plaintext);
        prop_assert!(cipher.decrypt(other, &sealed, b"header").is_err());
    }

    /// Flipping any bit of ciphertext or associated data fails authentication
    #[test]
    fn any_bit_flip_is_rejected(
        engine in engine(),
        key in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
        aad in prop::collection::vec(any::<u8>(), 1..64),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
        in_aad in any::<bool>(),
    ) {
        let cipher = cipher(engine, key, [7; 16]);
        let mut sealed = cipher.encrypt(3, &plaintext, &aad).unwrap();
        let mut aad = aad;
        if in_aad {
            let i = position.index(aad.len());
            aad[i] ^= 1 << bit;
        } else {
            let i = position.index(sealed.len());
            sealed[i] ^= 1 << bit;
        }
        prop_assert!(cipher.decrypt(3, &sealed, &aad).is_err());
    }

    /// Different IVs under one key never produce the same ciphertext
    #[test]
    fn iv_separates_streams(
        key in any::<[u8; 32]>(),
        iv_a in any::<[u8; 16]>(),
        iv_b in any::<[u8; 16]>(),
        counter in any::<u64>(),
    ) {
        prop_assume!(iv_a != iv_b);
        let engine = CipherEngine::XChaCha20Poly1305;
        let a = cipher(engine, key, iv_a).encrypt(counter, &[0; 32], b"").unwrap();
        let b = cipher(engine, key, iv_b).encrypt(counter, &[0; 32], b"").unwrap();
        prop_assert_ne!(a, b);
    }

    /// KDF contexts never agree on the same input
    #[test]
    fn kdf_contexts_are_separated(ikm in prop::collection::vec(any::<u8>(), 0..128)) {
        let auth = Kdf::AUTH.derive_material(&ikm);
        let primary = Kdf::PRIMARY.derive_material(&ikm);
        prop_assert_ne!(auth.fingerprint(), primary.fingerprint());
        prop_assert_eq!(
            Kdf::AUTH.derive_material(&ikm).fingerprint(),
            auth.fingerprint()
        );
    }
}
