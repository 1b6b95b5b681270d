//! ML-KEM (FIPS 203) key encapsulation via the `fips203` crate.
//!
//! Three parameter sets are exposed: [`MlKem512`], [`MlKem768`] and
//! [`MlKem1024`]. Keys and ciphertexts are carried in their FIPS 203 byte
//! encodings.

use crate::kem::{KemAlgorithm, KemKeyPair, KeyExchangeAlgorithm, SharedSecret};
use crate::CryptoError;
use fips203::traits::{Decaps, Encaps, KeyGen, SerDes};

macro_rules! ml_kem_backend {
    ($name:ident, $module:ident, $algorithm:expr, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl KeyExchangeAlgorithm for $name {
            fn algorithm(&self) -> KemAlgorithm {
                $algorithm
            }

            fn generate_keypair(&self) -> Result<KemKeyPair, CryptoError> {
                let (ek, dk) = fips203::$module::KG::try_keygen()
                    .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
                Ok(KemKeyPair::new(
                    ek.into_bytes().to_vec(),
                    dk.into_bytes().to_vec(),
                ))
            }

            fn encapsulate(
                &self,
                public_key: &[u8],
            ) -> Result<(Vec<u8>, SharedSecret), CryptoError> {
                let bytes: [u8; fips203::$module::EK_LEN] = public_key
                    .try_into()
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let ek = fips203::$module::EncapsKey::try_from_bytes(bytes)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;

                let (ssk, ct) = ek
                    .try_encaps()
                    .map_err(|e| CryptoError::Encapsulation(e.to_string()))?;
                Ok((
                    ct.into_bytes().to_vec(),
                    SharedSecret::from_bytes(ssk.into_bytes()),
                ))
            }

            fn decapsulate(
                &self,
                keypair: &KemKeyPair,
                ciphertext: &[u8],
            ) -> Result<SharedSecret, CryptoError> {
                let ct_bytes: [u8; fips203::$module::CT_LEN] =
                    ciphertext
                        .try_into()
                        .map_err(|_| CryptoError::InvalidCiphertext {
                            expected: fips203::$module::CT_LEN,
                            actual: ciphertext.len(),
                        })?;
                let dk_bytes: [u8; fips203::$module::DK_LEN] = keypair
                    .secret
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::InvalidKeyLength {
                        expected: fips203::$module::DK_LEN,
                        actual: keypair.secret.len(),
                    })?;

                let ct = fips203::$module::CipherText::try_from_bytes(ct_bytes)
                    .map_err(|e| CryptoError::Decapsulation(e.to_string()))?;
                let dk = fips203::$module::DecapsKey::try_from_bytes(dk_bytes)
                    .map_err(|_| CryptoError::InvalidKeyMaterial)?;

                let ssk = dk
                    .try_decaps(&ct)
                    .map_err(|e| CryptoError::Decapsulation(e.to_string()))?;
                Ok(SharedSecret::from_bytes(ssk.into_bytes()))
            }
        }
    };
}

ml_kem_backend!(
    MlKem512,
    ml_kem_512,
    KemAlgorithm::MlKem512,
    "ML-KEM-512 (NIST security category 1)."
);
ml_kem_backend!(
    MlKem768,
    ml_kem_768,
    KemAlgorithm::MlKem768,
    "ML-KEM-768 (NIST security category 3)."
);
ml_kem_backend!(
    MlKem1024,
    ml_kem_1024,
    KemAlgorithm::MlKem1024,
    "ML-KEM-1024 (NIST security category 5)."
);
