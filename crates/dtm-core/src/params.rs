//! Named exchange parameter sets and the catalog that resolves them.

use crate::error::{DtmError, Result};
use crate::identity::TrustState;
use dtm_crypto::{CipherEngine, KemAlgorithm};
use serde::{Deserialize, Serialize};

/// Default parameter set name
pub const DEFAULT_PARAMETER_SET: &str = "dtm-x25519-mlkem768-xchacha";

/// A named bundle of algorithms used by one session.
///
/// The auth-stage KEM protects the Primary exchange; the primary-stage KEM
/// establishes the session keys and doubles as this side's minimum in the
/// Sync negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeParameters {
    /// Catalog name
    pub name: String,
    /// Auth-stage KEM
    pub auth: KemAlgorithm,
    /// Primary-stage KEM (minimum accepted)
    pub primary: KemAlgorithm,
    /// Symmetric engine for the Auth cipher and session channels
    pub engine: CipherEngine,
    /// Trust required before the Primary channel may start
    pub min_trust: TrustState,
}

impl ExchangeParameters {
    /// Create a parameter set requiring full trust
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        auth: KemAlgorithm,
        primary: KemAlgorithm,
        engine: CipherEngine,
    ) -> Self {
        Self {
            name: name.into(),
            auth,
            primary,
            engine,
            min_trust: TrustState::Full,
        }
    }

    /// Auth-stage parameter OID
    #[must_use]
    pub fn auth_oid(&self) -> u32 {
        self.auth.oid()
    }

    /// Primary-stage parameter OID
    #[must_use]
    pub fn primary_oid(&self) -> u32 {
        self.primary.oid()
    }

    /// Security level of the primary stage in bits
    #[must_use]
    pub fn security_level(&self) -> u32 {
        self.primary.security_level()
    }
}

/// Lookup of named exchange parameters.
pub trait ParameterCatalog: Send + Sync {
    /// Resolve a parameter set by name.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::UnknownParameterSet`] if `name` is not listed.
    fn lookup(&self, name: &str) -> Result<ExchangeParameters>;

    /// Resolve a KEM parameter OID this side supports
    fn lookup_oid(&self, oid: u32) -> Option<KemAlgorithm>;

    /// Every primary-stage OID this side supports
    fn supported_oids(&self) -> Vec<u32>;
}

/// In-memory catalog.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    sets: Vec<ExchangeParameters>,
    supported: Vec<KemAlgorithm>,
}

impl StaticCatalog {
    /// Catalog over `sets`; supports every KEM they name
    #[must_use]
    pub fn new(sets: Vec<ExchangeParameters>) -> Self {
        let mut supported = Vec::new();
        for set in &sets {
            for alg in [set.auth, set.primary] {
                if !supported.contains(&alg) {
                    supported.push(alg);
                }
            }
        }
        Self { sets, supported }
    }

    /// The bundled parameter sets
    #[must_use]
    pub fn standard() -> Self {
        use CipherEngine::{ChaCha20Poly1305, XChaCha20Poly1305};
        use KemAlgorithm::{MlKem512, MlKem768, MlKem1024, X25519};

        Self::new(vec![
            ExchangeParameters::new("dtm-x25519-xchacha", X25519, X25519, XChaCha20Poly1305),
            ExchangeParameters::new(
                "dtm-x25519-mlkem512-xchacha",
                X25519,
                MlKem512,
                XChaCha20Poly1305,
            ),
            ExchangeParameters::new(DEFAULT_PARAMETER_SET, X25519, MlKem768, XChaCha20Poly1305),
            ExchangeParameters::new(
                "dtm-x25519-mlkem768-chacha",
                X25519,
                MlKem768,
                ChaCha20Poly1305,
            ),
            ExchangeParameters::new(
                "dtm-mlkem768-mlkem1024-xchacha",
                MlKem768,
                MlKem1024,
                XChaCha20Poly1305,
            ),
        ])
    }

    /// Restrict the supported KEMs (the named sets are unchanged)
    #[must_use]
    pub fn with_supported(mut self, supported: Vec<KemAlgorithm>) -> Self {
        self.supported = supported;
        self
    }

    /// Every named set
    #[must_use]
    pub fn sets(&self) -> &[ExchangeParameters] {
        &self.sets
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl ParameterCatalog for StaticCatalog {
    fn lookup(&self, name: &str) -> Result<ExchangeParameters> {
        self.sets
            .iter()
            .find(|set| set.name == name)
            .cloned()
            .ok_or_else(|| DtmError::UnknownParameterSet(name.to_string()))
    }

    fn lookup_oid(&self, oid: u32) -> Option<KemAlgorithm> {
        self.supported.iter().copied().find(|alg| alg.oid() == oid)
    }

    fn supported_oids(&self) -> Vec<u32> {
        self.supported.iter().map(|alg| alg.oid()).collect()
    }
}
