//! Peer identity and trust tracking.
//!
//! Each session holds two identities: the local one, fixed at construction,
//! and the remote one, bound exactly once when the peer's `Init` packet
//! arrives. Trust is promoted in two steps:
//!
//! - `Partial`: the remote public identity was accepted by the [`TrustPolicy`]
//! - `Full`: the remote secret id, received under the Auth cipher, validated
//!
//! Secret ids are zeroized on drop.

use crate::error::{DtmError, Result};
use crate::wire::{WireReader, WireWriter};
use dtm_crypto::CipherEngine;
use dtm_crypto::constant_time::ct_eq;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Peer identity: a public id disclosed in the clear and a secret id only
/// sent under the Auth-stage cipher.
#[derive(Clone)]
pub struct Identity {
    public_id: Vec<u8>,
    secret_id: Zeroizing<Vec<u8>>,
}

impl Identity {
    /// Create an identity from its two halves
    #[must_use]
    pub fn new(public_id: impl Into<Vec<u8>>, secret_id: impl Into<Vec<u8>>) -> Self {
        Self {
            public_id: public_id.into(),
            secret_id: Zeroizing::new(secret_id.into()),
        }
    }

    /// Public id
    #[must_use]
    pub fn public_id(&self) -> &[u8] {
        &self.public_id
    }

    /// Secret id (empty for a remote identity until Auth completes)
    #[must_use]
    pub fn secret_id(&self) -> &[u8] {
        &self.secret_id
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_id", &hex::encode(&self.public_id))
            .finish_non_exhaustive()
    }
}

/// Trust level reached with the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum TrustState {
    /// Nothing validated yet
    #[default]
    None,
    /// Public identity accepted
    Partial,
    /// Secret id validated over the Auth channel
    Full,
}

impl TrustState {
    /// Wire value
    #[must_use]
    pub fn value(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Partial => 1,
            Self::Full => 2,
        }
    }

    /// Parse a wire value
    #[must_use]
    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Partial),
            2 => Some(Self::Full),
            _ => None,
        }
    }
}

/// What a peer discloses about itself in the `Init` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    /// Public id
    pub public_id: Vec<u8>,
    /// Auth-stage KEM parameter OID
    pub auth_oid: u32,
    /// Preferred Primary-stage KEM parameter OID
    pub primary_oid: u32,
    /// Symmetric engine used for session channels
    pub engine: CipherEngine,
    /// Application-defined option bits
    pub option_flag: u64,
}

impl PublicIdentity {
    /// Encode as a packet payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .bytes(&self.public_id)
            .u32(self.auth_oid)
            .u32(self.primary_oid)
            .u8(self.engine.id())
            .u64(self.option_flag)
            .finish()
    }

    /// Decode from a packet payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::MalformedPacket`] for truncated input and
    /// [`DtmError::IncompatibleParameters`] for an unknown engine id.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let public_id = reader.bytes("public_id")?.to_vec();
        let auth_oid = reader.u32("auth_oid")?;
        let primary_oid = reader.u32("primary_oid")?;
        let engine = CipherEngine::from_id(reader.u8("engine")?)
            .map_err(|_| DtmError::incompatible("unknown symmetric engine"))?;
        let option_flag = reader.u64("option_flag")?;
        reader.finish()?;

        Ok(Self {
            public_id,
            auth_oid,
            primary_oid,
            engine,
            option_flag,
        })
    }
}

/// Application-supplied trust decisions.
pub trait TrustPolicy: Send + Sync {
    /// Decide whether the peer's public identity is acceptable
    fn accept_public_id(&self, identity: &PublicIdentity) -> bool;

    /// Decide whether `secret_id` is valid for the peer with `public_id`
    fn accept_secret_id(&self, public_id: &[u8], secret_id: &[u8]) -> bool;
}

/// Accepts every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TrustPolicy for AcceptAll {
    fn accept_public_id(&self, _identity: &PublicIdentity) -> bool {
        true
    }

    fn accept_secret_id(&self, _public_id: &[u8], _secret_id: &[u8]) -> bool {
        true
    }
}

/// Accepts a fixed set of public ids, optionally pinning their secret ids.
#[derive(Clone, Default)]
pub struct AllowList {
    entries: HashMap<Vec<u8>, Option<Zeroizing<Vec<u8>>>>,
}

impl std::fmt::Debug for AllowList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllowList")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl AllowList {
    /// Create an empty allow list (rejects everyone)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `public_id` with any secret id
    #[must_use]
    pub fn allow(mut self, public_id: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(public_id.into(), None);
        self
    }

    /// Allow `public_id` only with the given secret id
    #[must_use]
    pub fn allow_with_secret(
        mut self,
        public_id: impl Into<Vec<u8>>,
        secret_id: impl Into<Vec<u8>>,
    ) -> Self {
        self.entries
            .insert(public_id.into(), Some(Zeroizing::new(secret_id.into())));
        self
    }
}

impl TrustPolicy for AllowList {
    fn accept_public_id(&self, identity: &PublicIdentity) -> bool {
        self.entries.contains_key(&identity.public_id)
    }

    fn accept_secret_id(&self, public_id: &[u8], secret_id: &[u8]) -> bool {
        match self.entries.get(public_id) {
            Some(Some(expected)) => ct_eq(expected, secret_id),
            Some(None) => true,
            None => false,
        }
    }
}

/// Local and remote identities plus the negotiated trust state.
pub struct IdentityStore {
    local: Identity,
    remote: Option<Identity>,
    remote_public: Option<PublicIdentity>,
    trust: TrustState,
    policy: Arc<dyn TrustPolicy>,
}

impl IdentityStore {
    /// Create a store that trusts every peer
    #[must_use]
    pub fn new(local: Identity) -> Self {
        Self::with_policy(local, Arc::new(AcceptAll))
    }

    /// Create a store using `policy` for trust decisions
    #[must_use]
    pub fn with_policy(local: Identity, policy: Arc<dyn TrustPolicy>) -> Self {
        Self {
            local,
            remote: None,
            remote_public: None,
            trust: TrustState::None,
            policy,
        }
    }

    /// Local identity
    #[must_use]
    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Remote identity, once bound
    #[must_use]
    pub fn remote(&self) -> Option<&Identity> {
        self.remote.as_ref()
    }

    /// Remote public identity as disclosed in `Init`
    #[must_use]
    pub fn remote_public(&self) -> Option<&PublicIdentity> {
        self.remote_public.as_ref()
    }

    /// Current trust state
    #[must_use]
    pub fn trust_state(&self) -> TrustState {
        self.trust
    }

    /// Bind the remote public identity and promote trust to `Partial`.
    ///
    /// # Errors
    ///
    /// - [`DtmError::IdentityAlreadyBound`] if a remote identity is bound
    /// - [`DtmError::IdentityRejected`] if the trust policy refuses it
    pub fn bind_remote(&mut self, identity: PublicIdentity) -> Result<()> {
        if self.remote.is_some() {
            return Err(DtmError::IdentityAlreadyBound);
        }
        if !self.policy.accept_public_id(&identity) {
            return Err(DtmError::IdentityRejected(Cow::Borrowed(
                "public id not accepted",
            )));
        }

        tracing::debug!("Remote identity bound: {}", hex::encode(&identity.public_id));
        self.remote = Some(Identity::new(identity.public_id.clone(), Vec::new()));
        self.remote_public = Some(identity);
        self.trust = TrustState::Partial;
        Ok(())
    }

    /// Validate the remote secret id and promote trust to `Full`.
    ///
    /// # Errors
    ///
    /// - [`DtmError::UnexpectedState`] if trust is not `Partial`
    /// - [`DtmError::IdentityRejected`] if the trust policy refuses it
    pub fn validate_secret(&mut self, secret_id: &[u8]) -> Result<()> {
        let Some(remote) = self.remote.as_mut() else {
            return Err(DtmError::UnexpectedState(Cow::Borrowed(
                "secret id before public identity",
            )));
        };
        if self.trust != TrustState::Partial {
            return Err(DtmError::UnexpectedState(Cow::Borrowed(
                "secret id already validated",
            )));
        }
        if !self.policy.accept_secret_id(&remote.public_id, secret_id) {
            return Err(DtmError::IdentityRejected(Cow::Borrowed(
                "secret id not accepted",
            )));
        }

        remote.secret_id = Zeroizing::new(secret_id.to_vec());
        self.trust = TrustState::Full;
        Ok(())
    }

    /// Forget the remote identity (teardown)
    pub fn clear_remote(&mut self) {
        self.remote = None;
        self.remote_public = None;
        self.trust = TrustState::None;
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("trust", &self.trust)
            .finish_non_exhaustive()
    }
}
