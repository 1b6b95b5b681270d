//! Exchange negotiator: drives both channels of the handshake.
//!
//! Recovery paths:
//! - a sequence gap buffers the early packet and requests a `Resend`
//! - a state out of order requests a `Resend` of the expected sequence
//! - bad data after the Auth channel completes triggers a `Resync`: both
//!   peers zeroize their Primary-channel state and the initiator restarts
//!   at `Sync`. Bad data before that point is unrecoverable.
//!
//! Exchange sequences are never reset, so Auth-cipher nonces (derived from
//! the sequence) are never reused, even across resyncs.

use super::messages::{ConnectHello, NegotiateOffer, SyncProposal, decode_oid, encode_oid};
use super::state::{ChannelProgress, ExchangeState};
use super::{ExchangeEvent, ExchangeStep, Role};
use crate::PROTOCOL_VERSION;
use crate::config::DtmConfig;
use crate::error::{DtmError, Result};
use crate::flags::DtmServiceFlag;
use crate::identity::{IdentityStore, PublicIdentity, TrustState};
use crate::packet::{Packet, PacketType, header_aad};
use crate::packet_buffer::PacketBuffer;
use crate::params::{ExchangeParameters, ParameterCatalog};
use dtm_crypto::hash::Kdf;
use dtm_crypto::{
    CryptoProvider, KemAlgorithm, KemKeyPair, KeyExchangeAlgorithm, SessionKeys, SharedSecret,
    SymmetricCipher,
};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Retry and buffering limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorLimits {
    /// Open with a `Negotiate` pre-exchange (initiator only)
    pub negotiate: bool,
    /// Resend requests tolerated
    pub max_resend: u32,
    /// Resync attempts tolerated
    pub max_resync: u32,
    /// Depth of the sent and pending buffers
    pub buffer_depth: usize,
}

impl Default for NegotiatorLimits {
    fn default() -> Self {
        Self::from(&DtmConfig::default())
    }
}

impl From<&DtmConfig> for NegotiatorLimits {
    fn from(config: &DtmConfig) -> Self {
        Self {
            negotiate: config.negotiate,
            max_resend: config.max_resend,
            max_resync: config.max_resync,
            buffer_depth: config.buffer_depth,
        }
    }
}

#[derive(Default)]
struct AuthStage {
    keypair: Option<KemKeyPair>,
    peer_public: Option<Vec<u8>>,
    encapsulated: Option<SharedSecret>,
    send: Option<Box<dyn SymmetricCipher>>,
    recv: Option<Box<dyn SymmetricCipher>>,
}

#[derive(Default)]
struct PrimaryStage {
    algorithm: Option<KemAlgorithm>,
    keypair: Option<KemKeyPair>,
    peer_public: Option<Vec<u8>>,
    encapsulated: Option<SharedSecret>,
    decapsulated: Option<SharedSecret>,
}

/// Sans-IO handshake state machine for one session.
pub struct ExchangeNegotiator {
    role: Role,
    params: ExchangeParameters,
    catalog: Arc<dyn ParameterCatalog>,
    provider: Arc<dyn CryptoProvider>,
    limits: NegotiatorLimits,
    progress: ChannelProgress,
    /// State the initiator opened and awaits an answer for
    awaiting: Option<ExchangeState>,
    send_seq: i64,
    recv_seq: i64,
    sent: PacketBuffer,
    pending: PacketBuffer,
    resends: u32,
    resyncs: u32,
    peer_public_id: Option<Vec<u8>>,
    peer_min_trust: TrustState,
    agreed: Option<KemAlgorithm>,
    auth: AuthStage,
    primary: PrimaryStage,
}

impl ExchangeNegotiator {
    /// Create a negotiator for `role`
    #[must_use]
    pub fn new(
        role: Role,
        params: ExchangeParameters,
        catalog: Arc<dyn ParameterCatalog>,
        provider: Arc<dyn CryptoProvider>,
        limits: NegotiatorLimits,
    ) -> Self {
        Self {
            role,
            params,
            catalog,
            provider,
            limits,
            progress: ChannelProgress::new(),
            awaiting: None,
            send_seq: 0,
            recv_seq: 0,
            sent: PacketBuffer::new(limits.buffer_depth),
            pending: PacketBuffer::new(limits.buffer_depth),
            resends: 0,
            resyncs: 0,
            peer_public_id: None,
            peer_min_trust: TrustState::None,
            agreed: None,
            auth: AuthStage::default(),
            primary: PrimaryStage::default(),
        }
    }

    /// Role played by this side
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Parameters this side started with
    #[must_use]
    pub fn params(&self) -> &ExchangeParameters {
        &self.params
    }

    /// Channel progress
    #[must_use]
    pub fn progress(&self) -> ChannelProgress {
        self.progress
    }

    /// Most advanced completed state
    #[must_use]
    pub fn state(&self) -> Option<ExchangeState> {
        self.progress.current()
    }

    /// Check if both channels are complete
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.progress.is_established()
    }

    /// Primary-stage KEM agreed at `Sync`
    #[must_use]
    pub fn agreed_primary(&self) -> Option<KemAlgorithm> {
        self.agreed
    }

    /// Resend requests issued so far
    #[must_use]
    pub fn resend_count(&self) -> u32 {
        self.resends
    }

    /// Resync attempts so far
    #[must_use]
    pub fn resync_count(&self) -> u32 {
        self.resyncs
    }

    /// Encoded bytes of a previously sent exchange packet
    #[must_use]
    pub fn retransmit(&self, sequence: i64) -> Option<Vec<u8>> {
        self.sent.peek(sequence)
    }

    /// Produce the initiator's opening packet.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidState`] for a responder or a negotiator
    /// that has already started.
    pub fn start(&mut self, store: &IdentityStore) -> Result<ExchangeStep> {
        if self.role != Role::Initiator {
            return Err(DtmError::invalid_state("responder cannot start an exchange"));
        }
        if self.progress.current().is_some() || self.awaiting.is_some() {
            return Err(DtmError::invalid_state("exchange already started"));
        }

        let first = if self.limits.negotiate {
            ExchangeState::Negotiate
        } else {
            ExchangeState::Connect
        };
        let result = self.open_state(first, store).map(|packet| ExchangeStep {
            outbound: vec![packet],
            ..ExchangeStep::default()
        });
        self.wipe_on_error(result)
    }

    /// Consume one Exchange packet.
    ///
    /// Recoverable conditions are reported as
    /// [`ExchangeEvent::Recoverable`] together with the Service packets
    /// that recover from them.
    ///
    /// # Errors
    ///
    /// Any error is terminal for the exchange; ephemeral key material is
    /// zeroized before returning.
    pub fn handle(&mut self, packet: &Packet, store: &mut IdentityStore) -> Result<ExchangeStep> {
        let result = self.handle_inner(packet, store);
        self.wipe_on_error(result)
    }

    /// Apply a `Resync` requested by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::UnrecoverableDataLoss`] once the resync budget is
    /// spent, or [`DtmError::UnexpectedState`] before the Auth channel is
    /// complete.
    pub fn on_resync(&mut self, store: &IdentityStore) -> Result<ExchangeStep> {
        let result = self.on_resync_inner(store);
        self.wipe_on_error(result)
    }

    /// Zeroize every piece of ephemeral key material
    pub fn wipe(&mut self) {
        self.auth = AuthStage::default();
        self.primary = PrimaryStage::default();
        self.pending.clear();
        self.sent.clear();
    }

    fn wipe_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::error!("Exchange failed: {}", e);
            self.wipe();
        }
        result
    }

    fn handle_inner(&mut self, packet: &Packet, store: &mut IdentityStore) -> Result<ExchangeStep> {
        let mut step = ExchangeStep::default();
        if packet.packet_type != PacketType::Exchange {
            return Err(DtmError::invalid_state("negotiator only handles exchange packets"));
        }
        if self.is_established() {
            tracing::debug!("Exchange packet {} after establishment ignored", packet.sequence);
            return Ok(step);
        }

        match packet.sequence.cmp(&self.recv_seq) {
            Ordering::Less => {
                tracing::debug!("Duplicate exchange packet {} ignored", packet.sequence);
                return Ok(step);
            }
            Ordering::Greater => {
                let first_gap = self.pending.is_empty();
                self.pending.push(packet.sequence, packet.encode()?);
                step.events.push(ExchangeEvent::Recoverable(DtmError::OutOfSequence {
                    expected: self.recv_seq,
                    actual: packet.sequence,
                }));
                if first_gap {
                    self.request_resend(&mut step)?;
                }
                return Ok(step);
            }
            Ordering::Equal => {}
        }

        self.process(packet, store, &mut step)?;
        while !self.is_established() {
            let Some(bytes) = self.pending.pop(self.recv_seq) else {
                break;
            };
            let buffered = Packet::decode(&bytes)?;
            self.process(&buffered, store, &mut step)?;
        }
        Ok(step)
    }

    fn on_resync_inner(&mut self, store: &IdentityStore) -> Result<ExchangeStep> {
        if !self.progress.auth_complete() {
            return Err(DtmError::UnexpectedState(Cow::Borrowed(
                "resync before auth channel completed",
            )));
        }
        if self.is_established() {
            return Err(DtmError::invalid_state("resync after establishment"));
        }

        let mut step = ExchangeStep::default();
        self.reset_primary()?;
        if self.role == Role::Initiator {
            step.outbound.push(self.open_state(ExchangeState::Sync, store)?);
        }
        Ok(step)
    }

    fn process(
        &mut self,
        packet: &Packet,
        store: &mut IdentityStore,
        step: &mut ExchangeStep,
    ) -> Result<()> {
        let state = ExchangeState::try_from(packet.option_flag)?;
        if !self.expects(state) {
            step.events.push(ExchangeEvent::Recoverable(DtmError::UnexpectedState(
                Cow::Owned(format!("{state:?} not expected after {:?}", self.state())),
            )));
            return self.request_resend(step);
        }
        self.recv_seq += 1;

        let outcome = match self.role {
            Role::Initiator => self.on_answer(state, packet, store, step),
            Role::Responder => self.on_opening(state, packet, store, step),
        };

        match outcome {
            Err(DtmError::ReceivedBadData(reason)) if self.progress.auth_complete() => {
                tracing::warn!("Bad data in {:?} exchange: {}", state, reason);
                step.events
                    .push(ExchangeEvent::Recoverable(DtmError::ReceivedBadData(reason)));
                self.begin_resync(store, step)
            }
            Err(DtmError::ReceivedBadData(reason)) => {
                tracing::error!(
                    "Bad data in {:?} exchange before auth completed: {}",
                    state,
                    reason
                );
                Err(DtmError::UnrecoverableDataLoss(self.resyncs))
            }
            other => other,
        }
    }

    fn expects(&self, state: ExchangeState) -> bool {
        match self.role {
            Role::Initiator => self.awaiting == Some(state),
            Role::Responder => self.progress.accepts(state),
        }
    }

    fn request_resend(&mut self, step: &mut ExchangeStep) -> Result<()> {
        if self.resends >= self.limits.max_resend {
            return Err(DtmError::MaxResendExceeded(self.limits.max_resend));
        }
        self.resends += 1;
        tracing::warn!(
            "Requesting resend of exchange packet {} ({}/{})",
            self.recv_seq,
            self.resends,
            self.limits.max_resend
        );
        step.outbound
            .push(Packet::service(DtmServiceFlag::Resend, self.recv_seq));
        Ok(())
    }

    fn begin_resync(&mut self, store: &IdentityStore, step: &mut ExchangeStep) -> Result<()> {
        self.reset_primary()?;
        step.outbound.push(Packet::service(
            DtmServiceFlag::Resync,
            i64::from(self.resyncs),
        ));
        if self.role == Role::Initiator {
            step.outbound.push(self.open_state(ExchangeState::Sync, store)?);
        }
        Ok(())
    }

    fn reset_primary(&mut self) -> Result<()> {
        if self.resyncs >= self.limits.max_resync {
            return Err(DtmError::UnrecoverableDataLoss(self.resyncs));
        }
        self.resyncs += 1;
        tracing::warn!(
            "Primary channel resync {}/{}",
            self.resyncs,
            self.limits.max_resync
        );

        self.primary = PrimaryStage::default();
        self.agreed = None;
        self.progress.resync();
        self.pending.clear();
        if self.role == Role::Initiator {
            self.awaiting = None;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Initiator
    // ------------------------------------------------------------------

    fn open_state(&mut self, state: ExchangeState, store: &IdentityStore) -> Result<Packet> {
        use ExchangeState::*;

        let packet = match state {
            Negotiate => {
                let offer = self.negotiate_offer().encode();
                self.emit(state, offer)
            }
            Connect => {
                let hello = hello(store).encode();
                self.emit(state, hello)
            }
            Init => {
                let identity = self.public_identity(store).encode();
                self.emit(state, identity)
            }
            PreAuth => {
                let public = self.generate_auth_pair()?;
                self.emit(state, public)
            }
            AuthEx => {
                let ciphertext = self.encapsulate_auth()?;
                self.emit(state, ciphertext)
            }
            Auth => {
                let secret = Zeroizing::new(store.local().secret_id().to_vec());
                self.seal(state, &secret)?
            }
            Sync => {
                self.check_trust(store)?;
                let proposal = self.proposal().encode();
                self.seal(state, &proposal)?
            }
            PrimeEx => {
                let public = self.generate_primary_pair()?;
                self.seal(state, &public)?
            }
            Primary => {
                let ciphertext = self.encapsulate_primary()?;
                self.seal(state, &ciphertext)?
            }
            Established => self.emit(state, Vec::new()),
        };

        self.awaiting = Some(state);
        tracing::debug!("Exchange {:?} opened at sequence {}", state, packet.sequence);
        Ok(packet)
    }

    fn on_answer(
        &mut self,
        state: ExchangeState,
        packet: &Packet,
        store: &mut IdentityStore,
        step: &mut ExchangeStep,
    ) -> Result<()> {
        use ExchangeState::*;

        match state {
            Negotiate => self.check_negotiate(&packet.payload)?,
            Connect => self.check_hello(&packet.payload)?,
            Init => self.bind_identity(&packet.payload, store, step)?,
            PreAuth => self.auth.peer_public = Some(packet.payload.clone()),
            AuthEx => {
                let received = self.decapsulate_auth(&packet.payload)?;
                self.derive_auth(received)?;
            }
            Auth => {
                let secret = self.open(packet)?;
                store.validate_secret(&secret)?;
            }
            Sync => {
                let plaintext = self.open(packet)?;
                let oid = decode_oid(&plaintext)?;
                self.accept_agreement(oid)?;
            }
            PrimeEx => {
                let public = self.open(packet)?;
                self.primary.peer_public = Some(public.to_vec());
            }
            Primary => {
                let ciphertext = self.open(packet)?;
                let received = self.decapsulate_primary(&ciphertext)?;
                self.primary.decapsulated = Some(received);
            }
            Established => {}
        }

        self.progress.complete(state)?;
        self.awaiting = None;

        if state == Established {
            step.established = Some(self.finish()?);
            return Ok(());
        }

        let next = self
            .progress
            .next()
            .ok_or(DtmError::invalid_state("no exchange state after completion"))?;
        let opening = self.open_state(next, store)?;
        step.outbound.push(opening);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Responder
    // ------------------------------------------------------------------

    fn on_opening(
        &mut self,
        state: ExchangeState,
        packet: &Packet,
        store: &mut IdentityStore,
        step: &mut ExchangeStep,
    ) -> Result<()> {
        use ExchangeState::*;

        let answer = match state {
            Negotiate => {
                self.check_negotiate(&packet.payload)?;
                let offer = self.negotiate_offer().encode();
                self.emit(state, offer)
            }
            Connect => {
                self.check_hello(&packet.payload)?;
                let hello = hello(store).encode();
                self.emit(state, hello)
            }
            Init => {
                self.bind_identity(&packet.payload, store, step)?;
                let identity = self.public_identity(store).encode();
                self.emit(state, identity)
            }
            PreAuth => {
                self.auth.peer_public = Some(packet.payload.clone());
                let public = self.generate_auth_pair()?;
                self.emit(state, public)
            }
            AuthEx => {
                let received = self.decapsulate_auth(&packet.payload)?;
                let ciphertext = self.encapsulate_auth()?;
                self.derive_auth(received)?;
                self.emit(state, ciphertext)
            }
            Auth => {
                let secret = self.open(packet)?;
                store.validate_secret(&secret)?;
                let own = Zeroizing::new(store.local().secret_id().to_vec());
                self.seal(state, &own)?
            }
            Sync => {
                let plaintext = self.open(packet)?;
                let proposal = SyncProposal::decode(&plaintext)?;
                self.check_trust(store)?;
                let agreed = self.agree(&proposal)?;
                self.primary.algorithm = Some(agreed);
                self.agreed = Some(agreed);
                self.seal(state, &encode_oid(agreed.oid()))?
            }
            PrimeEx => {
                let public = self.open(packet)?;
                self.primary.peer_public = Some(public.to_vec());
                let own = self.generate_primary_pair()?;
                self.seal(state, &own)?
            }
            Primary => {
                let ciphertext = self.open(packet)?;
                let received = self.decapsulate_primary(&ciphertext)?;
                let answer = self.encapsulate_primary()?;
                self.primary.decapsulated = Some(received);
                self.seal(state, &answer)?
            }
            Established => self.emit(state, Vec::new()),
        };

        self.progress.complete(state)?;
        step.outbound.push(answer);

        if state == Established {
            step.established = Some(self.finish()?);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    fn emit(&mut self, state: ExchangeState, payload: Vec<u8>) -> Packet {
        let packet = Packet::new(PacketType::Exchange, state.value(), self.send_seq, payload);
        self.send_seq += 1;
        match packet.encode() {
            Ok(bytes) => self.sent.push(packet.sequence, bytes),
            Err(e) => tracing::warn!("Exchange packet {} not retained: {}", packet.sequence, e),
        }
        packet
    }

    fn seal(&mut self, state: ExchangeState, plaintext: &[u8]) -> Result<Packet> {
        let cipher = self
            .auth
            .send
            .as_ref()
            .ok_or(DtmError::invalid_state("auth cipher not established"))?;
        let aad = header_aad(PacketType::Exchange, state.value(), self.send_seq);
        let ciphertext = cipher.encrypt(counter(self.send_seq)?, plaintext, &aad)?;
        Ok(self.emit(state, ciphertext))
    }

    fn open(&self, packet: &Packet) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = self
            .auth
            .recv
            .as_ref()
            .ok_or(DtmError::invalid_state("auth cipher not established"))?;
        let plaintext = cipher
            .decrypt(counter(packet.sequence)?, &packet.payload, &packet.aad())
            .map_err(DtmError::bad_data)?;
        Ok(Zeroizing::new(plaintext))
    }

    fn negotiate_offer(&self) -> NegotiateOffer {
        NegotiateOffer {
            auth_oid: self.params.auth_oid(),
            primary_oid: self.params.primary_oid(),
            min_trust: self.params.min_trust,
        }
    }

    fn public_identity(&self, store: &IdentityStore) -> PublicIdentity {
        PublicIdentity {
            public_id: store.local().public_id().to_vec(),
            auth_oid: self.params.auth_oid(),
            primary_oid: self.params.primary_oid(),
            engine: self.params.engine,
            option_flag: 0,
        }
    }

    fn proposal(&self) -> SyncProposal {
        SyncProposal {
            primary_oid: self.params.primary_oid(),
            security_level: self.params.security_level(),
            supported: self.catalog.supported_oids(),
        }
    }

    fn check_negotiate(&mut self, payload: &[u8]) -> Result<()> {
        let offer = NegotiateOffer::decode(payload)?;
        if offer.auth_oid != self.params.auth_oid()
            || self.catalog.lookup_oid(offer.auth_oid).is_none()
        {
            return Err(DtmError::incompatible("auth parameter set not supported"));
        }
        tracing::debug!(
            "Peer minimums: primary oid {:#010x}, trust {:?}",
            offer.primary_oid,
            offer.min_trust
        );
        self.peer_min_trust = offer.min_trust;
        Ok(())
    }

    fn check_hello(&mut self, payload: &[u8]) -> Result<()> {
        let hello = ConnectHello::decode(payload)?;
        if hello.version != PROTOCOL_VERSION {
            return Err(DtmError::IncompatibleParameters(Cow::Owned(format!(
                "protocol version {:#x}, expected {:#x}",
                hello.version, PROTOCOL_VERSION
            ))));
        }
        self.peer_public_id = Some(hello.public_id);
        Ok(())
    }

    fn bind_identity(
        &mut self,
        payload: &[u8],
        store: &mut IdentityStore,
        step: &mut ExchangeStep,
    ) -> Result<()> {
        let identity = PublicIdentity::decode(payload)?;
        if self
            .peer_public_id
            .as_ref()
            .is_some_and(|announced| *announced != identity.public_id)
        {
            return Err(DtmError::IdentityRejected(Cow::Borrowed(
                "public id differs from connect",
            )));
        }
        if identity.auth_oid != self.params.auth_oid() {
            return Err(DtmError::incompatible("auth parameter set mismatch"));
        }
        if identity.engine != self.params.engine {
            return Err(DtmError::incompatible("symmetric engine mismatch"));
        }

        store.bind_remote(identity.clone())?;
        step.events.push(ExchangeEvent::IdentityReceived(identity));
        Ok(())
    }

    fn check_trust(&self, store: &IdentityStore) -> Result<()> {
        let required = self.params.min_trust.max(self.peer_min_trust);
        if store.trust_state() < required {
            return Err(DtmError::IdentityRejected(Cow::Owned(format!(
                "trust {:?} below required {:?}",
                store.trust_state(),
                required
            ))));
        }
        Ok(())
    }

    /// Pick the proposal with the larger security level (larger OID on a
    /// tie) and require that both sides support it.
    fn agree(&self, proposal: &SyncProposal) -> Result<KemAlgorithm> {
        let own = self.params.primary;
        let candidate = if (proposal.security_level, proposal.primary_oid)
            > (own.security_level(), own.oid())
        {
            proposal.primary_oid
        } else {
            own.oid()
        };

        let algorithm = self
            .catalog
            .lookup_oid(candidate)
            .ok_or(DtmError::incompatible("primary parameters not supported locally"))?;
        if !proposal.supported.contains(&candidate) {
            return Err(DtmError::incompatible("primary parameters not supported by peer"));
        }
        if algorithm.security_level() < own.security_level().max(proposal.security_level) {
            return Err(DtmError::incompatible("primary parameters below declared minimum"));
        }

        tracing::debug!("Primary parameters agreed: {}", algorithm);
        Ok(algorithm)
    }

    fn accept_agreement(&mut self, oid: u32) -> Result<()> {
        let algorithm = self
            .catalog
            .lookup_oid(oid)
            .ok_or(DtmError::incompatible("agreed primary parameters not supported"))?;
        if algorithm.security_level() < self.params.security_level() {
            return Err(DtmError::incompatible("agreed primary parameters below minimum"));
        }
        self.primary.algorithm = Some(algorithm);
        self.agreed = Some(algorithm);
        Ok(())
    }

    fn auth_kem(&self) -> Result<Box<dyn KeyExchangeAlgorithm>> {
        Ok(self.provider.key_exchange(self.params.auth)?)
    }

    fn primary_kem(&self) -> Result<Box<dyn KeyExchangeAlgorithm>> {
        let algorithm = self
            .primary
            .algorithm
            .ok_or(DtmError::invalid_state("primary parameters not agreed"))?;
        Ok(self.provider.key_exchange(algorithm)?)
    }

    fn generate_auth_pair(&mut self) -> Result<Vec<u8>> {
        let pair = self.auth_kem()?.generate_keypair()?;
        let public = pair.public.clone();
        self.auth.keypair = Some(pair);
        Ok(public)
    }

    fn encapsulate_auth(&mut self) -> Result<Vec<u8>> {
        let peer = self
            .auth
            .peer_public
            .take()
            .ok_or(DtmError::invalid_state("peer auth key missing"))?;
        let (ciphertext, secret) = self
            .auth_kem()?
            .encapsulate(&peer)
            .map_err(DtmError::bad_data)?;
        self.auth.encapsulated = Some(secret);
        Ok(ciphertext)
    }

    fn decapsulate_auth(&mut self, ciphertext: &[u8]) -> Result<SharedSecret> {
        let pair = self
            .auth
            .keypair
            .take()
            .ok_or(DtmError::invalid_state("auth key pair missing"))?;
        self.auth_kem()?
            .decapsulate(&pair, ciphertext)
            .map_err(DtmError::bad_data)
    }

    fn derive_auth(&mut self, received: SharedSecret) -> Result<()> {
        let sent = self
            .auth
            .encapsulated
            .take()
            .ok_or(DtmError::invalid_state("auth secret missing"))?;
        let engine = self.params.engine;
        self.auth.send = Some(
            self.provider
                .cipher(engine, Kdf::AUTH.derive_material(sent.as_bytes()))?,
        );
        self.auth.recv = Some(
            self.provider
                .cipher(engine, Kdf::AUTH.derive_material(received.as_bytes()))?,
        );
        tracing::debug!("Auth-stage ciphers derived ({:?})", engine);
        Ok(())
    }

    fn generate_primary_pair(&mut self) -> Result<Vec<u8>> {
        let pair = self.primary_kem()?.generate_keypair()?;
        let public = pair.public.clone();
        self.primary.keypair = Some(pair);
        Ok(public)
    }

    fn encapsulate_primary(&mut self) -> Result<Vec<u8>> {
        let peer = self
            .primary
            .peer_public
            .take()
            .ok_or(DtmError::invalid_state("peer primary key missing"))?;
        let (ciphertext, secret) = self
            .primary_kem()?
            .encapsulate(&peer)
            .map_err(DtmError::bad_data)?;
        self.primary.encapsulated = Some(secret);
        Ok(ciphertext)
    }

    fn decapsulate_primary(&mut self, ciphertext: &[u8]) -> Result<SharedSecret> {
        let pair = self
            .primary
            .keypair
            .take()
            .ok_or(DtmError::invalid_state("primary key pair missing"))?;
        self.primary_kem()?
            .decapsulate(&pair, ciphertext)
            .map_err(DtmError::bad_data)
    }

    fn finish(&mut self) -> Result<SessionKeys> {
        let sent = self
            .primary
            .encapsulated
            .take()
            .ok_or(DtmError::invalid_state("primary secret missing"))?;
        let received = self
            .primary
            .decapsulated
            .take()
            .ok_or(DtmError::invalid_state("primary secret missing"))?;

        let keys = SessionKeys {
            forward: Kdf::PRIMARY.derive_material(sent.as_bytes()),
            ret: Kdf::PRIMARY.derive_material(received.as_bytes()),
            engine: self.params.engine,
        };
        self.wipe();

        tracing::info!(
            "Exchange established as {:?} ({} / {})",
            self.role,
            self.params.auth,
            self.agreed.map_or("?", KemAlgorithm::name)
        );
        Ok(keys)
    }
}

fn hello(store: &IdentityStore) -> ConnectHello {
    ConnectHello {
        version: PROTOCOL_VERSION,
        public_id: store.local().public_id().to_vec(),
    }
}

fn counter(sequence: i64) -> Result<u64> {
    u64::try_from(sequence).map_err(|_| DtmError::bad_data("negative sequence"))
}

impl std::fmt::Debug for ExchangeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeNegotiator")
            .field("role", &self.role)
            .field("params", &self.params.name)
            .field("progress", &self.progress)
            .field("send_seq", &self.send_seq)
            .field("recv_seq", &self.recv_seq)
            .field("resends", &self.resends)
            .field("resyncs", &self.resyncs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AllowList, Identity};
    use crate::params::{DEFAULT_PARAMETER_SET, StaticCatalog};
    use dtm_crypto::{CipherEngine, DefaultProvider};
    use std::collections::VecDeque;

    struct Peer {
        negotiator: ExchangeNegotiator,
        store: IdentityStore,
        keys: Option<SessionKeys>,
        events: Vec<ExchangeEvent>,
    }

    fn peer_with(
        role: Role,
        params: ExchangeParameters,
        catalog: StaticCatalog,
        limits: NegotiatorLimits,
        name: &str,
    ) -> Peer {
        Peer {
            negotiator: ExchangeNegotiator::new(
                role,
                params,
                Arc::new(catalog),
                Arc::new(DefaultProvider),
                limits,
            ),
            store: IdentityStore::new(Identity::new(
                name.as_bytes().to_vec(),
                format!("{name}-secret").into_bytes(),
            )),
            keys: None,
            events: Vec::new(),
        }
    }

    fn peer(role: Role, set: &str, limits: NegotiatorLimits) -> Peer {
        let catalog = StaticCatalog::standard();
        let params = catalog.lookup(set).unwrap();
        let name = if role == Role::Initiator { "alice" } else { "bob" };
        peer_with(role, params, catalog, limits, name)
    }

    /// Deliver packets between the two peers until both are quiet.
    /// `tamper` may rewrite any packet in flight. Returns the number of
    /// exchange packets delivered.
    fn pump(
        initiator: &mut Peer,
        responder: &mut Peer,
        tamper: &mut dyn FnMut(bool, &mut Packet),
    ) -> Result<usize> {
        let mut queue: VecDeque<(bool, Packet)> = initiator
            .negotiator
            .start(&initiator.store)?
            .outbound
            .into_iter()
            .map(|p| (true, p))
            .collect();
        let mut delivered = 0;

        while let Some((to_responder, mut packet)) = queue.pop_front() {
            let target = if to_responder {
                &mut *responder
            } else {
                &mut *initiator
            };
            tamper(to_responder, &mut packet);

            let step = match packet.packet_type {
                PacketType::Exchange => {
                    delivered += 1;
                    target.negotiator.handle(&packet, &mut target.store)?
                }
                PacketType::Service => match packet.service_flag()? {
                    DtmServiceFlag::Resync => target.negotiator.on_resync(&target.store)?,
                    DtmServiceFlag::Resend => {
                        let bytes = target.negotiator.retransmit(packet.sequence).unwrap();
                        queue.push_back((!to_responder, Packet::decode(&bytes)?));
                        continue;
                    }
                    other => panic!("unexpected service packet {other:?}"),
                },
                other => panic!("unexpected packet type {other:?}"),
            };

            if let Some(keys) = step.established {
                target.keys = Some(keys);
            }
            target.events.extend(step.events);
            queue.extend(step.outbound.into_iter().map(|p| (!to_responder, p)));
        }
        Ok(delivered)
    }

    fn no_tamper() -> impl FnMut(bool, &mut Packet) {
        |_, _| {}
    }

    fn assert_keys_match(initiator: &Peer, responder: &Peer) {
        let a = initiator.keys.as_ref().unwrap();
        let b = responder.keys.as_ref().unwrap();
        assert_eq!(a.forward.fingerprint(), b.ret.fingerprint());
        assert_eq!(a.ret.fingerprint(), b.forward.fingerprint());
        assert_ne!(a.forward.fingerprint(), a.ret.fingerprint());
        assert_eq!(a.session_id(true), b.session_id(false));
    }

    // ========================================================================
    // Handshake Tests
    // ========================================================================

    #[test]
    fn test_handshake_reaches_established() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, DEFAULT_PARAMETER_SET, limits);
        let mut bob = peer(Role::Responder, DEFAULT_PARAMETER_SET, limits);

        let delivered = pump(&mut alice, &mut bob, &mut no_tamper()).unwrap();

        assert_eq!(delivered, 18);
        assert!(alice.negotiator.is_established());
        assert!(bob.negotiator.is_established());
        assert_keys_match(&alice, &bob);
        assert_eq!(alice.store.trust_state(), TrustState::Full);
        assert_eq!(bob.store.trust_state(), TrustState::Full);
        assert_eq!(bob.store.remote().unwrap().public_id(), b"alice");
        assert_eq!(alice.store.remote().unwrap().secret_id(), b"bob-secret");
        assert_eq!(alice.negotiator.agreed_primary(), Some(KemAlgorithm::MlKem768));
    }

    #[test]
    fn test_handshake_with_negotiate() {
        let limits = NegotiatorLimits {
            negotiate: true,
            ..NegotiatorLimits::default()
        };
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", NegotiatorLimits::default());

        let delivered = pump(&mut alice, &mut bob, &mut no_tamper()).unwrap();

        assert_eq!(delivered, 20);
        assert_keys_match(&alice, &bob);
    }

    #[test]
    fn test_identity_received_on_both_sides() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);
        pump(&mut alice, &mut bob, &mut no_tamper()).unwrap();

        for (peer, expected) in [(&alice, b"bob".as_slice()), (&bob, b"alice".as_slice())] {
            let received: Vec<_> = peer
                .events
                .iter()
                .filter_map(|e| match e {
                    ExchangeEvent::IdentityReceived(identity) => Some(identity.public_id.clone()),
                    ExchangeEvent::Recoverable(_) => None,
                })
                .collect();
            assert_eq!(received, vec![expected.to_vec()]);
        }
    }

    #[test]
    fn test_progress_is_monotonic() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let mut observed = Vec::new();
        let mut queue: VecDeque<(bool, Packet)> = alice
            .negotiator
            .start(&alice.store)
            .unwrap()
            .outbound
            .into_iter()
            .map(|p| (true, p))
            .collect();
        while let Some((to_bob, packet)) = queue.pop_front() {
            let target = if to_bob { &mut bob } else { &mut alice };
            let step = target.negotiator.handle(&packet, &mut target.store).unwrap();
            observed.push((to_bob, target.negotiator.progress()));
            queue.extend(step.outbound.into_iter().map(|p| (!to_bob, p)));
        }

        for side in [true, false] {
            let history: Vec<_> = observed
                .iter()
                .filter(|(s, _)| *s == side)
                .map(|(_, p)| *p)
                .collect();
            for pair in history.windows(2) {
                assert!(pair[0].auth() <= pair[1].auth());
                assert!(pair[0].primary() <= pair[1].primary());
            }
        }
    }

    #[test]
    fn test_sync_picks_stronger_proposal() {
        let catalog = StaticCatalog::standard();
        let weak = ExchangeParameters::new(
            "weak",
            KemAlgorithm::X25519,
            KemAlgorithm::MlKem512,
            CipherEngine::XChaCha20Poly1305,
        );
        let strong = ExchangeParameters::new(
            "strong",
            KemAlgorithm::X25519,
            KemAlgorithm::MlKem1024,
            CipherEngine::XChaCha20Poly1305,
        );
        let limits = NegotiatorLimits::default();
        let mut alice = peer_with(Role::Initiator, weak, catalog.clone(), limits, "alice");
        let mut bob = peer_with(Role::Responder, strong, catalog, limits, "bob");

        pump(&mut alice, &mut bob, &mut no_tamper()).unwrap();

        assert_eq!(alice.negotiator.agreed_primary(), Some(KemAlgorithm::MlKem1024));
        assert_eq!(bob.negotiator.agreed_primary(), Some(KemAlgorithm::MlKem1024));
        assert_keys_match(&alice, &bob);
    }

    // ========================================================================
    // Failure Tests
    // ========================================================================

    #[test]
    fn test_sync_incompatible_parameters() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, DEFAULT_PARAMETER_SET, limits);
        let catalog = StaticCatalog::standard().with_supported(vec![KemAlgorithm::X25519]);
        let params = catalog.lookup("dtm-x25519-xchacha").unwrap();
        let mut bob = peer_with(Role::Responder, params, catalog, limits, "bob");

        let err = pump(&mut alice, &mut bob, &mut no_tamper()).unwrap_err();

        assert!(matches!(err, DtmError::IncompatibleParameters(_)));
        assert!(err.is_terminal());
        assert!(!bob.negotiator.is_established());
    }

    #[test]
    fn test_negotiate_rejects_auth_mismatch() {
        let limits = NegotiatorLimits {
            negotiate: true,
            ..NegotiatorLimits::default()
        };
        let mut alice = peer(Role::Initiator, "dtm-mlkem768-mlkem1024-xchacha", limits);
        let mut bob = peer(Role::Responder, DEFAULT_PARAMETER_SET, limits);

        let err = pump(&mut alice, &mut bob, &mut no_tamper()).unwrap_err();
        assert!(matches!(err, DtmError::IncompatibleParameters(_)));
        assert_eq!(bob.negotiator.state(), None);
    }

    #[test]
    fn test_policy_rejects_identity() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);
        bob.store = IdentityStore::with_policy(
            Identity::new(b"bob".to_vec(), b"bob-secret".to_vec()),
            Arc::new(AllowList::new().allow(b"carol".to_vec())),
        );

        let err = pump(&mut alice, &mut bob, &mut no_tamper()).unwrap_err();
        assert!(matches!(err, DtmError::IdentityRejected(_)));
    }

    #[test]
    fn test_corrupted_prime_ex_resyncs() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, DEFAULT_PARAMETER_SET, limits);
        let mut bob = peer(Role::Responder, DEFAULT_PARAMETER_SET, limits);

        let mut corrupted = false;
        let mut tamper = |to_responder: bool, packet: &mut Packet| {
            if to_responder
                && !corrupted
                && packet.packet_type == PacketType::Exchange
                && packet.option_flag == ExchangeState::PrimeEx.value()
            {
                packet.payload[5] ^= 0x01;
                corrupted = true;
            }
        };
        pump(&mut alice, &mut bob, &mut tamper).unwrap();

        assert!(corrupted);
        assert!(bob.events.iter().any(|e| matches!(
            e,
            ExchangeEvent::Recoverable(DtmError::ReceivedBadData(_))
        )));
        assert_eq!(alice.negotiator.resync_count(), 1);
        assert_eq!(bob.negotiator.resync_count(), 1);
        assert_keys_match(&alice, &bob);
        assert_eq!(bob.store.trust_state(), TrustState::Full);
    }

    #[test]
    fn test_corrupted_answer_resyncs_from_initiator() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let mut corrupted = false;
        let mut tamper = |to_responder: bool, packet: &mut Packet| {
            if !to_responder
                && !corrupted
                && packet.option_flag == ExchangeState::Primary.value()
                && packet.packet_type == PacketType::Exchange
            {
                packet.payload[0] ^= 0xFF;
                corrupted = true;
            }
        };
        pump(&mut alice, &mut bob, &mut tamper).unwrap();

        assert_eq!(alice.negotiator.resync_count(), 1);
        assert_keys_match(&alice, &bob);
    }

    #[test]
    fn test_persistent_corruption_is_unrecoverable() {
        let limits = NegotiatorLimits {
            max_resync: 2,
            ..NegotiatorLimits::default()
        };
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let mut tamper = |to_responder: bool, packet: &mut Packet| {
            if to_responder
                && packet.packet_type == PacketType::Exchange
                && packet.option_flag == ExchangeState::PrimeEx.value()
            {
                packet.payload[0] ^= 0x01;
            }
        };
        let err = pump(&mut alice, &mut bob, &mut tamper).unwrap_err();

        assert!(matches!(err, DtmError::UnrecoverableDataLoss(2)));
        assert!(bob.keys.is_none());
    }

    #[test]
    fn test_auth_stage_corruption_is_critical() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let mut tamper = |to_responder: bool, packet: &mut Packet| {
            if to_responder
                && packet.packet_type == PacketType::Exchange
                && packet.option_flag == ExchangeState::Auth.value()
            {
                packet.payload[0] ^= 0x01;
            }
        };
        let err = pump(&mut alice, &mut bob, &mut tamper).unwrap_err();

        assert!(matches!(err, DtmError::UnrecoverableDataLoss(0)));
        assert_eq!(err.severity(), crate::error::Severity::Critical);
        assert_eq!(bob.negotiator.resync_count(), 0);
    }

    // ========================================================================
    // Sequencing Tests
    // ========================================================================

    #[test]
    fn test_gap_is_buffered_and_filled() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let connect = alice.negotiator.start(&alice.store).unwrap().outbound.remove(0);
        let connect_answer = bob
            .negotiator
            .handle(&connect, &mut bob.store)
            .unwrap()
            .outbound
            .remove(0);
        let init = alice
            .negotiator
            .handle(&connect_answer, &mut alice.store)
            .unwrap()
            .outbound
            .remove(0);
        assert_eq!(init.sequence, 1);

        // A fresh responder sees Init before Connect
        let mut carol = peer(Role::Responder, "dtm-x25519-xchacha", limits);
        let step = carol.negotiator.handle(&init, &mut carol.store).unwrap();
        assert_eq!(step.outbound.len(), 1);
        assert_eq!(step.outbound[0].service_flag().unwrap(), DtmServiceFlag::Resend);
        assert_eq!(step.outbound[0].sequence, 0);
        assert!(matches!(
            step.events[0],
            ExchangeEvent::Recoverable(DtmError::OutOfSequence { expected: 0, actual: 1 })
        ));

        let step = carol.negotiator.handle(&connect, &mut carol.store).unwrap();
        let states: Vec<_> = step.outbound.iter().map(|p| p.option_flag).collect();
        assert_eq!(
            states,
            vec![ExchangeState::Connect.value(), ExchangeState::Init.value()]
        );
        assert!(step.identity_received().is_some());
        assert_eq!(carol.negotiator.state(), Some(ExchangeState::Init));
    }

    #[test]
    fn test_duplicate_ignored() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);

        let connect = alice.negotiator.start(&alice.store).unwrap().outbound.remove(0);
        bob.negotiator.handle(&connect, &mut bob.store).unwrap();
        let step = bob.negotiator.handle(&connect, &mut bob.store).unwrap();
        assert!(step.outbound.is_empty());
        assert_eq!(bob.negotiator.state(), Some(ExchangeState::Connect));
    }

    #[test]
    fn test_wrong_state_exhausts_resends() {
        let limits = NegotiatorLimits {
            max_resend: 2,
            ..NegotiatorLimits::default()
        };
        let mut bob = peer(Role::Responder, "dtm-x25519-xchacha", limits);
        let bogus = Packet::new(PacketType::Exchange, ExchangeState::Auth.value(), 0, vec![0; 8]);

        for _ in 0..2 {
            let step = bob.negotiator.handle(&bogus, &mut bob.store).unwrap();
            assert_eq!(step.outbound[0].service_flag().unwrap(), DtmServiceFlag::Resend);
        }
        assert!(matches!(
            bob.negotiator.handle(&bogus, &mut bob.store),
            Err(DtmError::MaxResendExceeded(2))
        ));
    }

    #[test]
    fn test_retransmit_returns_sent_bytes() {
        let limits = NegotiatorLimits::default();
        let mut alice = peer(Role::Initiator, "dtm-x25519-xchacha", limits);
        let connect = alice.negotiator.start(&alice.store).unwrap().outbound.remove(0);

        let bytes = alice.negotiator.retransmit(0).unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), connect);
        assert!(alice.negotiator.retransmit(1).is_none());
    }

    #[test]
    fn test_responder_cannot_start() {
        let bob = peer(Role::Responder, "dtm-x25519-xchacha", NegotiatorLimits::default());
        let mut negotiator = bob.negotiator;
        assert!(matches!(
            negotiator.start(&bob.store),
            Err(DtmError::InvalidState(_))
        ));
    }
}
