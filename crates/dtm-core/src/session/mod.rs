//! Async DTM session.
//!
//! A [`DtmSession`] owns a transport, runs the exchange to completion and
//! then multiplexes messages, file transfers, forward-secrecy rekeying and
//! control traffic over the established channels.
//!
//! ## Tasks
//!
//! - One receive task per session decodes the stream and routes packets by
//!   type. It alone owns the return channel.
//! - Callers issue [`DtmSession::send`], [`DtmSession::send_file`] and
//!   [`DtmSession::forward_key_request`]. The forward channel sits behind an
//!   async mutex held across seal and transport send, so packets leave in
//!   sequence order.
//! - An optional keep-alive task sends `KeepAlive` while established.
//!
//! ## Example
//!
//! ```no_run
//! use dtm_core::identity::Identity;
//! use dtm_core::session::DtmSession;
//! use dtm_core::transport::TcpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> dtm_core::error::Result<()> {
//! let identity = Identity::new(b"alice".to_vec(), b"alice-secret".to_vec());
//! let session = DtmSession::builder(identity, Arc::new(TcpTransport::new())).build()?;
//! session.connect("127.0.0.1:4000").await?;
//! session.send(b"hello").await?;
//! session.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod transfer;

pub use events::{
    ErrorKind, FileReceived, FileRequest, IdentityReceived, KeyRequested, KeySynchronized,
    NoopHandler, QueueHandler, SessionError, SessionEstablished, SessionEvent, SessionHandler,
};
pub use transfer::TransferOutcome;

use crate::channel::{Direction, SessionChannel};
use crate::config::DtmConfig;
use crate::error::{DtmError, DtmErrorFlag, PacketError, Result, Severity};
use crate::exchange::{
    ExchangeEvent, ExchangeNegotiator, ExchangeState, ExchangeStep, NegotiatorLimits, Role,
};
use crate::flags::{DtmServiceFlag, MessageFlag, TransferFlag};
use crate::identity::{Identity, IdentityStore, PublicIdentity, TrustPolicy, TrustState};
use crate::packet::{Packet, PacketDecoder, PacketType};
use crate::packet_buffer::PacketBuffer;
use crate::params::{ExchangeParameters, ParameterCatalog, StaticCatalog};
use crate::transport::Transport;
use crate::wire::{WireReader, WireWriter};
use dashmap::DashMap;
use dtm_crypto::{CryptoProvider, DefaultProvider, KeyMaterial, SessionKeys, TAG_SIZE};
use std::borrow::Cow;
use std::cmp::Ordering as SeqOrdering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use transfer::{
    FileSource, IncomingTransfer, TransferChunk, TransferNotice, TransferOffer, TransferReply,
    default_destination,
};
use zeroize::Zeroizing;

/// Life cycle of a session
#[derive(Debug, Clone)]
pub enum SessionStatus {
    /// Created, not yet connected
    Idle,
    /// Exchange in progress
    Connecting,
    /// Both channels established
    Established,
    /// Torn down, with the error that caused it if any
    Closed(Option<DtmError>),
}

/// Forward-secrecy key offer carried by `KeyRequest`
struct KeyOffer {
    material: KeyMaterial,
    lifespan_secs: u64,
    reciprocal: bool,
}

impl KeyOffer {
    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let material = self.material.to_bytes();
        Zeroizing::new(
            WireWriter::new()
                .bytes(&material)
                .u64(self.lifespan_secs)
                .u8(u8::from(self.reciprocal))
                .finish(),
        )
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let material = reader.bytes("material").map_err(DtmError::bad_data)?;
        let lifespan_secs = reader.u64("lifespan").map_err(DtmError::bad_data)?;
        let reciprocal = reader.u8("reciprocal").map_err(DtmError::bad_data)? != 0;
        reader.finish().map_err(DtmError::bad_data)?;
        Ok(Self {
            material: KeyMaterial::from_slice(material).map_err(DtmError::bad_data)?,
            lifespan_secs,
            reciprocal,
        })
    }
}

/// Our outstanding key offer. `material` is taken when the forward channel
/// switches; the offer stays pending until the peer acknowledges the switch.
struct PendingRekey {
    material: Option<KeyMaterial>,
    reply: oneshot::Sender<bool>,
}

/// A key offer we accepted, applied on `KeySynchronized`
struct AcceptedKey {
    material: KeyMaterial,
    reciprocal: bool,
    /// Opens nothing; identifies packets already sealed under the new key
    next: SessionChannel,
    /// New-key packets that overtook a lost `KeySynchronized`
    early: PacketBuffer,
}

struct ExchangeContext {
    store: IdentityStore,
    negotiator: Option<ExchangeNegotiator>,
}

/// State owned by the receive task
struct ReceiveState {
    decoder: PacketDecoder,
    ret: Option<SessionChannel>,
    pending: PacketBuffer,
    incoming: HashMap<u64, IncomingTransfer>,
    accepted_key: Option<AcceptedKey>,
    /// Sequence we asked the peer to resend, until it arrives
    resend_for: Option<i64>,
    resends: u32,
    data_loss: u32,
}

impl ReceiveState {
    fn new(config: &DtmConfig) -> Self {
        Self {
            decoder: PacketDecoder::new(config.max_payload),
            ret: None,
            pending: PacketBuffer::new(config.buffer_depth),
            incoming: HashMap::new(),
            accepted_key: None,
            resend_for: None,
            resends: 0,
            data_loss: 0,
        }
    }

    fn ret(&mut self) -> Result<&mut SessionChannel> {
        self.ret
            .as_mut()
            .ok_or(DtmError::invalid_state("sealed packet before establishment"))
    }

    /// Hold `packet` for after the pending rekey if it is already sealed
    /// under the accepted key.
    fn stash_for_next_key(&mut self, packet: &Packet) -> Result<bool> {
        let Some(accepted) = self.accepted_key.as_ref() else {
            return Ok(false);
        };
        if !accepted.next.authenticates(packet) {
            return Ok(false);
        }
        tracing::debug!("Packet {} sealed under the pending key; holding it", packet.sequence);
        accepted.early.push(packet.sequence, packet.encode()?);
        Ok(true)
    }

    /// Clear resend bookkeeping once the awaited sequence has been opened
    fn recovered(&mut self, opened: i64) {
        if self.resend_for.is_some_and(|seq| seq <= opened) {
            tracing::debug!("Resent packet {} recovered", opened);
            self.resend_for = None;
            self.resends = 0;
            self.data_loss = 0;
        }
    }
}

pub(crate) struct SessionInner {
    config: DtmConfig,
    params: ExchangeParameters,
    catalog: Arc<dyn ParameterCatalog>,
    provider: Arc<dyn CryptoProvider>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn SessionHandler>,
    exchange: Mutex<ExchangeContext>,
    forward: Mutex<Option<SessionChannel>>,
    return_fingerprint: Mutex<Option<[u8; 32]>>,
    sent: PacketBuffer,
    /// Packets sealed under the previous forward key, kept until the peer
    /// acknowledges the switch
    retired: PacketBuffer,
    status: watch::Sender<SessionStatus>,
    transfers: DashMap<u64, oneshot::Sender<TransferReply>>,
    echoes: DashMap<i64, oneshot::Sender<Instant>>,
    rekey: Mutex<Option<PendingRekey>>,
    next_transfer: AtomicU64,
    next_echo: AtomicI64,
    receiver: Mutex<Option<JoinHandle<()>>>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`DtmSession`]
pub struct DtmSessionBuilder {
    identity: Identity,
    transport: Arc<dyn Transport>,
    config: DtmConfig,
    handler: Arc<dyn SessionHandler>,
    catalog: Arc<dyn ParameterCatalog>,
    provider: Arc<dyn CryptoProvider>,
    policy: Option<Arc<dyn TrustPolicy>>,
}

impl DtmSessionBuilder {
    /// Use `config` instead of the defaults
    #[must_use]
    pub fn config(mut self, config: DtmConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver events to `handler`
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Look parameter sets up in `catalog`
    #[must_use]
    pub fn catalog(mut self, catalog: Arc<dyn ParameterCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Obtain primitives from `provider`
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Judge the peer with `policy`
    #[must_use]
    pub fn trust_policy(mut self, policy: Arc<dyn TrustPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the configuration and create the session.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidConfig`] for an invalid configuration and
    /// [`DtmError::UnknownParameterSet`] if the configured set is not in the
    /// catalog.
    pub fn build(self) -> Result<DtmSession> {
        self.config.validate()?;
        let params = self.catalog.lookup(&self.config.parameter_set)?;
        let store = match self.policy {
            Some(policy) => IdentityStore::with_policy(self.identity, policy),
            None => IdentityStore::new(self.identity),
        };
        let (status, _) = watch::channel(SessionStatus::Idle);

        Ok(DtmSession {
            inner: Arc::new(SessionInner {
                sent: PacketBuffer::new(self.config.buffer_depth),
                retired: PacketBuffer::new(self.config.buffer_depth),
                config: self.config,
                params,
                catalog: self.catalog,
                provider: self.provider,
                transport: self.transport,
                handler: self.handler,
                exchange: Mutex::new(ExchangeContext {
                    store,
                    negotiator: None,
                }),
                forward: Mutex::new(None),
                return_fingerprint: Mutex::new(None),
                status,
                transfers: DashMap::new(),
                echoes: DashMap::new(),
                rekey: Mutex::new(None),
                next_transfer: AtomicU64::new(1),
                next_echo: AtomicI64::new(1),
                receiver: Mutex::new(None),
                keep_alive: Mutex::new(None),
            }),
        })
    }
}

/// DTM session handle. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct DtmSession {
    pub(crate) inner: Arc<SessionInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Public API
// ═══════════════════════════════════════════════════════════════════════════

impl DtmSession {
    /// Start building a session for `identity` over `transport`
    #[must_use]
    pub fn builder(identity: Identity, transport: Arc<dyn Transport>) -> DtmSessionBuilder {
        DtmSessionBuilder {
            identity,
            transport,
            config: DtmConfig::default(),
            handler: Arc::new(NoopHandler),
            catalog: Arc::new(StaticCatalog::standard()),
            provider: Arc::new(DefaultProvider),
            policy: None,
        }
    }

    /// Connect to `address` as initiator and run the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::ConnectionTimedOut`] if the transport connect or
    /// the exchange exceeds `connect_timeout`, or the error that ended the
    /// exchange.
    pub async fn connect(&self, address: &str) -> Result<()> {
        self.begin()?;
        tracing::info!("Connecting to {}", address);

        let timeout = self.inner.config.connect_timeout();
        if let Err(e) = self.inner.transport.connect(address, timeout).await {
            let err = DtmError::from(e);
            self.shutdown(Some(err.clone())).await;
            return Err(err);
        }
        self.establish(Role::Initiator).await
    }

    /// Run the exchange as responder over an already connected transport.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::ConnectionTimedOut`] if the exchange exceeds
    /// `connect_timeout`, or the error that ended the exchange.
    pub async fn accept(&self) -> Result<()> {
        self.begin()?;
        if !self.inner.transport.is_connected() {
            let err = DtmError::ConnectionDropped(Cow::Borrowed("transport not connected"));
            self.shutdown(Some(err.clone())).await;
            return Err(err);
        }
        self.establish(Role::Responder).await
    }

    /// Send application data.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidState`] before establishment and
    /// transport errors otherwise.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_sealed(PacketType::Message, MessageFlag::Transmission.value(), data)
            .await
            .map(|_| ())
    }

    /// Offer the file at `path` and stream it if the peer accepts.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::TransferFailed`] if the file cannot be read and
    /// [`DtmError::ConnectionDropped`] if the session closes mid-transfer.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<TransferOutcome> {
        self.ensure_established()?;
        let mut source = FileSource::open(path.as_ref()).await?;
        let transfer_id = self.inner.next_transfer.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Offering transfer {} ({} bytes)",
            transfer_id,
            source.size()
        );

        let offer = source.offer(transfer_id).encode();
        let reply = self
            .request_reply(transfer_id, TransferFlag::Request, &offer)
            .await?;
        match reply {
            TransferReply::Accepted => {}
            TransferReply::Refused => {
                tracing::info!("Transfer {} refused by peer", transfer_id);
                return Ok(TransferOutcome::Refused);
            }
            TransferReply::Failed(reason) => return Ok(TransferOutcome::Failed(reason)),
            TransferReply::Received => {
                return Err(DtmError::TransferFailed("received before any data".into()));
            }
        }

        let (tx, mut done) = oneshot::channel();
        self.inner.transfers.insert(transfer_id, tx);
        let chunk_size = self.inner.config.file_chunk_size;
        loop {
            if let Ok(reply) = done.try_recv() {
                return Ok(outcome(transfer_id, source.sent(), reply));
            }
            let chunk = match source.next_chunk(transfer_id, chunk_size).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    self.inner.transfers.remove(&transfer_id);
                    return Err(e);
                }
            };
            if let Err(e) = self
                .send_sealed(PacketType::Transfer, TransferFlag::DataChunk.value(), &chunk.encode())
                .await
            {
                self.inner.transfers.remove(&transfer_id);
                return Err(e);
            }
        }

        let sent = TransferNotice::with_detail(transfer_id, source.digest().to_vec());
        if let Err(e) = self
            .send_sealed(PacketType::Transfer, TransferFlag::Sent.value(), &sent.encode())
            .await
        {
            self.inner.transfers.remove(&transfer_id);
            return Err(e);
        }
        let reply = done.await.map_err(|_| closed_during("transfer"))?;
        Ok(outcome(transfer_id, source.sent(), reply))
    }

    /// Offer fresh key material for our forward channel.
    ///
    /// Resolves to `true` once the peer acknowledged the new key and `false`
    /// if it refused. With `reciprocal`, the peer renews its own forward key
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidState`] before establishment or while
    /// another offer is outstanding.
    pub async fn forward_key_request(&self, reciprocal: bool) -> Result<bool> {
        self.ensure_established()?;
        let offer = KeyOffer {
            material: KeyMaterial::generate()?,
            lifespan_secs: self.inner.config.key_lifespan_secs,
            reciprocal,
        };
        let payload = offer.encode();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.rekey.lock().await;
            if pending.is_some() {
                return Err(DtmError::invalid_state("key request already outstanding"));
            }
            *pending = Some(PendingRekey {
                material: Some(offer.material),
                reply: tx,
            });
        }

        tracing::debug!("Offering new forward key (reciprocal: {})", reciprocal);
        if let Err(e) = self
            .send_sealed(PacketType::Message, MessageFlag::KeyRequest.value(), &payload)
            .await
        {
            self.inner.rekey.lock().await.take();
            return Err(e);
        }
        rx.await.map_err(|_| closed_during("rekey"))
    }

    /// Send a `KeepAlive` packet.
    ///
    /// # Errors
    ///
    /// Returns transport errors.
    pub async fn keep_alive(&self) -> Result<()> {
        self.send_packet(&Packet::service(DtmServiceFlag::KeepAlive, 0))
            .await
    }

    /// Measure a round trip with `Echo` / `EchoReply`.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::ConnectionTimedOut`] if no reply arrives within
    /// `connect_timeout`.
    pub async fn echo(&self) -> Result<Duration> {
        self.ensure_established()?;
        let token = self.inner.next_echo.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.echoes.insert(token, tx);

        let started = Instant::now();
        if let Err(e) = self
            .send_packet(&Packet::service(DtmServiceFlag::Echo, token))
            .await
        {
            self.inner.echoes.remove(&token);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.config.connect_timeout(), rx).await {
            Err(_) => {
                self.inner.echoes.remove(&token);
                Err(DtmError::ConnectionTimedOut)
            }
            Ok(Err(_)) => Err(closed_during("echo")),
            Ok(Ok(replied)) => Ok(replied.duration_since(started)),
        }
    }

    /// Close the session. A `Terminate` is attempted first; failing to
    /// deliver it is not an error.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub async fn disconnect(&self) -> Result<()> {
        self.terminate(None).await;
        if let Some(handle) = self.inner.receiver.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    /// Current life-cycle status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Check if both channels are established
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(*self.inner.status.borrow(), SessionStatus::Established)
    }

    /// Check if the session has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(*self.inner.status.borrow(), SessionStatus::Closed(_))
    }

    /// Most advanced completed exchange state
    pub async fn state(&self) -> Option<ExchangeState> {
        self.inner
            .exchange
            .lock()
            .await
            .negotiator
            .as_ref()
            .and_then(ExchangeNegotiator::state)
    }

    /// Identity the peer disclosed
    pub async fn remote_identity(&self) -> Option<PublicIdentity> {
        self.inner.exchange.lock().await.store.remote_public().cloned()
    }

    /// Trust established in the peer
    pub async fn trust_state(&self) -> TrustState {
        self.inner.exchange.lock().await.store.trust_state()
    }

    /// Fingerprint of the forward channel key
    pub async fn forward_fingerprint(&self) -> Option<[u8; 32]> {
        self.inner
            .forward
            .lock()
            .await
            .as_ref()
            .map(SessionChannel::fingerprint)
    }

    /// Fingerprint of the return channel key
    pub async fn return_fingerprint(&self) -> Option<[u8; 32]> {
        *self.inner.return_fingerprint.lock().await
    }

    /// Exchange parameters this session started with
    #[must_use]
    pub fn params(&self) -> &ExchangeParameters {
        &self.inner.params
    }

    /// Parameter catalog in use
    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn ParameterCatalog> {
        &self.inner.catalog
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &DtmConfig {
        &self.inner.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Establishment and teardown
// ═══════════════════════════════════════════════════════════════════════════

impl DtmSession {
    fn begin(&self) -> Result<()> {
        let started = self.inner.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Idle) {
                *status = SessionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if started {
            Ok(())
        } else {
            Err(DtmError::invalid_state("session already started"))
        }
    }

    fn ensure_established(&self) -> Result<()> {
        if self.is_established() {
            Ok(())
        } else {
            Err(DtmError::invalid_state("session not established"))
        }
    }

    async fn establish(&self, role: Role) -> Result<()> {
        let mut status = self.inner.status.subscribe();
        {
            let mut exchange = self.inner.exchange.lock().await;
            exchange.negotiator = Some(ExchangeNegotiator::new(
                role,
                self.inner.params.clone(),
                Arc::clone(&self.inner.catalog),
                Arc::clone(&self.inner.provider),
                NegotiatorLimits::from(&self.inner.config),
            ));
        }

        let session = self.clone();
        let handle = tokio::spawn(async move { session.receive_loop().await });
        *self.inner.receiver.lock().await = Some(handle);

        if role == Role::Initiator {
            let opening = {
                let mut guard = self.inner.exchange.lock().await;
                let ExchangeContext { store, negotiator } = &mut *guard;
                match negotiator.as_mut() {
                    Some(negotiator) => negotiator.start(store),
                    None => Err(DtmError::invalid_state("exchange not initialized")),
                }
            };
            let sent = match opening {
                Ok(step) => self.send_all(&step.outbound).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                self.fail(e.clone()).await;
                return Err(e);
            }
        }

        let waited = tokio::time::timeout(
            self.inner.config.connect_timeout(),
            status.wait_for(|s| !matches!(s, SessionStatus::Connecting)),
        )
        .await
        .map(|r| r.map(|s| s.clone()));

        match waited {
            Err(_) => {
                tracing::warn!(
                    "Exchange did not complete within {:?}",
                    self.inner.config.connect_timeout()
                );
                self.terminate(Some(DtmError::ConnectionTimedOut)).await;
                Err(DtmError::ConnectionTimedOut)
            }
            Ok(Err(_)) => Err(closed_during("exchange")),
            Ok(Ok(SessionStatus::Established)) => Ok(()),
            Ok(Ok(SessionStatus::Closed(Some(err)))) => Err(err),
            Ok(Ok(_)) => Err(closed_during("exchange")),
        }
    }

    async fn on_established(&self, rx: &mut ReceiveState, keys: SessionKeys) -> Result<()> {
        let (role, primary) = {
            let exchange = self.inner.exchange.lock().await;
            let negotiator = exchange
                .negotiator
                .as_ref()
                .ok_or(DtmError::invalid_state("exchange not initialized"))?;
            (negotiator.role(), negotiator.agreed_primary())
        };
        let session_id = keys.session_id(role == Role::Initiator);

        let SessionKeys {
            forward,
            ret,
            engine,
        } = keys;
        let forward =
            SessionChannel::new(self.inner.provider.cipher(engine, forward)?, Direction::Send);
        let ret =
            SessionChannel::new(self.inner.provider.cipher(engine, ret)?, Direction::Receive);

        *self.inner.return_fingerprint.lock().await = Some(ret.fingerprint());
        *self.inner.forward.lock().await = Some(forward);
        rx.ret = Some(ret);

        let established = self.inner.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Connecting) {
                *status = SessionStatus::Established;
                true
            } else {
                false
            }
        });
        if !established {
            return Err(DtmError::invalid_state("established after teardown"));
        }

        tracing::info!(
            "Session {} established as {:?}",
            hex::encode(session_id),
            role
        );
        self.inner.handler.on_session_established(&SessionEstablished {
            session_id,
            role,
            primary,
        });
        self.spawn_keep_alive().await;
        Ok(())
    }

    async fn spawn_keep_alive(&self) {
        let Some(interval) = self.inner.config.keep_alive_interval() else {
            return;
        };
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !session.is_established() {
                    break;
                }
                if let Err(e) = session.keep_alive().await {
                    tracing::warn!("Keep-alive failed: {}", e);
                    break;
                }
            }
        });
        if let Some(old) = self.inner.keep_alive.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Tear down after a terminal error. Unless the connection itself is
    /// gone, the peer gets a `Refusal` carrying the error code, then
    /// `Terminate`.
    async fn fail(&self, err: DtmError) {
        if err.severity() == Severity::Connection {
            self.shutdown(Some(err)).await;
            return;
        }
        if !self.is_closed() {
            let refusal = Packet::service(DtmServiceFlag::Refusal, err.flag().code());
            if let Err(e) = self.send_packet(&refusal).await {
                tracing::debug!("Refusal not delivered: {}", e);
            }
        }
        self.terminate(Some(err)).await;
    }

    /// Tear down cleanly, announcing it with `Terminate`
    async fn terminate(&self, reason: Option<DtmError>) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self
            .send_packet(&Packet::service(DtmServiceFlag::Terminate, 0))
            .await
        {
            tracing::debug!("Terminate not delivered: {}", e);
        }
        self.shutdown(reason).await;
    }

    /// Zeroize every key, fail every waiter and close the transport.
    async fn shutdown(&self, reason: Option<DtmError>) {
        let first = self.inner.status.send_if_modified(|status| {
            if matches!(status, SessionStatus::Closed(_)) {
                false
            } else {
                *status = SessionStatus::Closed(reason.clone());
                true
            }
        });
        if !first {
            return;
        }

        match &reason {
            Some(e) if e.severity() == Severity::Critical => {
                tracing::error!("Session closed: {}", e);
            }
            Some(e) => tracing::warn!("Session closed: {}", e),
            None => tracing::info!("Session closed"),
        }

        self.inner.forward.lock().await.take();
        self.inner.return_fingerprint.lock().await.take();
        if let Some(negotiator) = self.inner.exchange.lock().await.negotiator.as_mut() {
            negotiator.wipe();
        }
        self.inner.rekey.lock().await.take();
        self.inner.sent.clear();
        self.inner.retired.clear();
        self.inner.transfers.clear();
        self.inner.echoes.clear();

        if let Some(handle) = self.inner.keep_alive.lock().await.take() {
            handle.abort();
        }
        if let Err(e) = self.inner.transport.disconnect().await {
            tracing::debug!("Transport disconnect failed: {}", e);
        }
    }

    /// Surface an error and tear down when it is terminal or the handler
    /// cancels.
    async fn report(&self, err: DtmError) {
        let event = self.raise_error(ErrorKind::Error(err.flag()), err.severity(), err.to_string());
        if err.is_terminal() {
            self.fail(err).await;
        } else if event.cancel {
            self.terminate(Some(err)).await;
        } else {
            tracing::warn!("Recovered from: {}", err);
        }
    }

    fn raise_error(&self, kind: ErrorKind, severity: Severity, message: String) -> SessionError {
        let mut event = SessionError {
            kind,
            severity,
            message,
            cancel: false,
        };
        self.inner.handler.on_session_error(&mut event);
        event
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Sending
// ═══════════════════════════════════════════════════════════════════════════

impl DtmSession {
    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        let sent = self.inner.transport.send(bytes);
        match tokio::time::timeout(self.inner.config.send_timeout(), sent).await {
            Err(_) => Err(DtmError::SendTimeoutExceeded),
            Ok(result) => Ok(result?),
        }
    }

    /// Send an unsealed Service or Exchange packet
    async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.transmit(&packet.encode()?).await?;
        self.inner.handler.on_packet_sent(packet);
        Ok(())
    }

    async fn send_all(&self, packets: &[Packet]) -> Result<()> {
        for packet in packets {
            self.send_packet(packet).await?;
        }
        Ok(())
    }

    /// Seal on the forward channel and send, returning the sequence used
    async fn send_sealed(
        &self,
        packet_type: PacketType,
        option_flag: i64,
        plaintext: &[u8],
    ) -> Result<i64> {
        let sealed_len = plaintext.len() + TAG_SIZE;
        if sealed_len > self.inner.config.max_payload {
            return Err(PacketError::PayloadTooLarge {
                declared: sealed_len,
                max: self.inner.config.max_payload,
            }
            .into());
        }

        let mut guard = self.inner.forward.lock().await;
        let channel = guard
            .as_mut()
            .ok_or(DtmError::invalid_state("session not established"))?;
        let packet = channel.seal(packet_type, option_flag, plaintext)?;
        self.transmit_sealed(&packet).await?;
        Ok(packet.sequence)
    }

    /// Send an already sealed packet, retaining it for `Resend`
    async fn transmit_sealed(&self, packet: &Packet) -> Result<()> {
        let bytes = packet.encode()?;
        self.transmit(&bytes).await?;
        self.inner.sent.push(packet.sequence, bytes);
        self.inner.handler.on_packet_sent(packet);
        Ok(())
    }

    async fn send_notice(&self, flag: TransferFlag, notice: &TransferNotice) -> Result<()> {
        self.send_sealed(PacketType::Transfer, flag.value(), &notice.encode())
            .await
            .map(|_| ())
    }

    async fn request_reply(
        &self,
        transfer_id: u64,
        flag: TransferFlag,
        payload: &[u8],
    ) -> Result<TransferReply> {
        let (tx, rx) = oneshot::channel();
        self.inner.transfers.insert(transfer_id, tx);
        if let Err(e) = self
            .send_sealed(PacketType::Transfer, flag.value(), payload)
            .await
        {
            self.inner.transfers.remove(&transfer_id);
            return Err(e);
        }
        rx.await.map_err(|_| closed_during("transfer"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Receiving
// ═══════════════════════════════════════════════════════════════════════════

impl DtmSession {
    async fn receive_loop(self) {
        let mut rx = ReceiveState::new(&self.inner.config);
        let mut status = self.inner.status.subscribe();

        'stream: while !self.is_closed() {
            // Stop on local teardown too, so the return channel is dropped
            let received = tokio::select! {
                received = self.inner.transport.recv() => received,
                () = closed(&mut status) => break,
            };
            let chunk = match received {
                Ok(chunk) => chunk,
                Err(e) => {
                    if !self.is_closed() {
                        self.report(DtmError::from(e)).await;
                    }
                    break;
                }
            };
            rx.decoder.extend(&chunk);

            loop {
                let packet = match rx.decoder.next_packet() {
                    Ok(Some(packet)) => packet,
                    Ok(None) => break,
                    Err(e) => {
                        self.report(DtmError::MalformedPacket(e)).await;
                        break 'stream;
                    }
                };
                self.inner.handler.on_packet_received(&packet);
                self.dispatch(&mut rx, packet).await;
                if self.is_closed() {
                    break 'stream;
                }
            }
        }

        for (_, incoming) in rx.incoming.drain() {
            incoming.discard().await;
        }
        tracing::debug!("Receive task finished");
    }

    async fn dispatch(&self, rx: &mut ReceiveState, packet: Packet) {
        match packet.packet_type {
            PacketType::Exchange => {
                let step = {
                    let mut guard = self.inner.exchange.lock().await;
                    let ExchangeContext { store, negotiator } = &mut *guard;
                    match negotiator.as_mut() {
                        Some(negotiator) => negotiator.handle(&packet, store),
                        None => Err(DtmError::invalid_state("exchange not initialized")),
                    }
                };
                self.run_exchange(rx, step).await;
            }
            PacketType::Service => {
                if let Err(e) = self.on_service(rx, &packet).await {
                    self.report(e).await;
                }
            }
            PacketType::Message | PacketType::Transfer => {
                if let Err(e) = self.on_sealed(rx, packet).await {
                    self.report(e).await;
                }
            }
        }
    }

    /// Apply a negotiator step. Every exchange error is terminal.
    async fn run_exchange(&self, rx: &mut ReceiveState, step: Result<ExchangeStep>) {
        let applied = match step {
            Ok(step) => self.apply_step(rx, step).await,
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            self.raise_error(ErrorKind::Error(e.flag()), e.severity(), e.to_string());
            self.fail(e).await;
        }
    }

    async fn apply_step(&self, rx: &mut ReceiveState, step: ExchangeStep) -> Result<()> {
        let ExchangeStep {
            outbound,
            events,
            established,
        } = step;

        for event in events {
            match event {
                ExchangeEvent::IdentityReceived(identity) => {
                    tracing::debug!("Peer identity {}", hex::encode(&identity.public_id));
                    let mut event = IdentityReceived {
                        identity,
                        cancel: false,
                    };
                    self.inner.handler.on_identity_received(&mut event);
                    if event.cancel {
                        return Err(DtmError::IdentityRejected(Cow::Borrowed(
                            "refused by application",
                        )));
                    }
                }
                ExchangeEvent::Recoverable(err) => self.report(err).await,
            }
            if self.is_closed() {
                return Ok(());
            }
        }

        self.send_all(&outbound).await?;
        if let Some(keys) = established {
            self.on_established(rx, keys).await?;
        }
        Ok(())
    }

    async fn on_service(&self, rx: &mut ReceiveState, packet: &Packet) -> Result<()> {
        let flag = packet.service_flag()?;
        let argument = packet.sequence;

        match flag {
            DtmServiceFlag::KeepAlive => tracing::trace!("Keep-alive received"),
            DtmServiceFlag::Echo => {
                self.send_packet(&Packet::service(DtmServiceFlag::EchoReply, argument))
                    .await?;
            }
            DtmServiceFlag::EchoReply => {
                if let Some((_, reply)) = self.inner.echoes.remove(&argument) {
                    let _ = reply.send(Instant::now());
                }
            }
            DtmServiceFlag::Resend => self.on_resend(argument).await?,
            DtmServiceFlag::Resync => {
                tracing::warn!("Peer requested resync {}", argument);
                let step = {
                    let mut guard = self.inner.exchange.lock().await;
                    let ExchangeContext { store, negotiator } = &mut *guard;
                    match negotiator.as_mut() {
                        Some(negotiator) => negotiator.on_resync(store),
                        None => Err(DtmError::invalid_state("exchange not initialized")),
                    }
                };
                self.run_exchange(rx, step).await;
            }
            DtmServiceFlag::DataLost if self.is_established() && rx.resend_for.is_some() => {
                tracing::error!("Peer no longer holds packet {:?}", rx.resend_for);
                return Err(DtmError::UnrecoverableDataLoss(rx.data_loss));
            }
            DtmServiceFlag::OutOfSequence | DtmServiceFlag::DataLost => {
                let severity = if flag == DtmServiceFlag::DataLost {
                    Severity::DataLoss
                } else {
                    Severity::Warning
                };
                let code = DtmErrorFlag::from_code(argument);
                let event = self.raise_error(
                    ErrorKind::Service(flag),
                    severity,
                    format!("peer reported {flag:?} ({code:?})"),
                );
                if event.cancel {
                    self.terminate(None).await;
                }
            }
            DtmServiceFlag::Refusal => {
                let code = DtmErrorFlag::from_code(argument);
                return Err(DtmError::ConnectionRefused(Cow::Owned(format!(
                    "refused by peer: {code:?}"
                ))));
            }
            DtmServiceFlag::Terminate => {
                tracing::info!("Peer terminated the session");
                self.shutdown(None).await;
            }
        }
        Ok(())
    }

    /// Serve a `Resend`. Until the peer acknowledges a forward rekey its
    /// requests still refer to the previous key.
    async fn on_resend(&self, sequence: i64) -> Result<()> {
        let retained = if !self.inner.retired.is_empty() {
            self.inner.retired.peek(sequence)
        } else if self.is_established() {
            self.inner.sent.peek(sequence)
        } else {
            self.inner
                .exchange
                .lock()
                .await
                .negotiator
                .as_ref()
                .and_then(|n| n.retransmit(sequence))
        };

        match retained {
            Some(bytes) => {
                tracing::warn!("Retransmitting packet {}", sequence);
                self.transmit(&bytes).await
            }
            None => {
                tracing::warn!("Packet {} no longer retained", sequence);
                self.send_packet(&Packet::service(
                    DtmServiceFlag::DataLost,
                    DtmErrorFlag::UnrecoverableDataLoss.code(),
                ))
                .await
            }
        }
    }

    async fn on_sealed(&self, rx: &mut ReceiveState, packet: Packet) -> Result<()> {
        let expected = rx.ret()?.expected();
        if packet.sequence != expected && rx.stash_for_next_key(&packet)? {
            return Ok(());
        }
        match packet.sequence.cmp(&expected) {
            SeqOrdering::Less => {
                tracing::debug!("Duplicate packet {} ignored", packet.sequence);
                return Ok(());
            }
            SeqOrdering::Greater => {
                let stalled = rx.pending.len() >= rx.pending.depth();
                rx.pending.push(packet.sequence, packet.encode()?);
                if stalled || rx.resend_for != Some(expected) {
                    self.request_resend(rx, expected).await?;
                }
                return Err(DtmError::OutOfSequence {
                    expected,
                    actual: packet.sequence,
                });
            }
            SeqOrdering::Equal => {
                // A stale copy may sit under this sequence after a corrupted header
                let _ = rx.pending.pop(expected);
            }
        }

        self.open_and_route(rx, &packet).await?;
        while let Some(ret) = rx.ret.as_ref() {
            let Some(bytes) = rx.pending.pop(ret.expected()) else {
                break;
            };
            let buffered = Packet::decode(&bytes)?;
            self.open_and_route(rx, &buffered).await?;
        }
        Ok(())
    }

    /// Ask the peer for `sequence` again, within the `max_resend` budget
    async fn request_resend(&self, rx: &mut ReceiveState, sequence: i64) -> Result<()> {
        if rx.resends >= self.inner.config.max_resend {
            return Err(DtmError::MaxResendExceeded(self.inner.config.max_resend));
        }
        rx.resends += 1;
        rx.resend_for = Some(sequence);
        tracing::warn!(
            "Requesting resend of packet {} ({}/{})",
            sequence,
            rx.resends,
            self.inner.config.max_resend
        );
        self.send_packet(&Packet::service(DtmServiceFlag::Resend, sequence))
            .await
    }

    async fn open_and_route(&self, rx: &mut ReceiveState, packet: &Packet) -> Result<()> {
        let ret = rx.ret()?;
        let expected = ret.expected();
        let plaintext = match ret.receive(packet) {
            Ok(plaintext) => Zeroizing::new(plaintext),
            Err(DtmError::ReceivedBadData(reason)) => {
                if rx.stash_for_next_key(packet)? {
                    return Ok(());
                }
                if rx.data_loss >= self.inner.config.max_resync {
                    return Err(DtmError::UnrecoverableDataLoss(rx.data_loss));
                }
                rx.data_loss += 1;
                rx.resend_for = Some(expected);
                self.send_packet(&Packet::service(DtmServiceFlag::Resend, expected))
                    .await?;
                return Err(DtmError::ReceivedBadData(reason));
            }
            Err(e) => return Err(e),
        };
        rx.recovered(expected);

        match packet.packet_type {
            PacketType::Message => self.on_message(rx, packet.option_flag, &plaintext).await,
            _ => self.on_transfer(rx, packet.option_flag, &plaintext).await,
        }
    }

    async fn on_message(
        &self,
        rx: &mut ReceiveState,
        option_flag: i64,
        plaintext: &[u8],
    ) -> Result<()> {
        match MessageFlag::try_from(option_flag)? {
            MessageFlag::Transmission => {
                self.inner.handler.on_data_received(plaintext);
                Ok(())
            }
            MessageFlag::KeyRequest => self.on_key_request(rx, plaintext).await,
            MessageFlag::KeyResponse => self.on_key_response().await,
            MessageFlag::KeyRefused => {
                let pending = self.inner.rekey.lock().await.take();
                match pending {
                    Some(pending) => {
                        tracing::info!("Peer refused the new forward key");
                        let _ = pending.reply.send(false);
                    }
                    None => tracing::debug!("Key refusal without an outstanding offer"),
                }
                Ok(())
            }
            MessageFlag::KeySynchronized if plaintext.is_empty() => {
                self.on_key_synchronized(rx).await
            }
            MessageFlag::KeySynchronized => self.on_key_acknowledged(plaintext).await,
        }
    }

    async fn on_key_request(&self, rx: &mut ReceiveState, plaintext: &[u8]) -> Result<()> {
        let offer = KeyOffer::decode(plaintext)?;
        let mut event = KeyRequested {
            lifespan_secs: offer.lifespan_secs,
            reciprocal: offer.reciprocal,
            cancel: false,
        };
        self.inner.handler.on_key_requested(&mut event);

        if event.cancel {
            tracing::info!("Key offer refused");
            return self
                .send_sealed(PacketType::Message, MessageFlag::KeyRefused.value(), &[])
                .await
                .map(|_| ());
        }

        let engine = rx.ret()?.engine();
        let next = SessionChannel::new(
            self.inner.provider.cipher(engine, offer.material.clone())?,
            Direction::Receive,
        );
        rx.accepted_key = Some(AcceptedKey {
            material: offer.material,
            reciprocal: offer.reciprocal,
            next,
            early: PacketBuffer::new(rx.pending.depth()),
        });
        self.send_sealed(PacketType::Message, MessageFlag::KeyResponse.value(), &[])
            .await
            .map(|_| ())
    }

    /// The peer accepted our key: announce the switch under the old key,
    /// then rekey the forward channel. Packets sealed under the old key stay
    /// resendable until the peer acknowledges.
    async fn on_key_response(&self) -> Result<()> {
        let material = self
            .inner
            .rekey
            .lock()
            .await
            .as_mut()
            .and_then(|pending| pending.material.take())
            .ok_or(DtmError::invalid_state("key response without an outstanding offer"))?;

        let fingerprint = {
            let mut guard = self.inner.forward.lock().await;
            let channel = guard
                .as_mut()
                .ok_or(DtmError::invalid_state("session not established"))?;
            let announce =
                channel.seal(PacketType::Message, MessageFlag::KeySynchronized.value(), &[])?;
            self.transmit_sealed(&announce).await?;
            channel.rekey(material);
            self.inner.retired.clear();
            for (sequence, bytes) in self.inner.sent.drain() {
                self.inner.retired.push(sequence, bytes);
            }
            channel.fingerprint()
        };

        tracing::info!("Forward channel rekeyed");
        self.inner.handler.on_key_synchronized(&KeySynchronized {
            direction: Direction::Send,
            fingerprint,
        });
        Ok(())
    }

    /// The peer switched its return channel to our new key
    async fn on_key_acknowledged(&self, fingerprint: &[u8]) -> Result<()> {
        let pending = {
            let mut guard = self.inner.rekey.lock().await;
            match guard.as_ref() {
                Some(pending) if pending.material.is_none() => guard.take(),
                _ => None,
            }
        }
        .ok_or(DtmError::invalid_state("key acknowledgement without a switched key"))?;

        let forward = self.forward_fingerprint().await;
        if forward.as_ref().map(<[u8; 32]>::as_slice) != Some(fingerprint) {
            tracing::error!("Peer acknowledged a different forward key");
            return Err(DtmError::UnrecoverableDataLoss(0));
        }
        self.inner.retired.clear();
        tracing::debug!("Peer acknowledged the new forward key");
        let _ = pending.reply.send(true);
        Ok(())
    }

    /// Switch the return channel to the accepted key, acknowledge it and
    /// replay packets that arrived under the new key early.
    async fn on_key_synchronized(&self, rx: &mut ReceiveState) -> Result<()> {
        let accepted = rx
            .accepted_key
            .take()
            .ok_or(DtmError::invalid_state("key synchronized without an accepted offer"))?;
        let ret = rx.ret()?;
        ret.rekey(accepted.material);
        let fingerprint = ret.fingerprint();
        rx.pending.clear();
        for (sequence, bytes) in accepted.early.drain() {
            rx.pending.push(sequence, bytes);
        }
        rx.resend_for = None;
        rx.resends = 0;
        rx.data_loss = 0;
        *self.inner.return_fingerprint.lock().await = Some(fingerprint);

        tracing::info!("Return channel rekeyed");
        self.inner.handler.on_key_synchronized(&KeySynchronized {
            direction: Direction::Receive,
            fingerprint,
        });
        self.send_sealed(
            PacketType::Message,
            MessageFlag::KeySynchronized.value(),
            &fingerprint,
        )
        .await?;

        if accepted.reciprocal {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.forward_key_request(false).await {
                    tracing::warn!("Reciprocal rekey failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn on_transfer(
        &self,
        rx: &mut ReceiveState,
        option_flag: i64,
        plaintext: &[u8],
    ) -> Result<()> {
        let flag = TransferFlag::try_from(option_flag)?;
        match flag {
            TransferFlag::Request => self.on_file_request(rx, plaintext).await,
            TransferFlag::DataChunk => {
                let chunk = TransferChunk::decode(plaintext)?;
                let id = chunk.transfer_id;
                let Some(incoming) = rx.incoming.get_mut(&id) else {
                    tracing::debug!("Chunk for unknown transfer {} dropped", id);
                    return Ok(());
                };
                if let Err(e) = incoming.write_chunk(&chunk).await {
                    self.abort_incoming(rx, id, &e).await;
                    return Err(e);
                }
                Ok(())
            }
            TransferFlag::Sent => {
                let notice = TransferNotice::decode(plaintext)?;
                let id = notice.transfer_id;
                let Some(mut incoming) = rx.incoming.remove(&id) else {
                    tracing::debug!("Completion for unknown transfer {} dropped", id);
                    return Ok(());
                };
                match incoming.finish(id, &notice.detail).await {
                    Ok(received) => {
                        self.send_notice(TransferFlag::Received, &TransferNotice::new(id))
                            .await?;
                        tracing::info!("Transfer {} received ({} bytes)", id, received.size);
                        self.inner.handler.on_file_received(&received);
                        Ok(())
                    }
                    Err(e) => {
                        incoming.discard().await;
                        self.send_notice(
                            TransferFlag::Failed,
                            &TransferNotice::with_detail(id, e.to_string()),
                        )
                        .await?;
                        Err(e)
                    }
                }
            }
            TransferFlag::Accepted
            | TransferFlag::Refused
            | TransferFlag::Received
            | TransferFlag::Failed => {
                let notice = TransferNotice::decode(plaintext)?;
                let reply = match flag {
                    TransferFlag::Accepted => TransferReply::Accepted,
                    TransferFlag::Refused => TransferReply::Refused,
                    TransferFlag::Received => TransferReply::Received,
                    _ => TransferReply::Failed(
                        String::from_utf8_lossy(&notice.detail).into_owned(),
                    ),
                };
                match self.inner.transfers.remove(&notice.transfer_id) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(reply);
                    }
                    None => tracing::debug!("Reply for unknown transfer {}", notice.transfer_id),
                }
                Ok(())
            }
        }
    }

    async fn on_file_request(&self, rx: &mut ReceiveState, plaintext: &[u8]) -> Result<()> {
        let offer = TransferOffer::decode(plaintext)?;
        let id = offer.transfer_id;
        let mut event = FileRequest {
            transfer_id: id,
            destination: default_destination(id, &offer.name),
            name: offer.name,
            size: offer.size,
            cancel: false,
        };
        self.inner.handler.on_file_request(&mut event);

        if event.cancel {
            tracing::info!("Transfer {} refused", id);
            return self
                .send_notice(TransferFlag::Refused, &TransferNotice::new(id))
                .await;
        }

        match IncomingTransfer::create(event.destination, event.size).await {
            Ok(incoming) => {
                rx.incoming.insert(id, incoming);
                self.send_notice(TransferFlag::Accepted, &TransferNotice::new(id))
                    .await
            }
            Err(e) => {
                self.send_notice(
                    TransferFlag::Failed,
                    &TransferNotice::with_detail(id, e.to_string()),
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn abort_incoming(&self, rx: &mut ReceiveState, id: u64, err: &DtmError) {
        if let Some(incoming) = rx.incoming.remove(&id) {
            incoming.discard().await;
        }
        let notice = TransferNotice::with_detail(id, err.to_string());
        if let Err(e) = self.send_notice(TransferFlag::Failed, &notice).await {
            tracing::debug!("Transfer failure not delivered: {}", e);
        }
    }
}

fn outcome(transfer_id: u64, bytes: u64, reply: TransferReply) -> TransferOutcome {
    match reply {
        TransferReply::Received => {
            tracing::info!("Transfer {} completed ({} bytes)", transfer_id, bytes);
            TransferOutcome::Completed { transfer_id, bytes }
        }
        TransferReply::Refused => TransferOutcome::Refused,
        TransferReply::Failed(reason) => TransferOutcome::Failed(reason),
        TransferReply::Accepted => TransferOutcome::Failed("accepted twice".into()),
    }
}

async fn closed(status: &mut watch::Receiver<SessionStatus>) {
    let _ = status
        .wait_for(|s| matches!(s, SessionStatus::Closed(_)))
        .await;
}

fn closed_during(what: &'static str) -> DtmError {
    DtmError::ConnectionDropped(Cow::Owned(format!("session closed during {what}")))
}

impl std::fmt::Debug for DtmSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtmSession")
            .field("status", &*self.inner.status.borrow())
            .field("params", &self.inner.params.name)
            .finish_non_exhaustive()
    }
}
