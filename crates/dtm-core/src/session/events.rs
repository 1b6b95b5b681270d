//! Session events and the handler that receives them.
//!
//! Handlers are invoked synchronously from the session's receive task, in
//! packet order. Events carrying a `cancel` flag let the handler veto the
//! action the event announces.

use crate::channel::Direction;
use crate::error::{DtmErrorFlag, Severity};
use crate::exchange::Role;
use crate::flags::DtmServiceFlag;
use crate::identity::PublicIdentity;
use crate::packet::Packet;
use dtm_crypto::KemAlgorithm;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Peer identity bound during `Init`
#[derive(Debug, Clone)]
pub struct IdentityReceived {
    /// Disclosed identity
    pub identity: PublicIdentity,
    /// Set to refuse the peer
    pub cancel: bool,
}

/// Handshake completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEstablished {
    /// Identifier both peers derive identically
    pub session_id: [u8; 16],
    /// Local role
    pub role: Role,
    /// Agreed primary-stage KEM
    pub primary: Option<KemAlgorithm>,
}

/// Peer offers a file
#[derive(Debug, Clone)]
pub struct FileRequest {
    /// Transfer identifier chosen by the sender
    pub transfer_id: u64,
    /// File name announced by the sender
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Where the file will be written; may be changed by the handler
    pub destination: PathBuf,
    /// Set to refuse the transfer
    pub cancel: bool,
}

/// A file transfer completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReceived {
    /// Transfer identifier
    pub transfer_id: u64,
    /// Written file
    pub path: PathBuf,
    /// Bytes written
    pub size: u64,
}

/// Origin of a [`SessionError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reported by the peer through a Service packet
    Service(DtmServiceFlag),
    /// Detected locally
    Error(DtmErrorFlag),
}

/// A protocol error surfaced to the application
#[derive(Debug, Clone)]
pub struct SessionError {
    /// Origin
    pub kind: ErrorKind,
    /// Severity
    pub severity: Severity,
    /// Human-readable description
    pub message: String,
    /// Set to tear the session down. Critical errors always do.
    pub cancel: bool,
}

/// Peer offers new key material for our return channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRequested {
    /// Lifespan advertised by the peer, in seconds
    pub lifespan_secs: u64,
    /// Peer asks us to renew our own forward key afterwards
    pub reciprocal: bool,
    /// Set to refuse the new key
    pub cancel: bool,
}

/// A channel switched to new key material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySynchronized {
    /// Channel that was rekeyed
    pub direction: Direction,
    /// Fingerprint of the new key
    pub fingerprint: [u8; 32],
}

/// Receiver of session events. Every method defaults to a no-op.
#[allow(unused_variables)]
pub trait SessionHandler: Send + Sync {
    /// Peer identity bound
    fn on_identity_received(&self, event: &mut IdentityReceived) {}

    /// Packet decoded from the transport
    fn on_packet_received(&self, packet: &Packet) {}

    /// Packet written to the transport
    fn on_packet_sent(&self, packet: &Packet) {}

    /// Handshake completed
    fn on_session_established(&self, event: &SessionEstablished) {}

    /// Application data received
    fn on_data_received(&self, data: &[u8]) {}

    /// Peer offers a file
    fn on_file_request(&self, event: &mut FileRequest) {}

    /// Incoming file written
    fn on_file_received(&self, event: &FileReceived) {}

    /// Protocol error
    fn on_session_error(&self, event: &mut SessionError) {}

    /// Peer offers new key material
    fn on_key_requested(&self, event: &mut KeyRequested) {}

    /// A channel was rekeyed
    fn on_key_synchronized(&self, event: &KeySynchronized) {}
}

/// Handler that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {}

/// Owned copy of an event, as forwarded by [`QueueHandler`]
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// See [`SessionHandler::on_identity_received`]
    IdentityReceived(PublicIdentity),
    /// See [`SessionHandler::on_packet_received`]
    PacketReceived(Packet),
    /// See [`SessionHandler::on_packet_sent`]
    PacketSent(Packet),
    /// See [`SessionHandler::on_session_established`]
    Established(SessionEstablished),
    /// See [`SessionHandler::on_data_received`]
    DataReceived(Vec<u8>),
    /// See [`SessionHandler::on_file_request`]; carries the final decision
    FileRequest(FileRequest),
    /// See [`SessionHandler::on_file_received`]
    FileReceived(FileReceived),
    /// See [`SessionHandler::on_session_error`]
    Error(SessionError),
    /// See [`SessionHandler::on_key_requested`]; carries the final decision
    KeyRequested(KeyRequested),
    /// See [`SessionHandler::on_key_synchronized`]
    KeySynchronized(KeySynchronized),
}

/// Handler that forwards every event onto a tokio channel.
///
/// Decisions for cancellable events are configured up front: file offers
/// are accepted into `download_dir` (or the announced default) unless
/// [`QueueHandler::refuse_files`] is set, and key offers are accepted unless
/// [`QueueHandler::refuse_keys`] is set.
#[derive(Debug, Clone)]
pub struct QueueHandler {
    tx: mpsc::UnboundedSender<SessionEvent>,
    trace_packets: bool,
    refuse_files: bool,
    refuse_keys: bool,
    download_dir: Option<PathBuf>,
}

impl QueueHandler {
    /// Create a handler and the receiving end of its queue
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                trace_packets: false,
                refuse_files: false,
                refuse_keys: false,
                download_dir: None,
            },
            rx,
        )
    }

    /// Also forward `PacketReceived` and `PacketSent`
    #[must_use]
    pub fn trace_packets(mut self) -> Self {
        self.trace_packets = true;
        self
    }

    /// Refuse every file offer
    #[must_use]
    pub fn refuse_files(mut self) -> Self {
        self.refuse_files = true;
        self
    }

    /// Refuse every key offer
    #[must_use]
    pub fn refuse_keys(mut self) -> Self {
        self.refuse_keys = true;
        self
    }

    /// Write accepted files into `dir`
    #[must_use]
    pub fn download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    fn forward(&self, event: SessionEvent) {
        // Receiver dropped: nobody is listening any more
        let _ = self.tx.send(event);
    }
}

impl SessionHandler for QueueHandler {
    fn on_identity_received(&self, event: &mut IdentityReceived) {
        self.forward(SessionEvent::IdentityReceived(event.identity.clone()));
    }

    fn on_packet_received(&self, packet: &Packet) {
        if self.trace_packets {
            self.forward(SessionEvent::PacketReceived(packet.clone()));
        }
    }

    fn on_packet_sent(&self, packet: &Packet) {
        if self.trace_packets {
            self.forward(SessionEvent::PacketSent(packet.clone()));
        }
    }

    fn on_session_established(&self, event: &SessionEstablished) {
        self.forward(SessionEvent::Established(*event));
    }

    fn on_data_received(&self, data: &[u8]) {
        self.forward(SessionEvent::DataReceived(data.to_vec()));
    }

    fn on_file_request(&self, event: &mut FileRequest) {
        event.cancel = self.refuse_files;
        if let Some(dir) = &self.download_dir {
            let announced = PathBuf::from(&event.name);
            if let Some(name) = announced.file_name() {
                event.destination = dir.join(name);
            }
        }
        self.forward(SessionEvent::FileRequest(event.clone()));
    }

    fn on_file_received(&self, event: &FileReceived) {
        self.forward(SessionEvent::FileReceived(event.clone()));
    }

    fn on_session_error(&self, event: &mut SessionError) {
        self.forward(SessionEvent::Error(event.clone()));
    }

    fn on_key_requested(&self, event: &mut KeyRequested) {
        event.cancel = self.refuse_keys;
        self.forward(SessionEvent::KeyRequested(*event));
    }

    fn on_key_synchronized(&self, event: &KeySynchronized) {
        self.forward(SessionEvent::KeySynchronized(*event));
    }
}
