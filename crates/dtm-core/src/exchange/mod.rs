//! Dual-channel key exchange.
//!
//! The [`ExchangeNegotiator`] is a sans-IO state machine: it consumes
//! Exchange packets and returns an [`ExchangeStep`] describing what to send,
//! what to surface to the application and, once both channels complete,
//! the derived [`SessionKeys`](dtm_crypto::SessionKeys).
//!
//! ## Flow
//!
//! The initiator opens every state and the responder answers with a packet
//! tagged with the same state. The initiator advances when the answer
//! arrives.
//!
//! ```text
//! Initiator                          Responder
//!     | -- Connect (version, id) ---->  |
//!     | <------------- Connect -------- |
//!     | -- Init (PublicIdentity) ----->  |   trust -> Partial
//!     | <---------------- Init -------- |
//!     | -- PreAuth (auth pk) ---------->  |
//!     | <------------- PreAuth -------- |
//!     | -- AuthEx (auth ct) ----------->  |   auth ciphers derived
//!     | <-------------- AuthEx -------- |
//!     | -- Auth {secret id} ----------->  |   trust -> Full
//!     | <---------------- Auth -------- |
//!     | -- Sync {proposal} ------------>  |
//!     | <------ Sync {agreed oid} ----- |
//!     | -- PrimeEx {primary pk} ------->  |
//!     | <------------- PrimeEx -------- |
//!     | -- Primary {primary ct} ------->  |   session keys derived
//!     | <------------- Primary -------- |
//!     | -- Established --------------->  |
//!     | <--------- Established -------- |
//! ```
//!
//! `{...}` payloads are sealed under the Auth cipher.

pub mod messages;
pub mod negotiator;
pub mod state;

pub use negotiator::{ExchangeNegotiator, NegotiatorLimits};
pub use state::{ChannelProgress, ExchangeState, can_advance_primary};

use crate::error::DtmError;
use crate::identity::PublicIdentity;
use crate::packet::Packet;
use dtm_crypto::SessionKeys;

/// Which side of the exchange this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Opens every exchange state
    Initiator,
    /// Answers every exchange state
    Responder,
}

/// Something the application should hear about
#[derive(Debug)]
pub enum ExchangeEvent {
    /// The peer's public identity was bound
    IdentityReceived(PublicIdentity),
    /// A non-terminal error that the negotiator recovered from locally
    Recoverable(DtmError),
}

/// Result of feeding one packet to the negotiator.
#[derive(Default)]
pub struct ExchangeStep {
    /// Packets to transmit, in order
    pub outbound: Vec<Packet>,
    /// Events to surface, in order
    pub events: Vec<ExchangeEvent>,
    /// Session keys, once the exchange is established
    pub established: Option<SessionKeys>,
}

impl ExchangeStep {
    /// Peer identity surfaced by this step, if any
    #[must_use]
    pub fn identity_received(&self) -> Option<&PublicIdentity> {
        self.events.iter().find_map(|event| match event {
            ExchangeEvent::IdentityReceived(identity) => Some(identity),
            ExchangeEvent::Recoverable(_) => None,
        })
    }
}

impl std::fmt::Debug for ExchangeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStep")
            .field("outbound", &self.outbound.len())
            .field("events", &self.events)
            .field("established", &self.established.is_some())
            .finish()
    }
}
