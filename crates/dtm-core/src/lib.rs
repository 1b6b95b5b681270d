//! # DTM Core
//!
//! Protocol engine for DTM, a peer-to-peer key exchange and session protocol.
//!
//! This crate provides:
//! - Packet encoding and stream reassembly
//! - The dual-channel (Auth + Primary) exchange state machine
//! - Identity binding and trust policies
//! - Encrypted session channels with forward-secrecy rekeying
//! - An async session carrying messages and file transfers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         DtmSession                               │
//! │   (messages, file transfers, rekeying, service control)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              ExchangeNegotiator / SessionChannel                 │
//! │   (Auth + Primary KEM handshake, then sealed channels)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Packets over Transport                        │
//! │   (24-byte header, length-prefixed payload, TCP or loopback)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod config;
pub mod error;
pub mod exchange;
pub mod flags;
pub mod identity;
pub mod packet;
pub mod packet_buffer;
pub mod params;
pub mod session;
pub mod transport;
pub mod wire;

pub use channel::{Direction, SessionChannel};
pub use config::DtmConfig;
pub use error::{DtmError, DtmErrorFlag, PacketError, Result, Severity};
pub use exchange::{ExchangeNegotiator, ExchangeState, Role};
pub use flags::{DtmServiceFlag, MessageFlag, TransferFlag};
pub use identity::{
    AcceptAll, AllowList, Identity, IdentityStore, PublicIdentity, TrustPolicy, TrustState,
};
pub use packet::{Packet, PacketDecoder, PacketType};
pub use packet_buffer::PacketBuffer;
pub use params::{ExchangeParameters, ParameterCatalog, StaticCatalog};
pub use session::{DtmSession, DtmSessionBuilder, SessionHandler, SessionStatus, TransferOutcome};
pub use transport::{LoopbackTransport, TcpTransport, Transport, TransportError};

/// Protocol version carried in the `Connect` exchange
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// Fixed packet header size in bytes
pub const PACKET_HEADER_SIZE: usize = 24;

/// Default upper bound on a packet payload
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;
