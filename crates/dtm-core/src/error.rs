//! Error types for the DTM core protocol.
//!
//! Two layers:
//! - [`PacketError`]: codec failures, always reported as `MalformedPacket`
//! - [`DtmError`]: the protocol, cryptographic, transport and resource
//!   taxonomy. Every variant maps to exactly one [`DtmErrorFlag`] and a
//!   [`Severity`]; `Critical` and `Connection` severities are terminal.

use crate::transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Core protocol result type
pub type Result<T> = std::result::Result<T, DtmError>;

/// Packet codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Packet type outside 1..=4
    #[error("invalid packet type: {0}")]
    InvalidPacketType(i32),

    /// Declared payload length is negative
    #[error("negative payload length: {0}")]
    NegativeLength(i32),

    /// Declared payload length exceeds the available bytes
    #[error("payload length {declared} exceeds available {available} bytes")]
    PayloadOverflow {
        /// Declared payload length
        declared: usize,
        /// Bytes actually available
        available: usize,
    },

    /// Declared payload length exceeds the configured maximum
    #[error("payload length {declared} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared payload length
        declared: usize,
        /// Configured maximum
        max: usize,
    },

    /// Bytes left over after a complete packet or field set
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    /// A payload field ended early
    #[error("truncated field: {0}")]
    Truncated(&'static str),

    /// Unassigned flag value
    #[error("invalid {field} flag: {value}")]
    InvalidFlag {
        /// Flag family
        field: &'static str,
        /// Raw value
        value: i64,
    },
}

/// Error severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational, no action needed
    Information,
    /// Recovered locally (resend)
    Warning,
    /// Transport-level failure
    Connection,
    /// Data was lost or corrupted (resync may recover)
    DataLoss,
    /// Session must terminate
    Critical,
}

/// Canonical error codes. The numeric values travel in `Refusal` and
/// `DataLost` service packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum DtmErrorFlag {
    /// Packet arrived out of the expected order
    OutOfSequence = 1,
    /// Peers could not agree on parameters
    IncompatibleParameters = 2,
    /// Remote identity already bound
    IdentityAlreadyBound = 3,
    /// Packet failed to decode
    MalformedPacket = 4,
    /// Cryptographic validation failed
    ReceivedBadData = 5,
    /// Resync attempts exhausted
    UnrecoverableDataLoss = 6,
    /// Transport connection lost
    ConnectionDropped = 7,
    /// Transport or handshake timed out
    ConnectionTimedOut = 8,
    /// Peer refused the connection
    ConnectionRefused = 9,
    /// Resend attempts exhausted
    MaxResendExceeded = 10,
    /// A send did not complete in time
    SendTimeoutExceeded = 11,
    /// Parameter set not found in the catalog
    UnknownParameterSet = 12,
    /// Trust policy rejected the peer
    IdentityRejected = 13,
    /// Operation not valid in the current state
    InvalidState = 14,
    /// File transfer failed
    TransferFailed = 15,
    /// Local failure (configuration, randomness)
    Internal = 16,
}

impl DtmErrorFlag {
    /// Default severity assigned to this flag
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::OutOfSequence | Self::InvalidState | Self::TransferFailed => Severity::Warning,
            Self::ReceivedBadData => Severity::DataLoss,
            Self::ConnectionDropped | Self::ConnectionTimedOut | Self::ConnectionRefused => {
                Severity::Connection
            }
            Self::IncompatibleParameters
            | Self::IdentityAlreadyBound
            | Self::MalformedPacket
            | Self::UnrecoverableDataLoss
            | Self::MaxResendExceeded
            | Self::SendTimeoutExceeded
            | Self::UnknownParameterSet
            | Self::IdentityRejected
            | Self::Internal => Severity::Critical,
        }
    }

    /// Parse a raw code
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::OutOfSequence,
            2 => Self::IncompatibleParameters,
            3 => Self::IdentityAlreadyBound,
            4 => Self::MalformedPacket,
            5 => Self::ReceivedBadData,
            6 => Self::UnrecoverableDataLoss,
            7 => Self::ConnectionDropped,
            8 => Self::ConnectionTimedOut,
            9 => Self::ConnectionRefused,
            10 => Self::MaxResendExceeded,
            11 => Self::SendTimeoutExceeded,
            12 => Self::UnknownParameterSet,
            13 => Self::IdentityRejected,
            14 => Self::InvalidState,
            15 => Self::TransferFailed,
            16 => Self::Internal,
            _ => return None,
        })
    }

    /// Raw code
    #[must_use]
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// DTM protocol errors
#[derive(Debug, Clone, Error)]
pub enum DtmError {
    /// Packet failed to decode
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] PacketError),

    /// Sequence number did not match the expected value
    #[error("out of sequence: expected {expected}, got {actual}")]
    OutOfSequence {
        /// Expected sequence
        expected: i64,
        /// Received sequence
        actual: i64,
    },

    /// Exchange packet for a state other than the one expected
    #[error("unexpected exchange state: {0}")]
    UnexpectedState(Cow<'static, str>),

    /// Peers could not agree on parameters
    #[error("incompatible parameters: {0}")]
    IncompatibleParameters(Cow<'static, str>),

    /// Remote identity already bound
    #[error("remote identity already bound")]
    IdentityAlreadyBound,

    /// Trust policy rejected the peer
    #[error("identity rejected: {0}")]
    IdentityRejected(Cow<'static, str>),

    /// Decryption, decapsulation or validation failure
    #[error("received bad data: {0}")]
    ReceivedBadData(Cow<'static, str>),

    /// Resync attempts exhausted
    #[error("unrecoverable data loss after {0} resync attempts")]
    UnrecoverableDataLoss(u32),

    /// Transport connection lost
    #[error("connection dropped: {0}")]
    ConnectionDropped(Cow<'static, str>),

    /// Transport or handshake timed out
    #[error("connection timed out")]
    ConnectionTimedOut,

    /// Peer refused the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(Cow<'static, str>),

    /// Resend attempts exhausted
    #[error("maximum resend attempts exceeded ({0})")]
    MaxResendExceeded(u32),

    /// A send did not complete in time
    #[error("send timeout exceeded")]
    SendTimeoutExceeded,

    /// Parameter set not found in the catalog
    #[error("unknown parameter set: {0}")]
    UnknownParameterSet(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// File transfer failed
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Local cryptographic failure (not attributable to the peer)
    #[error("crypto error: {0}")]
    Crypto(#[from] dtm_crypto::CryptoError),
}

impl DtmError {
    /// Canonical flag for this error
    #[must_use]
    pub fn flag(&self) -> DtmErrorFlag {
        match self {
            Self::MalformedPacket(_) => DtmErrorFlag::MalformedPacket,
            Self::OutOfSequence { .. } | Self::UnexpectedState(_) => DtmErrorFlag::OutOfSequence,
            Self::IncompatibleParameters(_) => DtmErrorFlag::IncompatibleParameters,
            Self::IdentityAlreadyBound => DtmErrorFlag::IdentityAlreadyBound,
            Self::IdentityRejected(_) => DtmErrorFlag::IdentityRejected,
            Self::ReceivedBadData(_) => DtmErrorFlag::ReceivedBadData,
            Self::UnrecoverableDataLoss(_) => DtmErrorFlag::UnrecoverableDataLoss,
            Self::ConnectionDropped(_) => DtmErrorFlag::ConnectionDropped,
            Self::ConnectionTimedOut => DtmErrorFlag::ConnectionTimedOut,
            Self::ConnectionRefused(_) => DtmErrorFlag::ConnectionRefused,
            Self::MaxResendExceeded(_) => DtmErrorFlag::MaxResendExceeded,
            Self::SendTimeoutExceeded => DtmErrorFlag::SendTimeoutExceeded,
            Self::UnknownParameterSet(_) => DtmErrorFlag::UnknownParameterSet,
            Self::InvalidState(_) => DtmErrorFlag::InvalidState,
            Self::TransferFailed(_) => DtmErrorFlag::TransferFailed,
            Self::InvalidConfig(_) | Self::Crypto(_) => DtmErrorFlag::Internal,
        }
    }

    /// Severity of this error
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.flag().severity()
    }

    /// Returns true if this error ends the session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.severity(), Severity::Critical | Severity::Connection)
    }

    /// Wrap a cryptographic failure caused by peer data
    #[must_use]
    pub fn bad_data(err: impl std::fmt::Display) -> Self {
        Self::ReceivedBadData(Cow::Owned(err.to_string()))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        Self::InvalidState(Cow::Borrowed(context))
    }

    /// Create an incompatible parameters error with static context
    #[must_use]
    pub const fn incompatible(context: &'static str) -> Self {
        Self::IncompatibleParameters(Cow::Borrowed(context))
    }
}

impl From<TransportError> for DtmError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::ConnectionTimedOut,
            TransportError::Refused(reason) => Self::ConnectionRefused(Cow::Owned(reason)),
            other => Self::ConnectionDropped(Cow::Owned(other.to_string())),
        }
    }
}
