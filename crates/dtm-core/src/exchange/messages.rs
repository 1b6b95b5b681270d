//! Exchange packet payloads.

use crate::error::{DtmError, Result};
use crate::identity::TrustState;
use crate::wire::{WireReader, WireWriter};

/// Upper bound on the OIDs listed in a Sync proposal
const MAX_SUPPORTED_OIDS: u32 = 64;

/// `Negotiate` payload: the sender's security minimums
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiateOffer {
    /// Auth-stage KEM OID
    pub auth_oid: u32,
    /// Minimum primary-stage KEM OID
    pub primary_oid: u32,
    /// Minimum trust required of the session
    pub min_trust: TrustState,
}

impl NegotiateOffer {
    /// Encode as a payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .u32(self.auth_oid)
            .u32(self.primary_oid)
            .u8(self.min_trust.value())
            .finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::MalformedPacket`] on truncated input or an
    /// unknown trust value.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let auth_oid = reader.u32("auth_oid")?;
        let primary_oid = reader.u32("primary_oid")?;
        let raw_trust = reader.u8("min_trust")?;
        reader.finish()?;
        let min_trust = TrustState::from_value(raw_trust).ok_or(
            crate::error::PacketError::InvalidFlag {
                field: "trust",
                value: i64::from(raw_trust),
            },
        )?;

        Ok(Self {
            auth_oid,
            primary_oid,
            min_trust,
        })
    }
}

/// `Connect` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectHello {
    /// Protocol version
    pub version: u32,
    /// Sender's public id
    pub public_id: Vec<u8>,
}

impl ConnectHello {
    /// Encode as a payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        WireWriter::new()
            .u32(self.version)
            .bytes(&self.public_id)
            .finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::MalformedPacket`] on truncated input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let version = reader.u32("version")?;
        let public_id = reader.bytes("public_id")?.to_vec();
        reader.finish()?;
        Ok(Self { version, public_id })
    }
}

/// `Sync` opening: the initiator's primary-stage proposal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProposal {
    /// Proposed (minimum) primary OID
    pub primary_oid: u32,
    /// Security level of the proposal in bits
    pub security_level: u32,
    /// Every primary OID the proposer supports
    pub supported: Vec<u32>,
}

impl SyncProposal {
    /// Encode as a payload
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::new()
            .u32(self.primary_oid)
            .u32(self.security_level)
            .u32(self.supported.len() as u32);
        for oid in &self.supported {
            writer = writer.u32(*oid);
        }
        writer.finish()
    }

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::ReceivedBadData`] on malformed input; the
    /// proposal only travels under the Auth cipher.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(data);
        let mut parse = || -> std::result::Result<Self, crate::error::PacketError> {
            let primary_oid = reader.u32("primary_oid")?;
            let security_level = reader.u32("security_level")?;
            let count = reader.u32("supported")?.min(MAX_SUPPORTED_OIDS);
            let supported = (0..count)
                .map(|_| reader.u32("supported"))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(Self {
                primary_oid,
                security_level,
                supported,
            })
        };
        let proposal = parse().map_err(DtmError::bad_data)?;
        reader.finish().map_err(DtmError::bad_data)?;
        Ok(proposal)
    }
}

/// Encode the single-OID Sync answer
#[must_use]
pub fn encode_oid(oid: u32) -> Vec<u8> {
    WireWriter::new().u32(oid).finish()
}

/// Decode the single-OID Sync answer
///
/// # Errors
///
/// Returns [`DtmError::ReceivedBadData`] on malformed input.
pub fn decode_oid(data: &[u8]) -> Result<u32> {
    let mut reader = WireReader::new(data);
    let oid = reader.u32("oid").map_err(DtmError::bad_data)?;
    reader.finish().map_err(DtmError::bad_data)?;
    Ok(oid)
}
