//! Packet encoding and decoding for the DTM wire protocol.
//!
//! Every packet is a fixed 24-byte header followed by the payload. All
//! multi-byte fields are little-endian.
//!
//! ```text
//! offset 0  : i32  packet_type   (1=Service, 2=Message, 3=Transfer, 4=Exchange)
//! offset 4  : i64  option_flag
//! offset 12 : i64  sequence
//! offset 20 : i32  payload_len
//! offset 24 : payload
//! ```

use crate::error::PacketError;
use crate::flags::DtmServiceFlag;
use crate::{DEFAULT_MAX_PAYLOAD, PACKET_HEADER_SIZE};

/// Size of the header prefix bound as AEAD associated data
/// (type, option flag and sequence).
pub const AAD_SIZE: usize = 20;

/// Packet types as defined on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PacketType {
    /// Session control, never encrypted
    Service = 1,
    /// Application and key-management messages
    Message = 2,
    /// File transfer
    Transfer = 3,
    /// Key exchange
    Exchange = 4,
}

impl TryFrom<i32> for PacketType {
    type Error = PacketError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Service),
            2 => Ok(Self::Message),
            3 => Ok(Self::Transfer),
            4 => Ok(Self::Exchange),
            _ => Err(PacketError::InvalidPacketType(value)),
        }
    }
}

/// A decoded protocol packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type
    pub packet_type: PacketType,
    /// Type-dependent option (service code, message flag, exchange state...)
    pub option_flag: i64,
    /// Per-direction sequence, or the argument of a Service packet
    pub sequence: i64,
    /// Payload bytes (ciphertext once a channel is keyed)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet
    #[must_use]
    pub fn new(packet_type: PacketType, option_flag: i64, sequence: i64, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            option_flag,
            sequence,
            payload,
        }
    }

    /// Create a Service packet with an argument and no payload
    #[must_use]
    pub fn service(flag: DtmServiceFlag, argument: i64) -> Self {
        Self::new(PacketType::Service, flag.value(), argument, Vec::new())
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Header fields bound as associated data when the payload is sealed
    #[must_use]
    pub fn aad(&self) -> [u8; AAD_SIZE] {
        header_aad(self.packet_type, self.option_flag, self.sequence)
    }

    /// Encode the packet into a byte buffer
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if the payload length does
    /// not fit in the `i32` length field.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len =
            i32::try_from(self.payload.len()).map_err(|_| PacketError::PayloadTooLarge {
                declared: self.payload.len(),
                max: i32::MAX as usize,
            })?;

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&(self.packet_type as i32).to_le_bytes());
        buf.extend_from_slice(&self.option_flag.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode exactly one packet from `data`
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] if the buffer is shorter than the header,
    /// the type is unknown, the declared length is negative or does not
    /// match the available bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let header = Header::parse(data)?;
        let available = data.len() - PACKET_HEADER_SIZE;

        if header.payload_len > available {
            return Err(PacketError::PayloadOverflow {
                declared: header.payload_len,
                available,
            });
        }
        if header.payload_len < available {
            return Err(PacketError::TrailingBytes(available - header.payload_len));
        }

        Ok(header.into_packet(data[PACKET_HEADER_SIZE..].to_vec()))
    }

    /// Interpret `option_flag` as a service code
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidFlag`] for unassigned codes.
    pub fn service_flag(&self) -> Result<DtmServiceFlag, PacketError> {
        DtmServiceFlag::try_from(self.option_flag)
    }
}

/// Associated data for a header prefix
#[must_use]
pub fn header_aad(packet_type: PacketType, option_flag: i64, sequence: i64) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    aad[0..4].copy_from_slice(&(packet_type as i32).to_le_bytes());
    aad[4..12].copy_from_slice(&option_flag.to_le_bytes());
    aad[12..20].copy_from_slice(&sequence.to_le_bytes());
    aad
}

struct Header {
    packet_type: PacketType,
    option_flag: i64,
    sequence: i64,
    payload_len: usize,
}

impl Header {
    fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: PACKET_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let packet_type = PacketType::try_from(i32::from_le_bytes([
            data[0], data[1], data[2], data[3],
        ]))?;
        let option_flag = i64::from_le_bytes([
            data[4], data[5], data[6], data[7], data[8], data[9], data[10], data[11],
        ]);
        let sequence = i64::from_le_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]);
        let raw_len = i32::from_le_bytes([data[20], data[21], data[22], data[23]]);
        let payload_len =
            usize::try_from(raw_len).map_err(|_| PacketError::NegativeLength(raw_len))?;

        Ok(Self {
            packet_type,
            option_flag,
            sequence,
            payload_len,
        })
    }

    fn into_packet(self, payload: Vec<u8>) -> Packet {
        Packet::new(self.packet_type, self.option_flag, self.sequence, payload)
    }
}

/// Incremental decoder for a byte stream.
///
/// Bytes arrive from the transport in arbitrary chunks; [`PacketDecoder`]
/// buffers them and yields whole packets.
#[derive(Debug)]
pub struct PacketDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl PacketDecoder {
    /// Create a decoder rejecting payloads above `max_payload` bytes
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    /// Append bytes received from the stream
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Yield the next complete packet, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] if the buffered header is malformed or
    /// declares a payload above the configured maximum. The stream cannot
    /// be resynchronized after an error.
    pub fn next_packet(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = Header::parse(&self.buf)?;
        if header.payload_len > self.max_payload {
            return Err(PacketError::PayloadTooLarge {
                declared: header.payload_len,
                max: self.max_payload,
            });
        }

        let total = PACKET_HEADER_SIZE + header.payload_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[PACKET_HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(header.into_packet(payload)))
    }
}
