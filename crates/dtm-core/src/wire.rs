//! Field-level encoding for packet payloads.
//!
//! Payload structures (identities, proposals, key offers, file headers) are
//! flat sequences of little-endian integers and `u32`-length-prefixed byte
//! strings.

use crate::error::PacketError;

/// Append-only payload builder
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte
    #[must_use]
    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    /// Append a little-endian `u32`
    #[must_use]
    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a little-endian `u64`
    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append a length-prefixed byte string
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn bytes(mut self, value: &[u8]) -> Self {
        // Payloads are bounded by the i32 packet length field
        self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    /// Finish and return the encoded payload
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded payload
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading `data`
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], PacketError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(PacketError::Truncated(field))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a byte
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u8(&mut self, field: &'static str) -> Result<u8, PacketError> {
        Ok(self.take(1, field)?[0])
    }

    /// Read a little-endian `u32`
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u32(&mut self, field: &'static str) -> Result<u32, PacketError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a little-endian `u64`
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] at end of input.
    pub fn u64(&mut self, field: &'static str) -> Result<u64, PacketError> {
        let raw = self.take(8, field)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read a length-prefixed byte string
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Truncated`] if the prefix or body is cut short.
    pub fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], PacketError> {
        let len = self.u32(field)? as usize;
        self.take(len, field)
    }

    /// Require that all input was consumed
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TrailingBytes`] if input remains.
    pub fn finish(self) -> Result<(), PacketError> {
        match self.data.len() - self.pos {
            0 => Ok(()),
            rest => Err(PacketError::TrailingBytes(rest)),
        }
    }
}
