//! Encrypted session channels.
//!
//! An established session owns two channels: the forward channel seals what
//! we send and the return channel opens what the peer sends. Each channel
//! keeps its own packet counter, which doubles as the AEAD nonce counter, so
//! a counter is never reused under one key. Rekeying resets the counter.

use crate::error::{DtmError, Result};
use crate::flags::MessageFlag;
use crate::packet::{Packet, PacketType, header_aad};
use dtm_crypto::{CipherEngine, KeyMaterial, SymmetricCipher};
use zeroize::Zeroize;

/// Direction a channel carries traffic in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Seals outbound packets
    Send,
    /// Opens inbound packets
    Receive,
}

/// A symmetric cipher bound to one direction of a session.
pub struct SessionChannel {
    cipher: Box<dyn SymmetricCipher>,
    direction: Direction,
    sequence: i64,
    #[cfg(test)]
    retired: Vec<KeyMaterial>,
}

impl SessionChannel {
    /// Wrap `cipher` for `direction`, starting at sequence 0
    #[must_use]
    pub fn new(cipher: Box<dyn SymmetricCipher>, direction: Direction) -> Self {
        Self {
            cipher,
            direction,
            sequence: 0,
            #[cfg(test)]
            retired: Vec::new(),
        }
    }

    /// Channel direction
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Next sequence to be sealed (send) or accepted (receive)
    #[must_use]
    pub fn expected(&self) -> i64 {
        self.sequence
    }

    /// Fingerprint of the current key material
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        self.cipher.fingerprint()
    }

    /// Engine backing this channel
    #[must_use]
    pub fn engine(&self) -> CipherEngine {
        self.cipher.engine()
    }

    /// Seal a `Transmission` message packet.
    ///
    /// # Errors
    ///
    /// See [`SessionChannel::seal`].
    pub fn send(&mut self, plaintext: &[u8]) -> Result<Packet> {
        self.seal(PacketType::Message, MessageFlag::Transmission.value(), plaintext)
    }

    /// Seal `plaintext` into a packet at the current sequence.
    ///
    /// The header is bound as associated data.
    ///
    /// # Errors
    ///
    /// Returns [`DtmError::InvalidState`] on a receive channel and
    /// [`DtmError::Crypto`] if sealing fails.
    pub fn seal(
        &mut self,
        packet_type: PacketType,
        option_flag: i64,
        plaintext: &[u8],
    ) -> Result<Packet> {
        if self.direction != Direction::Send {
            return Err(DtmError::invalid_state("cannot seal on a receive channel"));
        }
        let sequence = self.sequence;
        let aad = header_aad(packet_type, option_flag, sequence);
        let ciphertext = self.cipher.encrypt(counter(sequence)?, plaintext, &aad)?;
        self.sequence += 1;
        Ok(Packet::new(packet_type, option_flag, sequence, ciphertext))
    }

    /// Open an inbound packet.
    ///
    /// The counter only advances on success.
    ///
    /// # Errors
    ///
    /// - [`DtmError::OutOfSequence`] if the packet sequence is not the
    ///   expected one
    /// - [`DtmError::ReceivedBadData`] if authentication fails
    pub fn receive(&mut self, packet: &Packet) -> Result<Vec<u8>> {
        if self.direction != Direction::Receive {
            return Err(DtmError::invalid_state("cannot open on a send channel"));
        }
        if packet.sequence != self.sequence {
            return Err(DtmError::OutOfSequence {
                expected: self.sequence,
                actual: packet.sequence,
            });
        }
        let plaintext = self
            .cipher
            .decrypt(counter(packet.sequence)?, &packet.payload, &packet.aad())
            .map_err(DtmError::bad_data)?;
        self.sequence += 1;
        Ok(plaintext)
    }

    /// Check whether `packet` authenticates under this channel's key at its
    /// own sequence. The counter is left untouched.
    #[must_use]
    pub fn authenticates(&self, packet: &Packet) -> bool {
        if self.direction != Direction::Receive {
            return false;
        }
        let Ok(counter) = counter(packet.sequence) else {
            return false;
        };
        self.cipher
            .decrypt(counter, &packet.payload, &packet.aad())
            .is_ok()
    }

    /// Swap in new key material and restart the counter at 0.
    ///
    /// The previous material is zeroized.
    pub fn rekey(&mut self, material: KeyMaterial) {
        let mut old = self.cipher.replace_key(material);
        old.zeroize();
        tracing::debug!(
            "{:?} channel rekeyed after {} packets",
            self.direction,
            self.sequence
        );
        self.sequence = 0;

        #[cfg(test)]
        self.retired.push(old);
    }

    #[cfg(test)]
    pub(crate) fn retired(&self) -> &[KeyMaterial] {
        &self.retired
    }
}

fn counter(sequence: i64) -> Result<u64> {
    u64::try_from(sequence).map_err(|_| DtmError::invalid_state("negative channel sequence"))
}

impl std::fmt::Debug for SessionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannel")
            .field("direction", &self.direction)
            .field("engine", &self.cipher.engine())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}
