//! Transport wrapper that corrupts selected outbound packets.

use async_trait::async_trait;
use dtm_core::transport::{TransportResult, TransportStats};
use dtm_core::{Packet, Transport};
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Offset of the low byte of the header `sequence` field
const SEQUENCE_OFFSET: usize = 12;

/// What to damage in a matching packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// Flip the last byte (the AEAD tag for sealed packets)
    Payload,
    /// Shift the header sequence by 16
    Sequence,
}

/// Which packets to corrupt and how many times
#[derive(Clone, Copy)]
pub struct Fault {
    /// Selects packets to corrupt
    pub matches: fn(&Packet) -> bool,
    /// Number of matching packets to corrupt; later matches pass untouched
    pub times: usize,
    /// Field to damage
    pub corruption: Corruption,
    /// Let byte-identical resends of a packet through
    pub spare_retransmits: bool,
}

impl Fault {
    /// Flip the tag of up to `times` matching packets
    pub const fn payload(matches: fn(&Packet) -> bool, times: usize) -> Self {
        Self {
            matches,
            times,
            corruption: Corruption::Payload,
            spare_retransmits: false,
        }
    }

    /// Shift the sequence of up to `times` matching packets
    pub const fn sequence(matches: fn(&Packet) -> bool, times: usize) -> Self {
        Self {
            matches,
            times,
            corruption: Corruption::Sequence,
            spare_retransmits: false,
        }
    }

    /// Only damage the first transmission of each packet
    pub const fn sparing_retransmits(mut self) -> Self {
        self.spare_retransmits = true;
        self
    }
}

/// Corrupts matching outbound packets.
///
/// Each session send carries exactly one encoded packet, so the bytes handed
/// to `send` can be decoded to decide whether to corrupt them. Retransmits
/// from the sender's retained copies count as new matches unless the fault
/// spares them.
pub struct FaultyTransport<T> {
    inner: T,
    fault: Fault,
    corrupted: AtomicUsize,
    seen: Mutex<HashSet<Vec<u8>>>,
}

impl<T: Transport> FaultyTransport<T> {
    /// Wrap `inner`
    pub fn new(inner: T, fault: Fault) -> Self {
        Self {
            inner,
            fault,
            corrupted: AtomicUsize::new(0),
            seen: Mutex::new(HashSet::new()),
        }
    }

    fn should_corrupt(&self, data: &[u8]) -> bool {
        let Ok(packet) = Packet::decode(data) else {
            return false;
        };
        if packet.payload.is_empty() || !(self.fault.matches)(&packet) {
            return false;
        }
        let first_send = self.seen.lock().unwrap().insert(data.to_vec());
        if self.fault.spare_retransmits && !first_send {
            return false;
        }
        self.corrupted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.fault.times).then_some(n + 1)
            })
            .is_ok()
    }
}

#[async_trait]
impl<T: Transport> Transport for FaultyTransport<T> {
    async fn connect(&self, address: &str, timeout: Duration) -> TransportResult<()> {
        self.inner.connect(address, timeout).await
    }

    async fn send(&self, data: &[u8]) -> TransportResult<()> {
        if self.should_corrupt(data) {
            let mut corrupted = data.to_vec();
            match self.fault.corruption {
                Corruption::Payload => {
                    if let Some(last) = corrupted.last_mut() {
                        *last ^= 0x01;
                    }
                }
                Corruption::Sequence => corrupted[SEQUENCE_OFFSET] ^= 0x10,
            }
            tracing::debug!(
                "Corrupting {:?} of an outbound packet of {} bytes",
                self.fault.corruption,
                data.len()
            );
            return self.inner.send(&corrupted).await;
        }
        self.inner.send(data).await
    }

    async fn recv(&self) -> TransportResult<Vec<u8>> {
        self.inner.recv().await
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats()
    }
}
