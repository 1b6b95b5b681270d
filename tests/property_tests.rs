//! Property-based tests for the DTM protocol
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Packet Codec Properties
// ============================================================================

mod packet_properties {
    use super::*;
    use dtm_core::{PACKET_HEADER_SIZE, Packet, PacketDecoder, PacketType};

    fn packet_type() -> impl Strategy<Value = PacketType> {
        prop_oneof![
            Just(PacketType::Service),
            Just(PacketType::Message),
            Just(PacketType::Exchange),
            Just(PacketType::Transfer),
        ]
    }

    proptest! {
        /// Packet roundtrip: decode(encode(p)) == p
        #[test]
        fn packet_roundtrip(
            packet_type in packet_type(),
            option_flag in any::<i64>(),
            sequence in any::<i64>(),
            payload in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let packet = Packet::new(packet_type, option_flag, sequence, payload);
            let encoded = packet.encode().unwrap();
            prop_assert_eq!(encoded.len(), PACKET_HEADER_SIZE + packet.payload.len());
            prop_assert_eq!(Packet::decode(&encoded).unwrap(), packet);
        }

        /// Any split of a packet stream yields the same packets in order
        #[test]
        fn decoder_reassembles_any_split(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 1..8),
            read_size in 1usize..700,
        ) {
            let packets: Vec<Packet> = payloads
                .into_iter()
                .enumerate()
                .map(|(i, payload)| Packet::new(PacketType::Message, 1, i as i64, payload))
                .collect();
            let stream: Vec<u8> = packets.iter().flat_map(|p| p.encode().unwrap()).collect();

            let mut decoder = PacketDecoder::default();
            let mut decoded = Vec::new();
            for read in stream.chunks(read_size) {
                decoder.extend(read);
                while let Some(packet) = decoder.next_packet().unwrap() {
                    decoded.push(packet);
                }
            }
            prop_assert_eq!(decoded, packets);
            prop_assert_eq!(decoder.buffered(), 0);
        }

        /// Truncated packets never decode
        #[test]
        fn truncated_packet_rejected(
            payload in prop::collection::vec(any::<u8>(), 1..512),
            cut in 1usize..512,
        ) {
            let encoded = Packet::new(PacketType::Transfer, 4, 0, payload).encode().unwrap();
            let cut = cut.min(encoded.len());
            prop_assert!(Packet::decode(&encoded[..encoded.len() - cut]).is_err());
        }
    }
}

// ============================================================================
// Packet Buffer Properties
// ============================================================================

mod buffer_properties {
    use super::*;
    use dtm_core::PacketBuffer;
    use std::collections::BTreeSet;

    proptest! {
        /// The buffer never exceeds its depth and keeps the highest sequences
        #[test]
        fn eviction_keeps_highest(
            depth in 1usize..32,
            sequences in prop::collection::vec(0i64..1000, 0..200),
        ) {
            let buffer = PacketBuffer::new(depth);
            for &seq in &sequences {
                buffer.push(seq, seq.to_le_bytes().to_vec());
                prop_assert!(buffer.len() <= depth);
            }

            let unique: BTreeSet<i64> = sequences.iter().copied().collect();
            prop_assert_eq!(buffer.len(), unique.len().min(depth));
            if let Some(&highest) = unique.iter().next_back() {
                prop_assert_eq!(buffer.highest_key(), highest);
                prop_assert_eq!(buffer.peek(highest), Some(highest.to_le_bytes().to_vec()));
            } else {
                prop_assert!(buffer.is_empty());
                prop_assert_eq!(buffer.lowest_key(), -1);
            }
        }
    }
}

// ============================================================================
// Channel Properties
// ============================================================================

mod channel_properties {
    use super::*;
    use dtm_core::{Direction, SessionChannel};
    use dtm_crypto::{AeadCipher, CipherEngine, KeyMaterial};

    fn channels(seed: u8) -> (SessionChannel, SessionChannel) {
        let material = KeyMaterial::new([seed; 32], [seed.wrapping_add(1); 16]);
        let engine = CipherEngine::ChaCha20Poly1305;
        (
            SessionChannel::new(
                Box::new(AeadCipher::new(engine, material.clone())),
                Direction::Send,
            ),
            SessionChannel::new(Box::new(AeadCipher::new(engine, material)), Direction::Receive),
        )
    }

    proptest! {
        /// Flipping any bit of a sealed payload is detected and leaves the
        /// receive counter in place
        #[test]
        fn tampering_detected(
            seed in any::<u8>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..256),
            bit in any::<prop::sample::Index>(),
        ) {
            let (mut tx, mut rx) = channels(seed);
            let packet = tx.send(&plaintext).unwrap();

            let mut tampered = packet.clone();
            let bit = bit.index(tampered.payload.len() * 8);
            tampered.payload[bit / 8] ^= 1 << (bit % 8);

            prop_assert!(rx.receive(&tampered).is_err());
            prop_assert_eq!(rx.expected(), 0);
            prop_assert_eq!(rx.receive(&packet).unwrap(), plaintext);
        }
    }
}
