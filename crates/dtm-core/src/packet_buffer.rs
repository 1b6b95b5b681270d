//! Bounded, sequence-indexed packet cache.
//!
//! Holds sent packets for resend and early arrivals until a sequence gap is
//! filled. When the number of entries exceeds the configured depth, the
//! lowest sequence is evicted first (oldest-first, not LRU).
//!
//! Insert and remove go straight to a sharded concurrent map; only the
//! min/max scans and eviction are serialized by a narrow mutex.

use dashmap::DashMap;
use std::sync::{Mutex, PoisonError};

/// Bounded map from sequence number to payload
#[derive(Debug)]
pub struct PacketBuffer {
    entries: DashMap<i64, Vec<u8>>,
    depth: usize,
    scan: Mutex<()>,
}

impl PacketBuffer {
    /// Create a buffer holding at most `depth` entries
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(depth.saturating_add(1)),
            depth,
            scan: Mutex::new(()),
        }
    }

    /// Maximum number of retained entries
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Insert or replace the payload at `seq`, evicting the lowest
    /// sequences while the buffer is over depth.
    pub fn push(&self, seq: i64, payload: Vec<u8>) {
        self.entries.insert(seq, payload);

        if self.entries.len() > self.depth {
            let _guard = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
            while self.entries.len() > self.depth {
                let Some(lowest) = self.scan_lowest() else {
                    break;
                };
                self.entries.remove(&lowest);
                tracing::trace!("Packet buffer evicted sequence {}", lowest);
            }
        }
    }

    /// Remove and return the payload at `seq`
    #[must_use]
    pub fn pop(&self, seq: i64) -> Option<Vec<u8>> {
        self.entries.remove(&seq).map(|(_, payload)| payload)
    }

    /// Copy of the payload at `seq`
    #[must_use]
    pub fn peek(&self, seq: i64) -> Option<Vec<u8>> {
        self.entries.get(&seq).map(|entry| entry.value().clone())
    }

    /// Check whether `seq` is buffered
    #[must_use]
    pub fn contains(&self, seq: i64) -> bool {
        self.entries.contains_key(&seq)
    }

    /// Lowest buffered sequence, or -1 when empty
    #[must_use]
    pub fn lowest_key(&self) -> i64 {
        let _guard = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        self.scan_lowest().unwrap_or(-1)
    }

    /// Highest buffered sequence, or -1 when empty
    #[must_use]
    pub fn highest_key(&self) -> i64 {
        let _guard = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        self.entries.iter().map(|entry| *entry.key()).max().unwrap_or(-1)
    }

    /// Number of buffered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Remove every entry, returning them in ascending sequence order
    #[must_use]
    pub fn drain(&self) -> Vec<(i64, Vec<u8>)> {
        let _guard = self.scan.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<i64> = self.entries.iter().map(|entry| *entry.key()).collect();
        keys.sort_unstable();
        keys.into_iter()
            .filter_map(|seq| self.entries.remove(&seq))
            .collect()
    }

    // Shard guards from the iterator are released before returning, so the
    // caller may remove the key.
    fn scan_lowest(&self) -> Option<i64> {
        self.entries.iter().map(|entry| *entry.key()).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_buffer() {
        let buffer = PacketBuffer::new(4);
        assert!(buffer.is_empty());
        assert_eq!(buffer.lowest_key(), -1);
        assert_eq!(buffer.highest_key(), -1);
        assert_eq!(buffer.pop(0), None);
        assert_eq!(buffer.peek(0), None);
    }

    #[test]
    fn test_push_pop_peek() {
        let buffer = PacketBuffer::new(4);
        buffer.push(3, b"three".to_vec());
        buffer.push(1, b"one".to_vec());

        assert_eq!(buffer.peek(3), Some(b"three".to_vec()));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.lowest_key(), 1);
        assert_eq!(buffer.highest_key(), 3);

        assert_eq!(buffer.pop(1), Some(b"one".to_vec()));
        assert_eq!(buffer.pop(1), None);
        assert_eq!(buffer.lowest_key(), 3);
    }

    #[test]
    fn test_repush_replaces() {
        let buffer = PacketBuffer::new(2);
        buffer.push(5, b"old".to_vec());
        buffer.push(5, b"new".to_vec());
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.peek(5), Some(b"new".to_vec()));
    }

    #[test]
    fn test_evicts_lowest_not_oldest_insert() {
        let buffer = PacketBuffer::new(3);
        buffer.push(10, vec![10]);
        buffer.push(2, vec![2]);
        buffer.push(7, vec![7]);
        buffer.push(8, vec![8]);

        assert_eq!(buffer.len(), 3);
        assert!(!buffer.contains(2));
        assert!(buffer.contains(10));
        assert_eq!(buffer.lowest_key(), 7);
    }

    #[test]
    fn test_drain_is_ordered() {
        let buffer = PacketBuffer::new(8);
        for seq in [9, 3, 5] {
            buffer.push(seq, vec![seq as u8]);
        }
        let drained = buffer.drain();
        assert_eq!(drained, vec![(3, vec![3]), (5, vec![5]), (9, vec![9])]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_depth_holds_nothing() {
        let buffer = PacketBuffer::new(0);
        buffer.push(1, vec![1]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_concurrent_push_pop() {
        let buffer = Arc::new(PacketBuffer::new(64));
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let seq = t * 1000 + i;
                        buffer.push(seq, vec![0u8; 8]);
                        let _ = buffer.pop(seq - 1);
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        assert!(buffer.len() <= 64);
    }
}
