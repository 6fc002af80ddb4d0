//! Gap-filling sequencer for quanta received from the leader
//!
//! Quanta may arrive out of order. They are buffered by apex and released
//! only once every lower apex has been applied.

use crate::messages::Envelope;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Out-of-order buffer keyed by apex
#[derive(Debug, Default)]
pub struct QuantumProcessingQueue {
    pending: DashMap<u64, Envelope>,
    last_added_apex: AtomicU64,
}

impl QuantumProcessingQueue {
    /// Create empty queue starting after `apex`
    pub fn new(apex: u64) -> Self {
        Self {
            pending: DashMap::new(),
            last_added_apex: AtomicU64::new(apex),
        }
    }

    /// Buffer a quantum; returns false if the apex is already buffered
    pub fn add(&self, apex: u64, envelope: Envelope) -> bool {
        if self.pending.contains_key(&apex) {
            return false;
        }
        self.pending.insert(apex, envelope);
        self.last_added_apex.fetch_max(apex, Ordering::SeqCst);
        true
    }

    /// Remove the quantum at `apex` if it has arrived
    pub fn take(&self, apex: u64) -> Option<Envelope> {
        self.pending.remove(&apex).map(|(_, envelope)| envelope)
    }

    /// Check if `apex` is buffered
    pub fn contains(&self, apex: u64) -> bool {
        self.pending.contains_key(&apex)
    }

    /// Highest apex ever added
    pub fn last_added_apex(&self) -> u64 {
        self.last_added_apex.load(Ordering::SeqCst)
    }

    /// First gap after `applied`, as an inclusive range
    pub fn missing_range(&self, applied: u64) -> Option<(u64, u64)> {
        let last_added = self.last_added_apex();
        let from = applied + 1;
        if from >= last_added || self.contains(from) {
            return None;
        }
        let to = (from + 1..last_added)
            .find(|apex| self.contains(*apex))
            .map(|present| present - 1)
            .unwrap_or(last_added - 1);
        Some((from, to))
    }

    /// Drop everything up to `applied`
    pub fn prune(&self, applied: u64) {
        self.pending.retain(|apex, _| *apex > applied);
    }

    /// Restart after a state reset to `apex`, keeping later quanta
    pub fn restart_after(&self, apex: u64) {
        self.prune(apex);
        self.last_added_apex.fetch_max(apex, Ordering::SeqCst);
    }

    /// Buffered quanta
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Quantum, QuantumKind};

    fn envelope(apex: u64) -> Envelope {
        Envelope::new(Message::Quantum(Quantum {
            apex,
            timestamp: 0,
            kind: QuantumKind::Snapshot { hash: [0u8; 32] },
        }))
    }

    #[test]
    fn test_gap_detection() {
        let queue = QuantumProcessingQueue::new(0);
        for apex in [1, 2, 4] {
            assert!(queue.add(apex, envelope(apex)));
        }
        assert_eq!(queue.last_added_apex(), 4);

        assert!(queue.take(1).is_some());
        assert!(queue.take(2).is_some());
        assert!(queue.take(3).is_none());
        assert_eq!(queue.missing_range(2), Some((3, 3)));

        assert!(queue.add(3, envelope(3)));
        assert_eq!(queue.missing_range(2), None);
    }

    #[test]
    fn test_missing_range_spans_gap() {
        let queue = QuantumProcessingQueue::new(0);
        queue.add(7, envelope(7));
        queue.add(9, envelope(9));
        assert_eq!(queue.missing_range(2), Some((3, 6)));
        assert_eq!(queue.missing_range(7), Some((8, 8)));
        assert_eq!(queue.missing_range(9), None);
    }

    #[test]
    fn test_duplicates_and_restart() {
        let queue = QuantumProcessingQueue::new(10);
        assert!(queue.add(11, envelope(11)));
        assert!(!queue.add(11, envelope(11)));
        assert_eq!(queue.len(), 1);

        queue.add(12, envelope(12));
        queue.prune(11);
        assert!(!queue.contains(11));
        assert!(queue.contains(12));

        queue.add(25, envelope(25));
        queue.restart_after(20);
        assert!(!queue.contains(12));
        assert!(queue.contains(25));
        assert_eq!(queue.last_added_apex(), 25);
    }
}
