//! In-memory persistence

use super::quantum_apex;
use crate::effects::Effect;
use crate::messages::Envelope;
use crate::ports::Persistence;
use crate::snapshot::Snapshot;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Stored {
    quanta: BTreeMap<u64, (Envelope, Vec<Effect>)>,
    snapshots: BTreeMap<u64, Snapshot>,
}

/// Persistence kept in process memory
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: RwLock<Stored>,
}

impl MemoryPersistence {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored effects of the quantum at `apex`
    pub fn effects(&self, apex: u64) -> Option<Vec<Effect>> {
        self.inner.read().quanta.get(&apex).map(|(_, effects)| effects.clone())
    }

    /// Number of stored quanta
    pub fn quanta_count(&self) -> usize {
        self.inner.read().quanta.len()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_effects(&self, quantum: &Envelope, effects: &[Effect]) -> Result<()> {
        let apex = quantum_apex(quantum)?;
        let mut inner = self.inner.write();
        if let Some((existing, _)) = inner.quanta.get(&apex) {
            if existing.message == quantum.message {
                return Ok(());
            }
            return Err(Error::Storage(format!(
                "A different quantum is already stored at apex {}",
                apex
            )));
        }
        inner.quanta.insert(apex, (quantum.clone(), effects.to_vec()));
        Ok(())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner
            .write()
            .snapshots
            .insert(snapshot.apex, snapshot.clone());
        Ok(())
    }

    async fn get_last_snapshot(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .inner
            .read()
            .snapshots
            .last_key_value()
            .map(|(_, s)| s.clone()))
    }

    async fn get_pending_quanta(&self) -> Result<Vec<Envelope>> {
        let inner = self.inner.read();
        let after = inner.snapshots.keys().next_back().copied().unwrap_or(0);
        Ok(inner
            .quanta
            .range(after + 1..)
            .map(|(_, (envelope, _))| envelope.clone())
            .collect())
    }

    async fn get_quanta(&self, from: u64, to: u64) -> Result<Vec<Envelope>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .read()
            .quanta
            .range(from..=to)
            .map(|(_, (envelope, _))| envelope.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Quantum, QuantumKind};
    use crate::snapshot::test_support::empty_snapshot;

    fn quantum(apex: u64, hash: u8) -> Envelope {
        Envelope::new(Message::Quantum(Quantum {
            apex,
            timestamp: 0,
            kind: QuantumKind::Snapshot { hash: [hash; 32] },
        }))
    }

    #[tokio::test]
    async fn test_pending_quanta_follow_last_snapshot() {
        let store = MemoryPersistence::new();
        for apex in 1..=5 {
            store.save_effects(&quantum(apex, 0), &[]).await.unwrap();
        }
        assert_eq!(store.get_pending_quanta().await.unwrap().len(), 5);

        store.save_snapshot(&empty_snapshot(3, vec![])).await.unwrap();
        let pending = store.get_pending_quanta().await.unwrap();
        let apexes: Vec<u64> = pending
            .iter()
            .map(|e| e.message.as_quantum().unwrap().apex)
            .collect();
        assert_eq!(apexes, vec![4, 5]);
        assert_eq!(store.get_last_snapshot().await.unwrap().unwrap().apex, 3);
        assert_eq!(store.get_quanta(2, 3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_quantum_rejected() {
        let store = MemoryPersistence::new();
        store.save_effects(&quantum(1, 0), &[]).await.unwrap();
        store.save_effects(&quantum(1, 0), &[]).await.unwrap();
        assert!(matches!(
            store.save_effects(&quantum(1, 1), &[]).await,
            Err(Error::Storage(_))
        ));
        assert_eq!(store.quanta_count(), 1);
    }
}
