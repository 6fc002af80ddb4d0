//! External ledger cursor and update listener
//!
//! Auditors follow the external ledger through [`LedgerOracle::subscribe`]:
//! every notification is checked for sequence continuity, signed and
//! forwarded to the leader, which commits it as a `LedgerCommit` quantum.
//! Any stream error stops the listener and fails the node.

use crate::app_state::StateManager;
use crate::crypto::KeyPair;
use crate::messages::{Envelope, LedgerUpdateNotification, Message};
use crate::ports::{LedgerOracle, Transport};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

/// Tracks the last observed external ledger and relays new ones
#[derive(Debug)]
pub struct LedgerManager {
    oracle: Arc<dyn LedgerOracle>,
    transport: Arc<dyn Transport>,
    keypair: KeyPair,
    state_manager: Arc<StateManager>,
    cursor: AtomicU64,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerManager {
    /// Create manager positioned at `ledger`
    pub fn new(
        oracle: Arc<dyn LedgerOracle>,
        transport: Arc<dyn Transport>,
        keypair: KeyPair,
        state_manager: Arc<StateManager>,
        ledger: u64,
    ) -> Self {
        Self {
            oracle,
            transport,
            keypair,
            state_manager,
            cursor: AtomicU64::new(ledger),
            shutdown: watch::channel(false).0,
            task: Mutex::new(None),
        }
    }

    /// Last relayed ledger sequence
    pub fn ledger(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Check that `sequence` directly follows the cursor
    pub fn is_valid_next_ledger(&self, sequence: u64) -> bool {
        sequence == self.ledger() + 1
    }

    /// Move the cursor forward
    pub fn set_ledger(&self, sequence: u64) -> Result<()> {
        let current = self.ledger();
        if sequence <= current {
            return Err(Error::InvariantViolation(format!(
                "Ledger cursor cannot move from {} to {}",
                current, sequence
            )));
        }
        self.cursor.store(sequence, Ordering::Release);
        Ok(())
    }

    /// Subscribe from the next ledger and relay updates until shutdown
    pub async fn start_listener(self: &Arc<Self>) -> Result<()> {
        if self.task.lock().is_some() {
            return Err(Error::InvalidState("Ledger listener already running".to_string()));
        }
        let from = self.ledger() + 1;
        let stream = self.oracle.subscribe(from).await?;
        tracing::info!(from, "Ledger listener started");

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next() => {
                        let outcome = match next {
                            Some(Ok(update)) => manager.relay(update).await,
                            Some(Err(e)) => Err(e),
                            None => Err(Error::Ledger("Ledger stream ended".to_string())),
                        };
                        if let Err(e) = outcome {
                            tracing::error!(error = %e, "Ledger listener failed");
                            manager.state_manager.fail(&e.to_string());
                            break;
                        }
                    }
                }
            }
            tracing::info!(ledger = manager.ledger(), "Ledger listener stopped");
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn relay(&self, update: LedgerUpdateNotification) -> Result<()> {
        if !self.is_valid_next_ledger(update.ledger) {
            return Err(Error::Ledger(format!(
                "Expected ledger {}, received {}",
                self.ledger() + 1,
                update.ledger
            )));
        }
        let sequence = update.ledger;
        let payments = update.payments.len();
        let envelope = Envelope::signed(Message::LedgerUpdate(update), &self.keypair)?;
        self.transport
            .send_to_alpha(&envelope)
            .await
            .map_err(|e| Error::Ledger(format!("Failed to relay ledger {}: {}", sequence, e)))?;
        self.set_ledger(sequence)?;
        tracing::debug!(ledger = sequence, payments, "Ledger update relayed");
        Ok(())
    }

    /// Stop the listener and wait for it to exit
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::ApplicationState;
    use crate::ports::{LedgerInfo, LedgerUpdateStream, SignedVaultTransaction};
    use crate::quantum::Role;
    use crate::types::PublicKey;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct StaticOracle {
        updates: Vec<u64>,
    }

    #[async_trait]
    impl LedgerOracle for StaticOracle {
        async fn latest_ledger(&self) -> Result<u64> {
            Ok(self.updates.last().copied().unwrap_or(0))
        }

        async fn get_ledger(&self, sequence: u64) -> Result<Option<LedgerInfo>> {
            Ok(Some(LedgerInfo {
                sequence,
                close_time: 0,
            }))
        }

        async fn subscribe(&self, from: u64) -> Result<LedgerUpdateStream> {
            let updates: Vec<Result<LedgerUpdateNotification>> = self
                .updates
                .iter()
                .filter(|l| **l >= from)
                .map(|ledger| {
                    Ok(LedgerUpdateNotification {
                        ledger: *ledger,
                        payments: vec![],
                    })
                })
                .collect();
            Ok(Box::pin(tokio_stream::iter(updates)))
        }

        async fn submit_transaction(&self, _transaction: SignedVaultTransaction) -> Result<bool> {
            Ok(true)
        }
    }

    #[derive(Debug, Default)]
    struct Outbox {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Transport for Outbox {
        async fn broadcast_quantum(&self, _quantum: &Envelope) -> Result<()> {
            Ok(())
        }

        async fn send_to_alpha(&self, message: &Envelope) -> Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        async fn request_quanta(&self, _from: u64, _to: u64) -> Result<()> {
            Ok(())
        }

        async fn notify_client(&self, _account: &PublicKey, _result: &Envelope) -> Result<()> {
            Ok(())
        }
    }

    fn manager(updates: Vec<u64>, outbox: Arc<Outbox>) -> (Arc<LedgerManager>, Arc<StateManager>) {
        let state_manager = Arc::new(StateManager::new(Role::Witness));
        let manager = Arc::new(LedgerManager::new(
            Arc::new(StaticOracle { updates }),
            outbox,
            KeyPair::from_seed(&[7u8; 32]),
            state_manager.clone(),
            10,
        ));
        (manager, state_manager)
    }

    #[test]
    fn test_cursor_moves_forward_only() {
        let (manager, _) = manager(vec![], Arc::new(Outbox::default()));
        assert!(manager.is_valid_next_ledger(11));
        assert!(!manager.is_valid_next_ledger(12));
        manager.set_ledger(11).unwrap();
        assert!(matches!(manager.set_ledger(11), Err(Error::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn test_updates_relayed_then_stream_end_fails_node() {
        let outbox = Arc::new(Outbox::default());
        let (manager, state_manager) = manager(vec![11, 12], outbox.clone());
        let mut states = state_manager.subscribe();

        manager.start_listener().await.unwrap();
        states
            .wait_for(|s| *s == ApplicationState::Failed)
            .await
            .unwrap();
        manager.shutdown().await;

        let sent = outbox.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.are_signatures_valid().unwrap()));
        assert_eq!(manager.ledger(), 12);
    }

    #[tokio::test]
    async fn test_sequence_gap_fails_node() {
        let outbox = Arc::new(Outbox::default());
        let (manager, state_manager) = manager(vec![12], outbox.clone());
        let mut states = state_manager.subscribe();

        manager.start_listener().await.unwrap();
        states
            .wait_for(|s| *s == ApplicationState::Failed)
            .await
            .unwrap();
        manager.shutdown().await;

        assert!(outbox.sent.lock().is_empty());
        assert_eq!(manager.ledger(), 10);
    }
}
