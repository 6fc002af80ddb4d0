//! Collaborator interfaces consumed by the pipeline
//!
//! Storage, the external ledger network and the auditor transport live
//! outside the core. Implementations must be cheap to share (`Arc<dyn ..>`)
//! and must never call back into the quantum handler synchronously.

use crate::effects::Effect;
use crate::messages::{Envelope, LedgerUpdateNotification};
use crate::snapshot::Snapshot;
use crate::types::PublicKey;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::pin::Pin;
use tokio_stream::Stream;

/// Durable storage of quanta, effects and snapshots
#[async_trait]
pub trait Persistence: Send + Sync + Debug {
    /// Append a processed quantum with its committed effects
    async fn save_effects(&self, quantum: &Envelope, effects: &[Effect]) -> Result<()>;

    /// Store a confirmed snapshot; quanta up to its apex are no longer pending
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Latest confirmed snapshot
    async fn get_last_snapshot(&self) -> Result<Option<Snapshot>>;

    /// Quanta recorded after the last snapshot, ascending by apex
    async fn get_pending_quanta(&self) -> Result<Vec<Envelope>>;

    /// Quanta in `from..=to`, ascending by apex
    async fn get_quanta(&self, from: u64, to: u64) -> Result<Vec<Envelope>>;
}

/// External ledger information for one sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerInfo {
    /// Ledger sequence
    pub sequence: u64,
    /// Close time (unix seconds)
    pub close_time: i64,
}

/// Vault configuration transaction: auditors become the vault signers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVaultTransaction {
    /// Vault account
    pub vault: PublicKey,
    /// Signers to install
    pub signers: Vec<PublicKey>,
    /// Signature threshold
    pub threshold: u32,
    /// Encoded transaction
    pub payload: Vec<u8>,
    /// Vault signature over the payload hash
    pub signature: crate::types::Signature,
}

/// Stream of ledger updates starting at a requested sequence
pub type LedgerUpdateStream = Pin<Box<dyn Stream<Item = Result<LedgerUpdateNotification>> + Send>>;

/// External ledger network client
#[async_trait]
pub trait LedgerOracle: Send + Sync + Debug {
    /// Latest closed ledger sequence
    async fn latest_ledger(&self) -> Result<u64>;

    /// Ledger info, `None` if not closed yet
    async fn get_ledger(&self, sequence: u64) -> Result<Option<LedgerInfo>>;

    /// Updates for every ledger from `from` on, in sequence order
    async fn subscribe(&self, from: u64) -> Result<LedgerUpdateStream>;

    /// Submit a transaction, `false` when the network rejected it
    async fn submit_transaction(&self, transaction: SignedVaultTransaction) -> Result<bool>;
}

/// Message delivery between nodes and clients
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Leader: send a sequenced quantum to every auditor
    async fn broadcast_quantum(&self, quantum: &Envelope) -> Result<()>;

    /// Auditor: send a message (results, ledger updates) to the leader
    async fn send_to_alpha(&self, message: &Envelope) -> Result<()>;

    /// Auditor: ask the leader to resend quanta in `from..=to`
    async fn request_quanta(&self, from: u64, to: u64) -> Result<()>;

    /// Leader: deliver a request result to the client
    async fn notify_client(&self, account: &PublicKey, result: &Envelope) -> Result<()>;
}
