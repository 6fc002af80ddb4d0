//! Snapshots: quorum-signed checkpoints of the full execution state
//!
//! A snapshot is hashed without its confirmation, so auditors can sign the
//! hash before the confirmation exists. Each snapshot carries the hash of its
//! predecessor, forming a chain back to the genesis snapshot at apex 1.

pub mod catchup;
pub mod manager;
pub mod validation;

pub use catchup::AuditorCatchup;
pub use manager::SnapshotManager;
pub use validation::validate_snapshot;

use crate::error::SnapshotError;
use crate::exchange::MarketState;
use crate::messages::{self, Envelope, QuantumKind};
use crate::types::{Account, ConstellationSettings, Order, Withdrawal};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Full checkpoint of a node's state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Apex of the snapshot quantum
    pub apex: u64,
    /// Hash of the previous snapshot (zero for genesis)
    pub previous_hash: [u8; 32],
    /// Constellation settings
    pub settings: ConstellationSettings,
    /// External ledger sequence
    pub ledger: u64,
    /// Accounts sorted by public key
    pub accounts: Vec<Account>,
    /// Open orders sorted by order id
    pub orders: Vec<Order>,
    /// Per-market last prices
    pub markets: Vec<MarketState>,
    /// Pending withdrawals sorted by transaction hash
    pub withdrawals: Vec<Withdrawal>,
    /// Aggregated result envelope auditors signed (absent for genesis)
    pub confirmation: Option<Envelope>,
}

/// Hashed part of a snapshot: everything except the confirmation
#[derive(Serialize)]
struct SnapshotBody<'a> {
    apex: u64,
    previous_hash: &'a [u8; 32],
    settings: &'a ConstellationSettings,
    ledger: u64,
    accounts: &'a [Account],
    orders: &'a [Order],
    markets: &'a [MarketState],
    withdrawals: &'a [Withdrawal],
}

impl Snapshot {
    /// Hash over the canonical encoding, confirmation excluded
    pub fn compute_hash(&self) -> Result<[u8; 32]> {
        messages::hash(&SnapshotBody {
            apex: self.apex,
            previous_hash: &self.previous_hash,
            settings: &self.settings,
            ledger: self.ledger,
            accounts: &self.accounts,
            orders: &self.orders,
            markets: &self.markets,
            withdrawals: &self.withdrawals,
        })
    }

    /// Genesis snapshot check
    pub fn is_genesis(&self) -> bool {
        self.apex == 1
    }

    /// Snapshot hash the confirmation was signed over
    pub fn confirmed_hash(&self) -> std::result::Result<[u8; 32], SnapshotError> {
        let confirmation = self
            .confirmation
            .as_ref()
            .ok_or(SnapshotError::MissingConfirmation(self.apex))?;
        let result = confirmation.message.as_result().ok_or_else(|| {
            SnapshotError::InvalidConfirmation("not a result message".to_string())
        })?;
        if !result.status.is_success() {
            return Err(SnapshotError::InvalidConfirmation(format!(
                "result status is {:?}",
                result.status
            )));
        }
        let quantum = result.original.message.as_quantum().ok_or_else(|| {
            SnapshotError::InvalidConfirmation("result does not wrap a quantum".to_string())
        })?;
        match &quantum.kind {
            QuantumKind::Snapshot { hash } if quantum.apex == self.apex => Ok(*hash),
            QuantumKind::Snapshot { .. } => Err(SnapshotError::InvalidConfirmation(format!(
                "confirmation apex {} differs from snapshot apex {}",
                quantum.apex, self.apex
            ))),
            other => Err(SnapshotError::InvalidConfirmation(format!(
                "confirmation wraps a {} quantum",
                other.name()
            ))),
        }
    }
}
