//! Execution state: the mutable stores of one node
//!
//! Owned by the quantum handler behind a `parking_lot::RwLock`. Only effect
//! processors mutate accounts, orders and withdrawals; the handler advances
//! `apex` and the ledger cursor after a successful commit.

use crate::accounts::AccountStorage;
use crate::exchange::Exchange;
use crate::snapshot::Snapshot;
use crate::types::ConstellationSettings;
use crate::withdrawals::WithdrawalStorage;
use crate::Result;

/// Mutable state of a constellation node
#[derive(Debug, Clone)]
pub struct ExecutionState {
    /// Constellation settings
    pub settings: ConstellationSettings,
    /// Accounts
    pub accounts: AccountStorage,
    /// Markets and order books
    pub exchange: Exchange,
    /// Pending withdrawals
    pub withdrawals: WithdrawalStorage,
    /// Last applied apex
    pub apex: u64,
    /// Last committed external ledger sequence
    pub ledger: u64,
    /// Hash of the last snapshot
    pub last_snapshot_hash: [u8; 32],
    /// Apex of the last snapshot
    pub last_snapshot_apex: u64,
}

impl ExecutionState {
    /// Fresh state before any quantum
    pub fn new(settings: ConstellationSettings, ledger: u64) -> Self {
        Self {
            exchange: Exchange::new(&settings.assets),
            settings,
            accounts: AccountStorage::new(),
            withdrawals: WithdrawalStorage::new(),
            apex: 0,
            ledger,
            last_snapshot_hash: [0u8; 32],
            last_snapshot_apex: 0,
        }
    }

    /// Rebuild all stores from a snapshot
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        Ok(Self {
            exchange: Exchange::restore(
                &snapshot.settings.assets,
                snapshot.orders.iter().cloned(),
                &snapshot.markets,
            )?,
            settings: snapshot.settings.clone(),
            accounts: AccountStorage::from_accounts(snapshot.accounts.iter().cloned()),
            withdrawals: WithdrawalStorage::from_withdrawals(snapshot.withdrawals.iter().cloned()),
            apex: snapshot.apex,
            ledger: snapshot.ledger,
            last_snapshot_hash: snapshot.compute_hash()?,
            last_snapshot_apex: snapshot.apex,
        })
    }

    /// Freeze the current stores into an unconfirmed snapshot at `apex`
    pub fn to_snapshot(&self, apex: u64) -> Snapshot {
        Snapshot {
            apex,
            previous_hash: self.last_snapshot_hash,
            settings: self.settings.clone(),
            ledger: self.ledger,
            accounts: self.accounts.iter().cloned().collect(),
            orders: self.exchange.orders(),
            markets: self.exchange.market_states(),
            withdrawals: self.withdrawals.iter().cloned().collect(),
            confirmation: None,
        }
    }
}
