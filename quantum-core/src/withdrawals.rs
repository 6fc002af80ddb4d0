//! Pending withdrawals awaiting external ledger confirmation

use crate::messages;
use crate::types::{AssetId, PublicKey, Withdrawal};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Build a withdrawal with its deterministic transaction hash
pub fn build_withdrawal(
    apex: u64,
    source: PublicKey,
    destination: PublicKey,
    asset: AssetId,
    amount: u64,
) -> Result<Withdrawal> {
    let transaction_hash = messages::hash(&(apex, source, destination, asset, amount))?;
    Ok(Withdrawal {
        apex,
        source,
        destination,
        asset,
        amount,
        transaction_hash,
    })
}

/// Withdrawals keyed by transaction hash
#[derive(Debug, Clone, Default)]
pub struct WithdrawalStorage {
    withdrawals: BTreeMap<[u8; 32], Withdrawal>,
}

impl WithdrawalStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from snapshot withdrawals
    pub fn from_withdrawals(withdrawals: impl IntoIterator<Item = Withdrawal>) -> Self {
        Self {
            withdrawals: withdrawals
                .into_iter()
                .map(|w| (w.transaction_hash, w))
                .collect(),
        }
    }

    /// Add a pending withdrawal
    pub fn add(&mut self, withdrawal: Withdrawal) -> Result<()> {
        if self.withdrawals.contains_key(&withdrawal.transaction_hash) {
            return Err(Error::InvariantViolation(format!(
                "Withdrawal {} already exists",
                hex::encode(withdrawal.transaction_hash)
            )));
        }
        self.withdrawals
            .insert(withdrawal.transaction_hash, withdrawal);
        Ok(())
    }

    /// Remove a pending withdrawal
    pub fn remove(&mut self, transaction_hash: &[u8; 32]) -> Result<Withdrawal> {
        self.withdrawals.remove(transaction_hash).ok_or_else(|| {
            Error::InvariantViolation(format!(
                "Withdrawal {} not found",
                hex::encode(transaction_hash)
            ))
        })
    }

    /// Get by transaction hash
    pub fn get(&self, transaction_hash: &[u8; 32]) -> Option<&Withdrawal> {
        self.withdrawals.get(transaction_hash)
    }

    /// Check whether the account already has a pending withdrawal
    pub fn has_pending(&self, source: &PublicKey) -> bool {
        self.withdrawals.values().any(|w| &w.source == source)
    }

    /// All withdrawals ordered by transaction hash
    pub fn iter(&self) -> impl Iterator<Item = &Withdrawal> {
        self.withdrawals.values()
    }

    /// Number of pending withdrawals
    pub fn len(&self) -> usize {
        self.withdrawals.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.withdrawals.is_empty()
    }
}
