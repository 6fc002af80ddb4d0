//! Account & liability store
//!
//! Plain storage: it enforces nothing on its own beyond existence checks.
//! Balance and nonce mutation happens only through effect processors, which
//! check the liability invariants before touching an account.

use crate::types::{Account, PublicKey};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Accounts keyed by public key
#[derive(Debug, Clone, Default)]
pub struct AccountStorage {
    accounts: BTreeMap<PublicKey, Account>,
}

impl AccountStorage {
    /// Empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from snapshot accounts
    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: accounts.into_iter().map(|a| (a.pubkey, a)).collect(),
        }
    }

    /// Create an empty account
    pub fn create_account(&mut self, pubkey: PublicKey) -> Result<&mut Account> {
        if self.accounts.contains_key(&pubkey) {
            return Err(Error::AccountExists(pubkey));
        }
        Ok(self.accounts.entry(pubkey).or_insert_with(|| Account::new(pubkey)))
    }

    /// Remove an account, returning it
    pub fn remove_account(&mut self, pubkey: &PublicKey) -> Result<Account> {
        self.accounts
            .remove(pubkey)
            .ok_or(Error::AccountNotFound(*pubkey))
    }

    /// Get account
    pub fn get_account(&self, pubkey: &PublicKey) -> Option<&Account> {
        self.accounts.get(pubkey)
    }

    pub(crate) fn get_account_mut(&mut self, pubkey: &PublicKey) -> Result<&mut Account> {
        self.accounts
            .get_mut(pubkey)
            .ok_or(Error::AccountNotFound(*pubkey))
    }

    /// Check existence
    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.accounts.contains_key(pubkey)
    }

    /// Number of accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// True when there are no accounts
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// All accounts ordered by public key
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_remove() {
        let mut storage = AccountStorage::new();
        let pk = PublicKey::from_bytes([1u8; 32]);

        storage.create_account(pk).unwrap();
        assert!(storage.contains(&pk));
        assert!(matches!(
            storage.create_account(pk),
            Err(Error::AccountExists(_))
        ));

        let account = storage.remove_account(&pk).unwrap();
        assert_eq!(account.pubkey, pk);
        assert!(storage.get_account(&pk).is_none());
        assert!(matches!(
            storage.remove_account(&pk),
            Err(Error::AccountNotFound(_))
        ));
    }

    #[test]
    fn test_iteration_is_ordered() {
        let keys = [[3u8; 32], [1u8; 32], [2u8; 32]];
        let storage = AccountStorage::from_accounts(
            keys.iter().map(|k| Account::new(PublicKey::from_bytes(*k))),
        );
        let ordered: Vec<_> = storage.iter().map(|a| a.pubkey).collect();
        assert_eq!(
            ordered,
            vec![
                PublicKey::from_bytes([1u8; 32]),
                PublicKey::from_bytes([2u8; 32]),
                PublicKey::from_bytes([3u8; 32]),
            ]
        );
    }
}
