//! Per-quantum container of staged effect processors
//!
//! `commit` applies processors in insertion order; if one fails, the
//! already-committed prefix is reverted in reverse order before the error
//! is returned. `revert` undoes a committed container in reverse order.
//!
//! The returned effect list goes to `Persistence::save_effects` together
//! with the quantum envelope. The quantum handler does that after the
//! state lock is released, see [`crate::quantum::handler`].

use super::processors::{
    AccountCreateProcessor, BalanceCreateProcessor, BalanceUpdateProcessor, EffectProcessor,
    LiabilitiesProcessor, NonceUpdateProcessor, OrderPlacedProcessor, OrderRemovedProcessor,
    TradeProcessor, WithdrawalProcessor,
};
use super::{Effect, UpdateSign};
use crate::state::ExecutionState;
use crate::types::{AssetId, Order, PublicKey, Withdrawal};
use crate::Result;
use rust_decimal::Decimal;

/// Staged effect processors of one quantum
#[derive(Debug)]
pub struct EffectProcessorsContainer {
    apex: u64,
    processors: Vec<Box<dyn EffectProcessor>>,
    committed: usize,
}

impl EffectProcessorsContainer {
    /// Empty container for the quantum at `apex`
    pub fn new(apex: u64) -> Self {
        Self {
            apex,
            processors: Vec::new(),
            committed: 0,
        }
    }

    /// Apex of the quantum
    pub fn apex(&self) -> u64 {
        self.apex
    }

    /// Stage a processor
    pub fn add(&mut self, processor: Box<dyn EffectProcessor>) {
        self.processors.push(processor);
    }

    /// Stage account creation
    pub fn add_account_create(&mut self, account: PublicKey) {
        self.add(Box::new(AccountCreateProcessor::new(self.apex, account)));
    }

    /// Stage balance creation
    pub fn add_balance_create(&mut self, account: PublicKey, asset: AssetId) {
        self.add(Box::new(BalanceCreateProcessor::new(self.apex, account, asset)));
    }

    /// Stage a balance credit or debit
    pub fn add_balance_update(
        &mut self,
        account: PublicKey,
        asset: AssetId,
        amount: u64,
        sign: UpdateSign,
    ) {
        self.add(Box::new(BalanceUpdateProcessor::new(
            self.apex, account, asset, amount, sign,
        )));
    }

    /// Stage a liabilities lock
    pub fn add_lock_liabilities(&mut self, account: PublicKey, asset: AssetId, amount: u64) {
        self.add(Box::new(LiabilitiesProcessor::lock(self.apex, account, asset, amount)));
    }

    /// Stage a liabilities release
    pub fn add_unlock_liabilities(&mut self, account: PublicKey, asset: AssetId, amount: u64) {
        self.add(Box::new(LiabilitiesProcessor::unlock(
            self.apex, account, asset, amount,
        )));
    }

    /// Stage a nonce update
    pub fn add_nonce_update(&mut self, account: PublicKey, nonce: u64, prev_nonce: u64) {
        self.add(Box::new(NonceUpdateProcessor::new(
            self.apex, account, nonce, prev_nonce,
        )));
    }

    /// Stage an order placement
    pub fn add_order_placed(&mut self, order: Order) {
        self.add(Box::new(OrderPlacedProcessor::new(self.apex, order)));
    }

    /// Stage an order removal
    pub fn add_order_removed(&mut self, order: Order) {
        self.add(Box::new(OrderRemovedProcessor::new(self.apex, order)));
    }

    /// Stage one side of a match
    pub fn add_trade(
        &mut self,
        account: PublicKey,
        order_id: u64,
        price: Decimal,
        asset_amount: u64,
        quote_amount: u64,
        is_new_order: bool,
    ) {
        self.add(Box::new(TradeProcessor::new(
            self.apex,
            account,
            order_id,
            price,
            asset_amount,
            quote_amount,
            is_new_order,
        )));
    }

    /// Stage a withdrawal registration
    pub fn add_withdrawal_create(&mut self, withdrawal: Withdrawal) {
        self.add(Box::new(WithdrawalProcessor::create(self.apex, withdrawal)));
    }

    /// Stage a withdrawal resolution
    pub fn add_withdrawal_remove(&mut self, withdrawal: Withdrawal) {
        self.add(Box::new(WithdrawalProcessor::remove(self.apex, withdrawal)));
    }

    /// Number of staged processors
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    /// True when nothing is staged
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// True after a successful commit
    pub fn is_committed(&self) -> bool {
        !self.processors.is_empty() && self.committed == self.processors.len()
    }

    /// Effects in insertion order
    pub fn effects(&self) -> Vec<Effect> {
        self.processors.iter().map(|p| p.effect()).collect()
    }

    /// Effects touching `account`
    pub fn effects_for(&self, account: &PublicKey) -> Vec<Effect> {
        self.processors
            .iter()
            .map(|p| p.effect())
            .filter(|e| &e.account == account)
            .collect()
    }

    /// Apply all processors in insertion order
    pub fn commit(&mut self, state: &mut ExecutionState) -> Result<Vec<Effect>> {
        for index in self.committed..self.processors.len() {
            if let Err(err) = self.processors[index].commit(state) {
                tracing::error!(
                    apex = self.apex,
                    effect = %self.processors[index].effect().kind.name(),
                    error = %err,
                    "Effect commit failed, reverting committed prefix"
                );
                self.revert(state)?;
                return Err(err);
            }
            self.committed = index + 1;
        }
        Ok(self.effects())
    }

    /// Undo committed processors in reverse order
    pub fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        while self.committed > 0 {
            self.processors[self.committed - 1].revert(state)?;
            self.committed -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::EffectKind;
    use crate::types::{AssetSettings, ConstellationSettings, QUOTE_ASSET};

    fn state() -> ExecutionState {
        let settings = ConstellationSettings {
            vault: PublicKey::from_bytes([9u8; 32]),
            auditors: vec![PublicKey::from_bytes([8u8; 32])],
            assets: vec![AssetSettings {
                id: 1,
                code: "X".to_string(),
                issuer: PublicKey::default(),
            }],
            min_account_balance: 1,
            min_allowed_lot_size: 1,
        };
        ExecutionState::new(settings, 1)
    }

    #[test]
    fn test_commit_in_order_and_revert() {
        let mut state = state();
        let pk = PublicKey::from_bytes([1u8; 32]);

        let mut container = EffectProcessorsContainer::new(2);
        container.add_account_create(pk);
        container.add_balance_create(pk, QUOTE_ASSET);
        container.add_balance_update(pk, QUOTE_ASSET, 100, UpdateSign::Plus);
        container.add_lock_liabilities(pk, QUOTE_ASSET, 40);
        container.add_nonce_update(pk, 1, 0);

        let effects = container.commit(&mut state).unwrap();
        assert_eq!(effects.len(), 5);
        assert!(container.is_committed());

        let account = state.accounts.get_account(&pk).unwrap();
        assert_eq!(account.nonce, 1);
        assert_eq!(account.available(QUOTE_ASSET), 60);

        container.revert(&mut state).unwrap();
        assert!(state.accounts.get_account(&pk).is_none());
    }

    #[test]
    fn test_failed_commit_reverts_prefix() {
        let mut state = state();
        let pk = PublicKey::from_bytes([1u8; 32]);

        let mut container = EffectProcessorsContainer::new(2);
        container.add_account_create(pk);
        container.add_balance_create(pk, QUOTE_ASSET);
        container.add_balance_update(pk, QUOTE_ASSET, 10, UpdateSign::Plus);
        // Locking more than the amount breaks the liability invariant
        container.add_lock_liabilities(pk, QUOTE_ASSET, 11);

        assert!(container.commit(&mut state).is_err());
        assert!(!container.is_committed());
        assert!(state.accounts.is_empty());
    }

    #[test]
    fn test_effects_for_account() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        let mut container = EffectProcessorsContainer::new(3);
        container.add_account_create(a);
        container.add_account_create(b);
        container.add_balance_create(a, QUOTE_ASSET);

        let effects = container.effects_for(&a);
        assert_eq!(effects.len(), 2);
        assert!(effects.iter().all(|e| e.account == a && e.apex == 3));
        assert_eq!(effects[1].kind, EffectKind::BalanceCreate { asset: QUOTE_ASSET });
    }

    #[test]
    fn test_nonce_never_moves_back() {
        let mut state = state();
        let pk = PublicKey::from_bytes([1u8; 32]);
        state.accounts.create_account(pk).unwrap().nonce = 5;

        let mut container = EffectProcessorsContainer::new(2);
        container.add_nonce_update(pk, 5, 5);
        assert!(container.commit(&mut state).is_err());
        assert_eq!(state.accounts.get_account(&pk).unwrap().nonce, 5);
    }
}
