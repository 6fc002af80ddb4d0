//! Typed effect processors
//!
//! Each processor validates before it mutates, so a failed commit or
//! revert leaves the state untouched.

use super::{Effect, EffectKind, UpdateSign};
use crate::exchange::decode_order_id;
use crate::state::ExecutionState;
use crate::types::{AssetId, Balance, Order, OrderSide, PublicKey, Withdrawal, QUOTE_ASSET};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::fmt;

/// Reversible state mutation
pub trait EffectProcessor: Send + Sync + fmt::Debug {
    /// Effect record produced by this processor
    fn effect(&self) -> Effect;

    /// Apply the change
    fn commit(&mut self, state: &mut ExecutionState) -> Result<()>;

    /// Undo the change
    fn revert(&mut self, state: &mut ExecutionState) -> Result<()>;
}

fn balance_mut<'a>(
    state: &'a mut ExecutionState,
    account: &PublicKey,
    asset: AssetId,
) -> Result<&'a mut Balance> {
    state
        .accounts
        .get_account_mut(account)?
        .balance_mut(asset)
        .ok_or_else(|| {
            Error::InvariantViolation(format!("Balance {} not found for {}", asset, account))
        })
}

fn update_amount(balance: &mut Balance, amount: u64, sign: UpdateSign) -> Result<()> {
    let updated = match sign {
        UpdateSign::Plus => balance.amount.checked_add(amount),
        UpdateSign::Minus => balance.amount.checked_sub(amount),
    }
    .ok_or_else(|| {
        Error::InvariantViolation(format!(
            "Balance {} out of range: {} {:?} {}",
            balance.asset, balance.amount, sign, amount
        ))
    })?;
    if updated < balance.liabilities {
        return Err(Error::InvariantViolation(format!(
            "Balance {} amount {} below liabilities {}",
            balance.asset, updated, balance.liabilities
        )));
    }
    balance.amount = updated;
    Ok(())
}

fn update_liabilities(balance: &mut Balance, amount: u64, sign: UpdateSign) -> Result<()> {
    let updated = match sign {
        UpdateSign::Plus => balance.liabilities.checked_add(amount),
        UpdateSign::Minus => balance.liabilities.checked_sub(amount),
    }
    .filter(|liabilities| *liabilities <= balance.amount)
    .ok_or_else(|| {
        Error::InvariantViolation(format!(
            "Liabilities {} of asset {} cannot change by {:?} {} (amount {})",
            balance.liabilities, balance.asset, sign, amount, balance.amount
        ))
    })?;
    balance.liabilities = updated;
    Ok(())
}

/// Creates an account
#[derive(Debug)]
pub struct AccountCreateProcessor {
    apex: u64,
    account: PublicKey,
}

impl AccountCreateProcessor {
    /// New processor
    pub fn new(apex: u64, account: PublicKey) -> Self {
        Self { apex, account }
    }
}

impl EffectProcessor for AccountCreateProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.account,
            kind: EffectKind::AccountCreate,
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        state.accounts.create_account(self.account)?;
        Ok(())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        state.accounts.remove_account(&self.account)?;
        Ok(())
    }
}

/// Creates an empty balance
#[derive(Debug)]
pub struct BalanceCreateProcessor {
    apex: u64,
    account: PublicKey,
    asset: AssetId,
}

impl BalanceCreateProcessor {
    /// New processor
    pub fn new(apex: u64, account: PublicKey, asset: AssetId) -> Self {
        Self {
            apex,
            account,
            asset,
        }
    }
}

impl EffectProcessor for BalanceCreateProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.account,
            kind: EffectKind::BalanceCreate { asset: self.asset },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        let account = state.accounts.get_account_mut(&self.account)?;
        if account.balance(self.asset).is_some() {
            return Err(Error::InvariantViolation(format!(
                "Balance {} already exists for {}",
                self.asset, self.account
            )));
        }
        account.balances.push(Balance::new(self.asset));
        account.balances.sort_by_key(|b| b.asset);
        Ok(())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        let account = state.accounts.get_account_mut(&self.account)?;
        let position = account
            .balances
            .iter()
            .position(|b| b.asset == self.asset)
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Balance {} not found for {}",
                    self.asset, self.account
                ))
            })?;
        account.balances.remove(position);
        Ok(())
    }
}

/// Credits or debits a balance
#[derive(Debug)]
pub struct BalanceUpdateProcessor {
    apex: u64,
    account: PublicKey,
    asset: AssetId,
    amount: u64,
    sign: UpdateSign,
}

impl BalanceUpdateProcessor {
    /// New processor
    pub fn new(apex: u64, account: PublicKey, asset: AssetId, amount: u64, sign: UpdateSign) -> Self {
        Self {
            apex,
            account,
            asset,
            amount,
            sign,
        }
    }
}

impl EffectProcessor for BalanceUpdateProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.account,
            kind: EffectKind::BalanceUpdate {
                asset: self.asset,
                amount: self.amount,
                sign: self.sign,
            },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        update_amount(
            balance_mut(state, &self.account, self.asset)?,
            self.amount,
            self.sign,
        )
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        update_amount(
            balance_mut(state, &self.account, self.asset)?,
            self.amount,
            self.sign.opposite(),
        )
    }
}

/// Locks or unlocks liabilities
#[derive(Debug)]
pub struct LiabilitiesProcessor {
    apex: u64,
    account: PublicKey,
    asset: AssetId,
    amount: u64,
    lock: bool,
}

impl LiabilitiesProcessor {
    /// Lock `amount`
    pub fn lock(apex: u64, account: PublicKey, asset: AssetId, amount: u64) -> Self {
        Self {
            apex,
            account,
            asset,
            amount,
            lock: true,
        }
    }

    /// Unlock `amount`
    pub fn unlock(apex: u64, account: PublicKey, asset: AssetId, amount: u64) -> Self {
        Self {
            apex,
            account,
            asset,
            amount,
            lock: false,
        }
    }

    fn sign(&self) -> UpdateSign {
        if self.lock {
            UpdateSign::Plus
        } else {
            UpdateSign::Minus
        }
    }
}

impl EffectProcessor for LiabilitiesProcessor {
    fn effect(&self) -> Effect {
        let kind = if self.lock {
            EffectKind::LockLiabilities {
                asset: self.asset,
                amount: self.amount,
            }
        } else {
            EffectKind::UnlockLiabilities {
                asset: self.asset,
                amount: self.amount,
            }
        };
        Effect {
            apex: self.apex,
            account: self.account,
            kind,
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        let sign = self.sign();
        update_liabilities(balance_mut(state, &self.account, self.asset)?, self.amount, sign)
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        let sign = self.sign().opposite();
        update_liabilities(balance_mut(state, &self.account, self.asset)?, self.amount, sign)
    }
}

/// Advances the account nonce
#[derive(Debug)]
pub struct NonceUpdateProcessor {
    apex: u64,
    account: PublicKey,
    nonce: u64,
    prev_nonce: u64,
}

impl NonceUpdateProcessor {
    /// New processor
    pub fn new(apex: u64, account: PublicKey, nonce: u64, prev_nonce: u64) -> Self {
        Self {
            apex,
            account,
            nonce,
            prev_nonce,
        }
    }
}

impl EffectProcessor for NonceUpdateProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.account,
            kind: EffectKind::NonceUpdate {
                nonce: self.nonce,
                prev_nonce: self.prev_nonce,
            },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        let account = state.accounts.get_account_mut(&self.account)?;
        if account.nonce != self.prev_nonce || self.nonce <= account.nonce {
            return Err(Error::InvariantViolation(format!(
                "Nonce of {} cannot move from {} to {}",
                self.account, account.nonce, self.nonce
            )));
        }
        account.nonce = self.nonce;
        Ok(())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        let account = state.accounts.get_account_mut(&self.account)?;
        if account.nonce != self.nonce {
            return Err(Error::InvariantViolation(format!(
                "Nonce of {} is {}, expected {} on revert",
                self.account, account.nonce, self.nonce
            )));
        }
        account.nonce = self.prev_nonce;
        Ok(())
    }
}

/// Puts an order in the book
#[derive(Debug)]
pub struct OrderPlacedProcessor {
    apex: u64,
    order: Order,
}

impl OrderPlacedProcessor {
    /// New processor
    pub fn new(apex: u64, order: Order) -> Self {
        Self { apex, order }
    }
}

impl EffectProcessor for OrderPlacedProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.order.account,
            kind: EffectKind::OrderPlaced {
                order_id: self.order.order_id,
                price: self.order.price,
                amount: self.order.amount,
            },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        state.exchange.add_order(self.order.clone())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        state.exchange.remove_order(self.order.order_id)?;
        Ok(())
    }
}

/// Takes an order out of the book
#[derive(Debug)]
pub struct OrderRemovedProcessor {
    apex: u64,
    order: Order,
}

impl OrderRemovedProcessor {
    /// New processor; `order.amount` is the amount left at removal
    pub fn new(apex: u64, order: Order) -> Self {
        Self { apex, order }
    }
}

impl EffectProcessor for OrderRemovedProcessor {
    fn effect(&self) -> Effect {
        Effect {
            apex: self.apex,
            account: self.order.account,
            kind: EffectKind::OrderRemoved {
                order_id: self.order.order_id,
                price: self.order.price,
                amount: self.order.amount,
            },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        let resting = state
            .exchange
            .get_order(self.order.order_id)
            .ok_or(Error::OrderNotFound(self.order.order_id))?;
        if resting.amount != self.order.amount || resting.account != self.order.account {
            return Err(Error::InvariantViolation(format!(
                "Order {} changed before removal",
                self.order.order_id
            )));
        }
        state.exchange.remove_order(self.order.order_id)?;
        Ok(())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        state.exchange.add_order(self.order.clone())
    }
}

/// Settles one side of a match
///
/// Moves the traded asset and the quote asset between balances and, for
/// the resting side, reduces the order amount. Liabilities are released by
/// separate unlock processors.
#[derive(Debug)]
pub struct TradeProcessor {
    apex: u64,
    account: PublicKey,
    order_id: u64,
    price: Decimal,
    asset_amount: u64,
    quote_amount: u64,
    is_new_order: bool,
    prev_last_price: Option<Decimal>,
}

impl TradeProcessor {
    /// New processor
    pub fn new(
        apex: u64,
        account: PublicKey,
        order_id: u64,
        price: Decimal,
        asset_amount: u64,
        quote_amount: u64,
        is_new_order: bool,
    ) -> Self {
        Self {
            apex,
            account,
            order_id,
            price,
            asset_amount,
            quote_amount,
            is_new_order,
            prev_last_price: None,
        }
    }

    fn apply(&self, state: &mut ExecutionState, forward: bool) -> Result<()> {
        let (asset, side, _) = decode_order_id(self.order_id);
        let (asset_sign, quote_sign) = match side {
            OrderSide::Buy => (UpdateSign::Plus, UpdateSign::Minus),
            OrderSide::Sell => (UpdateSign::Minus, UpdateSign::Plus),
        };
        let (asset_sign, quote_sign) = if forward {
            (asset_sign, quote_sign)
        } else {
            (asset_sign.opposite(), quote_sign.opposite())
        };

        // Work on copies so a failed step leaves state intact
        let account = state.accounts.get_account_mut(&self.account)?;
        let mut asset_balance = account
            .balance(asset)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation(format!("Balance {} not found", asset)))?;
        let mut quote_balance = account
            .balance(QUOTE_ASSET)
            .cloned()
            .ok_or_else(|| Error::InvariantViolation("Quote balance not found".to_string()))?;
        update_amount(&mut asset_balance, self.asset_amount, asset_sign)?;
        update_amount(&mut quote_balance, self.quote_amount, quote_sign)?;

        if !self.is_new_order {
            let order = state.exchange.get_order_mut(self.order_id)?;
            order.amount = if forward {
                order.amount.checked_sub(self.asset_amount)
            } else {
                order.amount.checked_add(self.asset_amount)
            }
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "Order {} amount {} cannot trade {}",
                    self.order_id, order.amount, self.asset_amount
                ))
            })?;
        }

        let account = state.accounts.get_account_mut(&self.account)?;
        if let Some(balance) = account.balance_mut(asset) {
            *balance = asset_balance;
        }
        if let Some(balance) = account.balance_mut(QUOTE_ASSET) {
            *balance = quote_balance;
        }
        Ok(())
    }
}

impl EffectProcessor for TradeProcessor {
    fn effect(&self) -> Effect {
        let (asset, side, _) = decode_order_id(self.order_id);
        Effect {
            apex: self.apex,
            account: self.account,
            kind: EffectKind::Trade {
                order_id: self.order_id,
                asset,
                side,
                price: self.price,
                asset_amount: self.asset_amount,
                quote_amount: self.quote_amount,
                is_new_order: self.is_new_order,
            },
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        let (asset, _, _) = decode_order_id(self.order_id);
        let last_price = state.exchange.market(asset)?.last_price;
        self.apply(state, true)?;
        state.exchange.market_mut(asset)?.last_price = self.price;
        self.prev_last_price = Some(last_price);
        Ok(())
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        let (asset, _, _) = decode_order_id(self.order_id);
        let prev_last_price = self.prev_last_price.ok_or_else(|| {
            Error::InvariantViolation(format!("Trade {} reverted before commit", self.order_id))
        })?;
        self.apply(state, false)?;
        state.exchange.market_mut(asset)?.last_price = prev_last_price;
        self.prev_last_price = None;
        Ok(())
    }
}

/// Registers or resolves a pending withdrawal
#[derive(Debug)]
pub struct WithdrawalProcessor {
    apex: u64,
    withdrawal: Withdrawal,
    create: bool,
}

impl WithdrawalProcessor {
    /// Register a new withdrawal
    pub fn create(apex: u64, withdrawal: Withdrawal) -> Self {
        Self {
            apex,
            withdrawal,
            create: true,
        }
    }

    /// Resolve an existing withdrawal
    pub fn remove(apex: u64, withdrawal: Withdrawal) -> Self {
        Self {
            apex,
            withdrawal,
            create: false,
        }
    }

    fn insert(&self, state: &mut ExecutionState) -> Result<()> {
        state.withdrawals.add(self.withdrawal.clone())
    }

    fn delete(&self, state: &mut ExecutionState) -> Result<()> {
        state
            .withdrawals
            .remove(&self.withdrawal.transaction_hash)
            .map(|_| ())
    }
}

impl EffectProcessor for WithdrawalProcessor {
    fn effect(&self) -> Effect {
        let kind = if self.create {
            EffectKind::WithdrawalCreate(self.withdrawal.clone())
        } else {
            EffectKind::WithdrawalRemove(self.withdrawal.clone())
        };
        Effect {
            apex: self.apex,
            account: self.withdrawal.source,
            kind,
        }
    }

    fn commit(&mut self, state: &mut ExecutionState) -> Result<()> {
        if self.create {
            self.insert(state)
        } else {
            self.delete(state)
        }
    }

    fn revert(&mut self, state: &mut ExecutionState) -> Result<()> {
        if self.create {
            self.delete(state)
        } else {
            self.insert(state)
        }
    }
}
