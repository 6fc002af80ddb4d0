//! Effects: immutable records of committed state changes
//!
//! Every state mutation a quantum triggers is staged as an effect processor
//! in an [`EffectProcessorsContainer`]. Processors hold only ids and amounts;
//! they look accounts, orders and withdrawals up in the [`ExecutionState`]
//! at commit/revert time.
//!
//! # Invariants
//!
//! - `liabilities <= amount` for every balance after every commit or revert
//! - Nonce only moves forward; revert restores the recorded previous nonce
//! - Reverting in reverse commit order restores the exact prior state
//!
//! [`ExecutionState`]: crate::state::ExecutionState

pub mod container;
pub mod processors;

pub use container::EffectProcessorsContainer;
pub use processors::EffectProcessor;

use crate::types::{AssetId, OrderSide, PublicKey, Withdrawal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a balance update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateSign {
    /// Credit
    Plus,
    /// Debit
    Minus,
}

impl UpdateSign {
    /// Opposite direction
    pub fn opposite(&self) -> Self {
        match self {
            UpdateSign::Plus => UpdateSign::Minus,
            UpdateSign::Minus => UpdateSign::Plus,
        }
    }
}

/// Committed state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effect {
    /// Apex of the quantum that produced it
    pub apex: u64,
    /// Affected account
    pub account: PublicKey,
    /// Change
    pub kind: EffectKind,
}

/// Kinds of state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectKind {
    /// Account created
    AccountCreate,
    /// Empty balance created
    BalanceCreate {
        /// Asset
        asset: AssetId,
    },
    /// Balance amount changed
    BalanceUpdate {
        /// Asset
        asset: AssetId,
        /// Amount
        amount: u64,
        /// Direction
        sign: UpdateSign,
    },
    /// Liabilities locked
    LockLiabilities {
        /// Asset
        asset: AssetId,
        /// Amount
        amount: u64,
    },
    /// Liabilities released
    UnlockLiabilities {
        /// Asset
        asset: AssetId,
        /// Amount
        amount: u64,
    },
    /// Nonce advanced
    NonceUpdate {
        /// New nonce
        nonce: u64,
        /// Nonce before the update
        prev_nonce: u64,
    },
    /// Order put in the book
    OrderPlaced {
        /// Order id
        order_id: u64,
        /// Limit price
        price: Decimal,
        /// Resting amount
        amount: u64,
    },
    /// Order taken out of the book
    OrderRemoved {
        /// Order id
        order_id: u64,
        /// Limit price
        price: Decimal,
        /// Amount left when removed
        amount: u64,
    },
    /// One side of a match
    Trade {
        /// Order id of this side
        order_id: u64,
        /// Traded asset
        asset: AssetId,
        /// Side of this order
        side: OrderSide,
        /// Execution price (resting order price)
        price: Decimal,
        /// Traded asset amount
        asset_amount: u64,
        /// Quote asset amount
        quote_amount: u64,
        /// Whether this side is the incoming order
        is_new_order: bool,
    },
    /// Pending withdrawal registered
    WithdrawalCreate(Withdrawal),
    /// Pending withdrawal resolved
    WithdrawalRemove(Withdrawal),
}

impl EffectKind {
    /// Short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            EffectKind::AccountCreate => "account_create",
            EffectKind::BalanceCreate { .. } => "balance_create",
            EffectKind::BalanceUpdate { .. } => "balance_update",
            EffectKind::LockLiabilities { .. } => "lock_liabilities",
            EffectKind::UnlockLiabilities { .. } => "unlock_liabilities",
            EffectKind::NonceUpdate { .. } => "nonce_update",
            EffectKind::OrderPlaced { .. } => "order_placed",
            EffectKind::OrderRemoved { .. } => "order_removed",
            EffectKind::Trade { .. } => "trade",
            EffectKind::WithdrawalCreate(_) => "withdrawal_create",
            EffectKind::WithdrawalRemove(_) => "withdrawal_remove",
        }
    }
}
