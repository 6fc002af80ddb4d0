//! Order matching
//!
//! The matcher walks the opposing book in priority order and stages the
//! effects of every fill. It never mutates the book: staged effects are
//! applied later by the container commit, so the remaining amount of the
//! incoming order is tracked locally.
//!
//! Per fill, for each side:
//! 1. missing receiving balance is created
//! 2. the liability covering the filled part is released
//! 3. a `Trade` effect moves asset and quote at the resting price
//!
//! Sell liabilities are released one-for-one. Buy liabilities are released
//! as `quote(before) - quote(after)` at the buy order's own price, so the
//! releases of an order sum to exactly what was locked for it.

use super::{decode_order_id, quote_amount};
use crate::effects::EffectProcessorsContainer;
use crate::state::ExecutionState;
use crate::types::{AssetId, Order, OrderSide, PublicKey, TimeInForce, QUOTE_ASSET};
use crate::Result;
use rust_decimal::Decimal;
use std::collections::BTreeSet;

/// Incoming order after validation and liability lock
#[derive(Debug, Clone)]
pub struct IncomingOrder {
    /// Owner
    pub account: PublicKey,
    /// Order id (encodes asset and side)
    pub order_id: u64,
    /// Limit price
    pub price: Decimal,
    /// Amount
    pub amount: u64,
    /// Remainder handling
    pub time_in_force: TimeInForce,
}

/// Outcome of matching one order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    /// Number of resting orders hit
    pub fills: usize,
    /// Total amount traded
    pub traded: u64,
    /// Amount left after matching
    pub remaining: u64,
    /// Whether the remainder was placed in the book
    pub placed: bool,
}

/// Stages the effects of matching one incoming order
#[derive(Debug)]
pub struct OrderMatcher<'a> {
    state: &'a ExecutionState,
    container: &'a mut EffectProcessorsContainer,
    created_balances: BTreeSet<(PublicKey, AssetId)>,
}

struct Fill {
    account: PublicKey,
    order_id: u64,
    side: OrderSide,
    own_price: Decimal,
    remaining_before: u64,
    is_new_order: bool,
}

impl<'a> OrderMatcher<'a> {
    /// New matcher over a read-only state view
    pub fn new(state: &'a ExecutionState, container: &'a mut EffectProcessorsContainer) -> Self {
        Self {
            state,
            container,
            created_balances: BTreeSet::new(),
        }
    }

    /// Match `order` against the opposing book
    pub fn process(mut self, order: IncomingOrder) -> Result<MatchSummary> {
        let (asset, side, _) = decode_order_id(order.order_id);
        let state = self.state;
        let book = state.exchange.market(asset)?.book(side.opposite());

        let mut summary = MatchSummary {
            remaining: order.amount,
            ..MatchSummary::default()
        };

        for resting in book.iter() {
            if summary.remaining == 0 {
                break;
            }
            let crosses = match side {
                OrderSide::Buy => order.price >= resting.price,
                OrderSide::Sell => order.price <= resting.price,
            };
            if !crosses {
                break;
            }

            let fill_amount = summary.remaining.min(resting.amount);
            let trade_quote = quote_amount(fill_amount, resting.price)?;

            self.fill(
                asset,
                Fill {
                    account: resting.account,
                    order_id: resting.order_id,
                    side: side.opposite(),
                    own_price: resting.price,
                    remaining_before: resting.amount,
                    is_new_order: false,
                },
                fill_amount,
                resting.price,
                trade_quote,
            )?;
            self.fill(
                asset,
                Fill {
                    account: order.account,
                    order_id: order.order_id,
                    side,
                    own_price: order.price,
                    remaining_before: summary.remaining,
                    is_new_order: true,
                },
                fill_amount,
                resting.price,
                trade_quote,
            )?;

            if fill_amount == resting.amount {
                self.container.add_order_removed(Order {
                    amount: 0,
                    ..resting.clone()
                });
            }

            summary.fills += 1;
            summary.traded += fill_amount;
            summary.remaining -= fill_amount;
        }

        if summary.remaining > 0 {
            match order.time_in_force {
                TimeInForce::GoodTillCancel => {
                    self.container.add_order_placed(Order {
                        order_id: order.order_id,
                        account: order.account,
                        price: order.price,
                        amount: summary.remaining,
                    });
                    summary.placed = true;
                }
                TimeInForce::ImmediateOrCancel => {
                    let (locked_asset, locked) = match side {
                        OrderSide::Sell => (asset, summary.remaining),
                        OrderSide::Buy => (QUOTE_ASSET, quote_amount(summary.remaining, order.price)?),
                    };
                    if locked > 0 {
                        self.container
                            .add_unlock_liabilities(order.account, locked_asset, locked);
                    }
                }
            }
        }

        tracing::debug!(
            order_id = order.order_id,
            fills = summary.fills,
            traded = summary.traded,
            remaining = summary.remaining,
            "Order matched"
        );
        Ok(summary)
    }

    fn fill(
        &mut self,
        asset: AssetId,
        fill: Fill,
        amount: u64,
        price: Decimal,
        trade_quote: u64,
    ) -> Result<()> {
        let (received_asset, released) = match fill.side {
            OrderSide::Sell => (QUOTE_ASSET, (asset, amount)),
            OrderSide::Buy => {
                let before = quote_amount(fill.remaining_before, fill.own_price)?;
                let after = quote_amount(fill.remaining_before - amount, fill.own_price)?;
                (asset, (QUOTE_ASSET, before - after))
            }
        };

        self.ensure_balance(fill.account, received_asset);
        if released.1 > 0 {
            self.container
                .add_unlock_liabilities(fill.account, released.0, released.1);
        }
        self.container.add_trade(
            fill.account,
            fill.order_id,
            price,
            amount,
            trade_quote,
            fill.is_new_order,
        );
        Ok(())
    }

    fn ensure_balance(&mut self, account: PublicKey, asset: AssetId) {
        let exists = self
            .state
            .accounts
            .get_account(&account)
            .map(|a| a.balance(asset).is_some())
            .unwrap_or(false);
        if !exists && self.created_balances.insert((account, asset)) {
            self.container.add_balance_create(account, asset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{EffectKind, UpdateSign};
    use crate::exchange::encode_order_id;
    use crate::types::{AssetSettings, ConstellationSettings};

    fn state_with_accounts(accounts: &[(PublicKey, u64, u64)]) -> ExecutionState {
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
        let mut state = ExecutionState::new(settings, 1);
        let mut container = EffectProcessorsContainer::new(1);
        for (pk, quote, asset) in accounts {
            container.add_account_create(*pk);
            container.add_balance_create(*pk, QUOTE_ASSET);
            container.add_balance_update(*pk, QUOTE_ASSET, *quote, UpdateSign::Plus);
            container.add_balance_create(*pk, 1);
            container.add_balance_update(*pk, 1, *asset, UpdateSign::Plus);
        }
        container.commit(&mut state).unwrap();
        state
    }

    fn place(
        state: &mut ExecutionState,
        apex: u64,
        account: PublicKey,
        side: OrderSide,
        price: &str,
        amount: u64,
        time_in_force: TimeInForce,
    ) -> (MatchSummary, Vec<EffectKind>) {
        let price: Decimal = price.parse().unwrap();
        let order_id = encode_order_id(1, side, apex).unwrap();
        let mut container = EffectProcessorsContainer::new(apex);
        match side {
            OrderSide::Sell => container.add_lock_liabilities(account, 1, amount),
            OrderSide::Buy => container.add_lock_liabilities(
                account,
                QUOTE_ASSET,
                quote_amount(amount, price).unwrap(),
            ),
        }
        let summary = OrderMatcher::new(state, &mut container)
            .process(IncomingOrder {
                account,
                order_id,
                price,
                amount,
                time_in_force,
            })
            .unwrap();
        let effects = container.commit(state).unwrap();
        (summary, effects.into_iter().map(|e| e.kind).collect())
    }

    #[test]
    fn test_resting_price_wins() {
        let seller = PublicKey::from_bytes([1u8; 32]);
        let buyer = PublicKey::from_bytes([2u8; 32]);
        let mut state = state_with_accounts(&[(seller, 0, 10), (buyer, 100, 0)]);

        let (summary, _) = place(&mut state, 2, seller, OrderSide::Sell, "2", 10, TimeInForce::GoodTillCancel);
        assert!(summary.placed);

        let (summary, effects) = place(&mut state, 3, buyer, OrderSide::Buy, "2.5", 4, TimeInForce::GoodTillCancel);
        assert_eq!(summary.traded, 4);
        assert!(!summary.placed);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, EffectKind::Trade { price, quote_amount: 8, .. } if *price == Decimal::from(2)))
                .count(),
            2
        );

        let buyer_account = state.accounts.get_account(&buyer).unwrap();
        assert_eq!(buyer_account.balance(QUOTE_ASSET).unwrap().amount, 92);
        assert_eq!(buyer_account.balance(QUOTE_ASSET).unwrap().liabilities, 0);
        assert_eq!(buyer_account.balance(1).unwrap().amount, 4);

        let seller_account = state.accounts.get_account(&seller).unwrap();
        assert_eq!(seller_account.balance(QUOTE_ASSET).unwrap().amount, 8);
        assert_eq!(seller_account.balance(1).unwrap().liabilities, 6);

        let asks = &state.exchange.market(1).unwrap().asks;
        assert_eq!(asks.len(), 1);
        assert_eq!(asks.best().unwrap().amount, 6);
        assert_eq!(state.exchange.market(1).unwrap().last_price, Decimal::from(2));
    }

    #[test]
    fn test_time_priority_and_full_fill_removal() {
        let first = PublicKey::from_bytes([1u8; 32]);
        let second = PublicKey::from_bytes([2u8; 32]);
        let buyer = PublicKey::from_bytes([3u8; 32]);
        let mut state = state_with_accounts(&[(first, 0, 5), (second, 0, 5), (buyer, 100, 0)]);

        place(&mut state, 2, first, OrderSide::Sell, "1", 5, TimeInForce::GoodTillCancel);
        place(&mut state, 3, second, OrderSide::Sell, "1", 5, TimeInForce::GoodTillCancel);
        let (summary, effects) = place(&mut state, 4, buyer, OrderSide::Buy, "1", 7, TimeInForce::GoodTillCancel);

        assert_eq!(summary.fills, 2);
        assert_eq!(
            effects
                .iter()
                .filter(|e| matches!(e, EffectKind::OrderRemoved { .. }))
                .count(),
            1
        );
        let asks = &state.exchange.market(1).unwrap().asks;
        assert_eq!(asks.len(), 1);
        let left = asks.best().unwrap();
        assert_eq!(left.account, second);
        assert_eq!(left.amount, 3);
    }

    #[test]
    fn test_immediate_or_cancel_releases_remainder() {
        let seller = PublicKey::from_bytes([1u8; 32]);
        let mut state = state_with_accounts(&[(seller, 0, 10)]);

        let (summary, _) = place(&mut state, 2, seller, OrderSide::Sell, "3", 10, TimeInForce::ImmediateOrCancel);
        assert_eq!(summary.remaining, 10);
        assert!(!summary.placed);
        assert!(state.exchange.market(1).unwrap().asks.is_empty());
        let balance = state.accounts.get_account(&seller).unwrap().balance(1).unwrap().clone();
        assert_eq!(balance.liabilities, 0);
    }

    #[test]
    fn test_buy_liability_release_telescopes() {
        let seller = PublicKey::from_bytes([1u8; 32]);
        let buyer = PublicKey::from_bytes([2u8; 32]);
        let mut state = state_with_accounts(&[(seller, 0, 3), (buyer, 100, 0)]);

        // Buy 3 at 1.5 locks floor(4.5) = 4
        place(&mut state, 2, buyer, OrderSide::Buy, "1.5", 3, TimeInForce::GoodTillCancel);
        for apex in 3..6 {
            place(&mut state, apex, seller, OrderSide::Sell, "1.5", 1, TimeInForce::GoodTillCancel);
        }

        let quote = state.accounts.get_account(&buyer).unwrap().balance(QUOTE_ASSET).unwrap().clone();
        assert_eq!(quote.liabilities, 0);
        // Each unit costs floor(1.5) = 1
        assert_eq!(quote.amount, 97);
        assert!(state.exchange.market(1).unwrap().bids.is_empty());
    }

    #[test]
    fn test_sub_unit_fill_settles_for_zero_quote() {
        let seller = PublicKey::from_bytes([1u8; 32]);
        let buyer = PublicKey::from_bytes([2u8; 32]);
        let mut state = state_with_accounts(&[(seller, 0, 1), (buyer, 100, 0)]);

        // Buy 4 at 0.5 locks 2
        place(&mut state, 2, buyer, OrderSide::Buy, "0.5", 4, TimeInForce::GoodTillCancel);
        let (summary, effects) = place(&mut state, 3, seller, OrderSide::Sell, "0.5", 1, TimeInForce::GoodTillCancel);

        assert_eq!(summary.traded, 1);
        assert!(effects
            .iter()
            .all(|e| !matches!(e, EffectKind::Trade { quote_amount: q, .. } if *q != 0)));

        let seller_account = state.accounts.get_account(&seller).unwrap();
        assert_eq!(seller_account.balance(QUOTE_ASSET).unwrap().amount, 0);
        assert_eq!(seller_account.balance(1).unwrap().amount, 0);

        // Release is quote(4) - quote(3) = 1, the rest still covers 3 @ 0.5
        let quote = state.accounts.get_account(&buyer).unwrap().balance(QUOTE_ASSET).unwrap().clone();
        assert_eq!(quote.amount, 100);
        assert_eq!(quote.liabilities, 1);
        assert_eq!(state.accounts.get_account(&buyer).unwrap().balance(1).unwrap().amount, 1);
    }

    #[test]
    fn test_self_trade_allowed() {
        let trader = PublicKey::from_bytes([1u8; 32]);
        let mut state = state_with_accounts(&[(trader, 100, 10)]);

        place(&mut state, 2, trader, OrderSide::Sell, "2", 5, TimeInForce::GoodTillCancel);
        let (summary, _) = place(&mut state, 3, trader, OrderSide::Buy, "2", 5, TimeInForce::GoodTillCancel);

        assert_eq!(summary.traded, 5);
        let account = state.accounts.get_account(&trader).unwrap();
        assert_eq!(account.balance(QUOTE_ASSET).unwrap().amount, 100);
        assert_eq!(account.balance(1).unwrap().amount, 10);
        assert_eq!(account.balance(1).unwrap().liabilities, 0);
    }
}
