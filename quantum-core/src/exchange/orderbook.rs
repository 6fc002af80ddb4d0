//! One side of a market
//!
//! Orders are kept in a `BTreeMap` whose key sorts by price priority first
//! and order id second. Bids sort on the negated price so iteration always
//! starts from the best price on both sides. Order ids grow with the apex,
//! so among equal prices the older order comes first.

use crate::types::{Order, OrderSide};
use crate::{Error, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

/// Price-time priority key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority_price: Decimal,
    order_id: u64,
}

/// Orders of one side ordered by price-time priority
#[derive(Debug, Clone)]
pub struct Orderbook {
    side: OrderSide,
    orders: BTreeMap<OrderKey, Order>,
    index: HashMap<u64, OrderKey>,
}

impl Orderbook {
    /// Empty book
    pub fn new(side: OrderSide) -> Self {
        Self {
            side,
            orders: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Book side
    pub fn side(&self) -> OrderSide {
        self.side
    }

    fn key(&self, price: Decimal, order_id: u64) -> OrderKey {
        let priority_price = match self.side {
            OrderSide::Sell => price,
            OrderSide::Buy => -price,
        };
        OrderKey {
            priority_price,
            order_id,
        }
    }

    /// Insert an order
    pub fn add(&mut self, order: Order) -> Result<()> {
        if self.index.contains_key(&order.order_id) {
            return Err(Error::InvariantViolation(format!(
                "Duplicate order id {}",
                order.order_id
            )));
        }
        let key = self.key(order.price, order.order_id);
        self.index.insert(order.order_id, key);
        self.orders.insert(key, order);
        Ok(())
    }

    /// Remove an order
    pub fn remove(&mut self, order_id: u64) -> Result<Order> {
        let key = self
            .index
            .remove(&order_id)
            .ok_or(Error::OrderNotFound(order_id))?;
        self.orders
            .remove(&key)
            .ok_or(Error::OrderNotFound(order_id))
    }

    /// Get order by id
    pub fn get(&self, order_id: u64) -> Option<&Order> {
        self.index.get(&order_id).and_then(|key| self.orders.get(key))
    }

    pub(crate) fn get_mut(&mut self, order_id: u64) -> Result<&mut Order> {
        let key = self
            .index
            .get(&order_id)
            .ok_or(Error::OrderNotFound(order_id))?;
        self.orders
            .get_mut(key)
            .ok_or(Error::OrderNotFound(order_id))
    }

    /// Best order (highest bid / lowest ask)
    pub fn best(&self) -> Option<&Order> {
        self.orders.values().next()
    }

    /// Orders in matching priority
    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Number of resting orders
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Total resting amount
    pub fn total_amount(&self) -> u64 {
        self.orders.values().map(|o| o.amount).sum()
    }
}
