//! Exchange: one market per asset, each with a bid and an ask book
//!
//! # Architecture
//!
//! ```text
//! Exchange
//!   └── Market (asset A quoted in asset 0)
//!         ├── bids: Orderbook (highest price first)
//!         ├── asks: Orderbook (lowest price first)
//!         └── last_price
//! ```
//!
//! The exchange is only mutated by effect processors. Matching reads the
//! books and stages effects, see [`matcher`].

pub mod matcher;
pub mod orderbook;

pub use matcher::OrderMatcher;
pub use orderbook::Orderbook;

use crate::types::{AssetId, AssetSettings, Order, OrderSide, MAX_ASSET_ID};
use crate::{Error, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const SIDE_BIT: u64 = 1 << 47;
const SEQUENCE_MASK: u64 = SIDE_BIT - 1;

/// Build an order id from asset, side and insertion sequence (the apex)
pub fn encode_order_id(asset: AssetId, side: OrderSide, sequence: u64) -> Result<u64> {
    if asset > MAX_ASSET_ID {
        return Err(Error::UnknownAsset(asset));
    }
    if sequence > SEQUENCE_MASK {
        return Err(Error::InvariantViolation(format!(
            "Order sequence {} out of range",
            sequence
        )));
    }
    let side_bit = match side {
        OrderSide::Buy => 0,
        OrderSide::Sell => SIDE_BIT,
    };
    Ok(((asset as u64) << 48) | side_bit | sequence)
}

/// Split an order id into asset, side and insertion sequence
pub fn decode_order_id(order_id: u64) -> (AssetId, OrderSide, u64) {
    let asset = (order_id >> 48) as AssetId;
    let side = if order_id & SIDE_BIT == 0 {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    };
    (asset, side, order_id & SEQUENCE_MASK)
}

/// Quote asset amount for `amount` units at `price`, rounded down
///
/// Rounding applies per fill: a fill whose notional is below one quote unit
/// settles for zero quote (one unit at 0.5 costs nothing). Orders whose full
/// amount quotes to zero are refused at validation, and the constellation's
/// `min_allowed_lot_size` bounds how small a resting remainder can be.
pub fn quote_amount(amount: u64, price: Decimal) -> Result<u64> {
    Decimal::from(amount)
        .checked_mul(price)
        .and_then(|total| total.floor().to_u64())
        .ok_or_else(|| {
            Error::BadRequest(format!("Quote amount overflow: {} x {}", amount, price))
        })
}

/// Last traded price of a market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketState {
    /// Asset
    pub asset: AssetId,
    /// Last traded price
    pub last_price: Decimal,
}

/// Market for one asset
#[derive(Debug, Clone)]
pub struct Market {
    /// Traded asset
    pub asset: AssetId,
    /// Buy orders
    pub bids: Orderbook,
    /// Sell orders
    pub asks: Orderbook,
    /// Price of the last trade
    pub last_price: Decimal,
}

impl Market {
    /// Empty market
    pub fn new(asset: AssetId) -> Self {
        Self {
            asset,
            bids: Orderbook::new(OrderSide::Buy),
            asks: Orderbook::new(OrderSide::Sell),
            last_price: Decimal::ZERO,
        }
    }

    /// Book holding orders of `side`
    pub fn book(&self, side: OrderSide) -> &Orderbook {
        match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        }
    }

    pub(crate) fn book_mut(&mut self, side: OrderSide) -> &mut Orderbook {
        match side {
            OrderSide::Buy => &mut self.bids,
            OrderSide::Sell => &mut self.asks,
        }
    }
}

/// All markets of the constellation
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    markets: BTreeMap<AssetId, Market>,
}

impl Exchange {
    /// Create markets for every registered asset
    pub fn new(assets: &[AssetSettings]) -> Self {
        Self {
            markets: assets.iter().map(|a| (a.id, Market::new(a.id))).collect(),
        }
    }

    /// Restore from snapshot orders and market states
    pub fn restore(
        assets: &[AssetSettings],
        orders: impl IntoIterator<Item = Order>,
        markets: &[MarketState],
    ) -> Result<Self> {
        let mut exchange = Self::new(assets);
        for state in markets {
            exchange.market_mut(state.asset)?.last_price = state.last_price;
        }
        for order in orders {
            exchange.add_order(order)?;
        }
        Ok(exchange)
    }

    /// Market for asset
    pub fn market(&self, asset: AssetId) -> Result<&Market> {
        self.markets.get(&asset).ok_or(Error::UnknownAsset(asset))
    }

    pub(crate) fn market_mut(&mut self, asset: AssetId) -> Result<&mut Market> {
        self.markets.get_mut(&asset).ok_or(Error::UnknownAsset(asset))
    }

    /// Look up an order by id
    pub fn get_order(&self, order_id: u64) -> Option<&Order> {
        let (asset, side, _) = decode_order_id(order_id);
        self.markets
            .get(&asset)
            .and_then(|m| m.book(side).get(order_id))
    }

    pub(crate) fn add_order(&mut self, order: Order) -> Result<()> {
        let (asset, side, _) = decode_order_id(order.order_id);
        self.market_mut(asset)?.book_mut(side).add(order)
    }

    pub(crate) fn remove_order(&mut self, order_id: u64) -> Result<Order> {
        let (asset, side, _) = decode_order_id(order_id);
        self.market_mut(asset)?.book_mut(side).remove(order_id)
    }

    pub(crate) fn get_order_mut(&mut self, order_id: u64) -> Result<&mut Order> {
        let (asset, side, _) = decode_order_id(order_id);
        self.market_mut(asset)?.book_mut(side).get_mut(order_id)
    }

    /// All resting orders sorted by order id
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .markets
            .values()
            .flat_map(|m| m.bids.iter().chain(m.asks.iter()))
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.order_id);
        orders
    }

    /// Last prices of all markets
    pub fn market_states(&self) -> Vec<MarketState> {
        self.markets
            .values()
            .map(|m| MarketState {
                asset: m.asset,
                last_price: m.last_price,
            })
            .collect()
    }
}
