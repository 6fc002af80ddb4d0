//! Order placement and cancellation

use super::RequestProcessor;
use crate::effects::EffectProcessorsContainer;
use crate::exchange::matcher::IncomingOrder;
use crate::exchange::{decode_order_id, encode_order_id, quote_amount, OrderMatcher};
use crate::messages::{OrderCancellationRequest, OrderRequest};
use crate::state::ExecutionState;
use crate::types::{AssetId, OrderSide, MAX_ASSET_ID, QUOTE_ASSET};
use crate::{Error, Result};
use rust_decimal::Decimal;

impl OrderRequest {
    /// Asset and amount locked for this order
    pub fn liability(&self) -> Result<(AssetId, u64)> {
        match self.side {
            OrderSide::Sell => Ok((self.asset, self.amount)),
            OrderSide::Buy => Ok((QUOTE_ASSET, quote_amount(self.amount, self.price)?)),
        }
    }
}

impl RequestProcessor for OrderRequest {
    fn validate(&self, state: &ExecutionState) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::BadRequest("Order amount must be positive".to_string()));
        }
        if self.amount < state.settings.min_allowed_lot_size {
            return Err(Error::BadRequest(format!(
                "Order amount {} is below the minimal lot size {}",
                self.amount, state.settings.min_allowed_lot_size
            )));
        }
        if self.price <= Decimal::ZERO {
            return Err(Error::BadRequest("Order price must be positive".to_string()));
        }
        if self.asset == QUOTE_ASSET
            || self.asset > MAX_ASSET_ID
            || !state.settings.has_asset(self.asset)
        {
            return Err(Error::UnknownAsset(self.asset));
        }

        let (asset, locked) = self.liability()?;
        if locked == 0 {
            return Err(Error::BadRequest(
                "Order quote amount rounds down to zero".to_string(),
            ));
        }
        let available = state
            .accounts
            .get_account(&self.account)
            .map(|a| a.available(asset))
            .unwrap_or(0);
        if available < locked {
            return Err(Error::InsufficientBalance {
                asset,
                required: locked,
                available,
            });
        }
        Ok(())
    }

    fn process(
        &self,
        apex: u64,
        state: &ExecutionState,
        container: &mut EffectProcessorsContainer,
    ) -> Result<()> {
        let (asset, locked) = self.liability()?;
        container.add_lock_liabilities(self.account, asset, locked);

        let summary = OrderMatcher::new(state, container).process(IncomingOrder {
            account: self.account,
            order_id: encode_order_id(self.asset, self.side, apex)?,
            price: self.price.normalize(),
            amount: self.amount,
            time_in_force: self.time_in_force,
        })?;

        tracing::debug!(
            apex,
            account = %self.account,
            side = %self.side,
            traded = summary.traded,
            placed = summary.placed,
            "Order processed"
        );
        Ok(())
    }
}

impl RequestProcessor for OrderCancellationRequest {
    fn validate(&self, state: &ExecutionState) -> Result<()> {
        let order = state
            .exchange
            .get_order(self.order_id)
            .ok_or(Error::OrderNotFound(self.order_id))?;
        if order.account != self.account {
            return Err(Error::Unauthorized(format!(
                "Order {} does not belong to {}",
                self.order_id, self.account
            )));
        }
        Ok(())
    }

    fn process(
        &self,
        _apex: u64,
        state: &ExecutionState,
        container: &mut EffectProcessorsContainer,
    ) -> Result<()> {
        let order = state
            .exchange
            .get_order(self.order_id)
            .ok_or(Error::OrderNotFound(self.order_id))?
            .clone();
        let (asset, side, _) = decode_order_id(order.order_id);
        let (locked_asset, locked) = match side {
            OrderSide::Sell => (asset, order.amount),
            OrderSide::Buy => (QUOTE_ASSET, quote_amount(order.amount, order.price)?),
        };

        container.add_order_removed(order);
        if locked > 0 {
            container.add_unlock_liabilities(self.account, locked_asset, locked);
        }
        Ok(())
    }
}
