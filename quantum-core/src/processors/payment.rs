//! Payments, withdrawals and account queries

use super::RequestProcessor;
use crate::effects::{EffectProcessorsContainer, UpdateSign};
use crate::messages::{AccountDataRequest, PaymentRequest, WithdrawalRequest};
use crate::state::ExecutionState;
use crate::types::{AssetId, PublicKey};
use crate::withdrawals::build_withdrawal;
use crate::{Error, Result};

fn validate_transfer(
    state: &ExecutionState,
    source: &PublicKey,
    asset: AssetId,
    amount: u64,
) -> Result<()> {
    if amount == 0 {
        return Err(Error::BadRequest("Amount must be positive".to_string()));
    }
    if !state.settings.has_asset(asset) {
        return Err(Error::UnknownAsset(asset));
    }
    let available = state
        .accounts
        .get_account(source)
        .ok_or(Error::AccountNotFound(*source))?
        .available(asset);
    if available < amount {
        return Err(Error::InsufficientBalance {
            asset,
            required: amount,
            available,
        });
    }
    Ok(())
}

fn validate_withdrawal(state: &ExecutionState, source: &PublicKey) -> Result<()> {
    if state.withdrawals.has_pending(source) {
        return Err(Error::BadRequest(format!(
            "Account {} already has a pending withdrawal",
            source
        )));
    }
    Ok(())
}

fn stage_withdrawal(
    apex: u64,
    source: PublicKey,
    destination: PublicKey,
    asset: AssetId,
    amount: u64,
    container: &mut EffectProcessorsContainer,
) -> Result<()> {
    let withdrawal = build_withdrawal(apex, source, destination, asset, amount)?;
    container.add_lock_liabilities(source, asset, amount);
    container.add_withdrawal_create(withdrawal);
    Ok(())
}

impl RequestProcessor for PaymentRequest {
    fn validate(&self, state: &ExecutionState) -> Result<()> {
        if self.destination == self.account {
            return Err(Error::BadRequest(
                "Source and destination must differ".to_string(),
            ));
        }
        if self.destination.is_zero() {
            return Err(Error::BadRequest("Destination is not set".to_string()));
        }
        validate_transfer(state, &self.account, self.asset, self.amount)?;
        if !state.accounts.contains(&self.destination) {
            validate_withdrawal(state, &self.account)?;
        }
        Ok(())
    }

    fn process(
        &self,
        apex: u64,
        state: &ExecutionState,
        container: &mut EffectProcessorsContainer,
    ) -> Result<()> {
        match state.accounts.get_account(&self.destination) {
            Some(destination) => {
                if destination.balance(self.asset).is_none() {
                    container.add_balance_create(self.destination, self.asset);
                }
                container.add_balance_update(self.account, self.asset, self.amount, UpdateSign::Minus);
                container.add_balance_update(self.destination, self.asset, self.amount, UpdateSign::Plus);
            }
            None => {
                tracing::debug!(
                    apex,
                    destination = %self.destination,
                    "Payment destination is external, creating withdrawal"
                );
                stage_withdrawal(
                    apex,
                    self.account,
                    self.destination,
                    self.asset,
                    self.amount,
                    container,
                )?;
            }
        }
        Ok(())
    }
}

impl RequestProcessor for WithdrawalRequest {
    fn validate(&self, state: &ExecutionState) -> Result<()> {
        if self.destination.is_zero() {
            return Err(Error::BadRequest("Destination is not set".to_string()));
        }
        validate_transfer(state, &self.account, self.asset, self.amount)?;
        validate_withdrawal(state, &self.account)
    }

    fn process(
        &self,
        apex: u64,
        _state: &ExecutionState,
        container: &mut EffectProcessorsContainer,
    ) -> Result<()> {
        stage_withdrawal(
            apex,
            self.account,
            self.destination,
            self.asset,
            self.amount,
            container,
        )
    }
}

impl RequestProcessor for AccountDataRequest {
    fn validate(&self, _state: &ExecutionState) -> Result<()> {
        Ok(())
    }

    fn process(
        &self,
        _apex: u64,
        _state: &ExecutionState,
        _container: &mut EffectProcessorsContainer,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::effects::EffectKind;
    use crate::messages::RequestMessage;
    use crate::processors::execute;
    use crate::processors::test_support::{funded_state, request_quantum};
    use crate::types::QUOTE_ASSET;

    fn payment(from: &KeyPair, to: PublicKey, nonce: u64, amount: u64) -> RequestMessage {
        RequestMessage::Payment(PaymentRequest {
            account: from.public_key(),
            nonce,
            destination: to,
            asset: QUOTE_ASSET,
            amount,
            memo: Some("rent".to_string()),
        })
    }

    #[test]
    fn test_internal_payment() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut state = funded_state(&[(&alice, 100, 0), (&bob, 0, 0)]);

        execute(&mut state, &request_quantum(2, &alice, payment(&alice, bob.public_key(), 1, 30))).unwrap();

        assert_eq!(state.accounts.get_account(&alice.public_key()).unwrap().available(QUOTE_ASSET), 70);
        assert_eq!(state.accounts.get_account(&bob.public_key()).unwrap().available(QUOTE_ASSET), 30);
        assert!(state.withdrawals.is_empty());
    }

    #[test]
    fn test_payment_validation() {
        let alice = KeyPair::generate();
        let mut state = funded_state(&[(&alice, 100, 0)]);

        let to_self = execute(&mut state, &request_quantum(2, &alice, payment(&alice, alice.public_key(), 1, 1)));
        assert!(matches!(to_self, Err(Error::BadRequest(_))));

        let zero = execute(&mut state, &request_quantum(2, &alice, payment(&alice, PublicKey::from_bytes([5u8; 32]), 1, 0)));
        assert!(matches!(zero, Err(Error::BadRequest(_))));

        let too_much = execute(&mut state, &request_quantum(2, &alice, payment(&alice, PublicKey::from_bytes([5u8; 32]), 1, 101)));
        assert!(matches!(too_much, Err(Error::InsufficientBalance { .. })));
    }

    #[test]
    fn test_external_payment_becomes_withdrawal() {
        let alice = KeyPair::generate();
        let external = PublicKey::from_bytes([5u8; 32]);
        let mut state = funded_state(&[(&alice, 100, 0)]);

        let executed = execute(&mut state, &request_quantum(2, &alice, payment(&alice, external, 1, 40))).unwrap();
        assert!(executed
            .effects
            .iter()
            .any(|e| matches!(e.kind, EffectKind::WithdrawalCreate(_))));

        let balance = state.accounts.get_account(&alice.public_key()).unwrap().balance(QUOTE_ASSET).unwrap().clone();
        assert_eq!(balance.amount, 100);
        assert_eq!(balance.liabilities, 40);
        assert_eq!(state.withdrawals.len(), 1);

        // One pending withdrawal per account
        let second = RequestMessage::Withdrawal(WithdrawalRequest {
            account: alice.public_key(),
            nonce: 2,
            destination: external,
            asset: QUOTE_ASSET,
            amount: 10,
        });
        assert!(matches!(
            execute(&mut state, &request_quantum(3, &alice, second)),
            Err(Error::BadRequest(_))
        ));
    }
}
