//! Ledger commit: applies external ledger observations relayed by auditors
//!
//! Deposits credit accounts (opening them when the quote deposit covers the
//! minimal balance). Withdrawal outcomes release the locked amount and, on
//! success, debit it. Payments that cannot be applied are skipped with a
//! warning so the ledger cursor keeps moving.

use crate::effects::{EffectProcessorsContainer, UpdateSign};
use crate::messages::{Envelope, LedgerPayment, LedgerUpdateNotification};
use crate::state::ExecutionState;
use crate::types::{AssetId, PublicKey, QUOTE_ASSET};
use crate::{Error, Result};
use std::collections::BTreeSet;

/// Check signer and sequence of a ledger update
pub fn validate<'a>(
    envelope: &'a Envelope,
    state: &ExecutionState,
) -> Result<&'a LedgerUpdateNotification> {
    let update = envelope.message.as_ledger_update().ok_or_else(|| {
        Error::BadRequest("Envelope does not carry a ledger update".to_string())
    })?;

    let signed_by_auditor = envelope
        .valid_signers()?
        .iter()
        .any(|signer| state.settings.is_auditor(signer));
    if !signed_by_auditor {
        return Err(Error::Unauthorized(
            "Ledger update is not signed by a known auditor".to_string(),
        ));
    }

    if update.ledger != state.ledger + 1 {
        return Err(Error::BadRequest(format!(
            "Ledger {} does not follow committed ledger {}",
            update.ledger, state.ledger
        )));
    }
    Ok(update)
}

/// Stage the effects of a ledger update, returning the new ledger sequence
pub fn stage(
    envelope: &Envelope,
    apex: u64,
    state: &ExecutionState,
    container: &mut EffectProcessorsContainer,
) -> Result<u64> {
    let update = validate(envelope, state)?;
    let mut staging = Staging {
        state,
        container,
        created_accounts: BTreeSet::new(),
        created_balances: BTreeSet::new(),
        resolved: BTreeSet::new(),
    };

    for payment in &update.payments {
        match payment {
            LedgerPayment::Deposit {
                account,
                asset,
                amount,
                ..
            } => staging.deposit(*account, *asset, *amount),
            LedgerPayment::Withdrawal {
                transaction_hash,
                success,
            } => staging.withdrawal(transaction_hash, *success),
        }
    }

    tracing::debug!(
        apex,
        ledger = update.ledger,
        payments = update.payments.len(),
        "Ledger update staged"
    );
    Ok(update.ledger)
}

struct Staging<'a> {
    state: &'a ExecutionState,
    container: &'a mut EffectProcessorsContainer,
    created_accounts: BTreeSet<PublicKey>,
    created_balances: BTreeSet<(PublicKey, AssetId)>,
    resolved: BTreeSet<[u8; 32]>,
}

impl Staging<'_> {
    fn deposit(&mut self, account: PublicKey, asset: AssetId, amount: u64) {
        if amount == 0 || !self.state.settings.has_asset(asset) {
            tracing::warn!(account = %account, asset, amount, "Skipping unsupported deposit");
            return;
        }

        let existing = self.state.accounts.get_account(&account);
        if existing.is_none() && !self.created_accounts.contains(&account) {
            if asset != QUOTE_ASSET || amount < self.state.settings.min_account_balance {
                tracing::warn!(
                    account = %account,
                    asset,
                    amount,
                    "Deposit cannot open an account"
                );
                return;
            }
            self.container.add_account_create(account);
            self.created_accounts.insert(account);
        }

        let has_balance = existing.map(|a| a.balance(asset).is_some()).unwrap_or(false);
        if !has_balance && self.created_balances.insert((account, asset)) {
            self.container.add_balance_create(account, asset);
        }
        self.container
            .add_balance_update(account, asset, amount, UpdateSign::Plus);
    }

    fn withdrawal(&mut self, transaction_hash: &[u8; 32], success: bool) {
        let withdrawal = match self.state.withdrawals.get(transaction_hash) {
            Some(w) if !self.resolved.contains(transaction_hash) => w.clone(),
            _ => {
                tracing::warn!(
                    transaction = %hex::encode(transaction_hash),
                    "Skipping unknown withdrawal"
                );
                return;
            }
        };
        self.resolved.insert(*transaction_hash);

        self.container
            .add_unlock_liabilities(withdrawal.source, withdrawal.asset, withdrawal.amount);
        if success {
            self.container.add_balance_update(
                withdrawal.source,
                withdrawal.asset,
                withdrawal.amount,
                UpdateSign::Minus,
            );
        }
        self.container.add_withdrawal_remove(withdrawal);
    }
}
