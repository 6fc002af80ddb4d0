//! Quantum processors
//!
//! `execute` is the single entry point used by the quantum handler while it
//! holds the state write lock:
//!
//! ```text
//! Quantum ──► validate (read-only) ──► stage effects ──► Container::commit
//!                  │                                          │
//!                  └── Err: nothing staged or committed       └── apex, ledger, snapshot hash advance
//! ```

pub mod ledger;
pub mod order;
pub mod payment;
pub mod snapshot;

use crate::effects::{Effect, EffectProcessorsContainer};
use crate::messages::{Envelope, Quantum, QuantumKind, RequestMessage};
use crate::snapshot::Snapshot;
use crate::state::ExecutionState;
use crate::types::{Account, PublicKey};
use crate::{Error, Result};

/// Client request handling
pub trait RequestProcessor {
    /// Request-specific checks against the current state
    fn validate(&self, state: &ExecutionState) -> Result<()>;

    /// Stage the effects of an already validated request
    fn process(
        &self,
        apex: u64,
        state: &ExecutionState,
        container: &mut EffectProcessorsContainer,
    ) -> Result<()>;
}

/// Result of executing one quantum
#[derive(Debug, Clone, Default)]
pub struct Executed {
    /// Committed effects
    pub effects: Vec<Effect>,
    /// Requesting account for client requests
    pub requester: Option<PublicKey>,
    /// Account data returned to the requester
    pub account_data: Option<Account>,
    /// Snapshot taken by a snapshot quantum
    pub snapshot: Option<Snapshot>,
}

impl Executed {
    /// Effects visible to the requester (all effects for system quanta)
    pub fn visible_effects(&self) -> Vec<Effect> {
        match &self.requester {
            Some(account) => self
                .effects
                .iter()
                .filter(|e| &e.account == account)
                .cloned()
                .collect(),
            None => self.effects.clone(),
        }
    }
}

/// Check that `nonce` is above the account nonce
pub fn validate_nonce<'a>(
    state: &'a ExecutionState,
    account: &PublicKey,
    nonce: u64,
) -> Result<&'a Account> {
    let existing = state
        .accounts
        .get_account(account)
        .ok_or(Error::AccountNotFound(*account))?;
    if nonce <= existing.nonce {
        return Err(Error::InvalidNonce {
            current: existing.nonce,
            received: nonce,
        });
    }
    Ok(existing)
}

/// Verify the stateless parts of a client request envelope
pub fn prevalidate_request(envelope: &Envelope) -> Result<&RequestMessage> {
    let request = envelope
        .message
        .as_request()
        .ok_or_else(|| Error::BadRequest("Envelope does not carry a request".to_string()))?;
    if !envelope.is_signed_by(request.account())? {
        return Err(Error::Unauthorized(format!(
            "Request is not signed by {}",
            request.account()
        )));
    }
    Ok(request)
}

fn processor(request: &RequestMessage) -> &dyn RequestProcessor {
    match request {
        RequestMessage::Order(r) => r,
        RequestMessage::OrderCancellation(r) => r,
        RequestMessage::Payment(r) => r,
        RequestMessage::Withdrawal(r) => r,
        RequestMessage::AccountData(r) => r,
    }
}

fn stage_request(
    envelope: &Envelope,
    apex: u64,
    state: &ExecutionState,
    container: &mut EffectProcessorsContainer,
) -> Result<PublicKey> {
    let request = prevalidate_request(envelope)?;
    let account = validate_nonce(state, request.account(), request.nonce())?;
    let processor = processor(request);
    processor.validate(state)?;

    container.add_nonce_update(account.pubkey, request.nonce(), account.nonce);
    processor.process(apex, state, container)?;
    Ok(account.pubkey)
}

/// Validate, stage and commit one quantum
///
/// On error nothing is left committed. The caller decides whether the apex
/// still advances (witnesses record rejected quanta as applied).
pub fn execute(state: &mut ExecutionState, quantum: &Quantum) -> Result<Executed> {
    let apex = quantum.apex;
    if apex != state.apex + 1 {
        return Err(Error::InvariantViolation(format!(
            "Quantum apex {} does not follow applied apex {}",
            apex, state.apex
        )));
    }

    let mut container = EffectProcessorsContainer::new(apex);
    let mut executed = Executed::default();
    let mut ledger = None;

    match &quantum.kind {
        QuantumKind::Request(envelope) => {
            executed.requester = Some(stage_request(envelope, apex, state, &mut container)?);
        }
        QuantumKind::LedgerCommit(envelope) => {
            ledger = Some(ledger::stage(envelope, apex, state, &mut container)?);
        }
        QuantumKind::Snapshot { hash } => {
            executed.snapshot = Some(snapshot::take(state, apex, hash)?);
        }
        QuantumKind::ConstellationInit { .. } => {
            return Err(Error::InvalidState(
                "Constellation is already initialized".to_string(),
            ));
        }
    }

    executed.effects = container.commit(state)?;

    if let Some(ledger) = ledger {
        state.ledger = ledger;
    }
    if let Some(snapshot) = &executed.snapshot {
        state.last_snapshot_hash = snapshot.compute_hash()?;
        state.last_snapshot_apex = apex;
    }
    if let (Some(account), Some(RequestMessage::AccountData(_))) = (
        executed.requester,
        quantum_request(quantum),
    ) {
        executed.account_data = state.accounts.get_account(&account).cloned();
    }
    state.apex = apex;
    Ok(executed)
}

fn quantum_request(quantum: &Quantum) -> Option<&RequestMessage> {
    match &quantum.kind {
        QuantumKind::Request(envelope) => envelope.message.as_request(),
        _ => None,
    }
}
