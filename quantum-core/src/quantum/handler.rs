//! Quantum handler: the single writer of the execution state
//!
//! This module implements the single-writer pattern with a Tokio actor:
//! - one task owns every state mutation, so apex order is commit order
//! - validation and commit happen under a short synchronous write lock
//! - persistence and network I/O run after the lock is released
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   Clients / auditors / snapshot scheduler            │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               QuantumHandle (Clone)                   │
//! │  witness: verify alpha signature, buffer by apex      │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              QuantumHandler (single task)             │
//! │  leader: assign apex, execute, sign, persist, send    │
//! │  witness: drain apex+1.., execute, persist, sign      │
//! └───────────────────────────────────────────────────────┘
//! ```

use super::{QuantumProcessingQueue, Role};
use crate::app_state::{ApplicationState, StateManager};
use crate::crypto::KeyPair;
use crate::effects::Effect;
use crate::error::ResultStatus;
use crate::messages::{Envelope, Message, Quantum, QuantumKind, ResultMessage};
use crate::metrics::Metrics;
use crate::ports::{Persistence, Transport};
use crate::processors::{self, Executed};
use crate::snapshot::Snapshot;
use crate::state::ExecutionState;
use crate::types::PublicKey;
use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Work submitted to the handler
#[derive(Debug, Clone)]
pub enum HandlerInput {
    /// Leader: signed client request
    Request(Envelope),
    /// Leader: auditor-signed ledger update
    LedgerUpdate(Envelope),
    /// Leader: freeze the state into a snapshot
    Snapshot,
    /// Witness: quantum sequenced and signed by the leader
    Quantum(Envelope),
}

/// Outcome of one applied quantum
#[derive(Debug, Clone)]
pub struct ProcessedQuantum {
    /// Applied apex
    pub apex: u64,
    /// Sequenced quantum, signed by the leader
    pub quantum: Envelope,
    /// Result, signed by this node
    pub result: Envelope,
    /// Processing status (witnesses record rejected quanta as applied)
    pub status: ResultStatus,
    /// Committed effects
    pub effects: Vec<Effect>,
    /// Snapshot produced by a snapshot quantum
    pub snapshot: Option<Snapshot>,
}

type Responder = oneshot::Sender<Result<ProcessedQuantum>>;

/// Witness callers waiting for an apex, registered before the quantum is queued
type Waiters = Arc<DashMap<u64, Responder>>;

/// Message sent to the handler actor
enum HandlerMessage {
    /// Leader: sequence and apply new work
    Sequence {
        input: HandlerInput,
        response: Option<Responder>,
    },

    /// Witness: apply buffered quanta in apex order
    Drain,

    /// Replace the state with a snapshot and replay quanta after it
    Setup {
        snapshot: Box<Snapshot>,
        pending: Vec<Envelope>,
        response: oneshot::Sender<Result<()>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Collaborators of the handler
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Node role
    pub role: Role,
    /// Node signing key
    pub keypair: KeyPair,
    /// Lifecycle state
    pub state_manager: Arc<StateManager>,
    /// Durable storage
    pub persistence: Arc<dyn Persistence>,
    /// Node transport
    pub transport: Arc<dyn Transport>,
    /// Metrics
    pub metrics: Metrics,
}

/// Actor that owns state mutation
struct QuantumHandler {
    ctx: HandlerContext,
    state: Arc<RwLock<ExecutionState>>,
    queue: Arc<QuantumProcessingQueue>,
    applied: watch::Sender<u64>,
    mailbox: mpsc::Receiver<HandlerMessage>,
    waiters: Waiters,
    initialized: bool,
    last_gap_request: Option<(u64, u64)>,
}

impl QuantumHandler {
    async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                HandlerMessage::Shutdown => break,
                HandlerMessage::Sequence { input, response } => {
                    let outcome = self.sequence(input).await;
                    self.check_fatal(&outcome);
                    match response {
                        Some(response) => {
                            let _ = response.send(outcome);
                        }
                        None => {
                            if let Err(e) = outcome {
                                tracing::debug!(error = %e, "Leader input rejected");
                            }
                        }
                    }
                }
                HandlerMessage::Drain => self.drain().await,
                HandlerMessage::Setup {
                    snapshot,
                    pending,
                    response,
                } => {
                    let outcome = self.setup(*snapshot, pending);
                    if let Err(e) = &outcome {
                        tracing::error!(error = %e, "Handler setup failed");
                    }
                    let _ = response.send(outcome);
                    self.drain().await;
                }
            }
        }
        tracing::info!(role = %self.ctx.role, "Quantum handler stopped");
    }

    fn check_fatal<T>(&self, outcome: &Result<T>) {
        if let Err(e) = outcome {
            if e.is_fatal() {
                self.ctx.state_manager.fail(&e.to_string());
            }
        }
    }

    fn apex(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Leader: assign the next apex, apply, persist and publish
    async fn sequence(&mut self, input: HandlerInput) -> Result<ProcessedQuantum> {
        let app_state = self.ctx.state_manager.state();
        if self.ctx.role != Role::Leader || !self.initialized || !app_state.accepts_requests() {
            return Err(Error::InvalidState(format!(
                "{} in state {} cannot sequence quanta",
                self.ctx.role, app_state
            )));
        }

        let request = match &input {
            HandlerInput::Request(envelope) => Some(envelope.clone()),
            _ => None,
        };

        let executed = {
            let mut state = self.state.write();
            let apex = state.apex + 1;
            let kind = match input {
                HandlerInput::Request(envelope) => QuantumKind::Request(Box::new(envelope)),
                HandlerInput::LedgerUpdate(envelope) => {
                    QuantumKind::LedgerCommit(Box::new(envelope))
                }
                HandlerInput::Snapshot => QuantumKind::Snapshot {
                    hash: state.to_snapshot(apex).compute_hash()?,
                },
                HandlerInput::Quantum(_) => {
                    return Err(Error::InvalidState(
                        "Leader does not accept sequenced quanta".to_string(),
                    ))
                }
            };
            let quantum = Quantum {
                apex,
                timestamp: chrono::Utc::now().timestamp_millis(),
                kind,
            };
            processors::execute(&mut state, &quantum).map(|executed| (quantum, executed))
        };

        let (quantum, executed) = match executed {
            Ok(done) => done,
            Err(e) => {
                self.ctx.metrics.record_rejection();
                if let Some(request) = request {
                    self.notify_rejection(request, &e).await;
                }
                return Err(e);
            }
        };

        let apex = quantum.apex;
        let quantum = Envelope::signed(Message::Quantum(quantum), &self.ctx.keypair)?;
        let processed = self
            .complete(apex, quantum, ResultStatus::Success, executed)
            .await?;

        if let Err(e) = self.ctx.transport.broadcast_quantum(&processed.quantum).await {
            tracing::warn!(apex, error = %e, "Failed to broadcast quantum");
        }
        if let Some(requester) = requester(&processed) {
            if let Err(e) = self.ctx.transport.notify_client(&requester, &processed.result).await {
                tracing::warn!(apex, account = %requester, error = %e, "Failed to notify client");
            }
        }
        Ok(processed)
    }

    /// Send an unsequenced failure result to the requesting client
    async fn notify_rejection(&self, request: Envelope, error: &Error) {
        let Some(account) = request.message.as_request().map(|r| *r.account()) else {
            return;
        };
        tracing::debug!(account = %account, error = %error, "Request rejected");
        let result = ResultMessage {
            original: Box::new(request),
            status: error.status(),
            effects: Vec::new(),
            account: None,
        };
        match Envelope::signed(Message::Result(result), &self.ctx.keypair) {
            Ok(result) => {
                if let Err(e) = self.ctx.transport.notify_client(&account, &result).await {
                    tracing::warn!(account = %account, error = %e, "Failed to notify client");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to sign rejection"),
        }
    }

    /// Sign the result, persist and advance the applied apex
    async fn complete(
        &mut self,
        apex: u64,
        quantum: Envelope,
        status: ResultStatus,
        executed: Executed,
    ) -> Result<ProcessedQuantum> {
        let result = Envelope::signed(
            Message::Result(ResultMessage {
                original: Box::new(quantum.clone()),
                status,
                effects: executed.visible_effects(),
                account: executed.account_data.clone(),
            }),
            &self.ctx.keypair,
        )?;

        self.ctx
            .persistence
            .save_effects(&quantum, &executed.effects)
            .await?;

        self.applied.send_replace(apex);
        self.ctx.metrics.record_quantum(apex, executed.effects.len());
        tracing::debug!(
            role = %self.ctx.role,
            apex,
            status = ?status,
            effects = executed.effects.len(),
            "Quantum applied"
        );

        Ok(ProcessedQuantum {
            apex,
            quantum,
            result,
            status,
            effects: executed.effects,
            snapshot: executed.snapshot,
        })
    }

    /// Witness: apply buffered quanta while the next apex is present
    async fn drain(&mut self) {
        if !self.initialized || self.ctx.role != Role::Witness {
            return;
        }
        loop {
            if self.ctx.state_manager.is_failed() {
                return;
            }
            let next = self.apex() + 1;
            let Some(envelope) = self.queue.take(next) else {
                break;
            };
            let outcome = self.apply_sequenced(next, envelope).await;
            // A copy re-queued while this one was in flight
            self.queue.take(next);
            self.check_fatal(&outcome);
            let fatal = matches!(&outcome, Err(e) if e.is_fatal());
            if let Some((_, waiter)) = self.waiters.remove(&next) {
                let _ = waiter.send(outcome);
            }
            if fatal {
                return;
            }
        }
        self.request_missing().await;
    }

    async fn apply_sequenced(&mut self, apex: u64, envelope: Envelope) -> Result<ProcessedQuantum> {
        let quantum = envelope
            .message
            .as_quantum()
            .ok_or_else(|| Error::BadRequest("Envelope does not carry a quantum".to_string()))?
            .clone();

        let outcome = {
            let mut state = self.state.write();
            match processors::execute(&mut state, &quantum) {
                Ok(executed) => Ok((ResultStatus::Success, executed)),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    // Divergence from the leader surfaces as a snapshot hash mismatch
                    state.apex = apex;
                    Ok((e.status(), Executed::default()))
                }
            }
        };
        let (status, executed) = outcome?;
        if !status.is_success() {
            self.ctx.metrics.record_rejection();
            tracing::warn!(apex, kind = quantum.kind.name(), status = ?status, "Sequenced quantum rejected");
        }

        let processed = self.complete(apex, envelope, status, executed).await?;
        if let Err(e) = self.ctx.transport.send_to_alpha(&processed.result).await {
            tracing::warn!(apex, error = %e, "Failed to send result to alpha");
        }
        Ok(processed)
    }

    async fn request_missing(&mut self) {
        let Some((from, to)) = self.queue.missing_range(self.apex()) else {
            self.last_gap_request = None;
            return;
        };
        if self.last_gap_request == Some((from, to)) {
            return;
        }
        self.last_gap_request = Some((from, to));
        tracing::info!(from, to, "Requesting missing quanta");
        if let Err(e) = self.ctx.transport.request_quanta(from, to).await {
            tracing::warn!(from, to, error = %e, "Failed to request missing quanta");
        }
    }

    /// Rebuild the state from a snapshot and replay later quanta without
    /// publishing them again
    fn setup(&mut self, snapshot: Snapshot, mut pending: Vec<Envelope>) -> Result<()> {
        let mut restored = ExecutionState::from_snapshot(&snapshot)?;
        pending.sort_by_key(quantum_apex);

        for envelope in &pending {
            let Some(quantum) = envelope.message.as_quantum() else {
                continue;
            };
            if quantum.apex <= restored.apex {
                continue;
            }
            match processors::execute(&mut restored, quantum) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(apex = quantum.apex, error = %e, "Replayed quantum rejected");
                    restored.apex = quantum.apex;
                }
            }
        }

        let apex = restored.apex;
        *self.state.write() = restored;
        self.queue.restart_after(apex);
        self.waiters.retain(|waiting, _| *waiting > apex);
        self.applied.send_replace(apex);
        self.ctx.metrics.current_apex.set(apex as i64);
        self.initialized = true;
        self.last_gap_request = None;

        tracing::info!(
            role = %self.ctx.role,
            snapshot = snapshot.apex,
            apex,
            replayed = pending.len(),
            "Handler state restored"
        );
        Ok(())
    }
}

fn quantum_apex(envelope: &Envelope) -> u64 {
    envelope.message.as_quantum().map(|q| q.apex).unwrap_or(0)
}

fn requester(processed: &ProcessedQuantum) -> Option<PublicKey> {
    match &processed.quantum.message {
        Message::Quantum(Quantum {
            kind: QuantumKind::Request(request),
            ..
        }) => request.message.as_request().map(|r| *r.account()),
        _ => None,
    }
}

/// Handle for sending work to the handler
#[derive(Debug, Clone)]
pub struct QuantumHandle {
    role: Role,
    sender: mpsc::Sender<HandlerMessage>,
    state: Arc<RwLock<ExecutionState>>,
    queue: Arc<QuantumProcessingQueue>,
    waiters: Waiters,
    applied: watch::Receiver<u64>,
    state_manager: Arc<StateManager>,
}

impl std::fmt::Debug for HandlerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerMessage::Sequence { input, .. } => f.debug_tuple("Sequence").field(input).finish(),
            HandlerMessage::Drain => f.write_str("Drain"),
            HandlerMessage::Setup { snapshot, .. } => {
                f.debug_tuple("Setup").field(&snapshot.apex).finish()
            }
            HandlerMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl QuantumHandle {
    /// Node role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Submit without waiting for the result
    pub async fn handle(&self, input: HandlerInput) -> Result<()> {
        let msg = self.message(input, None)?;
        self.send(msg).await
    }

    /// Submit and wait until the quantum is applied
    pub async fn handle_async(&self, input: HandlerInput) -> Result<ProcessedQuantum> {
        let (tx, rx) = oneshot::channel();
        let msg = self.message(input, Some(tx))?;
        self.send(msg).await?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    fn message(&self, input: HandlerInput, response: Option<Responder>) -> Result<HandlerMessage> {
        match (self.role, input) {
            (Role::Witness, HandlerInput::Quantum(envelope)) => {
                self.enqueue(envelope, response)?;
                Ok(HandlerMessage::Drain)
            }
            (Role::Witness, _) => Err(Error::InvalidState(
                "Witness only applies sequenced quanta".to_string(),
            )),
            (Role::Leader, input) => Ok(HandlerMessage::Sequence { input, response }),
        }
    }

    /// Witness pre-validation: leader signature, apex not yet applied
    fn enqueue(&self, envelope: Envelope, response: Option<Responder>) -> Result<u64> {
        let app_state = self.state_manager.state();
        if matches!(app_state, ApplicationState::WaitingForInit | ApplicationState::Failed) {
            return Err(Error::InvalidState(format!(
                "Cannot accept quanta in state {}",
                app_state
            )));
        }

        let apex = envelope
            .message
            .as_quantum()
            .map(|q| q.apex)
            .ok_or_else(|| Error::BadRequest("Envelope does not carry a quantum".to_string()))?;
        let alpha = *self.state.read().settings.alpha();
        if !envelope.is_signed_by(&alpha)? {
            return Err(Error::Unauthorized(format!(
                "Quantum {} is not signed by alpha",
                apex
            )));
        }
        if apex <= self.current_apex() {
            return Err(Error::BadRequest(format!("Quantum {} is already applied", apex)));
        }
        if self.queue.contains(apex) {
            return Err(Error::BadRequest(format!("Quantum {} is already queued", apex)));
        }
        if let Some(response) = response {
            self.waiters.insert(apex, response);
        }
        self.queue.add(apex, envelope);
        Ok(apex)
    }

    async fn send(&self, msg: HandlerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Concurrency("Handler mailbox closed".to_string()))
    }

    /// Replace the state with `snapshot` and replay `pending` quanta after it
    pub async fn setup(&self, snapshot: Snapshot, pending: Vec<Envelope>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(HandlerMessage::Setup {
            snapshot: Box::new(snapshot),
            pending,
            response: tx,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Last applied apex
    pub fn current_apex(&self) -> u64 {
        *self.applied.borrow()
    }

    /// Highest apex received from the leader
    pub fn last_added_apex(&self) -> u64 {
        self.queue.last_added_apex()
    }

    /// Check if `apex` is buffered and waiting for its turn
    pub fn is_queued(&self, apex: u64) -> bool {
        self.queue.contains(apex)
    }

    /// Wait until `apex` is applied
    pub async fn wait_for_apex(&self, apex: u64) -> Result<()> {
        let mut applied = self.applied.clone();
        applied
            .wait_for(|current| *current >= apex)
            .await
            .map(|_| ())
            .map_err(|_| Error::Concurrency("Quantum handler stopped".to_string()))
    }

    /// Read the execution state
    pub fn read<R>(&self, f: impl FnOnce(&ExecutionState) -> R) -> R {
        f(&self.state.read())
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.send(HandlerMessage::Shutdown).await
    }
}

/// Spawn the handler with an initial state
///
/// Nothing is applied until [`QuantumHandle::setup`] loads a snapshot.
pub fn spawn_quantum_handler(
    ctx: HandlerContext,
    initial: ExecutionState,
    mailbox_capacity: usize,
) -> QuantumHandle {
    let (tx, rx) = mpsc::channel(mailbox_capacity);
    let apex = initial.apex;
    let (applied, applied_rx) = watch::channel(apex);
    let state = Arc::new(RwLock::new(initial));
    let queue = Arc::new(QuantumProcessingQueue::new(apex));
    let waiters: Waiters = Arc::new(DashMap::new());

    let handle = QuantumHandle {
        role: ctx.role,
        sender: tx,
        state: state.clone(),
        queue: queue.clone(),
        waiters: waiters.clone(),
        applied: applied_rx,
        state_manager: ctx.state_manager.clone(),
    };

    let actor = QuantumHandler {
        ctx,
        state,
        queue,
        applied,
        mailbox: rx,
        waiters,
        initialized: false,
        last_gap_request: None,
    };

    tokio::spawn(async move {
        actor.run().await;
    });

    handle
}
