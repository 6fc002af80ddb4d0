//! Node: the application context of one constellation member
//!
//! Every component (stores, handler, snapshot manager, ledger listener) is
//! owned here and wired once at startup. Several nodes can run in one
//! process, which the integration tests rely on.

use crate::app_state::StateManager;
use crate::config::Config;
use crate::constellation::{ConstellationInitRequest, ConstellationInitializer};
use crate::crypto::KeyPair;
use crate::error::ResultStatus;
use crate::ledger::LedgerManager;
use crate::messages::{Envelope, QuantumKind};
use crate::metrics::Metrics;
use crate::ports::{LedgerOracle, Persistence, Transport};
use crate::processors;
use crate::quantum::{
    spawn_quantum_handler, HandlerContext, HandlerInput, ProcessedQuantum, QuantumHandle, Role,
};
use crate::snapshot::{AuditorCatchup, Snapshot, SnapshotManager};
use crate::state::ExecutionState;
use crate::types::{ConstellationSettings, PublicKey};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// External collaborators of a node
#[derive(Debug, Clone)]
pub struct NodeServices {
    /// Durable storage
    pub persistence: Arc<dyn Persistence>,
    /// Message delivery
    pub transport: Arc<dyn Transport>,
    /// External ledger network
    pub oracle: Arc<dyn LedgerOracle>,
}

/// One leader or witness node
#[derive(Debug)]
pub struct Node {
    role: Role,
    keypair: KeyPair,
    default_auditors: Vec<PublicKey>,
    snapshot_interval: Duration,
    services: NodeServices,
    metrics: Metrics,
    state_manager: Arc<StateManager>,
    handle: QuantumHandle,
    snapshots: Arc<SnapshotManager>,
    ledger_manager: Mutex<Option<Arc<LedgerManager>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Wire components and, on a leader, recover from persisted state
    pub async fn start(config: &Config, services: NodeServices) -> Result<Arc<Self>> {
        let role = config.node.role;
        let keypair = config.node.keypair()?;
        let alpha = config.node.alpha_key(&keypair)?;
        let metrics = Metrics::new()
            .map_err(|e| Error::Other(format!("Failed to register metrics: {}", e)))?;
        let state_manager = Arc::new(StateManager::new(role));

        // Only the vault key matters until a snapshot is loaded
        let placeholder = ExecutionState::new(
            ConstellationSettings {
                vault: alpha,
                auditors: config.node.default_auditors.clone(),
                assets: Vec::new(),
                min_account_balance: 0,
                min_allowed_lot_size: 0,
            },
            0,
        );
        let handle = spawn_quantum_handler(
            HandlerContext {
                role,
                keypair: keypair.clone(),
                state_manager: state_manager.clone(),
                persistence: services.persistence.clone(),
                transport: services.transport.clone(),
                metrics: metrics.clone(),
            },
            placeholder,
            config.handler.mailbox_capacity,
        );
        let snapshots = Arc::new(SnapshotManager::new(
            state_manager.clone(),
            services.persistence.clone(),
            metrics.clone(),
            config.snapshot.quorum_timeout(),
        ));

        let node = Arc::new(Self {
            role,
            keypair,
            default_auditors: config.node.default_auditors.clone(),
            snapshot_interval: config.snapshot.interval(),
            services,
            metrics,
            state_manager,
            handle,
            snapshots,
            ledger_manager: Mutex::new(None),
            scheduler: Mutex::new(None),
            shutdown: watch::channel(false).0,
        });

        tracing::info!(role = %role, key = %node.public_key(), "Node started");
        if role == Role::Leader {
            node.recover().await?;
        }
        Ok(node)
    }

    /// Leader: reload the last snapshot and replay quanta recorded after it
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let Some(snapshot) = self.services.persistence.get_last_snapshot().await? else {
            tracing::info!("No persisted constellation, waiting for initialization");
            return Ok(());
        };
        let pending = self.services.persistence.get_pending_quanta().await?;
        tracing::info!(
            snapshot = snapshot.apex,
            pending = pending.len(),
            "Recovering constellation"
        );

        self.state_manager.set_auditors(&snapshot.settings.auditors);
        self.snapshots.set_last_snapshot(snapshot.clone());
        self.handle.setup(snapshot, pending).await?;
        self.state_manager.setup_completed();
        self.start_snapshot_scheduler();
        Ok(())
    }

    /// Node role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Node public key
    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// Lifecycle state
    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state_manager
    }

    /// Quantum handler
    pub fn handle(&self) -> &QuantumHandle {
        &self.handle
    }

    /// Snapshot manager
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn require_role(&self, role: Role, operation: &str) -> Result<()> {
        if self.role != role {
            return Err(Error::InvalidState(format!(
                "{} is not available on a {}",
                operation, self.role
            )));
        }
        Ok(())
    }

    /// Leader: bootstrap a new constellation
    pub async fn initialize(self: &Arc<Self>, request: ConstellationInitRequest) -> Result<Snapshot> {
        self.require_role(Role::Leader, "Initialization")?;
        let genesis = ConstellationInitializer::new(
            self.keypair.clone(),
            self.services.oracle.clone(),
            self.services.persistence.clone(),
            self.state_manager.clone(),
            self.handle.clone(),
        )
        .init(request)
        .await?;
        self.snapshots.set_last_snapshot(genesis.clone());
        self.start_snapshot_scheduler();
        Ok(genesis)
    }

    /// Leader: sequence a signed client request
    pub async fn submit_request(&self, envelope: Envelope) -> Result<ProcessedQuantum> {
        self.require_role(Role::Leader, "Client requests")?;
        processors::prevalidate_request(&envelope)?;
        self.handle.handle_async(HandlerInput::Request(envelope)).await
    }

    /// Leader: sequence a ledger update relayed by an auditor
    pub async fn handle_ledger_update(&self, envelope: Envelope) -> Result<ProcessedQuantum> {
        self.require_role(Role::Leader, "Ledger updates")?;
        self.handle
            .handle_async(HandlerInput::LedgerUpdate(envelope))
            .await
    }

    /// Witness: accept a quantum broadcast by the leader
    pub async fn receive_quantum(&self, envelope: Envelope) -> Result<()> {
        self.require_role(Role::Witness, "Quantum replay")?;
        self.handle.handle(HandlerInput::Quantum(envelope)).await
    }

    /// Leader: stored quanta in `from..=to`, to answer an auditor gap request
    pub async fn quanta(&self, from: u64, to: u64) -> Result<Vec<Envelope>> {
        self.require_role(Role::Leader, "Quanta requests")?;
        self.services.persistence.get_quanta(from, to).await
    }

    /// Leader: process a result signed by an auditor
    ///
    /// Returns true when the result completed a snapshot quorum.
    pub async fn handle_auditor_result(&self, envelope: &Envelope) -> Result<bool> {
        self.require_role(Role::Leader, "Auditor results")?;
        let result = envelope
            .message
            .as_result()
            .ok_or_else(|| Error::BadRequest("Envelope does not carry a result".to_string()))?;

        let is_snapshot = matches!(
            result.original.message.as_quantum().map(|q| &q.kind),
            Some(QuantumKind::Snapshot { .. })
        );
        if !is_snapshot {
            if !result.status.is_success() {
                tracing::warn!(status = ?result.status, "Auditor rejected a sequenced quantum");
            }
            return Ok(false);
        }
        self.snapshots.add_auditor_result(envelope).await
    }

    /// Leader: an auditor finished its handshake
    pub fn auditor_connected(&self, auditor: PublicKey) {
        self.state_manager.auditor_connected(auditor);
    }

    /// Leader: an auditor connection closed
    pub fn auditor_disconnected(&self, auditor: &PublicKey) {
        self.state_manager.auditor_disconnected(auditor);
    }

    /// Witness: resynchronize from `snapshot` and the quanta after it, then
    /// start following the external ledger
    pub async fn catchup(&self, snapshot: Snapshot, pending: Vec<Envelope>) -> ResultStatus {
        if let Err(e) = self.require_role(Role::Witness, "Catchup") {
            tracing::warn!(error = %e, "Catchup rejected");
            return e.status();
        }
        let status = AuditorCatchup::new(
            self.handle.clone(),
            self.state_manager.clone(),
            self.services.persistence.clone(),
            self.default_auditors.clone(),
        )
        .apply(snapshot, pending)
        .await;
        if !status.is_success() {
            return status;
        }

        if let Err(e) = self.restart_ledger_listener().await {
            tracing::error!(error = %e, "Failed to start ledger listener");
            self.state_manager.fail(&e.to_string());
            return ResultStatus::InternalError;
        }
        status
    }

    async fn restart_ledger_listener(&self) -> Result<()> {
        let previous = self.ledger_manager.lock().take();
        if let Some(previous) = previous {
            previous.shutdown().await;
        }
        let manager = Arc::new(LedgerManager::new(
            self.services.oracle.clone(),
            self.services.transport.clone(),
            self.keypair.clone(),
            self.state_manager.clone(),
            self.handle.read(|state| state.ledger),
        ));
        manager.start_listener().await?;
        *self.ledger_manager.lock() = Some(manager);
        Ok(())
    }

    /// Leader: sequence a snapshot quantum and start collecting signatures
    pub async fn trigger_snapshot(&self) -> Result<u64> {
        self.require_role(Role::Leader, "Snapshots")?;
        self.snapshots.begin()?;
        let processed = match self.handle.handle_async(HandlerInput::Snapshot).await {
            Ok(processed) => processed,
            Err(e) => {
                self.snapshots.cancel_begin();
                return Err(e);
            }
        };
        let Some(snapshot) = processed.snapshot else {
            self.snapshots.cancel_begin();
            return Err(Error::InvariantViolation(format!(
                "Snapshot quantum {} produced no snapshot",
                processed.apex
            )));
        };
        self.snapshots.register(snapshot, processed.result)?;
        Ok(processed.apex)
    }

    /// Leader: periodic snapshots while the node accepts requests
    fn start_snapshot_scheduler(self: &Arc<Self>) {
        let mut guard = self.scheduler.lock();
        if guard.is_some() {
            return;
        }
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.snapshot_interval;

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                let app_state = node.state_manager.state();
                if node.state_manager.is_failed() {
                    break;
                }
                if !app_state.accepts_requests() {
                    continue;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = node.snapshots.wait_idle() => {}
                }
                match node.trigger_snapshot().await {
                    Ok(apex) => tracing::debug!(apex, "Scheduled snapshot started"),
                    Err(e) => tracing::warn!(error = %e, "Scheduled snapshot failed"),
                }
            }
            tracing::info!("Snapshot scheduler stopped");
        }));
    }

    /// Stop background tasks and the handler
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            let _ = scheduler.await;
        }
        let ledger_manager = self.ledger_manager.lock().take();
        if let Some(ledger_manager) = ledger_manager {
            ledger_manager.shutdown().await;
        }
        self.handle.shutdown().await?;
        tracing::info!(role = %self.role, "Node stopped");
        Ok(())
    }
}
