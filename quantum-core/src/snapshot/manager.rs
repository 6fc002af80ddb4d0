//! Leader-side snapshot lifecycle
//!
//! ```text
//! begin ──► snapshot quantum applied ──► register ──► auditor results ──► majority
//!   │                                       │                               │
//!   │                                       └── watchdog: timeout / Failed  └── persist, Running
//!   └── Err while another snapshot is in progress
//! ```
//!
//! Only one snapshot collects signatures at a time. The in-progress flag is a
//! `watch` channel, so the scheduler awaits it instead of polling. A snapshot
//! abandoned on timeout or failure is never persisted and late results for it
//! are ignored.

use super::Snapshot;
use crate::app_state::{ApplicationState, StateManager};
use crate::crypto::majority_count;
use crate::error::SnapshotError;
use crate::messages::Envelope;
use crate::metrics::Metrics;
use crate::ports::Persistence;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug)]
struct PendingSnapshot {
    snapshot: Snapshot,
    confirmation: Envelope,
    started: Instant,
}

/// Collects auditor signatures for snapshots proposed by the leader
#[derive(Debug)]
pub struct SnapshotManager {
    state_manager: Arc<StateManager>,
    persistence: Arc<dyn Persistence>,
    metrics: Metrics,
    quorum_timeout: Duration,
    pending: Mutex<Option<PendingSnapshot>>,
    last_snapshot: Mutex<Option<Snapshot>>,
    in_progress: watch::Sender<bool>,
    finalized: watch::Sender<u64>,
}

impl SnapshotManager {
    /// Create manager
    pub fn new(
        state_manager: Arc<StateManager>,
        persistence: Arc<dyn Persistence>,
        metrics: Metrics,
        quorum_timeout: Duration,
    ) -> Self {
        Self {
            state_manager,
            persistence,
            metrics,
            quorum_timeout,
            pending: Mutex::new(None),
            last_snapshot: Mutex::new(None),
            in_progress: watch::channel(false).0,
            finalized: watch::channel(0).0,
        }
    }

    /// Latest confirmed snapshot
    pub fn last_snapshot(&self) -> Option<Snapshot> {
        self.last_snapshot.lock().clone()
    }

    /// Record a snapshot loaded at startup
    pub fn set_last_snapshot(&self, snapshot: Snapshot) {
        self.finalized.send_replace(snapshot.apex);
        *self.last_snapshot.lock() = Some(snapshot);
    }

    /// Apex of the latest confirmed snapshot
    pub fn finalized_apex(&self) -> u64 {
        *self.finalized.borrow()
    }

    /// Check if a snapshot is collecting signatures
    pub fn is_in_progress(&self) -> bool {
        *self.in_progress.borrow()
    }

    /// Claim the in-progress slot
    pub fn begin(&self) -> Result<()> {
        if self.state_manager.is_failed() {
            return Err(Error::InvalidState("Node has failed".to_string()));
        }
        let claimed = self.in_progress.send_if_modified(|in_progress| {
            if *in_progress {
                false
            } else {
                *in_progress = true;
                true
            }
        });
        if !claimed {
            return Err(Error::InvalidState(
                "Snapshot already in progress".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait until no snapshot is in progress
    pub async fn wait_idle(&self) {
        let mut in_progress = self.in_progress.subscribe();
        let _ = in_progress.wait_for(|busy| !*busy).await;
    }

    /// Start collecting signatures for `snapshot`
    ///
    /// `leader_result` is the leader's signed result of the snapshot quantum;
    /// auditor results over the same message are aggregated into it.
    pub fn register(self: &Arc<Self>, snapshot: Snapshot, leader_result: Envelope) -> Result<()> {
        let apex = snapshot.apex;
        {
            let mut pending = self.pending.lock();
            if let Some(existing) = pending.as_ref() {
                return Err(Error::InvalidState(format!(
                    "Snapshot {} is still collecting signatures",
                    existing.snapshot.apex
                )));
            }
            *pending = Some(PendingSnapshot {
                snapshot,
                confirmation: leader_result,
                started: Instant::now(),
            });
        }
        tracing::info!(apex, "Snapshot registered, collecting auditor signatures");
        self.spawn_watchdog(apex);
        Ok(())
    }

    fn spawn_watchdog(self: &Arc<Self>, apex: u64) {
        let manager = Arc::clone(self);
        let mut finalized = self.finalized.subscribe();
        let mut app_state = self.state_manager.subscribe();
        let timeout = self.quorum_timeout;

        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, async {
                tokio::select! {
                    confirmed = finalized.wait_for(|f| *f >= apex) => confirmed.is_ok(),
                    _ = app_state.wait_for(|s| *s == ApplicationState::Failed) => false,
                }
            })
            .await;

            match outcome {
                Ok(true) => {}
                Ok(false) => {
                    manager.abort(apex, "node failed");
                }
                Err(_) => {
                    let error = SnapshotError::Timeout(apex);
                    if manager.abort(apex, &error.to_string()) {
                        manager.state_manager.fail(&error.to_string());
                    }
                }
            }
        });
    }

    /// Drop the pending snapshot at `apex`; returns true if it was pending
    pub fn abort(&self, apex: u64, reason: &str) -> bool {
        let aborted = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(p) if p.snapshot.apex == apex => pending.take().is_some(),
                _ => false,
            }
        };
        if aborted {
            tracing::warn!(apex, reason, "Snapshot abandoned");
            self.in_progress.send_replace(false);
        }
        aborted
    }

    /// Release the in-progress slot when the snapshot quantum itself failed
    pub fn cancel_begin(&self) {
        if self.pending.lock().is_none() {
            self.in_progress.send_replace(false);
        }
    }

    /// Aggregate an auditor's result; returns true once the snapshot is confirmed
    pub async fn add_auditor_result(&self, result: &Envelope) -> Result<bool> {
        let confirmed = {
            let mut guard = self.pending.lock();
            let Some(pending) = guard.as_mut() else {
                tracing::debug!("Ignoring snapshot result, nothing pending");
                return Ok(false);
            };
            if let Err(e) = pending.confirmation.aggregate(result) {
                tracing::warn!(
                    apex = pending.snapshot.apex,
                    error = %e,
                    "Auditor result does not match the pending snapshot"
                );
                return Ok(false);
            }

            let auditors = &pending.snapshot.settings.auditors;
            let valid = pending
                .confirmation
                .valid_signers()?
                .iter()
                .filter(|signer| auditors.contains(signer))
                .count();
            let required = majority_count(auditors.len());
            tracing::debug!(apex = pending.snapshot.apex, valid, required, "Snapshot signature added");
            if valid < required {
                return Ok(false);
            }
            guard.take()
        };

        let Some(PendingSnapshot {
            mut snapshot,
            confirmation,
            started,
        }) = confirmed
        else {
            return Ok(false);
        };
        snapshot.confirmation = Some(confirmation);
        let apex = snapshot.apex;

        if let Err(e) = self.persistence.save_snapshot(&snapshot).await {
            tracing::error!(apex, error = %e, "Failed to persist confirmed snapshot");
            self.in_progress.send_replace(false);
            self.state_manager.fail(&e.to_string());
            return Err(e);
        }

        *self.last_snapshot.lock() = Some(snapshot);
        self.finalized.send_replace(apex);
        self.in_progress.send_replace(false);
        self.metrics
            .record_snapshot_finalized(started.elapsed().as_secs_f64());
        self.state_manager.snapshot_confirmed();
        tracing::info!(apex, "Snapshot confirmed by auditor quorum");
        Ok(true)
    }
}
