//! Auditor catchup: rebuild a witness from a snapshot plus pending quanta

use super::{validate_snapshot, Snapshot};
use crate::app_state::{ApplicationState, StateManager};
use crate::error::ResultStatus;
use crate::messages::Envelope;
use crate::ports::Persistence;
use crate::quantum::handler::HandlerInput;
use crate::quantum::QuantumHandle;
use crate::types::PublicKey;
use crate::{Error, Result};
use std::sync::Arc;

/// Witness resynchronization
#[derive(Debug, Clone)]
pub struct AuditorCatchup {
    handle: QuantumHandle,
    state_manager: Arc<StateManager>,
    persistence: Arc<dyn Persistence>,
    default_auditors: Vec<PublicKey>,
}

impl AuditorCatchup {
    /// Create catchup for a witness handler
    pub fn new(
        handle: QuantumHandle,
        state_manager: Arc<StateManager>,
        persistence: Arc<dyn Persistence>,
        default_auditors: Vec<PublicKey>,
    ) -> Self {
        Self {
            handle,
            state_manager,
            persistence,
            default_auditors,
        }
    }

    /// Validate and adopt `snapshot`, then replay `pending` quanta after it
    ///
    /// Validation failures map to `SnapshotValidationFailed`, everything else
    /// to `InternalError`.
    pub async fn apply(&self, snapshot: Snapshot, pending: Vec<Envelope>) -> ResultStatus {
        match self.try_apply(snapshot, pending).await {
            Ok(apex) => {
                tracing::info!(apex, "Catchup completed");
                ResultStatus::Success
            }
            Err(Error::Snapshot(e)) => {
                tracing::warn!(error = %e, "Catchup snapshot rejected");
                ResultStatus::SnapshotValidationFailed
            }
            Err(e) => {
                tracing::error!(error = %e, "Catchup failed");
                if e.is_fatal() {
                    self.state_manager.fail(&e.to_string());
                }
                ResultStatus::InternalError
            }
        }
    }

    async fn try_apply(&self, snapshot: Snapshot, mut pending: Vec<Envelope>) -> Result<u64> {
        let local = self.persistence.get_last_snapshot().await?;
        let known_auditors = match &local {
            Some(local) => local.settings.auditors.clone(),
            None => self.default_auditors.clone(),
        };
        validate_snapshot(
            &snapshot,
            local.as_ref().map(|s| s.apex),
            &self.default_auditors,
            &known_auditors,
        )?;

        let snapshot_apex = snapshot.apex;
        self.state_manager.set_auditors(&snapshot.settings.auditors);
        self.handle.setup(snapshot.clone(), Vec::new()).await?;
        self.state_manager.setup_completed();

        pending.retain(|envelope| {
            envelope
                .message
                .as_quantum()
                .map(|q| q.apex > snapshot_apex)
                .unwrap_or(false)
        });
        pending.sort_by_key(|envelope| envelope.message.as_quantum().map(|q| q.apex));

        // Quanta broadcast live before catchup may already be buffered
        let mut last = snapshot_apex;
        for envelope in pending {
            let apex = envelope.message.as_quantum().map(|q| q.apex).unwrap_or(0);
            last = last.max(apex);
            if self.is_settled(apex) {
                continue;
            }
            match self.handle.handle(HandlerInput::Quantum(envelope)).await {
                Ok(()) => tracing::debug!(apex, "Pending quantum queued for replay"),
                Err(Error::BadRequest(_)) if self.is_settled(apex) => continue,
                Err(e) => return Err(e),
            }
        }
        let mut app_state = self.state_manager.subscribe();
        tokio::select! {
            applied = self.handle.wait_for_apex(last) => applied?,
            _ = app_state.wait_for(|s| *s == ApplicationState::Failed) => {
                return Err(Error::InvalidState(format!(
                    "Node failed while replaying quanta up to {}",
                    last
                )));
            }
        }

        // Only an adopted snapshot becomes the local base for later validation
        self.persistence.save_snapshot(&snapshot).await?;

        self.state_manager.catchup_completed();
        Ok(self.handle.current_apex())
    }

    fn is_settled(&self, apex: u64) -> bool {
        apex <= self.handle.current_apex() || self.handle.is_queued(apex)
    }
}
