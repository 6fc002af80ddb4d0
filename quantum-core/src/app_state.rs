//! Application lifecycle state machine
//!
//! ```text
//! WaitingForInit ──► Rising ◄──► Ready ◄──► Running
//!                      │           │           │
//!                      └───────────┴───────────┴──► Failed (terminal)
//! ```
//!
//! The leader starts in `WaitingForInit` and becomes `Ready` once a majority
//! of auditors is connected, `Running` after the first confirmed snapshot.
//! Auditors start in `Rising` and become `Ready` after catchup setup,
//! `Running` once pending quanta are replayed.

use crate::crypto::majority_count;
use crate::quantum::Role;
use crate::types::PublicKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::watch;

/// Node lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    /// No constellation configured yet (leader only)
    WaitingForInit,
    /// Bootstrap or quorum handshake in progress
    Rising,
    /// Accepting operations, not yet quorum-confirmed
    Ready,
    /// Normal operation
    Running,
    /// Fatal failure, all processing stopped
    Failed,
}

impl ApplicationState {
    /// Check if a transition to `next` is legal
    pub fn can_transition_to(self, next: ApplicationState) -> bool {
        use ApplicationState::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (a, b) if a == b => true,
            (WaitingForInit, Rising) => true,
            (Rising, Ready) => true,
            (Ready, Running) | (Ready, Rising) => true,
            (Running, Rising) | (Running, Ready) => true,
            _ => false,
        }
    }

    /// States in which new client requests are accepted
    pub fn accepts_requests(self) -> bool {
        matches!(self, ApplicationState::Ready | ApplicationState::Running)
    }
}

impl fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared owner of the application state
#[derive(Debug)]
pub struct StateManager {
    role: Role,
    state: watch::Sender<ApplicationState>,
    auditors: Mutex<AuditorQuorum>,
}

#[derive(Debug, Default)]
struct AuditorQuorum {
    known: BTreeSet<PublicKey>,
    connected: BTreeSet<PublicKey>,
}

impl AuditorQuorum {
    fn has_majority(&self) -> bool {
        !self.known.is_empty() && self.connected.len() >= majority_count(self.known.len())
    }
}

impl StateManager {
    /// Create in the role's initial state
    pub fn new(role: Role) -> Self {
        let initial = match role {
            Role::Leader => ApplicationState::WaitingForInit,
            Role::Witness => ApplicationState::Rising,
        };
        let (state, _) = watch::channel(initial);
        Self {
            role,
            state,
            auditors: Mutex::new(AuditorQuorum::default()),
        }
    }

    /// Node role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ApplicationState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<ApplicationState> {
        self.state.subscribe()
    }

    /// Check for the terminal state
    pub fn is_failed(&self) -> bool {
        self.state() == ApplicationState::Failed
    }

    /// Move to `next`, returning true if the state changed
    pub fn transition(&self, next: ApplicationState) -> bool {
        let mut previous = None;
        let mut refused = false;
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                refused = true;
                previous = Some(*current);
                return false;
            }
            if *current == next {
                return false;
            }
            previous = Some(*current);
            *current = next;
            true
        });

        match previous {
            Some(from) if refused => {
                tracing::warn!(role = %self.role, %from, to = %next, "Refused application state transition");
                false
            }
            Some(from) => {
                tracing::info!(role = %self.role, %from, to = %next, "Application state changed");
                true
            }
            None => false,
        }
    }

    /// Force the terminal state
    pub fn fail(&self, reason: &str) {
        if self.transition(ApplicationState::Failed) {
            tracing::error!(role = %self.role, reason, "Node failed");
        }
    }

    /// Register the constellation auditor set
    pub fn set_auditors(&self, auditors: &[PublicKey]) {
        let mut quorum = self.auditors.lock();
        quorum.known = auditors.iter().copied().collect();
        let known = quorum.known.clone();
        quorum.connected.retain(|a| known.contains(a));
    }

    /// Constellation state loaded
    pub fn setup_completed(&self) {
        match self.role {
            Role::Leader => {
                self.transition(ApplicationState::Rising);
                if self.auditors.lock().has_majority() {
                    self.transition(ApplicationState::Ready);
                }
            }
            Role::Witness => {
                self.transition(ApplicationState::Ready);
            }
        }
    }

    /// Leader: an auditor finished its handshake
    pub fn auditor_connected(&self, auditor: PublicKey) {
        let majority = {
            let mut quorum = self.auditors.lock();
            if !quorum.known.contains(&auditor) {
                tracing::warn!(auditor = %auditor, "Ignoring connection of unknown auditor");
                return;
            }
            quorum.connected.insert(auditor);
            quorum.has_majority()
        };
        if majority && self.state() == ApplicationState::Rising {
            self.transition(ApplicationState::Ready);
        }
    }

    /// Leader: an auditor connection closed
    pub fn auditor_disconnected(&self, auditor: &PublicKey) {
        let majority = {
            let mut quorum = self.auditors.lock();
            quorum.connected.remove(auditor);
            quorum.has_majority()
        };
        if !majority && matches!(self.state(), ApplicationState::Ready | ApplicationState::Running) {
            tracing::warn!(auditor = %auditor, "Auditor quorum lost");
            self.transition(ApplicationState::Rising);
        }
    }

    /// Connected auditor count
    pub fn connected_auditors(&self) -> usize {
        self.auditors.lock().connected.len()
    }

    /// Leader: a snapshot collected quorum
    pub fn snapshot_confirmed(&self) {
        if self.role == Role::Leader && self.state() == ApplicationState::Ready {
            self.transition(ApplicationState::Running);
        }
    }

    /// Witness: pending quanta replayed after setup
    pub fn catchup_completed(&self) {
        if self.role == Role::Witness && self.state() == ApplicationState::Ready {
            self.transition(ApplicationState::Running);
        }
    }
}
