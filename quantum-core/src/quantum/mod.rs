//! Quantum sequencing and application
//!
//! - [`queue::QuantumProcessingQueue`]: gap-filling buffer for auditors
//! - [`handler::QuantumHandle`]: client of the single writer of the execution state

pub mod handler;
pub mod queue;

pub use handler::{
    spawn_quantum_handler, HandlerContext, HandlerInput, ProcessedQuantum, QuantumHandle,
};
pub use queue::QuantumProcessingQueue;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node role, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Alpha: assigns apexes and proposes snapshots
    Leader,
    /// Auditor: replays the leader's quanta and co-signs results
    Witness,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Witness => write!(f, "witness"),
        }
    }
}
