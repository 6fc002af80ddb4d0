//! Quantum Core
//!
//! Deterministic order-matching and settlement engine replicated across a
//! leader (alpha) and a set of auditors.
//!
//! # Architecture
//!
//! - **Single Writer**: one handler task per node commits every state change
//! - **Apex Ordering**: the leader numbers each quantum; auditors replay in order
//! - **Reversible Effects**: commits are staged as effects that can be reverted
//! - **Quorum Snapshots**: checkpoints count only once a majority of auditors signs
//!
//! # Invariants
//!
//! - Available balance: amount − liabilities ≥ 0 for every balance
//! - Nonces strictly increase per account
//! - Deterministic replay: same quanta → same state → same snapshot hash
//! - Effects of apex N are committed and persisted before apex N+1 starts

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod accounts;
pub mod withdrawals;
pub mod exchange;
pub mod effects;
pub mod state;
pub mod processors;
pub mod quantum;
pub mod snapshot;
pub mod ledger;
pub mod app_state;
pub mod ports;
pub mod storage;
pub mod constellation;
pub mod node;
pub mod config;
pub mod metrics;

// Re-exports
pub use app_state::{ApplicationState, StateManager};
pub use config::Config;
pub use error::{Error, Result, ResultStatus};
pub use messages::{Envelope, Message, Quantum, QuantumKind};
pub use node::{Node, NodeServices};
pub use quantum::Role;
pub use snapshot::Snapshot;
pub use types::{Account, AssetId, Balance, Order, OrderSide, PublicKey};
