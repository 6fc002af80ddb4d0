//! Error types for the quantum pipeline
//!
//! Three kinds of failure flow through the crate:
//! - validation errors reject a single quantum and never touch state
//! - snapshot errors reject a snapshot or catchup attempt
//! - infrastructure errors are fatal and move the node to `Failed`

use crate::types::{AssetId, PublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status code carried by every result message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Request applied
    Success,
    /// Malformed request
    BadRequest,
    /// Missing or invalid signature
    Unauthorized,
    /// Nonce not greater than the account nonce
    InvalidNonce,
    /// Not enough available balance
    InsufficientBalance,
    /// Asset is not registered
    UnknownAsset,
    /// Account does not exist
    AccountNotFound,
    /// Account already exists
    AccountExists,
    /// Order does not exist
    OrderNotFound,
    /// Node is not in a state that accepts the request
    InvalidState,
    /// Snapshot or catchup rejected
    SnapshotValidationFailed,
    /// Internal failure, details are logged only
    InternalError,
}

impl ResultStatus {
    /// Check for success
    pub fn is_success(&self) -> bool {
        matches!(self, ResultStatus::Success)
    }
}

/// Reasons a snapshot is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// A snapshot with a greater apex is already held
    #[error("Local snapshot is newer: local apex {local}, received apex {received}")]
    LocalIsNewer {
        /// Local snapshot apex
        local: u64,
        /// Received snapshot apex
        received: u64,
    },

    /// Genesis auditors differ from the configured defaults
    #[error("Genesis snapshot auditors do not match the default auditor set")]
    GenesisAuditorsMismatch,

    /// Non-genesis snapshot has no confirmation
    #[error("Snapshot {0} has no confirmation")]
    MissingConfirmation(u64),

    /// Confirmation does not wrap a snapshot quantum for this apex
    #[error("Invalid confirmation: {0}")]
    InvalidConfirmation(String),

    /// Recomputed hash differs from the confirmed one
    #[error("Snapshot hash mismatch at apex {0}")]
    HashMismatch(u64),

    /// Not enough valid auditor signatures
    #[error("Not enough signatures: {valid} valid, {required} required")]
    NotEnoughSignatures {
        /// Valid signatures from known auditors
        valid: usize,
        /// Majority threshold
        required: usize,
    },

    /// Snapshot was not confirmed in time
    #[error("Snapshot {0} timed out waiting for quorum")]
    Timeout(u64),
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Signature or role check failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Stale or replayed nonce
    #[error("Invalid nonce: current {current}, received {received}")]
    InvalidNonce {
        /// Account nonce
        current: u64,
        /// Request nonce
        received: u64,
    },

    /// Not enough available balance
    #[error("Insufficient balance for asset {asset}: required {required}, available {available}")]
    InsufficientBalance {
        /// Asset id
        asset: AssetId,
        /// Required amount
        required: u64,
        /// Available amount
        available: u64,
    },

    /// Asset not registered in the constellation
    #[error("Unknown asset: {0}")]
    UnknownAsset(AssetId),

    /// Account not found
    #[error("Account not found: {0}")]
    AccountNotFound(PublicKey),

    /// Account already exists
    #[error("Account already exists: {0}")]
    AccountExists(PublicKey),

    /// Order not found
    #[error("Order not found: {0}")]
    OrderNotFound(u64),

    /// Operation not allowed in the current application state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Snapshot rejected
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// External ledger error
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Invariant violation (negative balance, liabilities above amount, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Client-facing status for this error
    pub fn status(&self) -> ResultStatus {
        match self {
            Error::BadRequest(_) => ResultStatus::BadRequest,
            Error::Unauthorized(_) => ResultStatus::Unauthorized,
            Error::InvalidNonce { .. } => ResultStatus::InvalidNonce,
            Error::InsufficientBalance { .. } => ResultStatus::InsufficientBalance,
            Error::UnknownAsset(_) => ResultStatus::UnknownAsset,
            Error::AccountNotFound(_) => ResultStatus::AccountNotFound,
            Error::AccountExists(_) => ResultStatus::AccountExists,
            Error::OrderNotFound(_) => ResultStatus::OrderNotFound,
            Error::InvalidState(_) => ResultStatus::InvalidState,
            Error::Snapshot(_) => ResultStatus::SnapshotValidationFailed,
            _ => ResultStatus::InternalError,
        }
    }

    /// Infrastructure failures that must stop the node
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Storage(_)
                | Error::Ledger(_)
                | Error::Serialization(_)
                | Error::InvariantViolation(_)
                | Error::Concurrency(_)
                | Error::Io(_)
        )
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidNonce { current: 2, received: 2 }.status(),
            ResultStatus::InvalidNonce
        );
        assert_eq!(
            Error::from(SnapshotError::HashMismatch(5)).status(),
            ResultStatus::SnapshotValidationFailed
        );
        assert_eq!(
            Error::Storage("disk full".into()).status(),
            ResultStatus::InternalError
        );
    }

    #[test]
    fn test_fatal_errors() {
        assert!(Error::Ledger("stream closed".into()).is_fatal());
        assert!(Error::InvariantViolation("negative".into()).is_fatal());
        assert!(!Error::BadRequest("zero amount".into()).is_fatal());
        assert!(!Error::from(SnapshotError::GenesisAuditorsMismatch).is_fatal());
    }
}
