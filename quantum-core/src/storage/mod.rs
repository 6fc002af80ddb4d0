//! Persistence backends
//!
//! - [`MemoryPersistence`]: in-process maps, used by tests and single-process runs
//! - `RocksDbPersistence`: durable column-family store (feature `rocksdb`)

pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;

pub use memory::MemoryPersistence;
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::RocksDbPersistence;

use crate::messages::Envelope;
use crate::{Error, Result};

/// Apex of a stored quantum envelope
pub(crate) fn quantum_apex(envelope: &Envelope) -> Result<u64> {
    envelope
        .message
        .as_quantum()
        .map(|q| q.apex)
        .ok_or_else(|| Error::Storage("Envelope does not carry a quantum".to_string()))
}
