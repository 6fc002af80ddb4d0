//! Snapshot quantum: freeze the state at the quantum's apex

use crate::error::SnapshotError;
use crate::snapshot::Snapshot;
use crate::state::ExecutionState;
use crate::Result;

/// Build the snapshot for `apex` and check it against the sequenced hash
///
/// The snapshot quantum itself stages no effects, so the snapshot holds the
/// state left by apex - 1 labelled with `apex`.
pub fn take(state: &ExecutionState, apex: u64, hash: &[u8; 32]) -> Result<Snapshot> {
    let snapshot = state.to_snapshot(apex);
    let computed = snapshot.compute_hash()?;
    if &computed != hash {
        tracing::warn!(
            apex,
            expected = %hex::encode(hash),
            computed = %hex::encode(computed),
            "Snapshot hash differs from the sequenced one"
        );
        return Err(SnapshotError::HashMismatch(apex).into());
    }
    Ok(snapshot)
}
