//! Snapshot validation on receipt

use super::Snapshot;
use crate::crypto::majority_count;
use crate::error::SnapshotError;
use crate::types::PublicKey;

/// Validate a received snapshot
///
/// - `local_apex`: apex of the snapshot already held, if any
/// - `default_auditors`: configured auditor set the genesis snapshot must carry
/// - `known_auditors`: auditors whose signatures count toward the majority
pub fn validate_snapshot(
    snapshot: &Snapshot,
    local_apex: Option<u64>,
    default_auditors: &[PublicKey],
    known_auditors: &[PublicKey],
) -> Result<(), SnapshotError> {
    if let Some(local) = local_apex {
        if local > snapshot.apex {
            return Err(SnapshotError::LocalIsNewer {
                local,
                received: snapshot.apex,
            });
        }
    }

    if snapshot.is_genesis() {
        return validate_genesis(snapshot, default_auditors);
    }

    let confirmed = snapshot.confirmed_hash()?;
    let computed = snapshot
        .compute_hash()
        .map_err(|e| SnapshotError::InvalidConfirmation(e.to_string()))?;
    if computed != confirmed {
        return Err(SnapshotError::HashMismatch(snapshot.apex));
    }

    let valid = count_auditor_signatures(snapshot, known_auditors)?;
    let required = majority_count(known_auditors.len());
    if valid < required {
        return Err(SnapshotError::NotEnoughSignatures { valid, required });
    }

    tracing::debug!(
        apex = snapshot.apex,
        signatures = valid,
        required,
        "Snapshot validated"
    );
    Ok(())
}

fn validate_genesis(snapshot: &Snapshot, default_auditors: &[PublicKey]) -> Result<(), SnapshotError> {
    let mut received = snapshot.settings.auditors.clone();
    let mut expected = default_auditors.to_vec();
    received.sort();
    received.dedup();
    expected.sort();
    expected.dedup();
    if received != expected {
        return Err(SnapshotError::GenesisAuditorsMismatch);
    }
    Ok(())
}

/// Distinct known auditors with a valid signature on the confirmation
fn count_auditor_signatures(
    snapshot: &Snapshot,
    known_auditors: &[PublicKey],
) -> Result<usize, SnapshotError> {
    let confirmation = snapshot
        .confirmation
        .as_ref()
        .ok_or(SnapshotError::MissingConfirmation(snapshot.apex))?;
    let signers = confirmation
        .valid_signers()
        .map_err(|e| SnapshotError::InvalidConfirmation(e.to_string()))?;
    Ok(signers
        .iter()
        .filter(|signer| known_auditors.contains(signer))
        .count())
}
