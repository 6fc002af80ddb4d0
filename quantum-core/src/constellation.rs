//! Constellation bootstrap
//!
//! The leader starts in `WaitingForInit`. Initialization installs the
//! auditors as vault signers on the external ledger, then produces the
//! genesis snapshot at apex 1 from which every node starts.

use crate::app_state::{ApplicationState, StateManager};
use crate::crypto::{majority_count, KeyPair};
use crate::messages::{self, Envelope, Message, Quantum, QuantumKind};
use crate::ports::{LedgerOracle, Persistence, SignedVaultTransaction};
use crate::quantum::QuantumHandle;
use crate::snapshot::Snapshot;
use crate::state::ExecutionState;
use crate::types::{AssetSettings, ConstellationSettings, PublicKey, MAX_ASSET_ID};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Asset listed at bootstrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDefinition {
    /// Asset code
    pub code: String,
    /// Issuer on the external ledger
    pub issuer: PublicKey,
}

/// Parameters of a new constellation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstellationInitRequest {
    /// Auditor public keys
    pub auditors: Vec<PublicKey>,
    /// Assets to list; ids are assigned from 1 in this order
    pub assets: Vec<AssetDefinition>,
    /// Minimal quote deposit that opens an account
    pub min_account_balance: u64,
    /// Minimal order amount
    pub min_allowed_lot_size: u64,
}

impl ConstellationInitRequest {
    /// Check parameters and build the settings for vault `vault`
    pub fn to_settings(&self, vault: PublicKey) -> Result<ConstellationSettings> {
        if self.auditors.is_empty() {
            return Err(Error::BadRequest("At least one auditor is required".to_string()));
        }
        let auditors: BTreeSet<PublicKey> = self.auditors.iter().copied().collect();
        if auditors.len() != self.auditors.len() {
            return Err(Error::BadRequest("Duplicate auditor".to_string()));
        }
        if self.min_account_balance == 0 {
            return Err(Error::BadRequest(
                "Minimal account balance must be positive".to_string(),
            ));
        }
        if self.min_allowed_lot_size == 0 {
            return Err(Error::BadRequest(
                "Minimal lot size must be positive".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for asset in &self.assets {
            if !seen.insert((asset.code.as_str(), asset.issuer)) {
                return Err(Error::BadRequest(format!(
                    "Asset {} is listed twice",
                    asset.code
                )));
            }
        }
        if self.assets.len() > MAX_ASSET_ID as usize {
            return Err(Error::BadRequest("Too many assets".to_string()));
        }

        let assets = self
            .assets
            .iter()
            .zip(1u32..)
            .map(|(asset, id)| AssetSettings {
                id,
                code: asset.code.clone(),
                issuer: asset.issuer,
            })
            .collect();

        Ok(ConstellationSettings {
            vault,
            auditors: self.auditors.clone(),
            assets,
            min_account_balance: self.min_account_balance,
            min_allowed_lot_size: self.min_allowed_lot_size,
        })
    }
}

/// Leader-side bootstrap of a new constellation
#[derive(Debug)]
pub struct ConstellationInitializer {
    keypair: KeyPair,
    oracle: Arc<dyn LedgerOracle>,
    persistence: Arc<dyn Persistence>,
    state_manager: Arc<StateManager>,
    handle: QuantumHandle,
}

impl ConstellationInitializer {
    /// Create initializer for the leader
    pub fn new(
        keypair: KeyPair,
        oracle: Arc<dyn LedgerOracle>,
        persistence: Arc<dyn Persistence>,
        state_manager: Arc<StateManager>,
        handle: QuantumHandle,
    ) -> Self {
        Self {
            keypair,
            oracle,
            persistence,
            state_manager,
            handle,
        }
    }

    /// Configure the vault, persist the genesis snapshot and load it
    pub async fn init(&self, request: ConstellationInitRequest) -> Result<Snapshot> {
        let app_state = self.state_manager.state();
        if app_state != ApplicationState::WaitingForInit {
            return Err(Error::InvalidState(format!(
                "Constellation cannot be initialized in state {}",
                app_state
            )));
        }

        let settings = request.to_settings(self.keypair.public_key())?;
        let ledger = self.oracle.latest_ledger().await?;

        let transaction = self.vault_transaction(&settings)?;
        let threshold = transaction.threshold;
        if !self.oracle.submit_transaction(transaction).await? {
            return Err(Error::Ledger(
                "Vault setup transaction was rejected".to_string(),
            ));
        }
        tracing::info!(
            auditors = settings.auditors.len(),
            threshold,
            ledger,
            "Vault signers configured"
        );

        let init = Envelope::signed(
            Message::Quantum(Quantum {
                apex: 1,
                timestamp: chrono::Utc::now().timestamp_millis(),
                kind: QuantumKind::ConstellationInit {
                    settings: settings.clone(),
                    ledger,
                },
            }),
            &self.keypair,
        )?;
        let genesis = ExecutionState::new(settings, ledger).to_snapshot(1);

        self.persistence.save_effects(&init, &[]).await?;
        self.persistence.save_snapshot(&genesis).await?;

        self.state_manager.set_auditors(&genesis.settings.auditors);
        self.handle.setup(genesis.clone(), Vec::new()).await?;
        self.state_manager.setup_completed();

        tracing::info!(
            assets = genesis.settings.assets.len(),
            "Constellation initialized"
        );
        Ok(genesis)
    }

    fn vault_transaction(&self, settings: &ConstellationSettings) -> Result<SignedVaultTransaction> {
        let threshold = u32::try_from(majority_count(settings.auditors.len()))
            .map_err(|_| Error::BadRequest("Too many auditors".to_string()))?;
        let payload = messages::encode(&(&settings.vault, &settings.auditors, threshold))?;
        let signature = self.keypair.sign(&messages::hash(&payload)?);
        Ok(SignedVaultTransaction {
            vault: settings.vault,
            signers: settings.auditors.clone(),
            threshold,
            payload,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(auditors: Vec<PublicKey>) -> ConstellationInitRequest {
        ConstellationInitRequest {
            auditors,
            assets: vec![
                AssetDefinition {
                    code: "USD".to_string(),
                    issuer: PublicKey::from_bytes([3u8; 32]),
                },
                AssetDefinition {
                    code: "EUR".to_string(),
                    issuer: PublicKey::from_bytes([3u8; 32]),
                },
            ],
            min_account_balance: 100,
            min_allowed_lot_size: 1,
        }
    }

    #[test]
    fn test_settings_assign_asset_ids() {
        let vault = PublicKey::from_bytes([1u8; 32]);
        let settings = request(vec![PublicKey::from_bytes([2u8; 32])])
            .to_settings(vault)
            .unwrap();
        assert_eq!(settings.vault, vault);
        let ids: Vec<_> = settings.assets.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let vault = PublicKey::from_bytes([1u8; 32]);
        assert!(request(vec![]).to_settings(vault).is_err());

        let mut duplicate = request(vec![PublicKey::from_bytes([2u8; 32])]);
        duplicate.assets.push(duplicate.assets[0].clone());
        assert!(duplicate.to_settings(vault).is_err());

        let mut zero_balance = request(vec![PublicKey::from_bytes([2u8; 32])]);
        zero_balance.min_account_balance = 0;
        assert!(zero_balance.to_settings(vault).is_err());
    }
}
