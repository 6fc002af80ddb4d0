//! Core domain types
//!
//! All types are designed for:
//! - Deterministic serialization (bincode, sorted `Vec`s instead of maps)
//! - Integer arithmetic for amounts (smallest units)
//! - `Decimal` prices used only for ordering and settlement ratios

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Asset identifier. `0` is the quote (native) asset every market trades against.
pub type AssetId = u32;

/// Quote asset id
pub const QUOTE_ASSET: AssetId = 0;

/// Highest asset id that still fits in an order id
pub const MAX_ASSET_ID: AssetId = u16::MAX as AssetId;

/// Raw Ed25519 public key (32 bytes)
///
/// Encoded as a hex string in human-readable formats (config files, JSON)
/// and as raw bytes in the canonical binary encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// All-zero key is never a valid account
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| crate::Error::BadRequest(format!("Invalid public key hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::Error::BadRequest("Public key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &hex::encode(self.0)[..8])
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(self.0))
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer).map(PublicKey)
        }
    }
}

/// Digital signature (Ed25519)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Signature bytes (64 bytes)
    #[serde(with = "serde_bytes")]
    bytes: [u8; 64],
}

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    /// Verify signature
    pub fn verify(&self, message: &[u8], public_key: &PublicKey) -> bool {
        crate::crypto::verify_signature(message, self, public_key)
    }
}

/// Signature record: signer public key plus signature over a message hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Signature {
    /// Signer
    pub signer: PublicKey,
    /// Signature over the message hash
    pub signature: Signature,
}

impl Ed25519Signature {
    /// Check the signature against a message hash
    pub fn is_valid(&self, message_hash: &[u8; 32]) -> bool {
        self.signature.verify(message_hash, &self.signer)
    }
}

/// Tradable asset registered in the constellation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSettings {
    /// Asset id (assigned from 1, 0 is the quote asset)
    pub id: AssetId,
    /// Asset code
    pub code: String,
    /// Asset issuer on the external ledger
    pub issuer: PublicKey,
}

/// Constellation settings shared by every node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstellationSettings {
    /// Vault account; also the leader's signing key
    pub vault: PublicKey,
    /// Auditor public keys
    pub auditors: Vec<PublicKey>,
    /// Registered assets (quote asset excluded)
    pub assets: Vec<AssetSettings>,
    /// Minimal quote balance required to open an account
    pub min_account_balance: u64,
    /// Minimal order amount
    pub min_allowed_lot_size: u64,
}

impl ConstellationSettings {
    /// Check if key belongs to a registered auditor
    pub fn is_auditor(&self, key: &PublicKey) -> bool {
        self.auditors.contains(key)
    }

    /// Check if asset is supported (quote asset always is)
    pub fn has_asset(&self, asset: AssetId) -> bool {
        asset == QUOTE_ASSET || self.assets.iter().any(|a| a.id == asset)
    }

    /// Leader public key
    pub fn alpha(&self) -> &PublicKey {
        &self.vault
    }
}

/// Per-asset balance with locked liabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Asset id
    pub asset: AssetId,
    /// Total amount
    pub amount: u64,
    /// Locked amount (orders, withdrawals)
    pub liabilities: u64,
}

impl Balance {
    /// Create empty balance
    pub fn new(asset: AssetId) -> Self {
        Self {
            asset,
            amount: 0,
            liabilities: 0,
        }
    }

    /// Spendable amount
    pub fn available(&self) -> u64 {
        self.amount.saturating_sub(self.liabilities)
    }

    /// Check that `amount` can be locked
    pub fn has_sufficient_balance(&self, amount: u64) -> bool {
        self.available() >= amount
    }
}

/// Exchange account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account public key
    pub pubkey: PublicKey,
    /// Last accepted request nonce
    pub nonce: u64,
    /// Balances sorted by asset id
    pub balances: Vec<Balance>,
}

impl Account {
    /// Create account without balances
    pub fn new(pubkey: PublicKey) -> Self {
        Self {
            pubkey,
            nonce: 0,
            balances: Vec::new(),
        }
    }

    /// Get balance for asset
    pub fn balance(&self, asset: AssetId) -> Option<&Balance> {
        self.balances.iter().find(|b| b.asset == asset)
    }

    /// Get mutable balance for asset
    pub fn balance_mut(&mut self, asset: AssetId) -> Option<&mut Balance> {
        self.balances.iter_mut().find(|b| b.asset == asset)
    }

    /// Available amount for asset (0 if no balance)
    pub fn available(&self, asset: AssetId) -> u64 {
        self.balance(asset).map(Balance::available).unwrap_or(0)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OrderSide {
    /// Buy asset for quote
    Buy = 0,
    /// Sell asset for quote
    Sell = 1,
}

impl OrderSide {
    /// Opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Whether an unmatched remainder may rest in the book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Remainder is placed in the book
    #[default]
    GoodTillCancel,
    /// Remainder is dropped and its liability released
    ImmediateOrCancel,
}

/// Resting order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order id (asset, side, insertion sequence)
    pub order_id: u64,
    /// Owner
    pub account: PublicKey,
    /// Limit price (quote per asset unit)
    pub price: Decimal,
    /// Remaining amount
    pub amount: u64,
}

/// Pending external transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Apex of the request that created it
    pub apex: u64,
    /// Source account
    pub source: PublicKey,
    /// Destination on the external ledger
    pub destination: PublicKey,
    /// Asset
    pub asset: AssetId,
    /// Amount
    pub amount: u64,
    /// External transaction hash
    pub transaction_hash: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_roundtrip() {
        let key = PublicKey::from_bytes([7u8; 32]);
        let parsed = PublicKey::from_hex(&key.to_string()).unwrap();
        assert_eq!(key, parsed);
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn test_public_key_json_is_hex() {
        let key = PublicKey::from_bytes([1u8; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
    }

    #[test]
    fn test_balance_available() {
        let balance = Balance {
            asset: 1,
            amount: 100,
            liabilities: 40,
        };
        assert_eq!(balance.available(), 60);
        assert!(balance.has_sufficient_balance(60));
        assert!(!balance.has_sufficient_balance(61));
    }

    #[test]
    fn test_settings_assets() {
        let settings = ConstellationSettings {
            vault: PublicKey::from_bytes([9u8; 32]),
            auditors: vec![PublicKey::from_bytes([1u8; 32])],
            assets: vec![AssetSettings {
                id: 1,
                code: "X".to_string(),
                issuer: PublicKey::default(),
            }],
            min_account_balance: 1,
            min_allowed_lot_size: 1,
        };
        assert!(settings.has_asset(QUOTE_ASSET));
        assert!(settings.has_asset(1));
        assert!(!settings.has_asset(2));
        assert!(settings.is_auditor(&PublicKey::from_bytes([1u8; 32])));
    }
}
