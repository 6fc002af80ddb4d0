//! Protocol messages and canonical encoding
//!
//! Every message that gets signed is hashed over its canonical bytes:
//! one version byte followed by the bincode (fixed-int, little-endian)
//! encoding of the value. Wire types only contain `Vec`s in a fixed order,
//! so two nodes always derive byte-identical encodings.

use crate::crypto::{self, KeyPair};
use crate::effects::Effect;
use crate::error::ResultStatus;
use crate::types::{
    Account, AssetId, ConstellationSettings, Ed25519Signature, OrderSide, PublicKey, TimeInForce,
};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Version prefix of the canonical encoding
pub const ENCODING_VERSION: u8 = 1;

/// Encode a value into canonical bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(ENCODING_VERSION);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode canonical bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match bytes.split_first() {
        Some((&ENCODING_VERSION, body)) => Ok(bincode::deserialize(body)?),
        Some((version, _)) => Err(Error::BadRequest(format!(
            "Unsupported encoding version: {}",
            version
        ))),
        None => Err(Error::BadRequest("Empty message".to_string())),
    }
}

/// SHA-256 of the canonical encoding
pub fn hash<T: Serialize>(value: &T) -> Result<[u8; 32]> {
    Ok(crypto::hash_bytes(&encode(value)?))
}

/// Top-level protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Sequenced quantum
    Quantum(Quantum),
    /// Processing result of a quantum
    Result(ResultMessage),
    /// External ledger observation relayed by an auditor
    LedgerUpdate(LedgerUpdateNotification),
    /// Client request
    Request(RequestMessage),
}

impl Message {
    /// Quantum payload, if any
    pub fn as_quantum(&self) -> Option<&Quantum> {
        match self {
            Message::Quantum(quantum) => Some(quantum),
            _ => None,
        }
    }

    /// Result payload, if any
    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Message::Result(result) => Some(result),
            _ => None,
        }
    }

    /// Client request payload, if any
    pub fn as_request(&self) -> Option<&RequestMessage> {
        match self {
            Message::Request(request) => Some(request),
            _ => None,
        }
    }

    /// Ledger update payload, if any
    pub fn as_ledger_update(&self) -> Option<&LedgerUpdateNotification> {
        match self {
            Message::LedgerUpdate(update) => Some(update),
            _ => None,
        }
    }
}

/// One unit of ordered work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantum {
    /// Sequence number
    pub apex: u64,
    /// Leader timestamp (unix milliseconds)
    pub timestamp: i64,
    /// Payload
    pub kind: QuantumKind,
}

/// Quantum payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantumKind {
    /// Constellation bootstrap, always apex 1
    ConstellationInit {
        /// Initial settings
        settings: ConstellationSettings,
        /// External ledger sequence at bootstrap
        ledger: u64,
    },
    /// Client request signed by its account
    Request(Box<Envelope>),
    /// Ledger update signed by an auditor
    LedgerCommit(Box<Envelope>),
    /// Snapshot checkpoint with the hash computed by the leader
    Snapshot {
        /// Snapshot hash
        hash: [u8; 32],
    },
}

impl QuantumKind {
    /// Short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            QuantumKind::ConstellationInit { .. } => "constellation_init",
            QuantumKind::Request(_) => "request",
            QuantumKind::LedgerCommit(_) => "ledger_commit",
            QuantumKind::Snapshot { .. } => "snapshot",
        }
    }
}

/// Client requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestMessage {
    /// Place an order
    Order(OrderRequest),
    /// Cancel an order
    OrderCancellation(OrderCancellationRequest),
    /// Transfer funds
    Payment(PaymentRequest),
    /// Withdraw funds to the external ledger
    Withdrawal(WithdrawalRequest),
    /// Query account data
    AccountData(AccountDataRequest),
}

impl RequestMessage {
    /// Requesting account
    pub fn account(&self) -> &PublicKey {
        match self {
            RequestMessage::Order(r) => &r.account,
            RequestMessage::OrderCancellation(r) => &r.account,
            RequestMessage::Payment(r) => &r.account,
            RequestMessage::Withdrawal(r) => &r.account,
            RequestMessage::AccountData(r) => &r.account,
        }
    }

    /// Request nonce
    pub fn nonce(&self) -> u64 {
        match self {
            RequestMessage::Order(r) => r.nonce,
            RequestMessage::OrderCancellation(r) => r.nonce,
            RequestMessage::Payment(r) => r.nonce,
            RequestMessage::Withdrawal(r) => r.nonce,
            RequestMessage::AccountData(r) => r.nonce,
        }
    }
}

/// Order placement request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Account
    pub account: PublicKey,
    /// Nonce
    pub nonce: u64,
    /// Traded asset (quoted in asset 0)
    pub asset: AssetId,
    /// Side
    pub side: OrderSide,
    /// Limit price
    pub price: Decimal,
    /// Amount of the traded asset
    pub amount: u64,
    /// Remainder handling
    pub time_in_force: TimeInForce,
}

/// Order cancellation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancellationRequest {
    /// Account
    pub account: PublicKey,
    /// Nonce
    pub nonce: u64,
    /// Order to cancel
    pub order_id: u64,
}

/// Payment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Source account
    pub account: PublicKey,
    /// Nonce
    pub nonce: u64,
    /// Destination account
    pub destination: PublicKey,
    /// Asset
    pub asset: AssetId,
    /// Amount
    pub amount: u64,
    /// Free-form memo
    pub memo: Option<String>,
}

/// Withdrawal request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Source account
    pub account: PublicKey,
    /// Nonce
    pub nonce: u64,
    /// Destination on the external ledger
    pub destination: PublicKey,
    /// Asset
    pub asset: AssetId,
    /// Amount
    pub amount: u64,
}

/// Account data request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDataRequest {
    /// Account
    pub account: PublicKey,
    /// Nonce
    pub nonce: u64,
}

/// Payments observed on the external ledger for one ledger sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerUpdateNotification {
    /// Ledger sequence
    pub ledger: u64,
    /// Observed payments touching the vault
    pub payments: Vec<LedgerPayment>,
}

/// Payment observed on the external ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerPayment {
    /// Funds sent to the vault for an account
    Deposit {
        /// Credited account
        account: PublicKey,
        /// Asset
        asset: AssetId,
        /// Amount
        amount: u64,
        /// External transaction hash
        transaction_hash: [u8; 32],
    },
    /// Outcome of a pending withdrawal
    Withdrawal {
        /// External transaction hash
        transaction_hash: [u8; 32],
        /// Whether the transfer went through
        success: bool,
    },
}

/// Result of processing a quantum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Processed quantum envelope
    pub original: Box<Envelope>,
    /// Status
    pub status: ResultStatus,
    /// Effects (filtered to the requesting account for client requests)
    pub effects: Vec<Effect>,
    /// Account state returned to account data requests
    pub account: Option<Account>,
}

/// Signed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Signed message
    pub message: Message,
    /// Signatures over the message hash, in collection order
    pub signatures: Vec<Ed25519Signature>,
}

impl Envelope {
    /// Unsigned envelope
    pub fn new(message: Message) -> Self {
        Self {
            message,
            signatures: Vec::new(),
        }
    }

    /// Create and sign
    pub fn signed(message: Message, keypair: &KeyPair) -> Result<Self> {
        let mut envelope = Self::new(message);
        envelope.sign(keypair)?;
        Ok(envelope)
    }

    /// Hash of the inner message
    pub fn message_hash(&self) -> Result<[u8; 32]> {
        hash(&self.message)
    }

    /// Add a signature, ignoring repeated signers
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<()> {
        let signer = keypair.public_key();
        if self.signatures.iter().any(|s| s.signer == signer) {
            return Ok(());
        }
        let message_hash = self.message_hash()?;
        self.signatures.push(Ed25519Signature {
            signer,
            signature: keypair.sign(&message_hash),
        });
        Ok(())
    }

    /// Merge signatures of another envelope over the same message
    pub fn aggregate(&mut self, other: &Envelope) -> Result<()> {
        if self.message_hash()? != other.message_hash()? {
            return Err(Error::BadRequest(
                "Cannot aggregate envelopes with different message hashes".to_string(),
            ));
        }
        for signature in &other.signatures {
            if !self.signatures.iter().any(|s| s.signer == signature.signer) {
                self.signatures.push(*signature);
            }
        }
        Ok(())
    }

    /// True when there is at least one signature and all of them verify
    pub fn are_signatures_valid(&self) -> Result<bool> {
        if self.signatures.is_empty() {
            return Ok(false);
        }
        let message_hash = self.message_hash()?;
        Ok(self.signatures.iter().all(|s| s.is_valid(&message_hash)))
    }

    /// True when `key` has a valid signature on this envelope
    pub fn is_signed_by(&self, key: &PublicKey) -> Result<bool> {
        let message_hash = self.message_hash()?;
        Ok(self
            .signatures
            .iter()
            .any(|s| &s.signer == key && s.is_valid(&message_hash)))
    }

    /// Distinct signers with valid signatures
    pub fn valid_signers(&self) -> Result<Vec<PublicKey>> {
        let message_hash = self.message_hash()?;
        let mut signers: Vec<PublicKey> = self
            .signatures
            .iter()
            .filter(|s| s.is_valid(&message_hash))
            .map(|s| s.signer)
            .collect();
        signers.sort();
        signers.dedup();
        Ok(signers)
    }
}
