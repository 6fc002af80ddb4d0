//! Cryptographic operations
//!
//! This module provides:
//! - Ed25519 key pair generation, signing, and verification
//! - SHA-256 hashing of canonical message bytes
//! - The majority threshold shared by snapshot quorum and vault multisig

use crate::types::{PublicKey, Signature};
use crate::{Error, Result};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Create from a hex-encoded seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed)
            .map_err(|e| Error::Config(format!("Invalid secret seed: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("Secret seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Get public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.verifying_key.to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signature = self.signing_key.sign(message);
        Signature::from_bytes(signature.to_bytes())
    }

    /// Verify a signature made by this key pair
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());
        self.verifying_key
            .verify(message, &dalek_sig)
            .map_err(|e| Error::Unauthorized(format!("Verification failed: {}", e)))
    }
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let dalek_sig = DalekSignature::from_bytes(signature.as_bytes());

    let verifying_key = match VerifyingKey::from_bytes(public_key.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Minimal number of signatures out of `total` signers: `floor(total / 2) + 1`
pub fn majority_count(total: usize) -> usize {
    total / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"apex 42";
        let signature = keypair.sign(message);

        assert!(keypair.verify(message, &signature).is_ok());
        assert!(verify_signature(message, &signature, &keypair.public_key()));
        assert!(!verify_signature(b"apex 43", &signature, &keypair.public_key()));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let signature = signer.sign(b"payload");

        assert!(!verify_signature(b"payload", &signature, &other.public_key()));
    }

    #[test]
    fn test_deterministic_from_seed() {
        let a = KeyPair::from_seed(&[3u8; 32]);
        let b = KeyPair::from_hex_seed(&"03".repeat(32)).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(KeyPair::from_hex_seed("zz").is_err());
    }

    #[test]
    fn test_hash_bytes() {
        let hash1 = hash_bytes(b"quantum");
        let hash2 = hash_bytes(b"quantum");
        let hash3 = hash_bytes(b"quanta");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn test_majority_count() {
        assert_eq!(majority_count(1), 1);
        assert_eq!(majority_count(2), 2);
        assert_eq!(majority_count(3), 2);
        assert_eq!(majority_count(4), 3);
        assert_eq!(majority_count(5), 3);
    }
}
