use rand::rngs::OsRng;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Length in bytes of an address (and therefore of an output's owner hash)
pub const ADDRESS_LEN: usize = 20;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed address: {0}")]
    MalformedAddress(String),
}

/// Represents a wallet address: the first 20 bytes of SHA-256 over the
/// compressed public key, written as hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_LEN]);

impl Address {
    /// Derives the address of a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self::from_public_key_bytes(&public_key.serialize())
    }

    /// Derives the address from serialized public key bytes
    ///
    /// The bytes are not checked to be a valid curve point; callers that need
    /// that guarantee parse the key first.
    pub fn from_public_key_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut raw = [0u8; ADDRESS_LEN];
        raw.copy_from_slice(&digest[..ADDRESS_LEN]);
        Address(raw)
    }

    /// Raw owner-hash bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::MalformedAddress(e.to_string()))?;

        let raw: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::MalformedAddress(format!(
                "expected {} bytes, got {}",
                ADDRESS_LEN,
                bytes.len()
            ))
        })?;

        Ok(Address(raw))
    }
}

/// Represents a wallet with a secp256k1 keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        let address = Address::from_public_key(&public_key);

        Wallet {
            secret_key,
            public_key,
            address,
        }
    }

    /// Creates a wallet from an existing 32-byte secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret_key = SecretKey::from_slice(secret_key_bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        let address = Address::from_public_key(&public_key);

        Ok(Wallet {
            secret_key,
            public_key,
            address,
        })
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Compressed (33 byte) public key
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public_key.serialize().to_vec()
    }

    /// Signs a 32-byte digest, returning the 64-byte compact `r || s` signature
    pub fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>, CryptoError> {
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest_slice(digest)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let signature = secp.sign_ecdsa(&message, &self.secret_key);
        Ok(signature.serialize_compact().to_vec())
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.secret_key.secret_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a compact signature over a digest against serialized public key
/// bytes. Malformed keys or signatures verify as false.
pub fn verify_signature(public_key: &[u8], signature: &[u8], digest: &[u8; 32]) -> bool {
    let Ok(public_key) = PublicKey::from_slice(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(signature) else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(digest) else {
        return false;
    };

    Secp256k1::verification_only()
        .verify_ecdsa(&message, &signature, &public_key)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert_eq!(wallet.address().to_string().len(), ADDRESS_LEN * 2);
        assert_eq!(wallet.public_key_bytes().len(), 33);
    }

    #[test]
    fn test_signing_and_verification() {
        let wallet = Wallet::new();
        let message = digest(b"Hello, world!");

        let signature = wallet.sign_digest(&message).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(&wallet.public_key_bytes(), &signature, &message));

        let wrong_message = digest(b"Wrong message");
        assert!(!verify_signature(&wallet.public_key_bytes(), &signature, &wrong_message));
    }

    #[test]
    fn test_verification_rejects_garbage() {
        let wallet = Wallet::new();
        let message = digest(b"payload");
        let signature = wallet.sign_digest(&message).unwrap();

        assert!(!verify_signature(&[1, 2, 3], &signature, &message));
        assert!(!verify_signature(&wallet.public_key_bytes(), &[], &message));
    }

    #[test]
    fn test_secret_key_round_trip() {
        let wallet = Wallet::new();
        let restored = Wallet::from_secret_key(&wallet.export_secret_key()).unwrap();

        assert_eq!(restored.address(), wallet.address());
        assert!(Wallet::from_secret_key(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_address_parsing() {
        let wallet = Wallet::new();
        let parsed: Address = wallet.address().to_string().parse().unwrap();
        assert_eq!(&parsed, wallet.address());

        assert!(matches!(
            "zz".parse::<Address>(),
            Err(CryptoError::MalformedAddress(_))
        ));
        assert!(matches!(
            "aabb".parse::<Address>(),
            Err(CryptoError::MalformedAddress(_))
        ));
    }
}
