use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::sync::atomic::AtomicBool;

use super::proof::{BlockHeader, Hash, ProofError, ProofOfWork};
use super::transaction::Transaction;

/// Payload of the genesis block
pub const GENESIS_DATA: &[u8] = b"Genesis Block";

/// Timestamp of the genesis block, fixed so every chain shares the same one
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200;

/// Errors that can occur while building a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("A ledger block needs at least one transaction")]
    EmptyTransactions,

    #[error("Proof of work error: {0}")]
    ProofError(#[from] ProofError),
}

/// Contents of a block: free-form data or a list of transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Data(Vec<u8>),
    Transactions(Vec<Transaction>),
}

impl Payload {
    const DATA_TAG: u8 = 0;
    const TRANSACTIONS_TAG: u8 = 1;

    /// Bytes fed to the proof-of-work header: a tag for the variant, then
    /// either the raw data or, per transaction, its length-prefixed id and
    /// its content hash
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Payload::Data(data) => {
                let mut bytes = Vec::with_capacity(data.len() + 1);
                bytes.push(Self::DATA_TAG);
                bytes.extend_from_slice(data);
                bytes
            }
            Payload::Transactions(transactions) => {
                let mut bytes = vec![Self::TRANSACTIONS_TAG];
                for transaction in transactions {
                    bytes.extend_from_slice(&(transaction.id.len() as u32).to_be_bytes());
                    bytes.extend_from_slice(&transaction.id);
                    bytes.extend_from_slice(&transaction.hash());
                }
                bytes
            }
        }
    }

    /// Transactions carried by the payload (none for a data payload)
    pub fn transactions(&self) -> &[Transaction] {
        match self {
            Payload::Data(_) => &[],
            Payload::Transactions(transactions) => transactions,
        }
    }

    fn check(&self) -> Result<(), BlockError> {
        match self {
            Payload::Transactions(transactions) if transactions.is_empty() => {
                Err(BlockError::EmptyTransactions)
            }
            _ => Ok(()),
        }
    }
}

impl From<&str> for Payload {
    fn from(data: &str) -> Self {
        Payload::Data(data.as_bytes().to_vec())
    }
}

impl From<Vec<Transaction>> for Payload {
    fn from(transactions: Vec<Transaction>) -> Self {
        Payload::Transactions(transactions)
    }
}

/// Represents a mined block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Creation time in seconds since the Unix epoch
    pub(crate) timestamp: i64,

    pub(crate) payload: Payload,

    /// Hash of the previous block; empty for genesis
    pub(crate) parent_hash: Vec<u8>,

    /// Proof of work (nonce)
    pub(crate) nonce: u64,

    /// Winning hash found while mining
    pub(crate) hash: Hash,
}

impl Block {
    /// Stamps the current time and mines a block on top of `parent_hash`
    pub fn new(
        payload: Payload,
        parent_hash: Vec<u8>,
        pow: &ProofOfWork,
    ) -> Result<Self, BlockError> {
        let block = Self::candidate(payload, parent_hash, Utc::now().timestamp())?;
        let solution = pow.mine(&block)?;
        Ok(block.solved(solution))
    }

    /// Same as [`Block::new`], but stops with [`ProofError::Cancelled`] once
    /// `cancel` is raised
    pub fn new_cancellable(
        payload: Payload,
        parent_hash: Vec<u8>,
        pow: &ProofOfWork,
        cancel: &AtomicBool,
    ) -> Result<Self, BlockError> {
        let block = Self::candidate(payload, parent_hash, Utc::now().timestamp())?;
        let solution = pow.mine_cancellable(&block, cancel)?;
        Ok(block.solved(solution))
    }

    /// Creates the genesis block. Its content is fixed, so every chain mined
    /// at the same difficulty starts from the same block.
    pub fn new_genesis(pow: &ProofOfWork) -> Result<Self, BlockError> {
        let block = Self::candidate(
            Payload::Data(GENESIS_DATA.to_vec()),
            Vec::new(),
            GENESIS_TIMESTAMP,
        )?;
        let solution = pow.mine(&block)?;
        Ok(block.solved(solution))
    }

    fn candidate(
        payload: Payload,
        parent_hash: Vec<u8>,
        timestamp: i64,
    ) -> Result<Self, BlockError> {
        payload.check()?;

        Ok(Block {
            timestamp,
            payload,
            parent_hash,
            nonce: 0,
            hash: [0u8; 32],
        })
    }

    fn solved(self, (nonce, hash): (u64, Hash)) -> Self {
        Block { nonce, hash, ..self }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn transactions(&self) -> &[Transaction] {
        self.payload.transactions()
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hash.is_empty()
    }

    /// Recomputes the hash at the stored nonce; it must equal the cached hash
    /// and be below the target
    pub fn has_valid_proof(&self, pow: &ProofOfWork) -> bool {
        pow.hash_with_nonce(self, self.nonce) == self.hash && pow.validate(self)
    }

    /// Whether every transaction's id matches its contents
    pub fn has_valid_transaction_ids(&self) -> bool {
        self.transactions().iter().all(Transaction::has_valid_id)
    }

    /// Encodes the block with bincode
    pub fn serialize(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes a block produced by [`Block::serialize`]
    pub fn deserialize(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

impl BlockHeader for Block {
    fn parent_hash(&self) -> &[u8] {
        &self.parent_hash
    }

    fn payload_bytes(&self) -> Vec<u8> {
        self.payload.bytes()
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn nonce(&self) -> u64 {
        self.nonce
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    fn pow() -> ProofOfWork {
        ProofOfWork::new(8).unwrap()
    }

    #[test]
    fn test_new_block() {
        let pow = pow();
        let block = Block::new("hello".into(), vec![7u8; 32], &pow).unwrap();

        assert_eq!(block.payload(), &Payload::Data(b"hello".to_vec()));
        assert_eq!(block.parent_hash(), &[7u8; 32][..]);
        assert!(!block.is_genesis());
        assert!(pow.meets_target(block.hash()));
        assert!(pow.validate(&block));
        assert!(block.has_valid_proof(&pow));
    }

    #[test]
    fn test_genesis_is_reproducible() {
        let pow = pow();
        let first = Block::new_genesis(&pow).unwrap();
        let second = Block::new_genesis(&pow).unwrap();

        assert!(first.is_genesis());
        assert_eq!(first, second);
        assert_eq!(first.timestamp(), GENESIS_TIMESTAMP);
        assert!(first.has_valid_proof(&pow));
    }

    #[test]
    fn test_empty_transaction_list_is_rejected() {
        let result = Block::new(Payload::Transactions(Vec::new()), vec![1; 32], &pow());
        assert!(matches!(result, Err(BlockError::EmptyTransactions)));
    }

    #[test]
    fn test_transaction_block() {
        let pow = pow();
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address(), 50);

        let block = Block::new(vec![coinbase.clone()].into(), vec![1; 32], &pow).unwrap();

        assert_eq!(block.transactions(), &[coinbase.clone()]);
        let mut expected = vec![1u8, 0, 0, 0, 32];
        expected.extend_from_slice(&coinbase.id);
        expected.extend_from_slice(&coinbase.hash());
        assert_eq!(block.payload_bytes(), expected);
        assert!(block.has_valid_proof(&pow));
        assert!(block.has_valid_transaction_ids());
    }

    #[test]
    fn test_data_payload_cannot_mimic_transactions() {
        let wallet = Wallet::new();
        let transactions = Payload::from(vec![Transaction::new_coinbase(wallet.address(), 50)]);

        // Data whose raw bytes equal the encoded transaction list
        let mimic = Payload::Data(transactions.bytes()[1..].to_vec());
        assert_ne!(mimic.bytes(), transactions.bytes());
    }

    #[test]
    fn test_rewritten_transaction_id_breaks_proof() {
        let pow = pow();
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address(), 50);
        let mut block = Block::new(vec![coinbase].into(), vec![1; 32], &pow).unwrap();

        if let Payload::Transactions(transactions) = &mut block.payload {
            transactions[0].id[0] ^= 0x01;
        }
        assert!(!block.has_valid_proof(&pow));
        assert!(!block.has_valid_transaction_ids());
    }

    #[test]
    fn test_tampering_breaks_proof() {
        let pow = pow();
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address(), 50);
        let block = Block::new(vec![coinbase].into(), vec![1; 32], &pow).unwrap();

        let mut reward = block.clone();
        if let Payload::Transactions(transactions) = &mut reward.payload {
            transactions[0].outputs[0].value = 1_000;
        }
        assert!(!reward.has_valid_proof(&pow));

        let mut nonce = block.clone();
        nonce.nonce += 1;
        assert!(!nonce.has_valid_proof(&pow));

        let mut parent = block;
        parent.parent_hash[0] ^= 0xff;
        assert!(!parent.has_valid_proof(&pow));
    }

    #[test]
    fn test_serialization_round_trip() {
        let pow = pow();
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address(), 50);
        let block = Block::new(vec![coinbase].into(), vec![3; 32], &pow).unwrap();

        let bytes = block.serialize().unwrap();
        let decoded = Block::deserialize(&bytes).unwrap();

        assert_eq!(decoded.hash(), block.hash());
        assert_eq!(decoded.nonce(), block.nonce());
        assert_eq!(decoded.parent_hash(), block.parent_hash());
        assert_eq!(decoded.payload(), block.payload());
        assert!(decoded.has_valid_proof(&pow));
    }
}
