// Blockchain module
//
// This module contains the ledger integrity engine:
// - Transaction model with signed inputs
// - Proof of work puzzle
// - Block structure
// - Blockchain structure and validation
// - Persistent block storage

pub mod block;
pub mod chain;
pub mod crypto;
pub mod proof;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::{Block, Payload};
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, Wallet};
pub use proof::BlockHeader;
pub use transaction::Transaction;
