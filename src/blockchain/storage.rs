use std::path::Path;

use log::debug;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::proof::BlockHeader;

/// Metadata key holding the hash of the current head block
const HEAD_HASH_KEY: &[u8] = b"lh";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Storage for blockchain data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Serialized blocks keyed by block hash
    blocks: Tree,

    /// Head pointer and other bookkeeping
    metadata: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A new BlockchainStorage instance
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a database that lives only as long as this handle
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
        })
    }

    /// Raw read from the block tree
    ///
    /// # Arguments
    ///
    /// * `key` - The key to read
    ///
    /// # Returns
    ///
    /// The stored value, if any
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(key)?.map(|value| value.to_vec()))
    }

    /// Raw write to the block tree
    ///
    /// # Arguments
    ///
    /// * `key` - The key to write
    /// * `value` - The bytes stored under `key`
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.blocks.insert(key, value)?;
        Ok(())
    }

    /// Saves a block and moves the head pointer to it
    ///
    /// # Arguments
    ///
    /// * `block` - The block to save
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = block
            .serialize()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.put(block.hash(), &value)?;
        self.metadata.insert(HEAD_HASH_KEY, &block.hash()[..])?;

        debug!("Stored block {}", block.hash_hex());
        Ok(())
    }

    /// Gets a block by its hash
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash of the block
    ///
    /// # Returns
    ///
    /// The block if found
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        let value = self.get(hash)?.ok_or_else(|| {
            StorageError::NotFound(format!("Block with hash {}", hex::encode(hash)))
        })?;

        Block::deserialize(&value)
            .map_err(|e| StorageError::DeserializationError(e.to_string()))
    }

    /// Gets the hash of the head block
    ///
    /// # Returns
    ///
    /// The head hash, or `None` if no block was ever stored
    pub fn head_hash(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(HEAD_HASH_KEY)?.map(|value| value.to_vec()))
    }

    /// Loads every block reachable from the head
    ///
    /// # Returns
    ///
    /// The stored blocks ordered genesis first, empty for a new database
    pub fn load_chain(&self) -> Result<Vec<Block>, StorageError> {
        let Some(mut hash) = self.head_hash()? else {
            return Ok(Vec::new());
        };

        let mut blocks = Vec::new();
        loop {
            let block = self.get_block(&hash)?;
            let reached_genesis = block.is_genesis();
            hash = block.parent_hash().to_vec();
            blocks.push(block);

            if reached_genesis {
                break;
            }
            if blocks.len() > self.blocks.len() {
                return Err(StorageError::DeserializationError(
                    "Parent pointers form a cycle".to_string(),
                ));
            }
        }

        blocks.reverse();
        Ok(blocks)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
