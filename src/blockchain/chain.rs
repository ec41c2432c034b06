use log::{info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use super::block::{Block, BlockError, Payload};
use super::proof::{BlockHeader, ProofOfWork, DIFFICULTY_BITS};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{OutPoint, ReferencedOutputs, Transaction};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Invalid chain: {0}")]
    InvalidChain(#[from] ChainViolation),

    #[error("Block rejected: {0}")]
    BlockRejected(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("System error: {0}")]
    SystemError(String),
}

/// Which invariant a block broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ViolationKind {
    #[error("genesis block is malformed")]
    GenesisInvalid,

    #[error("proof of work does not hold")]
    ProofInvalid,

    #[error("parent hash does not match the previous block")]
    LinkageInvalid,

    #[error("transaction id does not match its contents")]
    TransactionInvalid,
}

/// First failing block found by validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind} at position {position}")]
pub struct ChainViolation {
    pub position: usize,
    pub kind: ViolationKind,
}

/// Represents the blockchain
///
/// Cloning yields another handle to the same chain. Appends are serialized
/// by a writer lock held across reading the head, mining and pushing; readers
/// only ever see fully appended blocks.
#[derive(Debug, Clone)]
pub struct Blockchain {
    /// Blocks from genesis (index 0) to head
    blocks: Arc<RwLock<Vec<Block>>>,

    /// Held for the whole read-head/mine/push sequence
    append_lock: Arc<Mutex<()>>,

    pow: ProofOfWork,

    /// Storage for blockchain data
    storage: Option<Arc<BlockchainStorage>>,
}

impl Blockchain {
    /// Creates an in-memory blockchain holding only the genesis block
    ///
    /// # Returns
    ///
    /// A new Blockchain mined at [`DIFFICULTY_BITS`]
    pub fn new() -> Result<Self, BlockchainError> {
        Self::with_proof(ProofOfWork::new(DIFFICULTY_BITS).map_err(BlockError::from)?)
    }

    /// Creates an in-memory blockchain mined at the given puzzle difficulty
    ///
    /// # Arguments
    ///
    /// * `pow` - The puzzle every block must solve
    pub fn with_proof(pow: ProofOfWork) -> Result<Self, BlockchainError> {
        let genesis = Block::new_genesis(&pow)?;
        info!("Created genesis block {}", genesis.hash_hex());

        Ok(Self::from_parts(vec![genesis], pow, None))
    }

    /// Opens a persistent blockchain
    ///
    /// # Arguments
    ///
    /// * `storage_path` - The path to the storage directory
    ///
    /// # Returns
    ///
    /// The stored chain, or a fresh one when the directory holds none
    pub fn with_storage<P: AsRef<Path>>(storage_path: P) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;
        let pow = ProofOfWork::new(DIFFICULTY_BITS).map_err(BlockError::from)?;
        Self::open(storage, pow)
    }

    /// Loads the chain held by `storage`, or seeds it with a genesis block
    /// when it is empty. A stored chain that fails validation is refused.
    ///
    /// # Arguments
    ///
    /// * `storage` - The opened block store
    /// * `pow` - The puzzle the stored blocks were mined against
    pub fn open(storage: BlockchainStorage, pow: ProofOfWork) -> Result<Self, BlockchainError> {
        let blocks = storage.load_chain()?;

        if blocks.is_empty() {
            info!("No existing blockchain found in storage, creating genesis block");
            let genesis = Block::new_genesis(&pow)?;
            storage.save_block(&genesis)?;
            storage.flush()?;

            return Ok(Self::from_parts(vec![genesis], pow, Some(storage)));
        }

        Self::check_blocks(&blocks, &pow)?;
        info!("Loaded {} blocks from storage", blocks.len());

        Ok(Self::from_parts(blocks, pow, Some(storage)))
    }

    fn from_parts(blocks: Vec<Block>, pow: ProofOfWork, storage: Option<BlockchainStorage>) -> Self {
        Blockchain {
            blocks: Arc::new(RwLock::new(blocks)),
            append_lock: Arc::new(Mutex::new(())),
            pow,
            storage: storage.map(Arc::new),
        }
    }

    fn read_blocks(&self) -> RwLockReadGuard<'_, Vec<Block>> {
        // Blocks are pushed whole, so a poisoned lock still guards a valid chain
        self.blocks.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The puzzle every block of this chain is mined against
    pub fn proof(&self) -> &ProofOfWork {
        &self.pow
    }

    /// Gets the last block in the chain
    ///
    /// # Returns
    ///
    /// A copy of the head block
    pub fn head(&self) -> Block {
        self.read_blocks()
            .last()
            .cloned()
            .expect("Blockchain should always have at least the genesis block")
    }

    /// Number of blocks, genesis included
    pub fn len(&self) -> usize {
        self.read_blocks().len()
    }

    /// Snapshot of every block, genesis first
    pub fn blocks(&self) -> Vec<Block> {
        self.read_blocks().clone()
    }

    /// Walks a snapshot of the chain from head to genesis
    pub fn iter(&self) -> BlockchainIterator {
        BlockchainIterator {
            remaining: self.blocks(),
            done: false,
        }
    }

    /// Mines `payload` on top of the current head and appends it
    ///
    /// # Arguments
    ///
    /// * `payload` - Free-form data or the transactions to include
    ///
    /// # Returns
    ///
    /// The appended block
    pub fn append(&self, payload: Payload) -> Result<Block, BlockchainError> {
        self.append_with(payload, None)
    }

    /// Like [`Blockchain::append`], but gives up without appending once
    /// `cancel` is raised
    ///
    /// # Arguments
    ///
    /// * `payload` - Free-form data or the transactions to include
    /// * `cancel` - Raised by another thread to stop the nonce search
    pub fn append_cancellable(
        &self,
        payload: Payload,
        cancel: &AtomicBool,
    ) -> Result<Block, BlockchainError> {
        self.append_with(payload, Some(cancel))
    }

    fn append_with(
        &self,
        payload: Payload,
        cancel: Option<&AtomicBool>,
    ) -> Result<Block, BlockchainError> {
        let _writer = self
            .append_lock
            .lock()
            .map_err(|_| BlockchainError::SystemError("append lock poisoned".to_string()))?;

        self.verify_transactions(payload.transactions())?;

        let parent_hash = self.head().hash().to_vec();
        let block = match cancel {
            Some(cancel) => Block::new_cancellable(payload, parent_hash, &self.pow, cancel)?,
            None => Block::new(payload, parent_hash, &self.pow)?,
        };

        self.commit(block.clone())?;
        Ok(block)
    }

    /// Persists then publishes a block. Must be called with the append lock held.
    fn commit(&self, block: Block) -> Result<(), BlockchainError> {
        if let Some(storage) = &self.storage {
            storage.save_block(&block)?;
            storage.flush()?;
        }

        let mut blocks = self
            .blocks
            .write()
            .map_err(|_| BlockchainError::SystemError("chain lock poisoned".to_string()))?;
        blocks.push(block);

        info!(
            "Appended block {} at height {}",
            blocks[blocks.len() - 1].hash_hex(),
            blocks.len() - 1
        );
        Ok(())
    }

    /// Appends a free-form data block
    ///
    /// # Arguments
    ///
    /// * `data` - The block data
    pub fn add_block(&self, data: &str) -> Result<Block, BlockchainError> {
        self.append(data.into())
    }

    /// Appends a block of transactions
    ///
    /// Every transaction must carry the id of its contents, and every
    /// non-coinbase transaction must spend outputs that exist on the chain,
    /// are unspent, are owned by its signer and cover its outputs.
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    ///
    /// # Returns
    ///
    /// The mined block
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        self.append(Payload::Transactions(transactions))
    }

    /// Accepts a block mined elsewhere if it extends the current head
    ///
    /// # Arguments
    ///
    /// * `block` - The already mined block
    pub fn submit_block(&self, block: Block) -> Result<(), BlockchainError> {
        let _writer = self
            .append_lock
            .lock()
            .map_err(|_| BlockchainError::SystemError("append lock poisoned".to_string()))?;

        let head = self.head();
        if !self.validate_single(&block, head.hash()) {
            warn!("Rejected submitted block {}", block.hash_hex());
            return Err(BlockchainError::BlockRejected(format!(
                "block {} does not extend head {}",
                block.hash_hex(),
                head.hash_hex()
            )));
        }
        self.verify_transactions(block.transactions())?;

        self.commit(block)
    }

    /// Checks a single candidate block: parent linkage, proof of work,
    /// transaction ids and a non-empty transaction list for ledger blocks
    ///
    /// # Arguments
    ///
    /// * `candidate` - The block to check
    /// * `expected_parent_hash` - The hash the block must build on
    pub fn validate_single(&self, candidate: &Block, expected_parent_hash: &[u8]) -> bool {
        let ledger_block_is_empty = matches!(
            candidate.payload(),
            Payload::Transactions(transactions) if transactions.is_empty()
        );

        !ledger_block_is_empty
            && candidate.parent_hash() == expected_parent_hash
            && candidate.has_valid_proof(&self.pow)
            && candidate.has_valid_transaction_ids()
    }

    /// Validates the whole chain, logging the first violation found
    ///
    /// # Returns
    ///
    /// `true` if the chain is valid, `false` otherwise
    pub fn validate(&self) -> bool {
        match self.check() {
            Ok(()) => true,
            Err(violation) => {
                warn!("Chain validation failed: {}", violation);
                false
            }
        }
    }

    /// Validates the whole chain and reports the first violation
    pub fn check(&self) -> Result<(), ChainViolation> {
        Self::check_blocks(&self.read_blocks(), &self.pow)
    }

    fn check_blocks(blocks: &[Block], pow: &ProofOfWork) -> Result<(), ChainViolation> {
        let genesis_ok = blocks
            .first()
            .is_some_and(|genesis| genesis.is_genesis() && genesis.has_valid_proof(pow));
        if !genesis_ok {
            return Err(ChainViolation {
                position: 0,
                kind: ViolationKind::GenesisInvalid,
            });
        }

        for (index, pair) in blocks.windows(2).enumerate() {
            let (previous, current) = (&pair[0], &pair[1]);
            let violation = |kind| ChainViolation {
                position: index + 1,
                kind,
            };

            if !current.has_valid_proof(pow) {
                return Err(violation(ViolationKind::ProofInvalid));
            }
            if current.parent_hash() != previous.hash() {
                return Err(violation(ViolationKind::LinkageInvalid));
            }
            if !current.has_valid_transaction_ids() {
                return Err(violation(ViolationKind::TransactionInvalid));
            }
        }

        Ok(())
    }

    /// Finds a transaction anywhere in the chain by id, newest first
    ///
    /// # Arguments
    ///
    /// * `id` - The transaction id
    pub fn find_transaction(&self, id: &[u8]) -> Option<Transaction> {
        self.iter()
            .flat_map(|block| block.transactions().to_vec())
            .find(|transaction| transaction.id == id)
    }

    /// Resolves every output spent by `transaction` from the chain
    ///
    /// # Arguments
    ///
    /// * `transaction` - The spending transaction
    ///
    /// # Returns
    ///
    /// The referenced outputs keyed by outpoint, ready for `sign`/`verify`
    pub fn referenced_outputs(
        &self,
        transaction: &Transaction,
    ) -> Result<ReferencedOutputs, BlockchainError> {
        let mut referenced = ReferencedOutputs::new();

        for input in &transaction.inputs {
            let unknown = || {
                BlockchainError::InvalidTransaction(format!(
                    "{} spends unknown output {}:{}",
                    transaction.id_hex(),
                    hex::encode(&input.txid),
                    input.vout
                ))
            };

            let previous = self.find_transaction(&input.txid).ok_or_else(unknown)?;
            let output = usize::try_from(input.vout)
                .ok()
                .and_then(|index| previous.outputs.get(index))
                .ok_or_else(unknown)?;

            referenced.insert(input.outpoint(), output.clone());
        }

        Ok(referenced)
    }

    /// Outpoints already consumed by transactions on the chain
    pub fn spent_outputs(&self) -> HashSet<OutPoint> {
        self.read_blocks()
            .iter()
            .flat_map(|block| block.transactions())
            .filter(|transaction| !transaction.is_coinbase())
            .flat_map(|transaction| transaction.inputs.iter().map(|input| input.outpoint()))
            .collect()
    }

    fn verify_transactions(&self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        let invalid = |transaction: &Transaction, reason: &str| {
            BlockchainError::InvalidTransaction(format!("{} {}", transaction.id_hex(), reason))
        };

        let mut spent = self.spent_outputs();

        for transaction in transactions {
            if !transaction.has_valid_id() {
                return Err(invalid(transaction, "has an id that does not match its contents"));
            }
            if transaction.is_coinbase() {
                continue;
            }

            let referenced = self.referenced_outputs(transaction)?;
            if !transaction.verify(&referenced) {
                return Err(invalid(transaction, "has an invalid signature"));
            }

            for input in &transaction.inputs {
                if !spent.insert(input.outpoint()) {
                    return Err(invalid(
                        transaction,
                        &format!(
                            "spends output {}:{} twice",
                            hex::encode(&input.txid),
                            input.vout
                        ),
                    ));
                }
            }

            let available = referenced
                .values()
                .try_fold(0u64, |sum, output| sum.checked_add(output.value));
            let requested = transaction
                .outputs
                .iter()
                .try_fold(0u64, |sum, output| sum.checked_add(output.value));
            match (available, requested) {
                (Some(available), Some(requested)) if requested <= available => {}
                _ => return Err(invalid(transaction, "spends more than its inputs hold")),
            }
        }

        Ok(())
    }
}

/// Yields blocks from head to genesis over a snapshot taken at creation
#[derive(Debug)]
pub struct BlockchainIterator {
    remaining: Vec<Block>,
    done: bool,
}

impl Iterator for BlockchainIterator {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.done {
            return None;
        }

        let block = self.remaining.pop()?;
        if block.is_genesis() {
            self.done = true;
        }
        Some(block)
    }
}
