use log::{debug, info};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uint::construct_uint;

use std::sync::atomic::{AtomicBool, Ordering};

construct_uint! {
    /// 256-bit unsigned integer used for target comparisons
    pub struct U256(4);
}

/// A SHA-256 block hash
pub type Hash = [u8; 32];

/// Number of leading zero bits a block hash must have
pub const DIFFICULTY_BITS: u32 = 16;

/// Nonce attempts between two checks of a cancellation flag
pub const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Errors that can occur while solving the puzzle
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Invalid difficulty: {0} bits (expected 1..=255)")]
    InvalidDifficulty(u32),

    #[error("Nonce space exhausted without finding a valid hash")]
    NonceSpaceExhausted,

    #[error("Mining cancelled")]
    Cancelled,
}

/// The header fields the puzzle hashes. Anything exposing them can be mined
/// and validated.
pub trait BlockHeader {
    fn parent_hash(&self) -> &[u8];

    fn payload_bytes(&self) -> Vec<u8>;

    fn timestamp(&self) -> i64;

    fn nonce(&self) -> u64;
}

/// Fixed-difficulty proof-of-work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofOfWork {
    difficulty_bits: u32,
    target: U256,
}

impl ProofOfWork {
    /// Creates a puzzle with `target = 2^(256 - difficulty_bits)`
    pub fn new(difficulty_bits: u32) -> Result<Self, ProofError> {
        if difficulty_bits == 0 || difficulty_bits > 255 {
            return Err(ProofError::InvalidDifficulty(difficulty_bits));
        }

        let target = U256::one() << (256 - difficulty_bits as usize);

        Ok(ProofOfWork {
            difficulty_bits,
            target,
        })
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    /// Concatenates parent hash, payload, then the decimal text of the
    /// timestamp, difficulty and nonce
    pub fn prepare_header(
        parent_hash: &[u8],
        payload: &[u8],
        timestamp: i64,
        difficulty_bits: u32,
        nonce: u64,
    ) -> Vec<u8> {
        let mut data = Vec::with_capacity(parent_hash.len() + payload.len() + 48);
        data.extend_from_slice(parent_hash);
        data.extend_from_slice(payload);
        data.extend_from_slice(timestamp.to_string().as_bytes());
        data.extend_from_slice(difficulty_bits.to_string().as_bytes());
        data.extend_from_slice(nonce.to_string().as_bytes());
        data
    }

    /// Hash of `header` with its nonce replaced by `nonce`
    pub fn hash_with_nonce<H: BlockHeader + ?Sized>(&self, header: &H, nonce: u64) -> Hash {
        let payload = header.payload_bytes();
        self.hash_parts(header.parent_hash(), &payload, header.timestamp(), nonce)
    }

    fn hash_parts(&self, parent_hash: &[u8], payload: &[u8], timestamp: i64, nonce: u64) -> Hash {
        let data = Self::prepare_header(parent_hash, payload, timestamp, self.difficulty_bits, nonce);
        Sha256::digest(data).into()
    }

    /// Whether `hash`, read as a big-endian integer, is below the target
    pub fn meets_target(&self, hash: &[u8]) -> bool {
        hash.len() == 32 && U256::from_big_endian(hash) < self.target
    }

    /// Searches nonces from zero upward for the first hash below the target
    pub fn mine<H: BlockHeader + ?Sized>(&self, header: &H) -> Result<(u64, Hash), ProofError> {
        self.search(header, None)
    }

    /// Like [`ProofOfWork::mine`], but gives up once `cancel` is raised. The
    /// flag is polled every [`CANCEL_CHECK_INTERVAL`] attempts.
    pub fn mine_cancellable<H: BlockHeader + ?Sized>(
        &self,
        header: &H,
        cancel: &AtomicBool,
    ) -> Result<(u64, Hash), ProofError> {
        self.search(header, Some(cancel))
    }

    fn search<H: BlockHeader + ?Sized>(
        &self,
        header: &H,
        cancel: Option<&AtomicBool>,
    ) -> Result<(u64, Hash), ProofError> {
        // The payload is fixed for the whole search
        let payload = header.payload_bytes();
        let parent_hash = header.parent_hash();
        let timestamp = header.timestamp();

        debug!(
            "Mining with difficulty {} over {} payload bytes",
            self.difficulty_bits,
            payload.len()
        );

        let mut nonce: u64 = 0;
        loop {
            if let Some(cancel) = cancel {
                if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                    info!("Mining cancelled after {} attempts", nonce);
                    return Err(ProofError::Cancelled);
                }
            }

            let hash = self.hash_parts(parent_hash, &payload, timestamp, nonce);
            if self.meets_target(&hash) {
                info!("Mined hash {} with nonce {}", hex::encode(hash), nonce);
                return Ok((nonce, hash));
            }

            nonce = nonce.checked_add(1).ok_or(ProofError::NonceSpaceExhausted)?;
        }
    }

    /// Recomputes the hash at the header's stored nonce and checks it against
    /// the target
    pub fn validate<H: BlockHeader + ?Sized>(&self, header: &H) -> bool {
        let hash = self.hash_with_nonce(header, header.nonce());
        self.meets_target(&hash)
    }
}
