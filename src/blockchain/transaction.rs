use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::collections::HashMap;

use super::crypto::{self, Address, CryptoError, Wallet};

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

/// Length of the random data a mining reward carries in its coinbase input
pub const COINBASE_DATA_LEN: usize = 20;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Referenced output {txid}:{vout} was not supplied")]
    MissingReferencedOutput { txid: String, vout: i64 },

    #[error("Transaction already signed")]
    AlreadySigned,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Identifies a transaction output by the creating transaction's id and the
/// output's position in it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Vec<u8>,
    pub vout: i64,
}

/// Outputs spent by a transaction, supplied by the caller of `sign`/`verify`
pub type ReferencedOutputs = HashMap<OutPoint, TxOutput>;

/// A reference to a previous output together with the proof of ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output (empty for coinbase)
    pub txid: Vec<u8>,

    /// Index of the spent output ([`COINBASE_VOUT`] for coinbase)
    pub vout: i64,

    /// Compact ECDSA signature
    pub signature: Option<Vec<u8>>,

    /// Compressed public key of the signer
    pub public_key: Option<Vec<u8>>,
}

impl TxInput {
    /// Creates an unsigned input spending `txid:vout`
    pub fn new(txid: Vec<u8>, vout: i64) -> Self {
        TxInput {
            txid,
            vout,
            signature: None,
            public_key: None,
        }
    }

    fn coinbase(data: Option<Vec<u8>>) -> Self {
        TxInput {
            public_key: data,
            ..Self::new(Vec::new(), COINBASE_VOUT)
        }
    }

    /// The output this input spends
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }
}

/// An amount locked to the owner of an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub owner_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output of `value` locked to a hex `address`
    pub fn new(value: u64, address: &str) -> Result<Self, TransactionError> {
        let mut output = TxOutput {
            value,
            owner_hash: Vec::new(),
        };
        output.lock(address)?;
        Ok(output)
    }

    /// Creates an output locked to an already parsed address
    pub fn to_address(value: u64, address: &Address) -> Self {
        TxOutput {
            value,
            owner_hash: address.as_bytes().to_vec(),
        }
    }

    /// Locks the output to a hex `address`. The output is left untouched when
    /// the address does not decode.
    pub fn lock(&mut self, address: &str) -> Result<(), TransactionError> {
        let address: Address = address
            .parse()
            .map_err(|e: CryptoError| TransactionError::MalformedAddress(e.to_string()))?;

        self.owner_hash = address.as_bytes().to_vec();
        Ok(())
    }
}

/// Represents a value transfer in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash of inputs and outputs; empty until assigned
    pub id: Vec<u8>,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates an unsigned transfer. The id is assigned by [`Transaction::sign`]
    /// once the signatures are attached.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        }
    }

    /// Creates a coinbase transaction (mining reward)
    ///
    /// The id depends only on the address and the reward, so two such
    /// transactions paying the same address collide. Miners use
    /// [`Transaction::new_reward`] instead.
    pub fn new_coinbase(to: &Address, reward: u64) -> Self {
        Self::coinbase_with_data(to, reward, None)
    }

    /// Creates a coinbase transaction whose input carries random coinbase
    /// data, giving every reward its own id
    pub fn new_reward(to: &Address, reward: u64) -> Self {
        let data: [u8; COINBASE_DATA_LEN] = rand::random();
        Self::coinbase_with_data(to, reward, Some(data.to_vec()))
    }

    fn coinbase_with_data(to: &Address, reward: u64, data: Option<Vec<u8>>) -> Self {
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput::coinbase(data)],
            outputs: vec![TxOutput::to_address(reward, to)],
        };
        transaction.set_id();
        transaction
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid.is_empty()
            && self.inputs[0].vout == COINBASE_VOUT
    }

    /// SHA-256 over the canonical encoding of inputs and outputs
    pub fn hash(&self) -> [u8; 32] {
        Sha256::digest(self.canonical_bytes()).into()
    }

    /// Whether the stored id is the hash of the current contents
    pub fn has_valid_id(&self) -> bool {
        self.id == self.hash()
    }

    /// Hex rendering of the id
    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    fn set_id(&mut self) {
        self.id = self.hash().to_vec();
    }

    /// Length-prefixed, big-endian encoding of inputs then outputs. Optional
    /// fields carry a presence byte so an absent signature never collides with
    /// an empty one.
    fn canonical_bytes(&self) -> Vec<u8> {
        fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }

        fn put_optional(buf: &mut Vec<u8>, bytes: Option<&Vec<u8>>) {
            match bytes {
                Some(bytes) => {
                    buf.push(1);
                    put_bytes(buf, bytes);
                }
                None => buf.push(0),
            }
        }

        let mut buf = Vec::new();

        buf.extend_from_slice(&(self.inputs.len() as u32).to_be_bytes());
        for input in &self.inputs {
            put_bytes(&mut buf, &input.txid);
            buf.extend_from_slice(&input.vout.to_be_bytes());
            put_optional(&mut buf, input.signature.as_ref());
            put_optional(&mut buf, input.public_key.as_ref());
        }

        buf.extend_from_slice(&(self.outputs.len() as u32).to_be_bytes());
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_be_bytes());
            put_bytes(&mut buf, &output.owner_hash);
        }

        buf
    }

    /// Copy with every input's signature and public key cleared
    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput::new(input.txid.clone(), input.vout))
            .collect();

        Transaction::new(inputs, self.outputs.clone())
    }

    /// Digest signed for one input: the trimmed copy's hash followed by the
    /// owner hash of the output being spent
    fn signing_digest(trimmed_hash: &[u8; 32], spent: &TxOutput) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(trimmed_hash);
        hasher.update(&spent.owner_hash);
        hasher.finalize().into()
    }

    /// Signs every input with `wallet` and assigns the id
    ///
    /// All referenced outputs are resolved before anything is written, so a
    /// missing one leaves the transaction unsigned. Coinbase transactions are
    /// left as they are.
    pub fn sign(
        &mut self,
        wallet: &Wallet,
        referenced_outputs: &ReferencedOutputs,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }
        if !self.id.is_empty() {
            return Err(TransactionError::AlreadySigned);
        }

        let trimmed_hash = self.trimmed_copy().hash();

        let signatures = self
            .inputs
            .iter()
            .map(|input| -> Result<Vec<u8>, TransactionError> {
                let spent = referenced_outputs.get(&input.outpoint()).ok_or_else(|| {
                    TransactionError::MissingReferencedOutput {
                        txid: hex::encode(&input.txid),
                        vout: input.vout,
                    }
                })?;
                let digest = Self::signing_digest(&trimmed_hash, spent);
                Ok(wallet.sign_digest(&digest)?)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let public_key = wallet.public_key_bytes();
        for (input, signature) in self.inputs.iter_mut().zip(signatures) {
            input.signature = Some(signature);
            input.public_key = Some(public_key.clone());
        }

        self.set_id();
        Ok(())
    }

    /// Verifies every input's signature against the outputs it spends
    ///
    /// Never fails: a missing referenced output, an absent signature, a key
    /// that does not own the spent output or a bad signature all yield false.
    pub fn verify(&self, referenced_outputs: &ReferencedOutputs) -> bool {
        if self.is_coinbase() {
            return true;
        }
        if self.inputs.is_empty() || !self.has_valid_id() {
            return false;
        }

        let trimmed_hash = self.trimmed_copy().hash();

        self.inputs.iter().all(|input| {
            let (Some(signature), Some(public_key)) = (&input.signature, &input.public_key) else {
                return false;
            };
            let Some(spent) = referenced_outputs.get(&input.outpoint()) else {
                return false;
            };
            if Address::from_public_key_bytes(public_key).as_bytes() != spent.owner_hash.as_slice() {
                return false;
            }

            let digest = Self::signing_digest(&trimmed_hash, spent);
            crypto::verify_signature(public_key, signature, &digest)
        })
    }
}
