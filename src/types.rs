//! Core data model for chainstate validation

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Natural number type
pub type Natural = u64;

/// Integer type
pub type Integer = i64;

/// Block identifier: double SHA-256 of the serialized header
pub type BlockId = Hash;

/// Output index reserved for the coinbase input's null reference
pub const COINBASE_INDEX: u32 = 0xffff_ffff;

/// Reference to a transaction output
///
/// Globally unique while the referenced output is unspent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null reference used by coinbase inputs
    pub fn null() -> Self {
        Self {
            txid: [0u8; 32],
            index: COINBASE_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0u8; 32] && self.index == COINBASE_INDEX
    }
}

/// Transaction input: output reference plus the unlocking witness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub prevout: OutPoint,
    pub witness: ByteString,
    pub sequence: u32,
}

/// Transaction output: value plus the locking script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: Integer,
    pub lock_script: ByteString,
}

/// Transaction: ordered inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase transaction has exactly one input carrying the null reference.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Transaction identifier: double SHA-256 of the serialized transaction
    pub fn txid(&self) -> Hash {
        double_sha256(&self.encode())
    }

    /// Serialized size in bytes
    pub fn serialized_size(&self) -> usize {
        self.encode().len()
    }

    /// Sum of output values; callers bound this against the supply cap.
    pub fn total_output_value(&self) -> Integer {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Signature digest committing to the whole transaction and the input
    /// being satisfied.
    pub fn sighash(&self, input_index: usize) -> Hash {
        let mut data = self.encode();
        data.extend_from_slice(&(input_index as u32).to_le_bytes());
        double_sha256(&data)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut data = Vec::new();

        data.extend_from_slice(&self.version.to_le_bytes());

        encode_varint(self.inputs.len() as u64, &mut data);
        for input in &self.inputs {
            data.extend_from_slice(&input.prevout.txid);
            data.extend_from_slice(&input.prevout.index.to_le_bytes());
            encode_varint(input.witness.len() as u64, &mut data);
            data.extend_from_slice(&input.witness);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }

        encode_varint(self.outputs.len() as u64, &mut data);
        for output in &self.outputs {
            data.extend_from_slice(&(output.value as u64).to_le_bytes());
            encode_varint(output.lock_script.len() as u64, &mut data);
            data.extend_from_slice(&output.lock_script);
        }

        data.extend_from_slice(&self.lock_time.to_le_bytes());
        data
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: BlockId,
    pub merkle_root: Hash,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Block identifier: double SHA-256 of the serialized header
    pub fn block_id(&self) -> BlockId {
        double_sha256(&self.encode())
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(84);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&self.prev_block);
        data.extend_from_slice(&self.merkle_root);
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.bits.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data
    }
}

/// Block: header plus ordered transaction list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_id(&self) -> BlockId {
        self.header.block_id()
    }

    pub fn serialized_size(&self) -> usize {
        self.header.encode().len()
            + self
                .transactions
                .iter()
                .map(|tx| tx.serialized_size())
                .sum::<usize>()
    }
}

/// A spendable transaction output tracked by the ledger
///
/// Created when a transaction is committed, destroyed when a later
/// transaction consumes it. An `OutPoint` resolves to at most one live
/// coin at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub value: Integer,
    pub lock_script: ByteString,
    pub height: Natural,
    pub is_coinbase: bool,
}

/// Double SHA-256
pub(crate) fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// Variable-length integer encoding for serialized counts
pub(crate) fn encode_varint(value: u64, out: &mut Vec<u8>) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}
