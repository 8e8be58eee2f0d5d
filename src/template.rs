//! Block template assembly from the admission pool
//!
//! Selects pooled transactions by descending fee rate, parents before
//! children, into a size-bounded candidate block whose coinbase claims the
//! subsidy plus collected fees. Sealing the header's proof field is the
//! miner's job, not ours.

use std::collections::HashSet;

use crate::block::merkle_root;
use crate::mempool::AdmissionPool;
use crate::params::ConsensusParams;
use crate::subsidy::block_subsidy;
use crate::types::{
    Block, BlockHeader, BlockId, ByteString, Hash, Integer, Natural, OutPoint, Transaction,
    TxInput, TxOutput,
};

/// Candidate block with its accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub block: Block,
    pub height: Natural,
    pub fees: Integer,
}

/// Assemble a candidate block on top of `prev`.
///
/// `bits` and `timestamp` come from the caller; the nonce is left at zero.
pub fn assemble_template(
    pool: &AdmissionPool,
    height: Natural,
    prev: BlockId,
    bits: u32,
    timestamp: u64,
    coinbase_script: &ByteString,
    params: &ConsensusParams,
) -> BlockTemplate {
    let mut selected: Vec<Transaction> = Vec::new();
    let mut selected_ids: HashSet<Hash> = HashSet::new();
    let mut fees: Integer = 0;
    // Reserve room for the header and a small coinbase.
    let mut remaining = params.max_block_size.saturating_sub(1_000);

    // Passes over the fee-rate ordering until nothing more fits; a child
    // skipped because its parent was not selected yet lands on a later
    // pass.
    loop {
        let mut progressed = false;
        for entry in pool.entries_by_fee_rate() {
            if selected_ids.contains(&entry.txid) || entry.size > remaining {
                continue;
            }
            let parents_selected = entry.tx.inputs.iter().all(|input| {
                let parent = input.prevout.txid;
                !pool.contains(&parent) || selected_ids.contains(&parent)
            });
            if !parents_selected {
                continue;
            }
            selected_ids.insert(entry.txid);
            selected.push(entry.tx.clone());
            fees += entry.fee;
            remaining -= entry.size;
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxInput {
            prevout: OutPoint::null(),
            witness: vec![],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            value: block_subsidy(height, params) + fees,
            lock_script: coinbase_script.clone(),
        }],
        lock_time: 0,
    };

    let mut transactions = Vec::with_capacity(selected.len() + 1);
    transactions.push(coinbase);
    transactions.extend(selected);

    let merkle = merkle_root(&transactions).unwrap_or([0u8; 32]);
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: merkle,
            timestamp,
            bits,
            nonce: 0,
        },
        transactions,
    };

    BlockTemplate {
        block,
        height,
        fees,
    }
}
