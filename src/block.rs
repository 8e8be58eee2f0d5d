//! Block validation state machine and block connection
//!
//! A block advances `Unchecked -> HeaderChecked -> StructurallyChecked ->
//! ContextuallyValid -> Connected`; any permanent rule violation drops it
//! into the terminal `Invalid` state. Transient failures (storage) leave
//! the stage untouched so the same block can be retried.

use serde::{Deserialize, Serialize};

use crate::coins::{CoinsCache, LedgerView};
use crate::error::{BlockError, TxError};
use crate::params::ConsensusParams;
use crate::pow::check_proof_of_work;
use crate::script::ScriptVerifier;
use crate::subsidy::block_subsidy;
use crate::transaction::{check_transaction, check_transaction_inputs};
use crate::types::{double_sha256, Block, BlockId, Coin, Hash, Integer, Natural, OutPoint, Transaction};

/// Validation stages, ordered; `Invalid` is terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationStage {
    Unchecked,
    HeaderChecked,
    StructurallyChecked,
    ContextuallyValid,
    Connected,
    Invalid,
}

impl ValidationStage {
    /// Legal transitions step forward one stage at a time; `Invalid` is
    /// reachable from every non-terminal stage and never left.
    pub fn can_advance_to(self, next: ValidationStage) -> bool {
        use ValidationStage::*;
        match (self, next) {
            (Invalid, _) | (Connected, _) => false,
            (_, Invalid) => true,
            (Unchecked, HeaderChecked) => true,
            (HeaderChecked, StructurallyChecked) => true,
            (StructurallyChecked, ContextuallyValid) => true,
            (ContextuallyValid, Connected) => true,
            _ => false,
        }
    }
}

/// Spent coins of one transaction, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub coins: Vec<Coin>,
}

/// Undo log of one connected block
///
/// One entry per transaction, aligned with the block's transaction list;
/// the coinbase entry is empty. Created outputs are recomputable from the
/// block itself, so only consumed coins are recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

/// Result of connecting a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResult {
    pub fees: Integer,
    pub undo: BlockUndo,
}

/// A block moving through the validation stages
#[derive(Debug)]
pub struct StagedBlock {
    pub block: Block,
    pub id: BlockId,
    stage: ValidationStage,
}

impl StagedBlock {
    pub fn new(block: Block) -> Self {
        let id = block.block_id();
        Self {
            block,
            id,
            stage: ValidationStage::Unchecked,
        }
    }

    pub fn stage(&self) -> ValidationStage {
        self.stage
    }

    fn advance(&mut self, next: ValidationStage) -> Result<(), BlockError> {
        if !self.stage.can_advance_to(next) {
            return Err(BlockError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        Ok(())
    }

    /// Permanent failures condemn the block; transient ones leave the
    /// stage as-is for a retry.
    fn fail(&mut self, err: BlockError) -> BlockError {
        if !err.is_transient() {
            self.stage = ValidationStage::Invalid;
        }
        err
    }

    /// Header checks: proof of work and bounded future skew.
    pub fn check_header(
        &mut self,
        adjusted_time: u64,
        params: &ConsensusParams,
    ) -> Result<(), BlockError> {
        if let Err(e) = check_proof_of_work(&self.block.header, params) {
            return Err(self.fail(e));
        }
        if self.block.header.timestamp > adjusted_time + params.max_future_drift {
            return Err(self.fail(BlockError::TimeTooNew));
        }
        self.advance(ValidationStage::HeaderChecked)
    }

    /// Structural checks: bounds, coinbase placement, merkle commitment.
    pub fn check_structure(&mut self, params: &ConsensusParams) -> Result<(), BlockError> {
        let txs = &self.block.transactions;
        if txs.is_empty() {
            return Err(self.fail(BlockError::NoTransactions));
        }
        if txs.len() > params.max_block_txs {
            return Err(self.fail(BlockError::TooManyTransactions(txs.len())));
        }
        let size = self.block.serialized_size();
        if size > params.max_block_size {
            return Err(self.fail(BlockError::Oversized(size)));
        }

        if !txs[0].is_coinbase() {
            return Err(self.fail(BlockError::FirstNotCoinbase));
        }
        for (position, tx) in txs.iter().enumerate().skip(1) {
            if tx.is_coinbase() {
                return Err(self.fail(BlockError::ExtraCoinbase(position)));
            }
        }

        match merkle_root(txs) {
            Some(root) if root == self.block.header.merkle_root => {}
            _ => return Err(self.fail(BlockError::MerkleMismatch)),
        }

        self.advance(ValidationStage::StructurallyChecked)
    }

    /// Contextual checks against the resolved chain position.
    ///
    /// The caller resolves the parent (a known, non-invalid index entry)
    /// and supplies the median of the trailing ancestor timestamps.
    pub fn check_contextual(&mut self, median_time_past: u64) -> Result<(), BlockError> {
        if self.block.header.timestamp <= median_time_past {
            return Err(self.fail(BlockError::TimeTooOld));
        }
        self.advance(ValidationStage::ContextuallyValid)
    }

    /// Run every stage in order against the given chain position.
    pub fn validate_and_connect<V: LedgerView>(
        &mut self,
        adjusted_time: u64,
        median_time_past: u64,
        cache: &mut CoinsCache<V>,
        height: Natural,
        params: &ConsensusParams,
        verifier: &dyn ScriptVerifier,
    ) -> Result<ConnectResult, BlockError> {
        self.check_header(adjusted_time, params)?;
        self.check_structure(params)?;
        self.check_contextual(median_time_past)?;
        self.connect(cache, height, params, verifier)
    }

    /// Connect the block's effects into `cache` at `height`.
    ///
    /// Transactions are validated and applied in order against a scratch
    /// overlay; any failure discards the overlay, so the passed cache is
    /// never partially mutated. On success the overlay is flushed into the
    /// cache together with the advanced best-block marker, and the undo
    /// log of consumed coins is returned.
    pub fn connect<V: LedgerView>(
        &mut self,
        cache: &mut CoinsCache<V>,
        height: Natural,
        params: &ConsensusParams,
        verifier: &dyn ScriptVerifier,
    ) -> Result<ConnectResult, BlockError> {
        // Refuse before touching the cache: connection is only legal from
        // the contextually-valid stage.
        if self.stage != ValidationStage::ContextuallyValid {
            return Err(BlockError::IllegalTransition {
                from: self.stage,
                to: ValidationStage::Connected,
            });
        }
        match self.connect_inner(cache, height, params, verifier) {
            Ok(result) => {
                self.advance(ValidationStage::Connected)?;
                Ok(result)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn connect_inner<V: LedgerView>(
        &self,
        cache: &mut CoinsCache<V>,
        height: Natural,
        params: &ConsensusParams,
        verifier: &dyn ScriptVerifier,
    ) -> Result<ConnectResult, BlockError> {
        let mut overlay = CoinsCache::new(&mut *cache);
        let mut undo = BlockUndo::default();
        let mut total_fees: Integer = 0;

        for (index, tx) in self.block.transactions.iter().enumerate() {
            check_transaction(tx, params).map_err(|source| BlockError::Tx { index, source })?;

            // Warm the overlay so later lookups of the same inputs stay in
            // this layer.
            for input in &tx.inputs {
                if !input.prevout.is_null() {
                    overlay
                        .fetch(&input.prevout)
                        .map_err(|e| BlockError::Tx {
                            index,
                            source: TxError::Store(e),
                        })?;
                }
            }

            let fee = check_transaction_inputs(tx, &overlay, height, params, verifier)
                .map_err(|source| BlockError::Tx { index, source })?;
            total_fees += fee;

            // All checks passed: apply this transaction's effects.
            let mut tx_undo = TxUndo::default();
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let spent = overlay
                        .spend(&input.prevout)
                        .map_err(BlockError::Coins)?;
                    tx_undo.coins.push(spent);
                }
            }
            let txid = tx.txid();
            for (out_index, output) in tx.outputs.iter().enumerate() {
                let coin = Coin {
                    value: output.value,
                    lock_script: output.lock_script.clone(),
                    height,
                    is_coinbase: tx.is_coinbase(),
                };
                overlay
                    .add(OutPoint::new(txid, out_index as u32), coin)
                    .map_err(BlockError::Coins)?;
            }
            undo.txs.push(tx_undo);
        }

        let allowed = block_subsidy(height, params) + total_fees;
        let claimed = self.block.transactions[0].total_output_value();
        if claimed > allowed {
            return Err(BlockError::BadCoinbaseValue { claimed, allowed });
        }

        overlay.set_best_block(self.id);
        overlay.flush().map_err(BlockError::Coins)?;

        Ok(ConnectResult {
            fees: total_fees,
            undo,
        })
    }
}

/// Reverse a connected block's effects.
///
/// Transactions unwind newest-first: created outputs are removed, then the
/// coins they consumed are restored from the undo log. Afterwards the
/// best-block marker steps back to the parent.
pub fn disconnect_block<V: LedgerView>(
    block: &Block,
    undo: &BlockUndo,
    cache: &mut CoinsCache<V>,
) -> Result<(), BlockError> {
    if undo.txs.len() != block.transactions.len() {
        return Err(BlockError::UndoMismatch);
    }

    for (tx, tx_undo) in block.transactions.iter().zip(&undo.txs).rev() {
        let txid = tx.txid();
        for out_index in (0..tx.outputs.len()).rev() {
            cache
                .spend(&OutPoint::new(txid, out_index as u32))
                .map_err(BlockError::Coins)?;
        }
        if !tx.is_coinbase() {
            for (input, coin) in tx.inputs.iter().zip(&tx_undo.coins) {
                cache
                    .add(input.prevout.clone(), coin.clone())
                    .map_err(BlockError::Coins)?;
            }
        }
    }

    cache.set_best_block(block.header.prev_block);
    Ok(())
}

/// Merkle commitment over the transaction list
///
/// Pairwise double SHA-256, duplicating the last node at odd levels.
/// `None` for an empty list: an empty block commits to nothing.
pub fn merkle_root(transactions: &[Transaction]) -> Option<Hash> {
    if transactions.is_empty() {
        return None;
    }

    let mut level: Vec<Hash> = transactions.iter().map(|tx| tx.txid()).collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&pair[0]);
            combined.extend_from_slice(pair.get(1).unwrap_or(&pair[0]));
            next.push(double_sha256(&combined));
        }
        level = next;
    }
    Some(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::StoreView;
    use crate::script::StackEvaluator;
    use crate::store::MemoryStore;
    use crate::types::{BlockHeader, TxInput, TxOutput};

    fn params() -> ConsensusParams {
        ConsensusParams::regtest()
    }

    fn coinbase(value: Integer) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::null(),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn sealed_block(prev: BlockId, timestamp: u64, txs: Vec<Transaction>) -> Block {
        let p = params();
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev,
                merkle_root: [0; 32],
                timestamp,
                bits: p.pow_limit_bits,
                nonce: 0,
            },
            transactions: txs,
        };
        block.header.merkle_root = merkle_root(&block.transactions).unwrap_or([0; 32]);
        // Regtest difficulty: a handful of nonce increments always suffice.
        while check_proof_of_work(&block.header, &p).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    fn fresh_cache() -> CoinsCache<StoreView<MemoryStore>> {
        CoinsCache::new(StoreView::new(MemoryStore::new()).unwrap())
    }

    #[test]
    fn test_stage_transitions_are_linear() {
        use ValidationStage::*;
        assert!(Unchecked.can_advance_to(HeaderChecked));
        assert!(!Unchecked.can_advance_to(StructurallyChecked));
        assert!(HeaderChecked.can_advance_to(Invalid));
        assert!(!Invalid.can_advance_to(HeaderChecked));
        assert!(!Connected.can_advance_to(Invalid));
    }

    #[test]
    fn test_header_check_future_timestamp() {
        let p = params();
        let block = sealed_block([0; 32], 200_000, vec![coinbase(p.initial_subsidy)]);
        let mut staged = StagedBlock::new(block);
        // Adjusted time far behind the header timestamp.
        let err = staged.check_header(200_000 - p.max_future_drift - 1, &p);
        assert_eq!(err, Err(BlockError::TimeTooNew));
        assert_eq!(staged.stage(), ValidationStage::Invalid);
    }

    #[test]
    fn test_structure_requires_leading_coinbase() {
        let p = params();
        let spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new([9; 32], 0),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 100,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        };
        let block = sealed_block([0; 32], 1_000, vec![spend]);
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        assert_eq!(
            staged.check_structure(&p),
            Err(BlockError::FirstNotCoinbase)
        );
    }

    #[test]
    fn test_structure_rejects_second_coinbase() {
        let p = params();
        let block = sealed_block(
            [0; 32],
            1_000,
            vec![coinbase(p.initial_subsidy), coinbase(1)],
        );
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        assert_eq!(
            staged.check_structure(&p),
            Err(BlockError::ExtraCoinbase(1))
        );
    }

    #[test]
    fn test_structure_rejects_merkle_mismatch() {
        let p = params();
        let mut block = sealed_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy)]);
        block.header.merkle_root = [0xaa; 32];
        // Re-seal the proof of work over the broken commitment.
        while check_proof_of_work(&block.header, &p).is_err() {
            block.header.nonce += 1;
        }
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        assert_eq!(staged.check_structure(&p), Err(BlockError::MerkleMismatch));
    }

    #[test]
    fn test_contextual_rejects_stale_timestamp() {
        let p = params();
        let block = sealed_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy)]);
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        assert_eq!(staged.check_contextual(1_000), Err(BlockError::TimeTooOld));
    }

    #[test]
    fn test_connect_genesis_coinbase() {
        let p = params();
        let block = sealed_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy)]);
        let id = block.block_id();
        let coinbase_txid = block.transactions[0].txid();

        let mut cache = fresh_cache();
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        staged.check_contextual(0).unwrap();
        let result = staged.connect(&mut cache, 0, &p, &StackEvaluator::new()).unwrap();

        assert_eq!(staged.stage(), ValidationStage::Connected);
        assert_eq!(result.fees, 0);
        let coin = cache
            .get(&OutPoint::new(coinbase_txid, 0))
            .unwrap()
            .unwrap();
        assert_eq!(coin.value, p.initial_subsidy);
        assert!(coin.is_coinbase);
        assert_eq!(coin.height, 0);
        assert_eq!(cache.best_block(), id);
    }

    #[test]
    fn test_connect_rejects_overpaying_coinbase() {
        let p = params();
        let block = sealed_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy + 1)]);
        let mut cache = fresh_cache();
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        staged.check_contextual(0).unwrap();

        let err = staged.connect(&mut cache, 0, &p, &StackEvaluator::new());
        assert!(matches!(err, Err(BlockError::BadCoinbaseValue { .. })));
        assert_eq!(staged.stage(), ValidationStage::Invalid);
        // Nothing leaked into the cache.
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn test_connect_is_all_or_nothing() {
        let p = params();
        // Second transaction spends an output that does not exist; the
        // coinbase before it must not survive in the cache.
        let bad_spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new([7; 32], 0),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 1,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        };
        let block = sealed_block(
            [0; 32],
            1_000,
            vec![coinbase(p.initial_subsidy), bad_spend],
        );
        let mut cache = fresh_cache();
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        staged.check_contextual(0).unwrap();

        let err = staged.connect(&mut cache, 0, &p, &StackEvaluator::new());
        assert!(matches!(
            err,
            Err(BlockError::Tx {
                index: 1,
                source: TxError::MissingInput { .. }
            })
        ));
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.best_block(), [0; 32]);
    }

    #[test]
    fn test_intra_block_spend_chain() {
        let p = params();
        let mut cache = fresh_cache();
        cache
            .add(
                OutPoint::new([3; 32], 0),
                Coin {
                    value: 500,
                    lock_script: vec![0x51],
                    height: 0,
                    is_coinbase: false,
                },
            )
            .unwrap();

        let first = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new([3; 32], 0),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 400,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        };
        let second = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new(first.txid(), 0),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 300,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        };

        let block = sealed_block(
            [0; 32],
            1_000,
            vec![coinbase(p.initial_subsidy + 200), first.clone(), second.clone()],
        );
        let mut staged = StagedBlock::new(block);
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        staged.check_contextual(0).unwrap();
        let result = staged
            .connect(&mut cache, 1, &p, &StackEvaluator::new())
            .unwrap();

        // Fees: (500 - 400) + (400 - 300).
        assert_eq!(result.fees, 200);
        // The intermediate output was consumed in-block.
        assert!(cache.get(&OutPoint::new(first.txid(), 0)).unwrap().is_none());
        assert!(cache.get(&OutPoint::new(second.txid(), 0)).unwrap().is_some());
    }

    #[test]
    fn test_disconnect_restores_snapshot() {
        let p = params();
        let mut cache = fresh_cache();
        cache
            .add(
                OutPoint::new([3; 32], 0),
                Coin {
                    value: 500,
                    lock_script: vec![0x51],
                    height: 0,
                    is_coinbase: false,
                },
            )
            .unwrap();
        cache.set_best_block([9; 32]);

        let spend = Transaction {
            version: 1,
            inputs: vec![TxInput {
                prevout: OutPoint::new([3; 32], 0),
                witness: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 450,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        };
        let block = sealed_block(
            [9; 32],
            1_000,
            vec![coinbase(p.initial_subsidy + 50), spend.clone()],
        );
        let before_spent = cache.get(&OutPoint::new([3; 32], 0)).unwrap();

        let mut staged = StagedBlock::new(block.clone());
        staged.check_header(1_000, &p).unwrap();
        staged.check_structure(&p).unwrap();
        staged.check_contextual(0).unwrap();
        let result = staged
            .connect(&mut cache, 1, &p, &StackEvaluator::new())
            .unwrap();

        disconnect_block(&block, &result.undo, &mut cache).unwrap();

        // The original coin is back, the block's outputs are gone, and the
        // marker points at the parent again.
        assert_eq!(cache.get(&OutPoint::new([3; 32], 0)).unwrap(), before_spent);
        assert!(cache.get(&OutPoint::new(spend.txid(), 0)).unwrap().is_none());
        assert_eq!(cache.best_block(), [9; 32]);
    }

    #[test]
    fn test_merkle_root_single_and_pair() {
        let p = params();
        let a = coinbase(p.initial_subsidy);
        let single = merkle_root(std::slice::from_ref(&a)).unwrap();
        assert_eq!(single, a.txid());

        let b = coinbase(1);
        let pair = merkle_root(&[a.clone(), b.clone()]).unwrap();
        assert_ne!(pair, a.txid());
        assert_ne!(pair, b.txid());

        assert!(merkle_root(&[]).is_none());
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let p = params();
        let txs = vec![coinbase(p.initial_subsidy), coinbase(1), coinbase(2)];
        let root3 = merkle_root(&txs).unwrap();
        let mut txs4 = txs.clone();
        txs4.push(txs[2].clone());
        assert_eq!(root3, merkle_root(&txs4).unwrap());
    }
}
