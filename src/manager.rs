//! Engine orchestration
//!
//! One `ChainstateManager` owns the coin cache, the chain selector, and
//! the admission pool; there is no ambient global state. Chain mutations
//! are serialized through `&mut self`, the single-writer discipline the
//! engine requires: the durable flush and the tip update are only ever
//! observed together. Readers work from the views handed out at
//! serialization points.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::chain::{AcceptOutcome, BlockStatus, ChainSelector};
use crate::coins::{CoinsCache, FlushPolicy, LedgerView, StoreView};
use crate::error::{ChainError, ChainstateError, Result};
use crate::mempool::{AdmissionPool, PoolLimits, PoolUpdate};
use crate::params::ConsensusParams;
use crate::script::ScriptVerifier;
use crate::store::{KvStore, WriteOp};
use crate::template::{assemble_template, BlockTemplate};
use crate::types::{
    Block, BlockHeader, BlockId, ByteString, Coin, Hash, Natural, OutPoint, Transaction,
};

/// Clock collaborator for header skew checks
pub trait TimeSource {
    /// Network-adjusted UNIX time in seconds
    fn adjusted_time(&self) -> u64;
}

/// Wall-clock time source
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn adjusted_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// Fixed time source for deterministic replay and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedTime(pub u64);

impl TimeSource for FixedTime {
    fn adjusted_time(&self) -> u64 {
        self.0
    }
}

/// Persisted per-block index record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    header: BlockHeader,
    height: Natural,
    status: BlockStatus,
}

const INDEX_KEY_PREFIX: &[u8] = b"i/";

/// The engine: owned chainstate, explicit, passed by handle
pub struct ChainstateManager<S: KvStore> {
    selector: ChainSelector,
    cache: CoinsCache<StoreView<S>>,
    pool: AdmissionPool,
    verifier: Box<dyn ScriptVerifier>,
    time: Box<dyn TimeSource>,
    flush_policy: FlushPolicy,
    halted: bool,
}

impl<S: KvStore> ChainstateManager<S> {
    pub fn new(
        store: S,
        params: ConsensusParams,
        verifier: Box<dyn ScriptVerifier>,
        time: Box<dyn TimeSource>,
    ) -> Result<Self> {
        let view = StoreView::new(store)?;
        Ok(Self {
            selector: ChainSelector::new(params),
            cache: CoinsCache::new(view),
            pool: AdmissionPool::new(PoolLimits::default()),
            verifier,
            time,
            flush_policy: FlushPolicy::default(),
            halted: false,
        })
    }

    pub fn set_flush_policy(&mut self, policy: FlushPolicy) {
        self.flush_policy = policy;
    }

    pub fn set_pool_limits(&mut self, limits: PoolLimits) {
        self.pool = AdmissionPool::new(limits);
    }

    pub fn params(&self) -> &ConsensusParams {
        self.selector.params()
    }

    pub fn pool(&self) -> &AdmissionPool {
        &self.pool
    }

    pub fn tip(&self) -> Option<(BlockId, Natural)> {
        self.selector.tip().map(|node| (node.id, node.height))
    }

    pub fn block_status(&self, id: &BlockId) -> BlockStatus {
        self.selector.status(id)
    }

    /// Resolve a reference against the active view.
    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(self.cache.get(outpoint).map_err(ChainstateError::Store)?)
    }

    /// Read view of the active chainstate, taken at a serialization point.
    pub fn active_view(&self) -> &impl LedgerView {
        &self.cache
    }

    fn ensure_live(&self) -> Result<()> {
        if self.halted {
            return Err(ChainstateError::Halted);
        }
        Ok(())
    }

    /// Track a bare header.
    pub fn accept_header(&mut self, header: BlockHeader) -> Result<BlockId> {
        self.ensure_live()?;
        let adjusted = self.time.adjusted_time();
        let id = self.selector.accept_header(header, adjusted)?;
        self.persist_index(&[id])?;
        Ok(id)
    }

    /// Validate a block, fold it into the chain, and let the pool react.
    pub fn accept_block(&mut self, block: Block) -> Result<AcceptOutcome> {
        self.ensure_live()?;
        let adjusted = self.time.adjusted_time();
        let outcome = match self
            .selector
            .accept_block(block, &mut self.cache, self.verifier.as_ref(), adjusted)
        {
            Ok(outcome) => outcome,
            Err(ChainError::Fatal(reason)) => {
                // Chainstate consistency can no longer be guaranteed; stop
                // accepting mutations rather than risk corrupt coin data.
                error!(%reason, "halting chain mutations");
                self.halted = true;
                return Err(ChainError::Fatal(reason).into());
            }
            Err(e) => return Err(e.into()),
        };

        if let AcceptOutcome::Connected(change) = &outcome {
            // Confirmed transactions leave the pool; transactions from
            // disconnected blocks get a chance to re-enter.
            let connected: Vec<Block> = change
                .connected
                .iter()
                .filter_map(|id| self.selector.block(id).cloned())
                .collect();
            let disconnected: Vec<Block> = change
                .disconnected
                .iter()
                .filter_map(|id| self.selector.block(id).cloned())
                .collect();

            for block in &connected {
                let displaced = self.pool.remove_confirmed(block);
                if !displaced.is_empty() {
                    debug!(count = displaced.len(), "pool dropped block-conflicting entries");
                }
            }
            for block in &disconnected {
                for tx in block.transactions.iter().skip(1) {
                    // Best effort: a disconnected transaction may no longer
                    // apply on the new branch.
                    let _ = self.submit_to_pool(tx.clone());
                }
            }

            let ids: Vec<BlockId> = change
                .connected
                .iter()
                .chain(change.disconnected.iter())
                .copied()
                .collect();
            self.persist_index(&ids)?;
            info!(height = ?self.selector.height(), "active chain updated");
        }

        if self.cache.needs_flush(&self.flush_policy) {
            self.flush()?;
        }

        Ok(outcome)
    }

    /// Admit a standalone transaction to the pool.
    pub fn submit_transaction(&mut self, tx: Transaction) -> Result<PoolUpdate> {
        self.ensure_live()?;
        self.submit_to_pool(tx)
    }

    fn submit_to_pool(&mut self, tx: Transaction) -> Result<PoolUpdate> {
        let spend_height = self.selector.height().map(|h| h + 1).unwrap_or(0);
        let update = self
            .pool
            .try_accept(
                tx,
                &self.cache,
                spend_height,
                self.selector.params(),
                self.verifier.as_ref(),
            )
            .map_err(ChainstateError::Pool)?;
        Ok(update)
    }

    /// Enforce the pool byte budget.
    pub fn evict_pool_to_limit(&mut self) -> Vec<Hash> {
        let budget = self.pool.limits().max_pool_bytes;
        self.pool.evict_to_limit(budget)
    }

    /// Push the cached coin delta into the durable store.
    ///
    /// Retryable: a timeout leaves the delta staged and the same batch is
    /// re-submitted on the next call.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush().map_err(ChainstateError::Coins)
    }

    /// Assemble a block template on the current tip.
    pub fn block_template(
        &self,
        coinbase_script: &ByteString,
        bits: u32,
        timestamp: u64,
    ) -> BlockTemplate {
        let (prev, height) = self
            .tip()
            .map(|(id, height)| (id, height + 1))
            .unwrap_or(([0u8; 32], 0));
        assemble_template(
            &self.pool,
            height,
            prev,
            bits,
            timestamp,
            coinbase_script,
            self.selector.params(),
        )
    }

    /// Persist index metadata for the given ids through the store seam.
    fn persist_index(&mut self, ids: &[BlockId]) -> Result<()> {
        let mut ops = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(idx) = self.selector.index().lookup(id) else {
                continue;
            };
            let node = self.selector.index().node(idx);
            let record = NodeRecord {
                header: node.header.clone(),
                height: node.height,
                status: node.status,
            };
            let value = serde_json::to_vec(&record)
                .map_err(|e| ChainstateError::Store(crate::error::StoreError::Backend(e.to_string())))?;
            let mut key = Vec::with_capacity(INDEX_KEY_PREFIX.len() + 32);
            key.extend_from_slice(INDEX_KEY_PREFIX);
            key.extend_from_slice(id);
            ops.push(WriteOp::Put { key, value });
        }
        if ops.is_empty() {
            return Ok(());
        }
        self.cache
            .backing_mut()
            .store_mut()
            .batch_write(ops)
            .map_err(ChainstateError::Store)
    }
}
