//! Layered, copy-on-write view over the unspent-output set
//!
//! A `CoinsCache` records block-sized deltas in front of a slower inner
//! view instead of copying the full coin set. Caches chain: overlay over
//! overlay over the durable store adapter. Flushing pushes the delta and
//! the best-block marker into the inner view in one atomic step.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{CoinsError, StoreError};
use crate::store::{KvStore, WriteOp};
use crate::types::{BlockId, Coin, OutPoint};

/// Read access to a ledger state.
///
/// Absence means "does not exist or already spent"; the two are not
/// distinguishable, spent outputs are removed rather than tombstoned.
pub trait LedgerView {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;

    /// Block whose connection produced this state
    fn best_block(&self) -> BlockId;
}

/// Write access: accept a staged batch atomically.
pub trait LedgerBacking: LedgerView {
    fn apply(&mut self, batch: CoinsBatch) -> Result<(), CoinsError>;
}

impl<V: LedgerView + ?Sized> LedgerView for &mut V {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        (**self).get(outpoint)
    }

    fn best_block(&self) -> BlockId {
        (**self).best_block()
    }
}

impl<V: LedgerBacking + ?Sized> LedgerBacking for &mut V {
    fn apply(&mut self, batch: CoinsBatch) -> Result<(), CoinsError> {
        (**self).apply(batch)
    }
}

/// State of one cached reference relative to the inner view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    /// Created in this layer; the inner view has no version of it.
    Fresh(Coin),
    /// The inner view's version is superseded by this one.
    Modified(Coin),
    /// Read-through copy carrying no delta.
    Unchanged(Coin),
    /// Spent in this layer.
    Deleted,
}

impl CacheEntry {
    fn coin(&self) -> Option<&Coin> {
        match self {
            CacheEntry::Fresh(c) | CacheEntry::Modified(c) | CacheEntry::Unchanged(c) => Some(c),
            CacheEntry::Deleted => None,
        }
    }
}

/// One staged mutation bound for the inner view
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    Put { coin: Coin, fresh: bool },
    Erase,
}

/// Delta plus best-block marker, committed as a unit
///
/// A flush that lands entries without the marker (or the reverse) would be
/// a correctness bug; the batch keeps them inseparable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinsBatch {
    pub entries: Vec<(OutPoint, BatchEntry)>,
    pub best_block: BlockId,
}

/// Injected bound on overlay growth; callers flush when exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_entries: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
        }
    }
}

/// In-memory overlay over an inner ledger view
#[derive(Debug)]
pub struct CoinsCache<V: LedgerView> {
    inner: V,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: BlockId,
}

impl<V: LedgerView> CoinsCache<V> {
    /// O(1): no data is copied from the inner view.
    pub fn new(inner: V) -> Self {
        let best_block = inner.best_block();
        Self {
            inner,
            entries: HashMap::new(),
            best_block,
        }
    }

    /// Mark a live coin spent, returning it for undo recording.
    ///
    /// An unresolvable reference is a hard validation failure, never
    /// silently ignored.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin, CoinsError> {
        match self.entries.get(outpoint) {
            Some(CacheEntry::Deleted) => Err(CoinsError::StaleReference(outpoint.clone())),
            Some(CacheEntry::Fresh(coin)) => {
                // Created and spent within this layer: nothing to tell the
                // inner view.
                let coin = coin.clone();
                self.entries.remove(outpoint);
                Ok(coin)
            }
            Some(CacheEntry::Modified(coin)) | Some(CacheEntry::Unchanged(coin)) => {
                let coin = coin.clone();
                self.entries.insert(outpoint.clone(), CacheEntry::Deleted);
                Ok(coin)
            }
            None => match self.inner.get(outpoint)? {
                Some(coin) => {
                    self.entries.insert(outpoint.clone(), CacheEntry::Deleted);
                    Ok(coin)
                }
                None => Err(CoinsError::StaleReference(outpoint.clone())),
            },
        }
    }

    /// Record a newly created coin.
    ///
    /// Rejects references that already resolve, guarding against
    /// transaction-hash collision and replay.
    pub fn add(&mut self, outpoint: OutPoint, coin: Coin) -> Result<(), CoinsError> {
        match self.entries.get(&outpoint) {
            Some(CacheEntry::Deleted) => {
                self.entries.insert(outpoint, CacheEntry::Modified(coin));
                Ok(())
            }
            Some(_) => Err(CoinsError::DuplicateOutput(outpoint)),
            None => {
                if self.inner.get(&outpoint)?.is_some() {
                    return Err(CoinsError::DuplicateOutput(outpoint));
                }
                self.entries.insert(outpoint, CacheEntry::Fresh(coin));
                Ok(())
            }
        }
    }

    /// Resolve a reference, memoizing inner-view hits locally.
    ///
    /// Unlike [`LedgerView::get`] this warms the overlay, so repeated
    /// lookups during block connection stay in this layer.
    pub fn fetch(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin().cloned());
        }
        match self.inner.get(outpoint)? {
            Some(coin) => {
                self.entries
                    .insert(outpoint.clone(), CacheEntry::Unchanged(coin.clone()));
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    pub fn set_best_block(&mut self, id: BlockId) {
        self.best_block = id;
    }

    /// Number of cached entries, including read-through copies
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn needs_flush(&self, policy: &FlushPolicy) -> bool {
        self.entries.len() >= policy.max_entries
    }

    pub fn backing(&self) -> &V {
        &self.inner
    }

    pub fn backing_mut(&mut self) -> &mut V {
        &mut self.inner
    }

    /// Stage the current delta. Unchanged entries carry nothing and are
    /// skipped.
    fn stage(&self) -> CoinsBatch {
        let mut entries = Vec::new();
        for (outpoint, entry) in &self.entries {
            let staged = match entry {
                CacheEntry::Fresh(coin) => BatchEntry::Put {
                    coin: coin.clone(),
                    fresh: true,
                },
                CacheEntry::Modified(coin) => BatchEntry::Put {
                    coin: coin.clone(),
                    fresh: false,
                },
                CacheEntry::Deleted => BatchEntry::Erase,
                CacheEntry::Unchanged(_) => continue,
            };
            entries.push((outpoint.clone(), staged));
        }
        CoinsBatch {
            entries,
            best_block: self.best_block,
        }
    }
}

impl<V: LedgerBacking> CoinsCache<V> {
    /// Push the delta and the best-block marker into the inner view.
    ///
    /// Atomic: on failure the local entries are untouched and a repeat call
    /// re-stages the identical batch, which is the recovery path after a
    /// storage timeout.
    pub fn flush(&mut self) -> Result<(), CoinsError> {
        let batch = self.stage();
        let staged = batch.entries.len();
        self.inner.apply(batch)?;
        self.entries.clear();
        debug!(entries = staged, "flushed coins overlay");
        Ok(())
    }
}

impl<V: LedgerView> LedgerView for CoinsCache<V> {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin().cloned()),
            None => self.inner.get(outpoint),
        }
    }

    fn best_block(&self) -> BlockId {
        self.best_block
    }
}

impl<V: LedgerView> LedgerBacking for CoinsCache<V> {
    fn apply(&mut self, batch: CoinsBatch) -> Result<(), CoinsError> {
        for (outpoint, staged) in batch.entries {
            match staged {
                BatchEntry::Put { coin, fresh } => {
                    let merged = match self.entries.get(&outpoint) {
                        Some(CacheEntry::Fresh(_)) => CacheEntry::Fresh(coin),
                        Some(CacheEntry::Deleted)
                        | Some(CacheEntry::Modified(_))
                        | Some(CacheEntry::Unchanged(_)) => CacheEntry::Modified(coin),
                        None => {
                            if fresh {
                                CacheEntry::Fresh(coin)
                            } else {
                                CacheEntry::Modified(coin)
                            }
                        }
                    };
                    self.entries.insert(outpoint, merged);
                }
                BatchEntry::Erase => match self.entries.get(&outpoint) {
                    Some(CacheEntry::Fresh(_)) => {
                        self.entries.remove(&outpoint);
                    }
                    _ => {
                        self.entries.insert(outpoint, CacheEntry::Deleted);
                    }
                },
            }
        }
        self.best_block = batch.best_block;
        Ok(())
    }
}

const COIN_KEY_PREFIX: &[u8] = b"c/";
const BEST_BLOCK_KEY: &[u8] = b"best_block";

/// Durable-store adapter forming the base of every cache chain
///
/// Coins are stored one key per reference; the best-block marker rides in
/// the same batch as the coin mutations, so a flush is atomic end to end.
#[derive(Debug)]
pub struct StoreView<S: KvStore> {
    store: S,
    best_block: BlockId,
}

impl<S: KvStore> StoreView<S> {
    pub fn new(store: S) -> Result<Self, StoreError> {
        let best_block = match store.get(BEST_BLOCK_KEY)? {
            Some(bytes) => decode_block_id(&bytes)?,
            None => [0u8; 32],
        };
        Ok(Self { store, best_block })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn coin_key(outpoint: &OutPoint) -> Vec<u8> {
        let mut key = Vec::with_capacity(COIN_KEY_PREFIX.len() + 36);
        key.extend_from_slice(COIN_KEY_PREFIX);
        key.extend_from_slice(&outpoint.txid);
        key.extend_from_slice(&outpoint.index.to_be_bytes());
        key
    }
}

impl<S: KvStore> LedgerView for StoreView<S> {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.store.get(&Self::coin_key(outpoint))? {
            Some(bytes) => {
                let coin = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(coin))
            }
            None => Ok(None),
        }
    }

    fn best_block(&self) -> BlockId {
        self.best_block
    }
}

impl<S: KvStore> LedgerBacking for StoreView<S> {
    fn apply(&mut self, batch: CoinsBatch) -> Result<(), CoinsError> {
        let mut ops = Vec::with_capacity(batch.entries.len() + 1);
        for (outpoint, staged) in &batch.entries {
            let key = Self::coin_key(outpoint);
            match staged {
                BatchEntry::Put { coin, .. } => {
                    let value = serde_json::to_vec(coin)
                        .map_err(|e| StoreError::Backend(e.to_string()))?;
                    ops.push(WriteOp::Put { key, value });
                }
                BatchEntry::Erase => ops.push(WriteOp::Delete { key }),
            }
        }
        ops.push(WriteOp::Put {
            key: BEST_BLOCK_KEY.to_vec(),
            value: batch.best_block.to_vec(),
        });

        self.store.batch_write(ops)?;
        self.best_block = batch.best_block;
        Ok(())
    }
}

fn decode_block_id(bytes: &[u8]) -> Result<BlockId, StoreError> {
    if bytes.len() != 32 {
        return Err(StoreError::Backend(format!(
            "best-block marker has {} bytes",
            bytes.len()
        )));
    }
    let mut id = [0u8; 32];
    id.copy_from_slice(bytes);
    Ok(id)
}
