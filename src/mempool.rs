//! Transaction admission pool
//!
//! Standalone transactions are validated against the active chain view
//! layered with the pool's own unconfirmed outputs, then held under fee
//! and package-size policy until a block confirms or evicts them. Policy
//! rejections are local; they never condemn a transaction for consensus.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::coins::LedgerView;
use crate::error::{PolicyError, PoolError, StoreError};
use crate::params::ConsensusParams;
use crate::script::ScriptVerifier;
use crate::transaction::{check_transaction, check_transaction_inputs};
use crate::types::{Block, BlockId, Coin, Hash, Integer, Natural, OutPoint, Transaction};

/// Pool policy knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    /// Floor in smallest units per 1000 bytes
    pub min_fee_rate: u64,
    /// Unconfirmed ancestors a transaction may have, itself included
    pub max_ancestors: usize,
    pub max_ancestor_bytes: usize,
    /// Unconfirmed descendants an entry may accumulate, itself included
    pub max_descendants: usize,
    pub max_descendant_bytes: usize,
    /// Byte budget enforced by [`AdmissionPool::evict_to_limit`]
    pub max_pool_bytes: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_fee_rate: 1_000,
            max_ancestors: 25,
            max_ancestor_bytes: 101_000,
            max_descendants: 25,
            max_descendant_bytes: 101_000,
            max_pool_bytes: 5_000_000,
        }
    }
}

/// One pooled transaction with its cached admission facts
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx: Transaction,
    pub txid: Hash,
    pub fee: Integer,
    pub size: usize,
    /// Active-chain height the entry was validated at
    pub height: Natural,
    seq: u64,
}

impl PoolEntry {
    /// Smallest units per 1000 bytes
    pub fn fee_rate(&self) -> u64 {
        fee_rate(self.fee, self.size)
    }
}

fn fee_rate(fee: Integer, size: usize) -> u64 {
    (fee.max(0) as u64).saturating_mul(1_000) / (size.max(1) as u64)
}

/// Accepted and displaced transaction ids from one pool operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    pub accepted: Vec<Hash>,
    pub evicted: Vec<Hash>,
}

/// Pool of validated, unconfirmed transactions
pub struct AdmissionPool {
    entries: HashMap<Hash, PoolEntry>,
    /// Which pooled transaction spends each outpoint
    spenders: HashMap<OutPoint, Hash>,
    /// In-pool child links for package traversal
    children: HashMap<Hash, HashSet<Hash>>,
    limits: PoolLimits,
    total_bytes: usize,
    next_seq: u64,
}

impl AdmissionPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            entries: HashMap::new(),
            spenders: HashMap::new(),
            children: HashMap::new(),
            limits,
            total_bytes: 0,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn entry(&self, txid: &Hash) -> Option<&PoolEntry> {
        self.entries.get(txid)
    }

    /// Entries ordered by descending fee rate, oldest first among equals;
    /// the ordering block assembly consumes.
    pub fn entries_by_fee_rate(&self) -> Vec<&PoolEntry> {
        let mut entries: Vec<&PoolEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.fee_rate()
                .cmp(&a.fee_rate())
                .then(a.seq.cmp(&b.seq))
        });
        entries
    }

    /// Validate and admit one transaction.
    ///
    /// The ledger view is the chain plus this pool's unconfirmed outputs,
    /// so spending an unconfirmed output is allowed (chained acceptance).
    /// Inputs already spent by pooled transactions are conflicts: the
    /// replacement must strictly out-pay the whole set it would displace,
    /// otherwise the pool keeps what it has.
    pub fn try_accept<V: LedgerView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &V,
        spend_height: Natural,
        params: &ConsensusParams,
        verifier: &dyn ScriptVerifier,
    ) -> Result<PoolUpdate, PoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(PolicyError::AlreadyPooled.into());
        }
        if tx.is_coinbase() {
            return Err(PolicyError::Coinbase.into());
        }
        check_transaction(&tx, params).map_err(PoolError::Tx)?;

        // Conflicts: pooled transactions spending the same inputs. They and
        // their dependents leave if (and only if) the replacement pays.
        let mut conflicts: HashSet<Hash> = HashSet::new();
        for input in &tx.inputs {
            if let Some(spender) = self.spenders.get(&input.prevout) {
                conflicts.insert(*spender);
            }
        }
        let mut displaced: HashSet<Hash> = HashSet::new();
        for conflict in &conflicts {
            displaced.insert(*conflict);
            self.collect_descendants(conflict, &mut displaced);
        }

        let fee = {
            let view = PoolView {
                chain,
                pool: &*self,
                exclude: &displaced,
            };
            check_transaction_inputs(&tx, &view, spend_height, params, verifier)
                .map_err(PoolError::Tx)?
        };

        let size = tx.serialized_size();
        let rate = fee_rate(fee, size);
        if rate < self.limits.min_fee_rate {
            return Err(PolicyError::FeeRateTooLow {
                rate,
                floor: self.limits.min_fee_rate,
            }
            .into());
        }

        let ancestors = self.ancestors_of(&tx, &displaced);
        if ancestors.len() + 1 > self.limits.max_ancestors {
            return Err(PolicyError::AncestorLimit.into());
        }
        let ancestor_bytes: usize = ancestors
            .iter()
            .map(|id| self.entries[id].size)
            .sum::<usize>()
            + size;
        if ancestor_bytes > self.limits.max_ancestor_bytes {
            return Err(PolicyError::AncestorLimit.into());
        }
        for ancestor in &ancestors {
            let mut package = HashSet::new();
            self.collect_descendants(ancestor, &mut package);
            package.retain(|id| !displaced.contains(id));
            // Ancestor, its surviving descendants, and the candidate.
            if package.len() + 2 > self.limits.max_descendants {
                return Err(PolicyError::DescendantLimit.into());
            }
            let package_bytes: usize = package
                .iter()
                .map(|id| self.entries[id].size)
                .sum::<usize>()
                + self.entries[ancestor].size
                + size;
            if package_bytes > self.limits.max_descendant_bytes {
                return Err(PolicyError::DescendantLimit.into());
            }
        }

        if !conflicts.is_empty() {
            let displaced_fee: Integer =
                displaced.iter().map(|id| self.entries[id].fee).sum();
            let displaced_bytes: usize =
                displaced.iter().map(|id| self.entries[id].size).sum();
            let displaced_rate = fee_rate(displaced_fee, displaced_bytes);
            if rate <= displaced_rate || fee <= displaced_fee {
                return Err(PolicyError::ConflictingTransaction.into());
            }
        }

        let mut evicted: Vec<Hash> = displaced.into_iter().collect();
        evicted.sort_by_key(|id| self.entries[id].seq);
        for id in &evicted {
            self.remove_entry(id);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "replaced conflicting transactions");
        }

        self.insert_entry(tx, txid, fee, size, spend_height);
        Ok(PoolUpdate {
            accepted: vec![txid],
            evicted,
        })
    }

    /// Drop transactions confirmed by `block`, and displace pooled
    /// transactions (plus dependents) that conflict with its spends.
    ///
    /// Returns the ids displaced by conflict; confirmed ids simply leave.
    pub fn remove_confirmed(&mut self, block: &Block) -> Vec<Hash> {
        let mut displaced = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove_entry(&txid);
                continue;
            }
            for input in &tx.inputs {
                if let Some(spender) = self.spenders.get(&input.prevout).copied() {
                    let mut set = HashSet::new();
                    set.insert(spender);
                    self.collect_descendants(&spender, &mut set);
                    let mut ids: Vec<Hash> = set.into_iter().collect();
                    ids.sort_by_key(|id| self.entries[id].seq);
                    for id in ids {
                        if self.entries.contains_key(&id) {
                            self.remove_entry(&id);
                            displaced.push(id);
                        }
                    }
                }
            }
        }
        if !displaced.is_empty() {
            debug!(count = displaced.len(), "dropped transactions conflicting with a block");
        }
        displaced
    }

    /// Evict lowest fee-rate entries, together with their dependents,
    /// until the pool fits the byte budget.
    pub fn evict_to_limit(&mut self, max_bytes: usize) -> Vec<Hash> {
        let mut evicted = Vec::new();
        while self.total_bytes > max_bytes {
            let victim = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.fee_rate()
                        .cmp(&b.fee_rate())
                        .then(b.seq.cmp(&a.seq))
                })
                .map(|entry| entry.txid);
            let Some(victim) = victim else {
                break;
            };

            let mut set = HashSet::new();
            set.insert(victim);
            self.collect_descendants(&victim, &mut set);
            let mut ids: Vec<Hash> = set.into_iter().collect();
            ids.sort_by_key(|id| self.entries[id].seq);
            for id in ids {
                self.remove_entry(&id);
                evicted.push(id);
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "evicted transactions over the byte budget");
        }
        evicted
    }

    fn insert_entry(&mut self, tx: Transaction, txid: Hash, fee: Integer, size: usize, height: Natural) {
        for input in &tx.inputs {
            self.spenders.insert(input.prevout.clone(), txid);
            let parent = input.prevout.txid;
            if self.entries.contains_key(&parent) {
                self.children.entry(parent).or_default().insert(txid);
            }
        }
        self.total_bytes += size;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            txid,
            PoolEntry {
                tx,
                txid,
                fee,
                size,
                height,
                seq,
            },
        );
    }

    fn remove_entry(&mut self, txid: &Hash) {
        let Some(entry) = self.entries.remove(txid) else {
            return;
        };
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prevout) == Some(txid) {
                self.spenders.remove(&input.prevout);
            }
            if let Some(siblings) = self.children.get_mut(&input.prevout.txid) {
                siblings.remove(txid);
            }
        }
        self.children.remove(txid);
        self.total_bytes -= entry.size;
    }

    /// Transitive in-pool ancestors of `tx`, excluding ids about to leave.
    fn ancestors_of(&self, tx: &Transaction, exclude: &HashSet<Hash>) -> HashSet<Hash> {
        let mut result = HashSet::new();
        let mut stack: Vec<Hash> = tx
            .inputs
            .iter()
            .map(|input| input.prevout.txid)
            .filter(|id| self.entries.contains_key(id) && !exclude.contains(id))
            .collect();
        while let Some(id) = stack.pop() {
            if !result.insert(id) {
                continue;
            }
            for input in &self.entries[&id].tx.inputs {
                let parent = input.prevout.txid;
                if self.entries.contains_key(&parent) && !exclude.contains(&parent) {
                    stack.push(parent);
                }
            }
        }
        result
    }

    fn collect_descendants(&self, txid: &Hash, out: &mut HashSet<Hash>) {
        if let Some(kids) = self.children.get(txid) {
            for kid in kids {
                if out.insert(*kid) {
                    self.collect_descendants(kid, out);
                }
            }
        }
    }
}

impl Default for AdmissionPool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

/// Chain view layered with the pool's unconfirmed outputs
struct PoolView<'a, V: LedgerView + ?Sized> {
    chain: &'a V,
    pool: &'a AdmissionPool,
    /// Pool ids treated as already gone (displacement candidates)
    exclude: &'a HashSet<Hash>,
}

impl<V: LedgerView + ?Sized> LedgerView for PoolView<'_, V> {
    fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if let Some(spender) = self.pool.spenders.get(outpoint) {
            if !self.exclude.contains(spender) {
                return Ok(None);
            }
        }
        if let Some(coin) = self.chain.get(outpoint)? {
            return Ok(Some(coin));
        }
        if self.exclude.contains(&outpoint.txid) {
            return Ok(None);
        }
        if let Some(entry) = self.pool.entries.get(&outpoint.txid) {
            if let Some(output) = entry.tx.outputs.get(outpoint.index as usize) {
                return Ok(Some(Coin {
                    value: output.value,
                    lock_script: output.lock_script.clone(),
                    height: entry.height,
                    is_coinbase: false,
                }));
            }
        }
        Ok(None)
    }

    fn best_block(&self) -> BlockId {
        self.chain.best_block()
    }
}
