//! Block index, best-chain selection, and reorganization
//!
//! Every seen header becomes a node in an arena-backed index; parent links
//! are arena indices, so the ancestry graph carries no ownership cycles.
//! The active chain is the fully-valid tip with the greatest cumulative
//! work; competing branches trigger an all-or-nothing reorganization.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::block::{disconnect_block, BlockUndo, StagedBlock};
use crate::coins::{CoinsCache, LedgerView};
use crate::error::{BlockError, ChainError};
use crate::params::{ConsensusParams, TieBreak};
use crate::pow::{check_proof_of_work, work_for_bits};
use crate::script::ScriptVerifier;
use crate::types::{Block, BlockHeader, BlockId, Natural};

/// Validation status of an indexed block
///
/// Escalates monotonically; `Invalid` is terminal and `FullyValid` is
/// never demoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Unknown,
    HeaderValid,
    FullyValid,
    Invalid,
}

impl BlockStatus {
    fn escalate(self, next: BlockStatus) -> BlockStatus {
        use BlockStatus::*;
        match (self, next) {
            (Invalid, _) => Invalid,
            (FullyValid, Invalid) => FullyValid,
            (_, Invalid) => Invalid,
            _ if next > self => next,
            _ => self,
        }
    }
}

/// Per-block metadata held in the index arena
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub id: BlockId,
    pub header: BlockHeader,
    /// Arena index of the parent; `None` only for the genesis node
    pub parent: Option<usize>,
    pub height: Natural,
    /// Cumulative work from genesis through this block
    pub chain_work: u128,
    pub status: BlockStatus,
    /// First-seen order, the default tie-break key
    pub seq: u64,
}

/// Arena of all known block headers, keyed by block id
#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: Vec<IndexNode>,
    by_id: HashMap<BlockId, usize>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn lookup(&self, id: &BlockId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn node(&self, idx: usize) -> &IndexNode {
        &self.nodes[idx]
    }

    /// Index a header. Idempotent for already-known ids.
    ///
    /// The parent must already be indexed; a null parent is only accepted
    /// while the index is empty.
    pub fn insert(&mut self, header: BlockHeader) -> Result<usize, ChainError> {
        let id = header.block_id();
        if let Some(idx) = self.lookup(&id) {
            return Ok(idx);
        }

        let parent = if header.prev_block == [0u8; 32] {
            if !self.nodes.is_empty() {
                return Err(ChainError::BadGenesis);
            }
            None
        } else {
            match self.lookup(&header.prev_block) {
                Some(p) => Some(p),
                None => return Err(ChainError::UnknownParent(header.prev_block)),
            }
        };

        let (height, parent_work) = match parent {
            Some(p) => (self.nodes[p].height + 1, self.nodes[p].chain_work),
            None => (0, 0),
        };
        let idx = self.nodes.len();
        self.nodes.push(IndexNode {
            id,
            chain_work: parent_work.saturating_add(work_for_bits(header.bits)),
            header,
            parent,
            height,
            status: BlockStatus::HeaderValid,
            seq: idx as u64,
        });
        self.by_id.insert(id, idx);
        Ok(idx)
    }

    pub fn set_status(&mut self, idx: usize, status: BlockStatus) {
        let current = self.nodes[idx].status;
        self.nodes[idx].status = current.escalate(status);
    }

    /// Median of the trailing `window` timestamps ending at `idx`.
    pub fn median_time_past(&self, idx: usize, window: usize) -> u64 {
        let mut timestamps = Vec::with_capacity(window);
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if timestamps.len() == window {
                break;
            }
            timestamps.push(self.nodes[i].header.timestamp);
            cursor = self.nodes[i].parent;
        }
        timestamps.sort_unstable();
        timestamps[timestamps.len() / 2]
    }

    /// Deepest node on both ancestries.
    pub fn fork_point(&self, a: usize, b: usize) -> usize {
        let mut a = a;
        let mut b = b;
        while self.nodes[a].height > self.nodes[b].height {
            a = self.nodes[a].parent.unwrap_or(a);
        }
        while self.nodes[b].height > self.nodes[a].height {
            b = self.nodes[b].parent.unwrap_or(b);
        }
        while a != b {
            match (self.nodes[a].parent, self.nodes[b].parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// Arena indices from just above `ancestor` through `tip`, in
    /// ancestor-to-tip order.
    pub fn path_between(&self, ancestor: usize, tip: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut cursor = tip;
        while cursor != ancestor {
            path.push(cursor);
            match self.nodes[cursor].parent {
                Some(p) => cursor = p,
                None => break,
            }
        }
        path.reverse();
        path
    }
}

/// Description of one active-chain mutation, consumed by the admission
/// pool and outside relay/notification collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainChange {
    /// Ids removed from the active chain, tip-to-ancestor order
    pub disconnected: Vec<BlockId>,
    /// Ids added to the active chain, ancestor-to-tip order
    pub connected: Vec<BlockId>,
    pub new_tip: BlockId,
}

/// Disposition of a submitted block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The active chain moved; the change lists every block involved,
    /// including any queued descendants unlocked by this submission.
    Connected(ChainChange),
    /// Valid so far but on a branch with less work than the active chain
    SideChain(BlockId),
    /// Parent unknown; queued and retried when the parent arrives
    Orphaned(BlockId),
    /// Already indexed with the same or better status
    AlreadyKnown(BlockId),
}

/// Best-chain tracker
pub struct ChainSelector {
    params: ConsensusParams,
    index: BlockIndex,
    /// Full block data for indexed blocks, needed for reorganization
    blocks: HashMap<BlockId, Block>,
    /// Undo logs of connected blocks
    undos: HashMap<BlockId, BlockUndo>,
    /// Blocks waiting for a missing parent, keyed by that parent
    orphans: HashMap<BlockId, Vec<Block>>,
    /// Permanently rejected ids; resubmissions fail without re-validation
    rejected: HashSet<BlockId>,
    active: Option<usize>,
}

impl ChainSelector {
    pub fn new(params: ConsensusParams) -> Self {
        Self {
            params,
            index: BlockIndex::new(),
            blocks: HashMap::new(),
            undos: HashMap::new(),
            orphans: HashMap::new(),
            rejected: HashSet::new(),
            active: None,
        }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn tip(&self) -> Option<&IndexNode> {
        self.active.map(|idx| self.index.node(idx))
    }

    pub fn height(&self) -> Option<Natural> {
        self.tip().map(|node| node.height)
    }

    pub fn tip_id(&self) -> Option<BlockId> {
        self.tip().map(|node| node.id)
    }

    pub fn block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn status(&self, id: &BlockId) -> BlockStatus {
        if self.rejected.contains(id) {
            return BlockStatus::Invalid;
        }
        match self.index.lookup(id) {
            Some(idx) => self.index.node(idx).status,
            None => BlockStatus::Unknown,
        }
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.values().map(|v| v.len()).sum()
    }

    /// Index a bare header after proof-of-work and skew checks.
    ///
    /// Headers are not queued: an unknown parent is reported to the caller
    /// for retry once the parent is indexed.
    pub fn accept_header(
        &mut self,
        header: BlockHeader,
        adjusted_time: u64,
    ) -> Result<BlockId, ChainError> {
        let id = header.block_id();
        if self.rejected.contains(&id) {
            return Err(ChainError::KnownInvalid(id));
        }
        if self.index.lookup(&id).is_some() {
            return Ok(id);
        }

        if let Err(e) = check_proof_of_work(&header, &self.params) {
            self.rejected.insert(id);
            return Err(ChainError::Block(e));
        }
        if header.timestamp > adjusted_time + self.params.max_future_drift {
            self.rejected.insert(id);
            return Err(ChainError::Block(BlockError::TimeTooNew));
        }

        if let Some(pidx) = self.index.lookup(&header.prev_block) {
            if self.index.node(pidx).status == BlockStatus::Invalid {
                self.rejected.insert(id);
                return Err(ChainError::InvalidAncestry(id));
            }
        }

        self.index.insert(header)?;
        Ok(id)
    }

    /// Validate a block and fold it into the chain.
    ///
    /// After the submitted block is processed, any queued orphans unlocked
    /// by it are processed as well; their tip movements are merged into the
    /// returned outcome.
    pub fn accept_block<V: LedgerView>(
        &mut self,
        block: Block,
        cache: &mut CoinsCache<V>,
        verifier: &dyn ScriptVerifier,
        adjusted_time: u64,
    ) -> Result<AcceptOutcome, ChainError> {
        let mut outcome = self.process_block(block, cache, verifier, adjusted_time)?;

        loop {
            let ready: Vec<BlockId> = self
                .orphans
                .keys()
                .filter(|parent| self.index.lookup(parent).is_some())
                .copied()
                .collect();
            if ready.is_empty() {
                break;
            }
            for parent in ready {
                let Some(waiting) = self.orphans.remove(&parent) else {
                    continue;
                };
                for orphan in waiting {
                    let orphan_id = orphan.block_id();
                    match self.process_block(orphan, cache, verifier, adjusted_time) {
                        Ok(next) => outcome = merge_outcomes(outcome, next),
                        Err(e) => {
                            debug!(?orphan_id, error = %e, "queued block rejected");
                        }
                    }
                }
            }
        }

        Ok(outcome)
    }

    fn process_block<V: LedgerView>(
        &mut self,
        block: Block,
        cache: &mut CoinsCache<V>,
        verifier: &dyn ScriptVerifier,
        adjusted_time: u64,
    ) -> Result<AcceptOutcome, ChainError> {
        let id = block.block_id();
        if self.rejected.contains(&id) {
            return Err(ChainError::KnownInvalid(id));
        }
        if let Some(idx) = self.index.lookup(&id) {
            if self.index.node(idx).status == BlockStatus::Invalid {
                return Err(ChainError::KnownInvalid(id));
            }
            // Idempotent resubmission: status is settled, script checks are
            // not re-executed. Keep the data in case it arrived header-first.
            self.blocks.entry(id).or_insert(block);
            return Ok(AcceptOutcome::AlreadyKnown(id));
        }

        let mut staged = StagedBlock::new(block);
        if let Err(e) = staged.check_header(adjusted_time, &self.params) {
            return Err(self.reject_permanent(id, e));
        }
        if let Err(e) = staged.check_structure(&self.params) {
            return Err(self.reject_permanent(id, e));
        }

        let prev = staged.block.header.prev_block;
        let is_genesis = prev == [0u8; 32];
        if is_genesis && !self.index.is_empty() {
            self.rejected.insert(id);
            return Err(ChainError::BadGenesis);
        }
        if !is_genesis {
            match self.index.lookup(&prev) {
                None => {
                    debug!("parent unknown; queueing block");
                    self.orphans.entry(prev).or_default().push(staged.block);
                    return Ok(AcceptOutcome::Orphaned(id));
                }
                Some(pidx) if self.index.node(pidx).status == BlockStatus::Invalid => {
                    self.rejected.insert(id);
                    return Err(ChainError::InvalidAncestry(id));
                }
                Some(_) => {}
            }
        }

        let idx = self.index.insert(staged.block.header.clone())?;

        let median = self
            .index
            .node(idx)
            .parent
            .map(|pidx| self.index.median_time_past(pidx, self.params.median_time_window))
            .unwrap_or(0);
        if let Err(e) = staged.check_contextual(median) {
            self.index.set_status(idx, BlockStatus::Invalid);
            self.rejected.insert(id);
            return Err(ChainError::Block(e));
        }

        self.blocks.insert(id, staged.block.clone());

        match self.active {
            None => self.connect_active(staged, idx, cache, verifier),
            Some(active) if self.index.node(idx).parent == Some(active) => {
                self.connect_active(staged, idx, cache, verifier)
            }
            Some(active) => {
                if self.prefer_over_active(idx, active) {
                    self.reorganize_to(idx, active, cache, verifier, adjusted_time)
                } else {
                    debug!(height = self.index.node(idx).height, "stored side-chain block");
                    Ok(AcceptOutcome::SideChain(id))
                }
            }
        }
    }

    fn reject_permanent(&mut self, id: BlockId, err: BlockError) -> ChainError {
        if !err.is_transient() {
            self.rejected.insert(id);
        }
        ChainError::Block(err)
    }

    /// Strict-preference rule for a candidate tip over the active one.
    fn prefer_over_active(&self, candidate: usize, active: usize) -> bool {
        let cand = self.index.node(candidate);
        let tip = self.index.node(active);
        if cand.chain_work != tip.chain_work {
            return cand.chain_work > tip.chain_work;
        }
        match self.params.tie_break {
            TieBreak::FirstSeen => false,
            TieBreak::LowestId => cand.id < tip.id,
        }
    }

    /// Connect a block that extends the active tip (or founds the chain).
    fn connect_active<V: LedgerView>(
        &mut self,
        mut staged: StagedBlock,
        idx: usize,
        cache: &mut CoinsCache<V>,
        verifier: &dyn ScriptVerifier,
    ) -> Result<AcceptOutcome, ChainError> {
        let id = staged.id;
        let height = self.index.node(idx).height;
        match staged.connect(cache, height, &self.params, verifier) {
            Ok(result) => {
                self.undos.insert(id, result.undo);
                self.index.set_status(idx, BlockStatus::FullyValid);
                self.active = Some(idx);
                info!(height, fees = result.fees, "extended active chain");
                Ok(AcceptOutcome::Connected(ChainChange {
                    disconnected: vec![],
                    connected: vec![id],
                    new_tip: id,
                }))
            }
            Err(e) if e.is_transient() => Err(ChainError::Block(e)),
            Err(e) => {
                self.index.set_status(idx, BlockStatus::Invalid);
                self.rejected.insert(id);
                self.blocks.remove(&id);
                warn!(height, error = %e, "block failed connection");
                Err(ChainError::Block(e))
            }
        }
    }

    /// Switch the active chain to the branch ending at `candidate`.
    ///
    /// All mutation happens in a scratch overlay: blocks of the old branch
    /// are disconnected tip-to-ancestor via their undo logs, the new branch
    /// is connected ancestor-to-tip, and only a fully successful switch is
    /// merged into the live cache. On any failure the overlay is dropped
    /// and the old chain remains active; chainstate never points at neither
    /// branch.
    fn reorganize_to<V: LedgerView>(
        &mut self,
        candidate: usize,
        active: usize,
        cache: &mut CoinsCache<V>,
        verifier: &dyn ScriptVerifier,
        adjusted_time: u64,
    ) -> Result<AcceptOutcome, ChainError> {
        let fork = self.index.fork_point(active, candidate);
        let old_path = self.index.path_between(fork, active);
        let new_path = self.index.path_between(fork, candidate);
        let candidate_id = self.index.node(candidate).id;
        info!(
            depth = old_path.len(),
            advance = new_path.len(),
            "reorganizing active chain"
        );

        let mut scratch = CoinsCache::new(&mut *cache);

        let mut disconnected = Vec::with_capacity(old_path.len());
        for &i in old_path.iter().rev() {
            let node_id = self.index.node(i).id;
            let block = self
                .blocks
                .get(&node_id)
                .ok_or(ChainError::MissingData(node_id))?;
            let undo = self.undos.get(&node_id).ok_or_else(|| {
                ChainError::Fatal("undo log missing for a connected block".into())
            })?;
            disconnect_block(block, undo, &mut scratch).map_err(ChainError::Block)?;
            disconnected.push(node_id);
        }

        let mut connected = Vec::with_capacity(new_path.len());
        let mut new_undos = Vec::with_capacity(new_path.len());
        for &i in &new_path {
            let (node_id, height, parent) = {
                let node = self.index.node(i);
                (node.id, node.height, node.parent)
            };
            let block = self
                .blocks
                .get(&node_id)
                .cloned()
                .ok_or(ChainError::MissingData(node_id))?;

            let median = parent
                .map(|p| self.index.median_time_past(p, self.params.median_time_window))
                .unwrap_or(0);

            let mut restaged = StagedBlock::new(block);
            let step = restaged.validate_and_connect(
                adjusted_time,
                median,
                &mut scratch,
                height,
                &self.params,
                verifier,
            );

            match step {
                Ok(result) => {
                    new_undos.push((node_id, result.undo));
                    connected.push(node_id);
                }
                Err(e) if e.is_transient() => return Err(ChainError::Block(e)),
                Err(e) => {
                    // Permanent: condemn the branch and stay on the old
                    // chain, which was never touched.
                    self.index.set_status(i, BlockStatus::Invalid);
                    self.rejected.insert(node_id);
                    self.blocks.remove(&node_id);
                    warn!(error = %e, "reorganization abandoned; branch invalid");
                    return Err(ChainError::Block(e));
                }
            }
        }

        scratch.flush().map_err(ChainError::Coins)?;
        drop(scratch);

        for id in &disconnected {
            self.undos.remove(id);
        }
        for (id, undo) in new_undos {
            self.undos.insert(id, undo);
        }
        for &i in &new_path {
            self.index.set_status(i, BlockStatus::FullyValid);
        }
        self.active = Some(candidate);
        info!(
            height = self.index.node(candidate).height,
            "reorganization complete"
        );

        Ok(AcceptOutcome::Connected(ChainChange {
            disconnected,
            connected,
            new_tip: candidate_id,
        }))
    }
}

fn merge_outcomes(first: AcceptOutcome, next: AcceptOutcome) -> AcceptOutcome {
    use AcceptOutcome::*;
    match (first, next) {
        (Connected(mut a), Connected(b)) => {
            a.disconnected.extend(b.disconnected);
            a.connected.extend(b.connected);
            a.new_tip = b.new_tip;
            Connected(a)
        }
        (SideChain(_), Connected(b)) | (Orphaned(_), Connected(b)) | (AlreadyKnown(_), Connected(b)) => {
            Connected(b)
        }
        (first, _) => first,
    }
}
