//! # Chainstate
//!
//! Block and transaction validation engine over a versioned
//! unspent-output ledger.
//!
//! The crate decides whether a candidate block or transaction is
//! acceptable, applies accepted blocks to a layered coin cache, and
//! resolves competing chains under a most-cumulative-work rule with
//! all-or-nothing reorganization.
//!
//! ## Architecture
//!
//! Leaf-first:
//! - `coins` — layered, copy-on-write view over the unspent-output set
//! - `transaction` — context-free and contextual transaction checks
//! - `block` — header/structure/context checks and block connection,
//!   organized as an explicit validation state machine
//! - `chain` — block index, best-chain selection, reorganization
//! - `mempool` — admission pool with fee ordering, package limits, and
//!   replace-by-fee
//! - `manager` — one owned `ChainstateManager` instance wiring the above
//!
//! Collaborators stay external behind seams: durable storage
//! ([`store::KvStore`]), script evaluation ([`script::ScriptVerifier`]),
//! and time ([`manager::TimeSource`]). Consensus constants are injected
//! per network profile via [`params::ConsensusParams`].
//!
//! ## Design principles
//!
//! 1. **No ambient state**: every operation flows through an explicit
//!    engine handle.
//! 2. **Typed failures**: validation outcomes are `Result`s over error
//!    enums that distinguish permanent, retryable, and policy rejections.
//! 3. **Atomic state motion**: coin deltas and the best-block marker move
//!    together or not at all.
//!
//! ## Usage
//!
//! ```rust
//! use chainstate::*;
//!
//! let mut engine = ChainstateManager::new(
//!     MemoryStore::new(),
//!     ConsensusParams::regtest(),
//!     Box::new(StackEvaluator::new()),
//!     Box::new(FixedTime(1_000_000)),
//! )
//! .unwrap();
//!
//! // Assemble and seal a genesis block.
//! let template = engine.block_template(&vec![0x51], ConsensusParams::regtest().pow_limit_bits, 1_000);
//! let mut genesis = template.block;
//! while chainstate::pow::check_proof_of_work(&genesis.header, engine.params()).is_err() {
//!     genesis.header.nonce += 1;
//! }
//!
//! let outcome = engine.accept_block(genesis).unwrap();
//! assert!(matches!(outcome, AcceptOutcome::Connected(_)));
//! assert_eq!(engine.tip().unwrap().1, 0);
//! ```

pub mod block;
pub mod chain;
pub mod coins;
pub mod error;
pub mod manager;
pub mod mempool;
pub mod params;
pub mod pow;
pub mod script;
pub mod store;
pub mod subsidy;
pub mod template;
pub mod transaction;
pub mod types;

// Re-export the working surface.
pub use block::{disconnect_block, merkle_root, BlockUndo, ConnectResult, StagedBlock, TxUndo, ValidationStage};
pub use chain::{AcceptOutcome, BlockIndex, BlockStatus, ChainChange, ChainSelector, IndexNode};
pub use coins::{
    BatchEntry, CacheEntry, CoinsBatch, CoinsCache, FlushPolicy, LedgerBacking, LedgerView,
    StoreView,
};
pub use error::{
    BlockError, ChainError, ChainstateError, CoinsError, PolicyError, PoolError, Result,
    StoreError, TxError,
};
pub use manager::{ChainstateManager, FixedTime, SystemTimeSource, TimeSource};
pub use mempool::{AdmissionPool, PoolEntry, PoolLimits, PoolUpdate};
pub use params::{ConsensusParams, TieBreak};
pub use script::{ScriptVerifier, StackEvaluator, TxContext};
pub use store::{KvStore, MemoryStore, WriteOp};
pub use subsidy::{block_subsidy, total_issued};
pub use template::{assemble_template, BlockTemplate};
pub use transaction::{check_transaction, check_transaction_inputs};
pub use types::*;
