//! Error taxonomy for chainstate validation
//!
//! Four failure families with different retry semantics: structural errors
//! are permanent for the offending data, contextual errors may clear once a
//! missing ancestor arrives, resource errors are transient and safe to
//! retry, and policy errors are pool-local soft rejections that never mark
//! anything consensus-invalid.

use thiserror::Error;

use crate::block::ValidationStage;
use crate::types::{BlockId, Integer, Natural, OutPoint};

/// Storage-layer failures; transient, the same operation may be retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage operation timed out")]
    TimedOut,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Failures of the layered coin view
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoinsError {
    /// The reference does not resolve to a live coin: it never existed or
    /// was already spent; the two are indistinguishable by design.
    #[error("output reference cannot be resolved to a live coin")]
    StaleReference(OutPoint),

    #[error("an unspent coin already exists at this reference")]
    DuplicateOutput(OutPoint),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Transaction validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("transaction has no inputs or no outputs")]
    Empty,

    #[error("output {index} value outside the supply bound")]
    OutputValueOutOfRange { index: usize },

    #[error("value sum exceeds the supply bound")]
    ValueOverflow,

    #[error("duplicate input at index {index}")]
    DuplicateInput { index: usize },

    #[error("null output reference at input {index} outside a coinbase")]
    NullPrevout { index: usize },

    #[error("serialized size {size} over the transaction limit")]
    Oversized { size: usize },

    #[error("input {index} does not resolve in the ledger view")]
    MissingInput { index: usize },

    #[error("coinbase output spent before maturity at height {matures_at}")]
    PrematureSpend { matures_at: Natural },

    #[error("outputs exceed resolved inputs")]
    NegativeFee,

    #[error("witness for input {index} does not satisfy its locking script")]
    ScriptFailure { index: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TxError {
    /// Transient failures do not condemn the transaction itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, TxError::Store(_))
    }
}

/// Block validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("compact target does not decode to a valid target")]
    BadTarget,

    #[error("block hash above the claimed target")]
    HighHash,

    #[error("header timestamp too far ahead of adjusted time")]
    TimeTooNew,

    #[error("header timestamp not after the median of recent ancestors")]
    TimeTooOld,

    #[error("block has no transactions")]
    NoTransactions,

    #[error("block carries {0} transactions, over the limit")]
    TooManyTransactions(usize),

    #[error("serialized size {0} over the block limit")]
    Oversized(usize),

    #[error("first transaction is not a coinbase")]
    FirstNotCoinbase,

    #[error("coinbase transaction at position {0}")]
    ExtraCoinbase(usize),

    #[error("merkle root does not match the header commitment")]
    MerkleMismatch,

    #[error("coinbase claims {claimed} but only {allowed} is available")]
    BadCoinbaseValue { claimed: Integer, allowed: Integer },

    #[error("undo log does not match the block")]
    UndoMismatch,

    #[error("transaction {index} rejected")]
    Tx {
        index: usize,
        #[source]
        source: TxError,
    },

    #[error("illegal validation transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ValidationStage,
        to: ValidationStage,
    },

    #[error(transparent)]
    Coins(#[from] CoinsError),
}

impl BlockError {
    /// Transient failures leave the block eligible for re-validation.
    pub fn is_transient(&self) -> bool {
        match self {
            BlockError::Coins(CoinsError::Store(_)) => true,
            BlockError::Tx { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// Chain selection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The parent is not indexed yet; the block is queued and retried once
    /// the parent arrives.
    #[error("parent block is not known yet")]
    UnknownParent(BlockId),

    /// Recorded permanent rejection; resubmissions fail without
    /// re-validation.
    #[error("block was already found invalid")]
    KnownInvalid(BlockId),

    #[error("block extends an invalid branch")]
    InvalidAncestry(BlockId),

    #[error("only the first indexed block may claim a null parent")]
    BadGenesis,

    /// The index knows the block but its full data was never supplied;
    /// clears once the block itself arrives.
    #[error("block data for an indexed block is not available")]
    MissingData(BlockId),

    /// Chainstate can no longer be mutated safely; the engine refuses
    /// further chain mutations.
    #[error("chainstate is in a fatal state: {0}")]
    Fatal(String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Coins(#[from] CoinsError),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        match self {
            ChainError::UnknownParent(_) | ChainError::MissingData(_) => true,
            ChainError::Block(e) => e.is_transient(),
            ChainError::Coins(CoinsError::Store(_)) => true,
            _ => false,
        }
    }
}

/// Pool-local soft rejections; never escalated to consensus invalidity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("transaction is already pooled")]
    AlreadyPooled,

    #[error("coinbase transactions are only valid inside a block")]
    Coinbase,

    #[error("fee rate {rate} below the pool floor {floor}")]
    FeeRateTooLow { rate: u64, floor: u64 },

    #[error("unconfirmed ancestor limit exceeded")]
    AncestorLimit,

    #[error("unconfirmed descendant limit exceeded")]
    DescendantLimit,

    #[error("conflicts with pooled transactions without paying enough to replace them")]
    ConflictingTransaction,
}

/// Admission pool failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainstateError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Coins(#[from] CoinsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("engine halted after an unrecoverable chainstate failure")]
    Halted,
}

pub type Result<T> = std::result::Result<T, ChainstateError>;
