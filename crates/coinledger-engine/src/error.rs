//! Engine error type.
//!
//! Failures carry one of two severities: a [`Severity::Reject`] is
//! recoverable from the engine's point of view (peer misbehavior, a coin
//! that may simply have been purged, a fee under the floor), while a
//! [`Severity::Error`] marks a consensus violation. The append pipeline and
//! claim admission attach a stage prefix at their boundary so callers see
//! where a failure surfaced.

use bitcoin::{OutPoint, Txid};
use coinledger_primitives::TxError;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recoverable; the offer may be bad rather than the ledger.
    Reject,
    /// Consensus violation.
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("block already accepted")]
    DuplicateBlock,

    #[error("cannot accept orphan block")]
    Orphan,

    #[error("rejected version {0} block: version too old")]
    VersionTooOld(i32),

    #[error("incorrect proof of work")]
    BadProofOfWork,

    #[error("block's timestamp is too early")]
    TimeTooEarly,

    #[error("branching disallowed before last checkpoint at {0}")]
    BranchingBeforeCheckpoint(i64),

    #[error("rejected by checkpoint lock-in at height {0}")]
    CheckpointMismatch(i64),

    #[error("contains a non-final transaction")]
    NonFinalTransaction,

    #[error("transaction list is empty")]
    EmptyTransactionList,

    #[error("first transaction is not coinbase")]
    FirstTransactionNotCoinbase,

    #[error("block contains multiple coinbase transactions")]
    MultipleCoinbase,

    #[error("invalid merkle root")]
    BadMerkleRoot,

    #[error("spent coin not found: {0}")]
    CoinNotFound(OutPoint),

    #[error("coin already spent: {0}")]
    CoinAlreadySpent(OutPoint),

    #[error("tried to spend immature coinbase: {0}")]
    ImmatureCoinbase(OutPoint),

    #[error("input values out of range")]
    InputValueOutOfRange,

    #[error("transaction already claimed: {0}")]
    DuplicateClaim(Txid),

    #[error("coinbase transactions cannot be claimed")]
    CoinbaseClaim,

    #[error("fee < 0")]
    NegativeFee,

    #[error("fee {got} below minimum {min}")]
    FeeBelowMinimum { got: u64, min: u64 },

    #[error("fees out of range")]
    FeeOutOfRange,

    #[error("signature verification failed: {0}")]
    SignatureFailed(String),

    #[error("coinbase value {got} exceeds subsidy plus fees {allowed}")]
    CoinbaseValueTooLarge { got: u64, allowed: u64 },

    #[error("attempting to insert duplicate coinbase: {0}")]
    DuplicateCoinbase(OutPoint),

    #[error("duplicate unspent outpoint: {0}")]
    DuplicateOutpoint(OutPoint),

    #[error("lookup of unspents requires the script index")]
    MissingScriptIndex,

    #[error("version {0} block without height in coinbase")]
    MissingHeightCommitment(i32),

    #[error("version {0} block without spendables root in coinbase")]
    MissingRootCommitment(i32),

    #[error("block {0} not found in the store")]
    BlockNotFound(i64),

    #[error("trying to generate a block template with no payees")]
    EmptyPayees,

    #[error("fractions should be either empty or match the number of payees")]
    FractionMismatch,

    #[error(transparent)]
    Tx(#[from] TxError),

    #[error(transparent)]
    Store(#[from] coinledger_store::Error),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::CoinNotFound(_)
            | Error::CoinAlreadySpent(_)
            | Error::FeeBelowMinimum { .. } => Severity::Reject,
            Error::Stage { source, .. } => source.severity(),
            _ => Severity::Error,
        }
    }

    pub fn is_reject(&self) -> bool {
        self.severity() == Severity::Reject
    }

    /// Prefixes the failure with the pipeline stage it surfaced from.
    pub(crate) fn in_stage(self, stage: &'static str) -> Self {
        match self {
            already @ Error::Stage { .. } => already,
            source => Error::Stage {
                stage,
                source: Box::new(source),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
