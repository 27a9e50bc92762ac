//! Shared data model of the ledger engine.
//!
//! The types in this crate mirror the persisted schema: a [`BlockRef`] is the
//! header summary kept in the block tree, a [`Confirmation`] binds a
//! transaction to its containing block, an [`Unspent`] is a materialized UTXO
//! row and a [`Spending`] is its archived consumption.

mod difficulty;
mod tx_check;

pub use self::difficulty::{compact_to_difficulty, work_from_bits};
pub use self::tx_check::{check_transaction_sanity, is_final_tx, money_range, TxError};

use bitcoin::block::Header;
use bitcoin::pow::Work;
use bitcoin::{Amount, BlockHash, CompactTarget, ScriptBuf, Txid};

/// Minimum number of confirmations before a coinbase output may be spent.
pub const COINBASE_MATURITY: i64 = 100;

/// Lock times at or above this threshold are interpreted as unix timestamps,
/// below it as block heights. Doubles as the sentinel confirmation id for
/// transactions confirmed below the purge depth, where no row is recorded.
pub const LOCK_TIME_THRESHOLD: i64 = 500_000_000;

/// Header summary held by the block tree.
///
/// Identity is the block hash; `prev` must refer to an already known block
/// (orphans are rejected, not buffered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub version: i32,
    pub hash: BlockHash,
    pub prev: BlockHash,
    pub time: u32,
    pub bits: CompactTarget,
}

impl BlockRef {
    pub fn new(version: i32, hash: BlockHash, prev: BlockHash, time: u32, bits: CompactTarget) -> Self {
        Self {
            version,
            hash,
            prev,
            time,
            bits,
        }
    }

    /// Summarizes a full block header.
    pub fn from_header(header: &Header) -> Self {
        Self {
            version: header.version.to_consensus(),
            hash: header.block_hash(),
            prev: header.prev_blockhash,
            time: header.time,
            bits: header.bits,
        }
    }

    /// Proof-of-work this header contributes to its branch.
    pub fn work(&self) -> Work {
        work_from_bits(self.bits)
    }
}

/// Ledger record binding a transaction to a position in an accepted block.
///
/// Coinbase confirmations use `cnf = -count` so they stay unique without
/// consuming the autoincrement sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub cnf: i64,
    pub version: i32,
    pub locktime: u32,
    pub count: i64,
    pub idx: i64,
}

impl Confirmation {
    pub fn is_coinbase(&self) -> bool {
        self.cnf < 0
    }

    /// Signed count used for unspent rows: negative for coinbase outputs so a
    /// single range predicate selects immature coinbases.
    pub fn signed_count(&self) -> i64 {
        if self.is_coinbase() {
            -self.count
        } else {
            self.count
        }
    }
}

/// A spendable coin, addressed by its outpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unspent {
    /// Row id in the Unspents table; 0 for coins that only exist virtually,
    /// e.g. outputs of unconfirmed claims.
    pub coin: i64,
    pub hash: Txid,
    pub idx: u32,
    pub value: u64,
    pub script: ScriptBuf,
    /// Block count of the confirming block, negated for coinbase outputs.
    pub count: i64,
    /// Confirmation that introduced the coin.
    pub cnf: i64,
}

impl Unspent {
    pub fn outpoint(&self) -> bitcoin::OutPoint {
        bitcoin::OutPoint {
            txid: self.hash,
            vout: self.idx,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.count < 0
    }

    pub fn amount(&self) -> Amount {
        Amount::from_sat(self.value)
    }
}

/// Archived consumption of a coin; enough to roll a block back and to serve
/// historical blocks after the unspent row is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spending {
    /// Confirmation that introduced the coin; 0 marks the coinbase
    /// pseudo-spending that only archives the coinbase input.
    pub ocnf: i64,
    pub coin: i64,
    pub hash: Txid,
    pub idx: u32,
    pub value: u64,
    pub script: ScriptBuf,
    pub signature: ScriptBuf,
    pub sequence: u32,
    /// Confirmation that consumed the coin.
    pub icnf: i64,
}

/// Sparse list of block hashes at exponentially increasing distances from a
/// tip, ending with the genesis hash. Exchanged with peers to locate the fork
/// point between two chains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockLocator {
    pub have: Vec<BlockHash>,
}

impl BlockLocator {
    /// Locator heights for a chain ending at `height`: the last ten heights at
    /// unit steps, then doubling until the bottom of the chain.
    pub fn heights(height: i64) -> Vec<i64> {
        let mut heights = vec![height];
        let mut step = 1;
        loop {
            let last = *heights.last().expect("seeded with the tip height");
            if last - step <= 0 {
                break;
            }
            heights.push(last - step);
            if heights.len() > 10 {
                step *= 2;
            }
        }
        heights
    }

    pub fn is_null(&self) -> bool {
        self.have.is_empty()
    }
}
