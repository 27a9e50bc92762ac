//! Chain parameters consumed by the engine.
//!
//! The engine is generic over [`Chain`]; the ledger itself never hard-codes
//! subsidy schedules, difficulty rules or activation timestamps.

use crate::tree::{BlockTree, NodeId};
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{Block, BlockHash, CompactTarget, Network, Target};
use primitive_types::U256;
use std::collections::HashMap;

/// Soft forks whose activation the engine consults by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftFork {
    /// Strict pay-to-script-hash evaluation.
    Bip16,
    /// Unique coinbase outpoints.
    Bip30,
}

/// Consensus parameters of a chain.
pub trait Chain: Send + Sync + 'static {
    fn genesis_block(&self) -> Block;

    /// Block subsidy at the given height, in minor units.
    fn subsidy(&self, height: i64) -> u64;

    /// Compact target required for the block following `prev`.
    fn next_work_required(&self, tree: &BlockTree, prev: NodeId) -> CompactTarget;

    /// Whether the block at `height` is consistent with the checkpoint map.
    fn check_points(&self, _height: i64, _hash: &BlockHash) -> bool {
        true
    }

    /// Activation timestamp of a soft fork.
    fn time_stamp(&self, fork: SoftFork) -> u32;

    /// Rough number of blocks the chain is known to have; branching below
    /// this boundary is refused and the trie activates above it.
    fn total_blocks_estimate(&self) -> i64 {
        0
    }

    fn accept_quorum(&self) -> usize;
    fn accept_majority(&self) -> usize;
    fn enforce_quorum(&self) -> usize;
    fn enforce_majority(&self) -> usize;

    /// Minimum claim fee, in minor units.
    fn min_fee(&self) -> u64 {
        0
    }
}

const HALVING_INTERVAL: i64 = 210_000;
const COIN: u64 = 100_000_000;
const RETARGET_INTERVAL: i64 = 2016;
const TARGET_TIMESPAN: u64 = 14 * 24 * 60 * 60;

/// The production Bitcoin chain.
pub struct Mainnet {
    checkpoints: HashMap<i64, BlockHash>,
}

impl Mainnet {
    pub fn new() -> Self {
        let checkpoints = [
            (11111, "0000000069e244f73d78e8fd29ba2fd2ed618bd6fa2ee92559f542fdb26e7c1d"),
            (33333, "000000002dd5588a74784eaa7ab0507a18ad16a236e7b1ce69f00d7ddfb5d0a6"),
            (74000, "0000000000573993a3c9e41ce34471c079dcf5f52a0e824a81e7f953b8661a20"),
            (105000, "00000000000291ce28027faea320c8d2b054b2e0fe44a773f3eefb151d6bdc97"),
            (134444, "00000000000005b12ffd4cd315cd34ffd4a594f430ac814c91184a0d42d2b0fe"),
            (168000, "000000000000099e61ea72015e79632f216fe6cb33d7899acb35b75c8303b763"),
            (193000, "000000000000059f452a5f7340de6682a977387c17010ff6e6c3bd83ca8b1317"),
            (210000, "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"),
            (216116, "00000000000001b4f4b433e81ee46494af945cf96014816a4e2370f11b23df4e"),
            (225430, "00000000000001c108384350f74090433e7fcf79a606b8e797f065b130575932"),
            (250000, "000000000000003887df1f29024b06fc2200b55f8af8f35453d7be294df2d214"),
            (279000, "0000000000000001ae8c72a0b0c301f67e3afca10e819efa9041e458e9bd7e40"),
            (295000, "00000000000000004d9b4ef50f0f9d686fd69db2e03af35a100370c64632a983"),
        ]
        .into_iter()
        .map(|(height, hash)| {
            (
                height,
                hash.parse().expect("hard-coded checkpoint hash; qed"),
            )
        })
        .collect();

        Self { checkpoints }
    }
}

impl Default for Mainnet {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain for Mainnet {
    fn genesis_block(&self) -> Block {
        genesis_block(Network::Bitcoin)
    }

    fn subsidy(&self, height: i64) -> u64 {
        let halvings = height / HALVING_INTERVAL;
        if halvings >= 64 {
            return 0;
        }
        (50 * COIN) >> halvings
    }

    fn next_work_required(&self, tree: &BlockTree, prev: NodeId) -> CompactTarget {
        let prev_ref = *tree.reference(prev);
        let height = tree.count_of(prev);

        // Only change once per retarget interval.
        if height % RETARGET_INTERVAL != 0 {
            return prev_ref.bits;
        }

        let first = tree
            .ancestors(prev)
            .nth((RETARGET_INTERVAL - 1) as usize)
            .expect("retarget boundary implies a full interval of ancestors; qed");
        let first_block_time = tree.reference(first).time;

        calculate_next_work_required(prev_ref.bits, first_block_time.into(), prev_ref.time.into())
    }

    fn check_points(&self, height: i64, hash: &BlockHash) -> bool {
        self.checkpoints
            .get(&height)
            .map_or(true, |expected| expected == hash)
    }

    fn time_stamp(&self, fork: SoftFork) -> u32 {
        match fork {
            SoftFork::Bip16 => 1_333_238_400,
            SoftFork::Bip30 => 1_331_769_600,
        }
    }

    fn total_blocks_estimate(&self) -> i64 {
        295_000
    }

    fn accept_quorum(&self) -> usize {
        1000
    }

    fn accept_majority(&self) -> usize {
        950
    }

    fn enforce_quorum(&self) -> usize {
        1000
    }

    fn enforce_majority(&self) -> usize {
        750
    }
}

/// Retarget from the timespan the last interval actually took, clamped to a
/// factor of four in either direction and capped at the proof-of-work limit.
fn calculate_next_work_required(
    previous_bits: CompactTarget,
    first_block_time: u64,
    last_block_time: u64,
) -> CompactTarget {
    let mut actual_timespan = last_block_time.saturating_sub(first_block_time);

    if actual_timespan < TARGET_TIMESPAN / 4 {
        actual_timespan = TARGET_TIMESPAN / 4;
    }
    if actual_timespan > TARGET_TIMESPAN * 4 {
        actual_timespan = TARGET_TIMESPAN * 4;
    }

    let previous_target = Target::from_compact(previous_bits);
    let target = U256::from_big_endian(&previous_target.to_be_bytes());
    let target = target * U256::from(actual_timespan) / U256::from(TARGET_TIMESPAN);
    let target = Target::from_be_bytes(target.to_big_endian());

    let pow_limit = Target::MAX_ATTAINABLE_MAINNET;
    if target > pow_limit {
        pow_limit.to_compact_lossy()
    } else {
        target.to_compact_lossy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use coinledger_primitives::BlockRef;

    const POW_LIMIT_BITS: u32 = 0x1d00ffff;

    fn spaced_tree(blocks: i64, spacing: u32) -> BlockTree {
        let refs: Vec<BlockRef> = (0..blocks)
            .map(|height| BlockRef {
                version: 1,
                hash: BlockHash::from_byte_array({
                    let mut bytes = [0u8; 32];
                    bytes[..8].copy_from_slice(&height.to_le_bytes());
                    bytes
                }),
                prev: BlockHash::all_zeros(),
                time: height as u32 * spacing,
                bits: CompactTarget::from_consensus(POW_LIMIT_BITS),
            })
            .collect();
        let mut tree = BlockTree::new();
        tree.assign(refs);
        tree
    }

    #[test]
    fn subsidy_halves_every_interval() {
        let chain = Mainnet::new();
        assert_eq!(chain.subsidy(0), 50 * COIN);
        assert_eq!(chain.subsidy(209_999), 50 * COIN);
        assert_eq!(chain.subsidy(210_000), 25 * COIN);
        assert_eq!(chain.subsidy(420_000), 1_250_000_000);
        assert_eq!(chain.subsidy(64 * 210_000), 0);
    }

    #[test]
    fn checkpoints_bind_known_heights() {
        let chain = Mainnet::new();
        let checkpoint: BlockHash =
            "000000000000048b95347e83192f69cf0366076336c639f9b7228e9ba171342e"
                .parse()
                .unwrap();
        assert!(chain.check_points(210_000, &checkpoint));
        assert!(!chain.check_points(210_000, &BlockHash::all_zeros()));
        // Heights without a checkpoint accept anything.
        assert!(chain.check_points(12345, &BlockHash::all_zeros()));
    }

    #[test]
    fn bits_unchanged_off_the_retarget_boundary() {
        let chain = Mainnet::new();
        let tree = spaced_tree(100, 600);
        let prev = tree.best();
        assert_eq!(
            chain.next_work_required(&tree, prev).to_consensus(),
            POW_LIMIT_BITS
        );
    }

    #[test]
    fn slow_blocks_cap_at_the_pow_limit() {
        let chain = Mainnet::new();
        // Twice the target spacing would double the target, which the
        // proof-of-work limit caps.
        let tree = spaced_tree(RETARGET_INTERVAL + 1, 1200);
        let prev = tree.at_height(RETARGET_INTERVAL - 1).unwrap();
        assert_eq!(
            chain.next_work_required(&tree, prev).to_consensus(),
            POW_LIMIT_BITS
        );
    }

    #[test]
    fn fast_blocks_clamp_to_a_quarter_timespan() {
        let chain = Mainnet::new();
        // Sixteen times too fast clamps at a factor of four.
        let tree = spaced_tree(RETARGET_INTERVAL + 1, 37);
        let prev = tree.at_height(RETARGET_INTERVAL - 1).unwrap();
        assert_eq!(
            chain.next_work_required(&tree, prev).to_consensus(),
            0x1c3fffc0
        );
    }
}
