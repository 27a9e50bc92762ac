//! End-to-end engine scenarios over a fixed-difficulty test chain.

use crate::chain::{Chain, SoftFork};
use crate::engine::LedgerEngine;
use crate::error::Error;
use crate::tree::{BlockTree, NodeId};
use crate::verifier::VerifySignature;
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use std::sync::Arc;

const BITS: u32 = 0x1d00ffff;
const GENESIS_TIME: u32 = 1_400_000_000;
const COIN: u64 = 100_000_000;
const SUBSIDY: u64 = 50 * COIN;

/// Minimum-difficulty chain with instant soft-fork activation.
struct TestChain {
    accept_quorum: usize,
    accept_majority: usize,
    enforce_quorum: usize,
    enforce_majority: usize,
}

impl TestChain {
    fn new() -> Self {
        Self {
            accept_quorum: 1000,
            accept_majority: 950,
            enforce_quorum: 1000,
            enforce_majority: 750,
        }
    }

    fn with_quorums(quorum: usize, majority: usize) -> Self {
        Self {
            accept_quorum: quorum,
            accept_majority: majority,
            enforce_quorum: quorum,
            enforce_majority: majority,
        }
    }
}

impl Chain for TestChain {
    fn genesis_block(&self) -> Block {
        make_block(1, BlockHash::all_zeros(), 0, 0, SUBSIDY, &payee(0), vec![])
    }

    fn subsidy(&self, _height: i64) -> u64 {
        SUBSIDY
    }

    fn next_work_required(&self, _tree: &BlockTree, _prev: NodeId) -> CompactTarget {
        CompactTarget::from_consensus(BITS)
    }

    fn time_stamp(&self, _fork: SoftFork) -> u32 {
        0
    }

    fn accept_quorum(&self) -> usize {
        self.accept_quorum
    }

    fn accept_majority(&self) -> usize {
        self.accept_majority
    }

    fn enforce_quorum(&self) -> usize {
        self.enforce_quorum
    }

    fn enforce_majority(&self) -> usize {
        self.enforce_majority
    }
}

struct AcceptAll;

impl VerifySignature for AcceptAll {
    fn verify_signature(
        &self,
        _spent_output: &TxOut,
        _tx: &[u8],
        _input_index: usize,
        _strict_p2sh: bool,
        _flags: u32,
    ) -> Result<(), String> {
        Ok(())
    }
}

struct RejectAll;

impl VerifySignature for RejectAll {
    fn verify_signature(
        &self,
        _spent_output: &TxOut,
        _tx: &[u8],
        _input_index: usize,
        _strict_p2sh: bool,
        _flags: u32,
    ) -> Result<(), String> {
        Err("stub rejection".to_string())
    }
}

async fn test_engine() -> LedgerEngine<TestChain> {
    LedgerEngine::with_verifier(TestChain::new(), "", Arc::new(AcceptAll))
        .await
        .expect("fresh in-memory engine")
}

fn payee(n: u8) -> ScriptBuf {
    ScriptBuf::from_bytes(vec![0x76, 0xa9, n, 0x88, 0xac])
}

/// Coinbase whose script pushes the height (version 2 commitment) and a
/// branch tag keeping txids unique across forks.
fn coinbase_at(height: i64, tag: u8, value: u64, script: &ScriptBuf) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new()
                .push_int(height)
                .push_slice(&[tag])
                .into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.clone(),
        }],
    }
}

fn make_block_with_coinbase(
    version: i32,
    prev: BlockHash,
    height: i64,
    tag: u8,
    coinbase: Transaction,
    txs: Vec<Transaction>,
) -> Block {
    let mut txdata = vec![coinbase];
    txdata.extend(txs);
    let mut block = Block {
        header: Header {
            version: bitcoin::block::Version::from_consensus(version),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: GENESIS_TIME + height as u32 * 600 + u32::from(tag),
            bits: CompactTarget::from_consensus(BITS),
            nonce: 0,
        },
        txdata,
    };
    block.header.merkle_root = block
        .compute_merkle_root()
        .expect("blocks are never empty");
    block
}

fn make_block(
    version: i32,
    prev: BlockHash,
    height: i64,
    tag: u8,
    coinbase_value: u64,
    script: &ScriptBuf,
    txs: Vec<Transaction>,
) -> Block {
    let coinbase = coinbase_at(height, tag, coinbase_value, script);
    make_block_with_coinbase(version, prev, height, tag, coinbase, txs)
}

fn spend(prevouts: &[OutPoint], outputs: &[(u64, ScriptBuf)]) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: prevouts
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::from_bytes(vec![0x51]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(value, script)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: script.clone(),
            })
            .collect(),
    }
}

/// Appends empty blocks for the given heights, returning them.
async fn grow_chain(
    engine: &LedgerEngine<TestChain>,
    mut prev: BlockHash,
    heights: std::ops::RangeInclusive<i64>,
    tag: u8,
    script: &ScriptBuf,
) -> Vec<Block> {
    let mut blocks = Vec::new();
    for height in heights {
        let block = make_block(1, prev, height, tag, SUBSIDY, script, vec![]);
        engine.append(&block).await.unwrap_or_else(|err| {
            panic!("appending empty block at height {height} failed: {err}")
        });
        prev = block.block_hash();
        blocks.push(block);
    }
    blocks
}

fn outpoint(tx: &Transaction, vout: u32) -> OutPoint {
    OutPoint {
        txid: tx.compute_txid(),
        vout,
    }
}

// S1: a fresh engine bootstraps the genesis block.
#[tokio::test]
async fn fresh_engine_holds_the_genesis() {
    let engine = test_engine().await;
    let genesis = TestChain::new().genesis_block();

    assert_eq!(engine.tree_height().await, 0);
    assert_eq!(engine.tree_count().await, 1);
    assert_eq!(engine.best_hash().await, genesis.block_hash());
    assert_eq!(engine.genesis_hash().await, genesis.block_hash());

    let locator = engine.get_best_locator().await;
    assert_eq!(locator.have, vec![genesis.block_hash()]);
    assert_eq!(engine.get_distance_back(&locator).await, 0);

    assert_eq!(engine.get_difficulty(None).await, Some(1.0));

    // The genesis block is reconstructible from the store.
    let loaded = engine.get_block(&genesis.block_hash()).await.unwrap();
    assert_eq!(loaded.unwrap().block_hash(), genesis.block_hash());
}

// S2: a single appended block extends the chain and its coinbase is unspent.
#[tokio::test]
async fn single_append_extends_the_chain() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();

    let block = make_block(
        1,
        engine.genesis_hash().await,
        1,
        0,
        SUBSIDY,
        &payee(1),
        vec![],
    );
    engine.append(&block).await.unwrap();

    assert_eq!(engine.tree_height().await, 1);
    assert_eq!(engine.best_hash().await, block.block_hash());
    assert!(engine.is_in_main_chain(&block.block_hash()).await);

    let coinbase = outpoint(&block.txdata[0], 0);
    assert!(!engine.is_spent(&coinbase).await.unwrap());

    // Genesis and block-1 coinbases, both immature.
    assert_eq!(engine.trie_sizes().await, (0, 2));
    assert_eq!(engine.get_difficulty(None).await, Some(1.0));

    // Re-offering the same block is a hard duplicate.
    assert!(matches!(
        engine.append(&block).await,
        Err(Error::DuplicateBlock)
    ));
}

#[tokio::test]
async fn orphans_and_stale_timestamps_are_rejected() {
    let engine = test_engine().await;

    let orphan = make_block(1, BlockHash::from_byte_array([9; 32]), 1, 0, SUBSIDY, &payee(1), vec![]);
    assert!(matches!(engine.append(&orphan).await, Err(Error::Orphan)));

    let mut stale = make_block(1, engine.genesis_hash().await, 1, 0, SUBSIDY, &payee(1), vec![]);
    stale.header.time = GENESIS_TIME; // equal to the median time past
    assert!(matches!(
        engine.append(&stale).await,
        Err(Error::TimeTooEarly)
    ));

    let mut wrong_bits = make_block(1, engine.genesis_hash().await, 1, 0, SUBSIDY, &payee(1), vec![]);
    wrong_bits.header.bits = CompactTarget::from_consensus(0x207fffff);
    assert!(matches!(
        engine.append(&wrong_bits).await,
        Err(Error::BadProofOfWork)
    ));

    assert_eq!(engine.tree_height().await, 0);
}

// S3: a heavier fork reorganizes the chain and foreign transactions return
// to the claim pool; the trie root matches a from-scratch replay.
#[tokio::test]
async fn reorg_returns_foreign_transactions_to_the_pool() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();

    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=101, 0, &payee(0)).await;
    let fork_point = base[100].block_hash();

    // Branch A carries a fee-paying spend of the (now mature) coinbase of
    // height 1.
    let tx_a = spend(
        &[outpoint(&base[0].txdata[0], 0)],
        &[(SUBSIDY - 1000, payee(9))],
    );
    let a102 = make_block(1, fork_point, 102, 1, SUBSIDY + 1000, &payee(1), vec![tx_a.clone()]);
    engine.append(&a102).await.unwrap();
    assert_eq!(engine.best_hash().await, a102.block_hash());
    assert!(engine.is_spent(&outpoint(&base[0].txdata[0], 0)).await.unwrap());

    // Branch B: same height first (held as side branch), then one more.
    let b102 = make_block(1, fork_point, 102, 2, SUBSIDY, &payee(2), vec![]);
    engine.append(&b102).await.unwrap();
    assert_eq!(engine.best_hash().await, a102.block_hash());
    assert!(!engine.is_in_main_chain(&b102.block_hash()).await);
    assert_eq!(engine.get_height(&b102.block_hash()).await, Some(102));

    let b103 = make_block(1, b102.block_hash(), 103, 2, SUBSIDY, &payee(2), vec![]);
    engine.append(&b103).await.unwrap();

    assert_eq!(engine.best_hash().await, b103.block_hash());
    assert_eq!(engine.tree_height().await, 103);
    assert!(engine.is_in_main_chain(&b102.block_hash()).await);
    assert!(!engine.is_in_main_chain(&a102.block_hash()).await);

    // The displaced spend is back in the pool and its coin unspent again.
    assert!(engine.have_tx(&tx_a.compute_txid()).await);
    assert!(!engine.is_spent(&outpoint(&base[0].txdata[0], 0)).await.unwrap());

    // Replaying the winning branch from scratch yields the identical root.
    let replay = test_engine().await;
    replay.set_validation_depth(1).await.unwrap();
    for block in &base {
        replay.append(block).await.unwrap();
    }
    replay.append(&b102).await.unwrap();
    replay.append(&b103).await.unwrap();

    assert!(engine.spendables_root().await.is_some());
    assert_eq!(engine.spendables_root().await, replay.spendables_root().await);
}

// Property 2: detaching and re-attaching a branch restores identical state.
#[tokio::test]
async fn round_trip_reorg_restores_the_original_branch() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();

    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=101, 0, &payee(0)).await;
    let fork_point = base[100].block_hash();

    let tx_a = spend(
        &[outpoint(&base[0].txdata[0], 0)],
        &[(SUBSIDY - 1000, payee(9))],
    );
    let a102 = make_block(1, fork_point, 102, 1, SUBSIDY + 1000, &payee(1), vec![tx_a.clone()]);
    engine.append(&a102).await.unwrap();

    // Over to branch B...
    let b102 = make_block(1, fork_point, 102, 2, SUBSIDY, &payee(2), vec![]);
    let b103 = make_block(1, b102.block_hash(), 103, 2, SUBSIDY, &payee(2), vec![]);
    engine.append(&b102).await.unwrap();
    engine.append(&b103).await.unwrap();
    assert_eq!(engine.best_hash().await, b103.block_hash());

    // ...and back, once branch A grows heavier.
    let a103 = make_block(1, a102.block_hash(), 103, 1, SUBSIDY, &payee(1), vec![]);
    let a104 = make_block(1, a103.block_hash(), 104, 1, SUBSIDY, &payee(1), vec![]);
    engine.append(&a103).await.unwrap();
    assert_eq!(engine.best_hash().await, b103.block_hash());
    engine.append(&a104).await.unwrap();
    assert_eq!(engine.best_hash().await, a104.block_hash());

    // The spend is confirmed again, not pooled.
    assert!(!engine.have_tx(&tx_a.compute_txid()).await);
    assert!(engine.is_spent(&outpoint(&base[0].txdata[0], 0)).await.unwrap());

    // Identical to a replay that never saw branch B.
    let replay = test_engine().await;
    replay.set_validation_depth(1).await.unwrap();
    for block in &base {
        replay.append(block).await.unwrap();
    }
    for block in [&a102, &a103, &a104] {
        replay.append(block).await.unwrap();
    }
    assert_eq!(engine.spendables_root().await, replay.spendables_root().await);

    // Conservation: every unspent minor unit traces back to a subsidy; the
    // fee of tx_a was reclaimed by the a102 coinbase.
    let minted: u64 = (0..=104).map(|_| SUBSIDY).sum();
    assert_eq!(engine.trie_value_total().await, minted);
    assert_eq!(replay.trie_value_total().await, minted);

    // Trie and store hold exactly the same coin set.
    let (spendable, immature) = engine.trie_sizes().await;
    assert_eq!(
        (spendable + immature) as i64,
        engine.store_unspent_count().await
    );
}

// S4: a pool double-spend is rejected and leaves the first claim intact.
#[tokio::test]
async fn pool_double_spend_is_rejected() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    let coin = outpoint(&base[0].txdata[0], 0);
    let tx1 = spend(&[coin], &[(SUBSIDY - 300, payee(5))]);
    let tx2 = spend(&[coin], &[(SUBSIDY - 500, payee(6))]);

    engine.claim(tx1.clone(), true).await.unwrap();

    let err = engine.claim(tx2.clone(), true).await.unwrap_err();
    assert!(err.is_reject());
    assert!(err.to_string().contains("coin already spent"));

    assert!(engine.have_tx(&tx1.compute_txid()).await);
    assert!(!engine.have_tx(&tx2.compute_txid()).await);

    // A claim may chain on another claim's output, but not double-spend it.
    let chained = spend(&[outpoint(&tx1, 0)], &[(SUBSIDY - 600, payee(7))]);
    engine.claim(chained.clone(), true).await.unwrap();
    assert!(engine.have_tx(&chained.compute_txid()).await);
}

#[tokio::test]
async fn claim_rejects_unknown_and_underpaying_transactions() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    // Unknown coin: recoverable, the coin may simply have been purged.
    let unknown = spend(
        &[OutPoint {
            txid: bitcoin::Txid::from_byte_array([7; 32]),
            vout: 0,
        }],
        &[(100, payee(5))],
    );
    let err = engine.claim(unknown, false).await.unwrap_err();
    assert!(err.is_reject());

    // Outputs above inputs: consensus violation.
    let coin = outpoint(&base[0].txdata[0], 0);
    let inflating = spend(&[coin], &[(SUBSIDY + 1, payee(5))]);
    let err = engine.claim(inflating, false).await.unwrap_err();
    assert!(!err.is_reject());
    assert!(err.to_string().contains("fee < 0"));

    // Immature coinbase spend: consensus violation.
    let immature = spend(
        &[outpoint(&base[50].txdata[0], 0)],
        &[(SUBSIDY - 100, payee(5))],
    );
    let err = engine.claim(immature, false).await.unwrap_err();
    assert!(!err.is_reject());
    assert!(err.to_string().contains("immature coinbase"));
}

#[tokio::test]
async fn claim_signature_failures_surface() {
    let engine = LedgerEngine::with_verifier(TestChain::new(), "", Arc::new(RejectAll))
        .await
        .unwrap();
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    let tx = spend(&[outpoint(&base[0].txdata[0], 0)], &[(SUBSIDY - 300, payee(5))]);

    // Without verification the claim passes; with it the stub rejects.
    let err = engine.claim(tx.clone(), true).await.unwrap_err();
    assert!(err.to_string().contains("signature verification failed"));
    engine.claim(tx, false).await.unwrap();
}

// S5: an immature coinbase spend inside a block fails the append and leaves
// no residue.
#[tokio::test]
async fn immature_coinbase_spend_rolls_the_append_back() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=50, 0, &payee(0)).await;

    let best_before = engine.best_hash().await;
    let root_before = engine.spendables_root().await;
    let sizes_before = engine.trie_sizes().await;
    let coin = outpoint(&base[0].txdata[0], 0);

    let early_spend = spend(&[coin], &[(SUBSIDY - 100, payee(5))]);
    let bad = make_block(
        1,
        best_before,
        51,
        0,
        SUBSIDY + 100,
        &payee(1),
        vec![early_spend],
    );
    let err = engine.append(&bad).await.unwrap_err();

    assert!(!err.is_reject());
    assert!(err.to_string().contains("immature coinbase"));
    assert!(err.to_string().starts_with("append(Block): "));

    // Tree, trie and store are exactly as before the offer.
    assert_eq!(engine.best_hash().await, best_before);
    assert_eq!(engine.tree_height().await, 50);
    assert!(!engine.have_block(&bad.block_hash()).await);
    assert_eq!(engine.spendables_root().await, root_before);
    assert_eq!(engine.trie_sizes().await, sizes_before);
    assert!(!engine.is_spent(&coin).await.unwrap());

    // The same chain keeps growing normally afterwards.
    grow_chain(&engine, best_before, 51..=52, 0, &payee(0)).await;
    assert_eq!(engine.tree_height().await, 52);
}

#[tokio::test]
async fn in_block_double_spend_rolls_the_append_back() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    let coin = outpoint(&base[0].txdata[0], 0);
    let tx1 = spend(&[coin], &[(SUBSIDY - 300, payee(5))]);
    let tx2 = spend(&[coin], &[(SUBSIDY - 500, payee(6))]);
    let best_before = engine.best_hash().await;
    let root_before = engine.spendables_root().await;

    let bad = make_block(
        1,
        best_before,
        103,
        0,
        SUBSIDY + 800,
        &payee(1),
        vec![tx1, tx2],
    );
    let err = engine.append(&bad).await.unwrap_err();
    assert!(err.to_string().contains("spent coin not found"));

    assert_eq!(engine.best_hash().await, best_before);
    assert_eq!(engine.spendables_root().await, root_before);
    assert!(!engine.is_spent(&coin).await.unwrap());
}

// S6: template assembly collects pool fees and splits the reward.
#[tokio::test]
async fn block_template_splits_subsidy_and_fees() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    let tx1 = spend(&[outpoint(&base[0].txdata[0], 0)], &[(SUBSIDY - 300, payee(5))]);
    let tx2 = spend(&[outpoint(&base[1].txdata[0], 0)], &[(SUBSIDY - 500, payee(6))]);
    engine.claim(tx1.clone(), true).await.unwrap();
    engine.claim(tx2.clone(), true).await.unwrap();

    let payees = [payee(11), payee(12)];
    let template = engine
        .get_block_template(&payees, &[1, 1], &[])
        .await
        .unwrap();

    assert_eq!(template.header.prev_blockhash, engine.best_hash().await);
    assert_eq!(template.header.version.to_consensus(), 3);
    assert_eq!(template.txdata.len(), 3);

    let total_fee = 800;
    let coinbase = &template.txdata[0];
    let total: u64 = coinbase.output.iter().map(|out| out.value.to_sat()).sum();
    assert_eq!(total, SUBSIDY + total_fee);
    assert_eq!(coinbase.output[1].value.to_sat(), (SUBSIDY + total_fee) / 2);
    assert_eq!(coinbase.output[0].script_pubkey, payees[0]);
    assert_eq!(coinbase.output[1].script_pubkey, payees[1]);

    // The template is a valid block: mining aside, the engine accepts it and
    // the claims leave the pool.
    engine.append(&template).await.unwrap();
    assert_eq!(engine.best_hash().await, template.block_hash());
    assert!(!engine.have_tx(&tx1.compute_txid()).await);
    assert!(!engine.have_tx(&tx2.compute_txid()).await);
    assert!(engine.unconfirmed_transactions().await.is_empty());
}

#[tokio::test]
async fn template_requires_payees_and_matching_fractions() {
    let engine = test_engine().await;
    assert!(matches!(
        engine.get_block_template(&[], &[], &[]).await,
        Err(Error::EmptyPayees)
    ));
    assert!(matches!(
        engine.get_block_template(&[payee(1)], &[1, 2], &[]).await,
        Err(Error::FractionMismatch)
    ));
}

#[tokio::test]
async fn version_quorum_gates_old_blocks_and_enforces_commitments() {
    let chain = TestChain::with_quorums(4, 3);
    let engine = LedgerEngine::with_verifier(chain, "", Arc::new(AcceptAll))
        .await
        .unwrap();

    // Four version-2 blocks form a super-majority.
    let mut prev = engine.genesis_hash().await;
    for height in 1..=4 {
        let block = make_block(2, prev, height, 0, SUBSIDY, &payee(0), vec![]);
        engine.append(&block).await.unwrap();
        prev = block.block_hash();
    }

    // A version-1 block is now too old.
    let old = make_block(1, prev, 5, 0, SUBSIDY, &payee(0), vec![]);
    assert!(matches!(
        engine.append(&old).await,
        Err(Error::VersionTooOld(1))
    ));

    // A version-2 block whose coinbase commits to the wrong height fails
    // enforcement and is fully rolled back.
    let wrong_height = coinbase_at(99, 0, SUBSIDY, &payee(0));
    let bad = make_block_with_coinbase(2, prev, 5, 0, wrong_height, vec![]);
    let err = engine.append(&bad).await.unwrap_err();
    assert!(err.to_string().contains("without height in coinbase"));
    assert!(!engine.have_block(&bad.block_hash()).await);

    // With the correct commitment it passes.
    let good = make_block(2, prev, 5, 0, SUBSIDY, &payee(0), vec![]);
    engine.append(&good).await.unwrap();
    assert_eq!(engine.tree_height().await, 5);
}

#[tokio::test]
async fn locator_distances_grow_for_unknown_branches() {
    let engine = test_engine().await;
    grow_chain(&engine, engine.genesis_hash().await, 1..=20, 0, &payee(0)).await;

    let locator = engine.get_best_locator().await;
    assert_eq!(engine.get_distance_back(&locator).await, 0);
    // Heights 20..=10 at unit steps, then 8 and 4, genesis always last.
    assert_eq!(locator.have.len(), 14);
    assert_eq!(*locator.have.last().unwrap(), engine.genesis_hash().await);

    let mut foreign = coinledger_primitives::BlockLocator::default();
    for byte in 1..=3u8 {
        foreign.have.push(BlockHash::from_byte_array([byte; 32]));
    }
    foreign.have.push(engine.genesis_hash().await);
    assert_eq!(engine.get_distance_back(&foreign).await, 3);
}

#[tokio::test]
async fn purge_depth_discards_old_confirmations() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    grow_chain(&engine, engine.genesis_hash().await, 1..=60, 0, &payee(0)).await;

    engine.set_purge_depth(50).await.unwrap();
    assert_eq!(engine.purge_depth().await, 50);

    // Coinbase confirmations at or below the depth are gone, later ones stay.
    assert!(engine.get_transaction_by_cnf(-10).await.unwrap().is_none());
    let (tx, height, _) = engine.get_transaction_by_cnf(-60).await.unwrap().unwrap();
    assert!(tx.is_coinbase());
    assert_eq!(height, 59);

    // The chain keeps extending normally.
    let best = engine.best_hash().await;
    grow_chain(&engine, best, 61..=62, 0, &payee(0)).await;
    assert_eq!(engine.tree_height().await, 62);
}

#[tokio::test]
async fn confirmed_transactions_are_queryable_by_hash() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;

    let tx = spend(&[outpoint(&base[0].txdata[0], 0)], &[(SUBSIDY - 300, payee(5))]);
    let block = make_block(
        1,
        engine.best_hash().await,
        103,
        0,
        SUBSIDY + 300,
        &payee(1),
        vec![tx.clone()],
    );
    engine.append(&block).await.unwrap();

    let (loaded, height, time) = engine
        .get_transaction(&tx.compute_txid())
        .await
        .unwrap()
        .expect("confirmed transaction");
    assert_eq!(loaded.compute_txid(), tx.compute_txid());
    assert_eq!(height, 103);
    assert_eq!(time, i64::from(block.header.time));

    let missing = bitcoin::Txid::from_byte_array([0xaa; 32]);
    assert!(engine.get_transaction(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn script_index_backs_address_queries() {
    let engine = test_engine().await;
    engine.set_validation_depth(1).await.unwrap();
    let target = payee(42);

    let err = engine.get_unspents(&target, 0).await.unwrap_err();
    assert!(matches!(err, Error::MissingScriptIndex));

    engine.set_script_to_unspents(true).await.unwrap();
    assert!(engine.script_to_unspents().await.unwrap());

    let base = grow_chain(&engine, engine.genesis_hash().await, 1..=102, 0, &payee(0)).await;
    let confirmed = spend(&[outpoint(&base[0].txdata[0], 0)], &[(SUBSIDY - 300, target.clone())]);
    let block = make_block(
        1,
        engine.best_hash().await,
        103,
        0,
        SUBSIDY + 300,
        &payee(1),
        vec![confirmed.clone()],
    );
    engine.append(&block).await.unwrap();

    let unspents = engine.get_unspents(&target, 0).await.unwrap();
    assert_eq!(unspents.len(), 1);
    assert_eq!(unspents[0].value, SUBSIDY - 300);

    // An unconfirmed claim paying the same script shows up too, and coins it
    // spends disappear.
    let pooled = spend(&[outpoint(&confirmed, 0)], &[(SUBSIDY - 600, target.clone())]);
    engine.claim(pooled, true).await.unwrap();
    let unspents = engine.get_unspents(&target, 0).await.unwrap();
    assert_eq!(unspents.len(), 1);
    assert_eq!(unspents[0].value, SUBSIDY - 600);
}

#[tokio::test]
async fn engine_reloads_persisted_state_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().to_str().unwrap().to_string();

    let (best, genesis) = {
        let engine = LedgerEngine::with_verifier(TestChain::new(), &data_dir, Arc::new(AcceptAll))
            .await
            .unwrap();
        grow_chain(&engine, engine.genesis_hash().await, 1..=5, 0, &payee(0)).await;
        (engine.best_hash().await, engine.genesis_hash().await)
    };

    let reopened = LedgerEngine::with_verifier(TestChain::new(), &data_dir, Arc::new(AcceptAll))
        .await
        .unwrap();
    assert_eq!(reopened.tree_height().await, 5);
    assert_eq!(reopened.best_hash().await, best);
    assert_eq!(reopened.genesis_hash().await, genesis);

    // Appending continues where the previous process stopped.
    grow_chain(&reopened, best, 6..=7, 0, &payee(0)).await;
    assert_eq!(reopened.tree_height().await, 7);
}
