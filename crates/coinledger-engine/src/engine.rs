//! The ledger engine: block ingestion, reorganization, claim admission,
//! queries and template assembly.
//!
//! The engine is single-writer: `append`, `claim` and the depth setters take
//! the writer half of one lock, readers observe a consistent snapshot between
//! writes. Within an append, every store mutation runs inside one SQLite
//! transaction and the spendables trie is snapshotted by value, so a failure
//! at any stage rolls back the store, the trie and the block tree as a unit
//! and leaves no residue.

use crate::chain::{Chain, SoftFork};
use crate::commitment;
use crate::error::{Error, Result};
use crate::tree::{BlockTree, Changes, NodeId, TreeError};
use crate::verifier::{ConsensusVerifier, Verifier, VerifySignature};
use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{
    Amount, Block, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
    TxOut, Txid, Witness,
};
use coinledger_claims::{ClaimPool, Spents};
use coinledger_primitives::{
    check_transaction_sanity, compact_to_difficulty, is_final_tx, money_range, BlockLocator,
    BlockRef, Confirmation, Spending, Unspent, COINBASE_MATURITY, LOCK_TIME_THRESHOLD,
};
use coinledger_spendables::Spendables;
use coinledger_store::{Connection, Store};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

const CLAIM_MAX_AGE: u64 = 24 * 60 * 60;

/// Shared mutable chain state behind the engine's reader/writer lock.
struct ChainState {
    tree: BlockTree,
    /// Bodies of candidate-branch blocks, kept until their branch commits.
    branches: HashMap<BlockHash, Block>,
    spendables: Spendables,
    immature_coinbases: Spendables,
    claims: ClaimPool,
    best_locator: BlockLocator,
    purge_depth: i64,
    validation_depth: i64,
    verification_depth: i64,
}

impl ChainState {
    fn new() -> Self {
        Self {
            tree: BlockTree::new(),
            branches: HashMap::new(),
            spendables: Spendables::new(),
            immature_coinbases: Spendables::new(),
            claims: ClaimPool::new(),
            best_locator: BlockLocator::default(),
            purge_depth: 0,
            validation_depth: 0,
            verification_depth: 0,
        }
    }
}

/// The core ledger engine of a full node.
pub struct LedgerEngine<C> {
    chain: C,
    store: Store,
    signatures: Arc<dyn VerifySignature>,
    lazy_purging: bool,
    state: RwLock<ChainState>,
}

impl<C: Chain> LedgerEngine<C> {
    /// Opens the engine with the production signature verifier. An empty data
    /// directory keeps the store in memory.
    pub async fn new(chain: C, data_dir: &str) -> Result<Self> {
        Self::with_verifier(chain, data_dir, Arc::new(ConsensusVerifier)).await
    }

    /// Opens the engine with a caller-provided signature backend.
    pub async fn with_verifier(
        chain: C,
        data_dir: &str,
        signatures: Arc<dyn VerifySignature>,
    ) -> Result<Self> {
        let store = Store::open(data_dir).await?;
        let engine = Self {
            chain,
            store,
            signatures,
            lazy_purging: false,
            state: RwLock::new(ChainState::new()),
        };

        {
            let mut state = engine.state.write().await;
            engine.init_state(&mut state).await?;
        }

        Ok(engine)
    }

    async fn init_state(&self, state: &mut ChainState) -> Result<()> {
        state.validation_depth = self.chain.total_blocks_estimate();
        state.verification_depth = self.chain.total_blocks_estimate();

        state.tree.assign(self.store.load_refs().await?);

        if state.tree.is_empty() {
            let genesis = self.chain.genesis_block();
            state
                .tree
                .assign(vec![BlockRef::from_header(&genesis.header)]);
            state.branches.insert(genesis.block_hash(), genesis);

            let bootstrap = self.bootstrap_genesis(state).await;
            state.branches.clear();
            bootstrap.map_err(|err| err.in_stage("creating genesis block"))?;
        }

        state.purge_depth = self.store.minimum_confirmation_count().await?;

        if self.store.has_unspent_index().await? {
            state.validation_depth = 0;
        } else {
            let bound = state.tree.count() - COINBASE_MATURITY;
            for row in self.store.spendable_rows(bound).await? {
                state.spendables.insert(row);
            }
            for row in self.store.immature_rows(bound).await? {
                state.immature_coinbases.insert(row);
            }
        }

        state.best_locator = Self::build_locator(&state.tree);
        tracing::info!(height = state.tree.height(), "block chain initialized");
        Ok(())
    }

    async fn bootstrap_genesis(&self, state: &mut ChainState) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let mut verifier = Verifier::new(self.signatures.clone());
        let mut unconfirmed = HashMap::new();
        let mut confirmed = HashSet::new();
        let genesis = state.tree.genesis();
        self.attach(
            state,
            &mut tx,
            genesis,
            &mut verifier,
            &mut unconfirmed,
            &mut confirmed,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    // ========== Mutators ==========

    /// Offers a block to the ledger.
    ///
    /// A block extending (or out-weighing) the best chain is attached inside
    /// one store transaction together with any reorganization it implies; a
    /// lighter side-branch block is recorded in the tree with its body held
    /// pending. Any failure restores the tree, the trie and the store to the
    /// pre-append state.
    pub async fn append(&self, block: &Block) -> Result<()> {
        let mut state = self.state.write().await;
        self.append_inner(&mut state, block).await
    }

    async fn append_inner(&self, state: &mut ChainState, block: &Block) -> Result<()> {
        let hash = block.block_hash();

        check_block_sanity(block)?;

        if state.tree.find(&hash).is_some() {
            return Err(Error::DuplicateBlock);
        }
        let prev = state
            .tree
            .find(&block.header.prev_blockhash)
            .ok_or(Error::Orphan)?;

        // If a super-majority of recent blocks carries version N, blocks
        // below N are no longer accepted.
        let version = block.header.version.to_consensus();
        let min_accepted = self.min_version_by_quorum(
            &state.tree,
            self.chain.accept_quorum(),
            self.chain.accept_majority(),
        );
        if version < min_accepted {
            return Err(Error::VersionTooOld(version));
        }

        if block.header.bits != self.chain.next_work_required(&state.tree, prev) {
            return Err(Error::BadProofOfWork);
        }

        if i64::from(block.header.time) <= Self::median_time_past(&state.tree, prev) {
            return Err(Error::TimeTooEarly);
        }

        // The prev handle is invalidated by the insert below.
        let prev_height = state.tree.height_of(prev);

        let changes = state
            .tree
            .insert(BlockRef::from_header(&block.header))
            .map_err(|err| match err {
                TreeError::Duplicate => Error::DuplicateBlock,
                TreeError::UnknownParent => Error::Orphan,
            })?;

        let spendables_snapshot = state.spendables.clone();
        let immature_snapshot = state.immature_coinbases.clone();

        if prev_height < self.chain.total_blocks_estimate() && changes.inserted.is_empty() {
            state.tree.pop_back();
            return Err(Error::BranchingBeforeCheckpoint(
                self.chain.total_blocks_estimate(),
            ));
        }

        state.branches.insert(hash, block.clone());

        if changes.inserted.is_empty() {
            // A longer chain exists; the header is in the tree and the body
            // stays pending until its branch wins.
            return Ok(());
        }

        let (unconfirmed, confirmed) = match self.connect(state, block, &changes, prev_height).await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                state.tree.pop_back();
                for deleted in &changes.deleted {
                    state.branches.remove(deleted);
                }
                state.branches.remove(&hash);
                state.spendables = spendables_snapshot;
                state.immature_coinbases = immature_snapshot;
                return Err(err.in_stage("append(Block)"));
            }
        };

        // Committed: candidate bodies are reconstructible from the store.
        for inserted in &changes.inserted {
            state.branches.remove(inserted);
        }
        state.best_locator = Self::build_locator(&state.tree);

        if state.validation_depth > 0 {
            state
                .spendables
                .authenticate(state.tree.count() >= state.validation_depth);
        }

        for txid in &confirmed {
            state.claims.erase(txid);
        }
        let now = unix_now();
        state.claims.purge(now.saturating_sub(CLAIM_MAX_AGE));

        // Transactions that fell out of the chain go back to the pool; one
        // that no longer resolves after the reorganization is dropped.
        for (txid, txn) in unconfirmed {
            if txn.is_coinbase() {
                continue;
            }
            match self.try_claim_inner(state, &txn, false).await {
                Ok((spents, fee)) => state.claims.insert(txn, spents, fee, now),
                Err(err) => {
                    tracing::warn!(%txid, "dropping unconfirmed transaction after reorg: {err}")
                }
            }
        }

        tracing::info!(
            best = %hash,
            height = prev_height + 1,
            "ACCEPT: new best block"
        );
        Ok(())
    }

    /// Steps 9 to 12 of the append pipeline: everything that runs inside the
    /// store transaction.
    async fn connect(
        &self,
        state: &mut ChainState,
        block: &Block,
        changes: &Changes,
        prev_height: i64,
    ) -> Result<(HashMap<Txid, Transaction>, HashSet<Txid>)> {
        let mut tx = self.store.begin().await?;
        let mut unconfirmed = HashMap::new();
        let mut confirmed = HashSet::new();

        for deleted in &changes.deleted {
            let node = state
                .tree
                .find(deleted)
                .expect("change-set hashes come from the tree; qed");
            self.detach(state, &mut tx, node, &mut unconfirmed).await?;
        }

        let mut verifier = Verifier::new(self.signatures.clone());
        for inserted in changes.inserted.iter().rev() {
            let node = state
                .tree
                .find(inserted)
                .expect("change-set hashes come from the tree; qed");
            self.attach(
                state,
                &mut tx,
                node,
                &mut verifier,
                &mut unconfirmed,
                &mut confirmed,
            )
            .await?;
        }

        if !self.lazy_purging && state.purge_depth > 0 && state.tree.count() >= state.purge_depth {
            self.store.purge(&mut tx, state.purge_depth).await?;
        }

        let min_enforced = self.min_version_by_quorum(
            &state.tree,
            self.chain.enforce_quorum(),
            self.chain.enforce_majority(),
        );
        let version = block.header.version.to_consensus();
        let coinbase_script = &block.txdata[0].input[0].script_sig;
        if min_enforced >= 3 && version >= 3 {
            if let Some(root) = state.spendables.root() {
                if !commitment::has_root(coinbase_script, &root) {
                    return Err(Error::MissingRootCommitment(version));
                }
            }
        }
        if min_enforced >= 2 && version >= 2 {
            if !commitment::has_height(coinbase_script, prev_height + 1) {
                return Err(Error::MissingHeightCommitment(version));
            }
        }

        tx.commit().await?;
        Ok((unconfirmed, confirmed))
    }

    /// Connects one block on top of the current state.
    async fn attach(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        node: NodeId,
        verifier: &mut Verifier,
        unconfirmed: &mut HashMap<Txid, Transaction>,
        confirmed: &mut HashSet<Txid>,
    ) -> Result<()> {
        let reference = *state.tree.reference(node);
        let height = state.tree.height_of(node);
        let count = state.tree.count_of(node);

        let block = state
            .branches
            .get(&reference.hash)
            .cloned()
            .ok_or(Error::BlockNotFound(count))?;

        if !self.chain.check_points(height, &reference.hash) {
            return Err(Error::CheckpointMismatch(height));
        }

        let time = i64::from(reference.time);
        for txn in &block.txdata {
            if !is_final_tx(txn, height, time) {
                return Err(Error::NonFinalTransaction);
            }
        }

        verifier.reset();

        self.store
            .insert_block_header(conn, count, &block.header)
            .await?;

        // Coinbase outputs from a full maturity interval back become
        // spendable with this block.
        if count > COINBASE_MATURITY {
            self.maturate(state, conn, count - COINBASE_MATURITY).await?;
        }

        let mut fees: u64 = 0;
        let min_fee = self.chain.min_fee();
        let strict_p2sh = reference.time > self.chain.time_stamp(SoftFork::Bip16);
        let verify_block = state.verification_depth > 0 && height > state.verification_depth;

        for (idx, txn) in block.txdata.iter().enumerate().skip(1) {
            let txid = txn.compute_txid();
            // Claims were verified on admission; no need to verify twice.
            let verify =
                verify_block && !unconfirmed.contains_key(&txid) && !state.claims.have(&txid);
            self.post_transaction(
                state, conn, txn, &mut fees, min_fee, count, idx as i64, strict_p2sh, verify,
                verifier,
            )
            .await?;
            unconfirmed.remove(&txid);
            confirmed.insert(txid);
        }

        self.post_subsidy(state, conn, &block.txdata[0], &reference, height, count, fees)
            .await?;

        if !verifier.yield_success() {
            return Err(Error::SignatureFailed(
                verifier.reason().unwrap_or("unknown").to_string(),
            ));
        }

        Ok(())
    }

    /// Disconnects the current tip block, returning its transactions for
    /// possible re-admission.
    async fn detach(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        node: NodeId,
        unconfirmed: &mut HashMap<Txid, Transaction>,
    ) -> Result<()> {
        let count = state.tree.count_of(node);
        let block = self
            .store
            .block(conn, count)
            .await?
            .ok_or(Error::BlockNotFound(count))?;

        self.rollback_block(state, conn, count).await?;

        for txn in &block.txdata {
            unconfirmed.insert(txn.compute_txid(), txn.clone());
        }
        state
            .branches
            .insert(state.tree.reference(node).hash, block);
        Ok(())
    }

    async fn rollback_block(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        count: i64,
    ) -> Result<()> {
        let cnfs = self.store.block_confirmations(conn, count).await?;
        for cnf in cnfs.iter().rev() {
            self.rollback_confirmation(state, conn, *cnf, count).await?;
        }

        // Undo the maturation this block performed when it attached.
        if state.validation_depth > 0 && count > COINBASE_MATURITY {
            for coin in self
                .store
                .coinbase_unspents(conn, count - COINBASE_MATURITY)
                .await?
            {
                let outpoint = coin.outpoint();
                state.spendables.remove(&outpoint);
                state.immature_coinbases.insert(coin);
            }
        }

        self.store.delete_block(conn, count).await?;
        Ok(())
    }

    async fn rollback_confirmation(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        cnf: i64,
        count: i64,
    ) -> Result<()> {
        if state.validation_depth > 0 {
            // Coins this confirmation consumed come back. A coinbase coin
            // whose maturity boundary is exactly this block returns to the
            // immature set; everything else is spendable again.
            for coin in self.store.resurrectable_spendings(conn, cnf, count).await? {
                if coin.is_coinbase() && -coin.count == count - COINBASE_MATURITY {
                    state.immature_coinbases.insert(coin);
                } else {
                    state.spendables.insert(coin);
                }
            }
            // Coins this confirmation introduced disappear.
            for outpoint in self.store.unspent_outpoints_of(conn, cnf).await? {
                state.spendables.remove(&outpoint);
                state.immature_coinbases.remove(&outpoint);
            }
        }

        self.store.rollback_confirmation(conn, cnf, count).await?;
        Ok(())
    }

    /// Consumes the coin referenced by `input` on behalf of `iconf`.
    async fn redeem(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        input: &TxIn,
        iconf: &Confirmation,
    ) -> Result<TxOut> {
        let outpoint = input.previous_output;

        let coin = if state.validation_depth == 0 {
            let coin = self
                .store
                .unspent_by_outpoint(conn, &outpoint)
                .await?
                .ok_or(Error::CoinNotFound(outpoint))?;
            if coin.count < 0 && iconf.count + coin.count < COINBASE_MATURITY {
                return Err(Error::ImmatureCoinbase(outpoint));
            }
            coin
        } else {
            match state.spendables.remove(&outpoint) {
                Some(coin) => coin,
                None if state.immature_coinbases.find(&outpoint).is_some() => {
                    return Err(Error::ImmatureCoinbase(outpoint));
                }
                None => return Err(Error::CoinNotFound(outpoint)),
            }
        };

        if !money_range(coin.amount()) {
            return Err(Error::InputValueOutOfRange);
        }

        if iconf.count >= state.purge_depth {
            let spending = Spending {
                ocnf: coin.cnf,
                coin: coin.coin,
                hash: outpoint.txid,
                idx: outpoint.vout,
                value: coin.value,
                script: coin.script.clone(),
                signature: input.script_sig.clone(),
                sequence: input.sequence.0,
                icnf: iconf.cnf,
            };
            self.store.insert_spending(conn, &spending).await?;
        }
        self.store.delete_unspent(conn, coin.coin).await?;

        Ok(TxOut {
            value: coin.amount(),
            script_pubkey: coin.script,
        })
    }

    /// Materializes one output as an unspent coin.
    async fn issue(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        output: &TxOut,
        txid: &Txid,
        vout: u32,
        conf: &Confirmation,
        unique: bool,
    ) -> Result<()> {
        let count = conf.signed_count();
        let outpoint = OutPoint { txid: *txid, vout };

        if state.validation_depth == 0 {
            self.store
                .insert_unspent(
                    conn,
                    txid,
                    vout,
                    output.value.to_sat(),
                    &output.script_pubkey,
                    count,
                    conf.cnf,
                    unique,
                )
                .await
                .map_err(|err| {
                    if err.is_unique_violation() {
                        if conf.is_coinbase() {
                            Error::DuplicateCoinbase(outpoint)
                        } else {
                            Error::DuplicateOutpoint(outpoint)
                        }
                    } else {
                        err.into()
                    }
                })?;
            return Ok(());
        }

        let coin = self
            .store
            .insert_unspent(
                conn,
                txid,
                vout,
                output.value.to_sat(),
                &output.script_pubkey,
                count,
                conf.cnf,
                false,
            )
            .await?;
        let unspent = Unspent {
            coin,
            hash: *txid,
            idx: vout,
            value: output.value.to_sat(),
            script: output.script_pubkey.clone(),
            count,
            cnf: conf.cnf,
        };

        if conf.is_coinbase() {
            // Coinbase uniqueness is enforced against both maturity buckets.
            if unique
                && (state.immature_coinbases.find(&outpoint).is_some()
                    || state.spendables.find(&outpoint).is_some())
            {
                return Err(Error::DuplicateCoinbase(outpoint));
            }
            state.immature_coinbases.insert(unspent);
        } else {
            state.spendables.insert(unspent);
        }
        Ok(())
    }

    /// Promotes coinbase outputs confirmed at `count` into the spendable set.
    async fn maturate(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        count: i64,
    ) -> Result<()> {
        if state.validation_depth == 0 {
            return Ok(());
        }
        for coin in self.store.coinbase_unspents(conn, count).await? {
            let outpoint = coin.outpoint();
            state.immature_coinbases.remove(&outpoint);
            state.spendables.insert(coin);
        }
        Ok(())
    }

    /// Confirms one non-coinbase transaction: redeem inputs, account fees,
    /// issue outputs.
    #[allow(clippy::too_many_arguments)]
    async fn post_transaction(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        txn: &Transaction,
        fees: &mut u64,
        min_fee: u64,
        count: i64,
        idx: i64,
        strict_p2sh: bool,
        verify: bool,
        verifier: &mut Verifier,
    ) -> Result<()> {
        let locktime = txn.lock_time.to_consensus_u32();
        let cnf = if count >= state.purge_depth {
            self.store
                .insert_confirmation(conn, txn.version.0, locktime, count, idx)
                .await?
        } else {
            // Downloading history below the purge depth; no confirmation row.
            LOCK_TIME_THRESHOLD
        };
        let conf = Confirmation {
            cnf,
            version: txn.version.0,
            locktime,
            count,
            idx,
        };

        let txid = txn.compute_txid();
        let raw = Arc::new(bitcoin::consensus::serialize(txn));

        let mut value_in: u64 = 0;
        for (in_idx, input) in txn.input.iter().enumerate() {
            let coin = self.redeem(state, conn, input, &conf).await?;
            value_in += coin.value.to_sat();
            // Invocation only; evaluation happens at the commit barrier.
            if verify {
                verifier.verify(coin, raw.clone(), in_idx, strict_p2sh, 0);
            }
        }

        let value_out = txn.output.iter().map(|out| out.value.to_sat()).sum::<u64>();
        let fee = value_in.checked_sub(value_out).ok_or(Error::NegativeFee)?;
        if fee < min_fee {
            return Err(Error::FeeBelowMinimum {
                got: fee,
                min: min_fee,
            });
        }
        *fees = fees.checked_add(fee).ok_or(Error::FeeOutOfRange)?;
        if !money_range(Amount::from_sat(*fees)) {
            return Err(Error::FeeOutOfRange);
        }

        for (out_idx, output) in txn.output.iter().enumerate() {
            self.issue(state, conn, output, &txid, out_idx as u32, &conf, true)
                .await?;
        }
        Ok(())
    }

    /// Confirms the coinbase: bounds its value by subsidy plus fees, archives
    /// its input and issues its outputs under maturity encoding.
    async fn post_subsidy(
        &self,
        state: &mut ChainState,
        conn: &mut Connection,
        txn: &Transaction,
        reference: &BlockRef,
        height: i64,
        count: i64,
        fees: u64,
    ) -> Result<()> {
        let locktime = txn.lock_time.to_consensus_u32();
        if count >= state.purge_depth {
            self.store
                .insert_coinbase_confirmation(conn, txn.version.0, locktime, count)
                .await?;
        }
        let conf = Confirmation {
            cnf: -count,
            version: txn.version.0,
            locktime,
            count,
            idx: 0,
        };

        let value_in = self
            .chain
            .subsidy(height)
            .checked_add(fees)
            .ok_or(Error::FeeOutOfRange)?;
        let value_out = txn.output.iter().map(|out| out.value.to_sat()).sum::<u64>();
        if value_out > value_in {
            return Err(Error::CoinbaseValueTooLarge {
                got: value_out,
                allowed: value_in,
            });
        }

        let input = &txn.input[0];
        if count >= state.purge_depth {
            self.store
                .insert_coinbase_spending(conn, count, value_in, &input.script_sig, input.sequence)
                .await?;
        }

        // Coinbase outpoints must be unique once BIP30 is in force.
        let unique = reference.time > self.chain.time_stamp(SoftFork::Bip30);
        let txid = txn.compute_txid();
        for (out_idx, output) in txn.output.iter().enumerate() {
            self.issue(state, conn, output, &txid, out_idx as u32, &conf, unique)
                .await?;
        }
        Ok(())
    }

    /// Admits an unconfirmed transaction into the claim pool.
    pub async fn claim(&self, txn: Transaction, verify: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let (spents, fee) = self
            .try_claim_inner(&state, &txn, verify)
            .await
            .map_err(|err| err.in_stage("claim(Transaction)"))?;
        state.claims.insert(txn, spents, fee, unix_now());
        Ok(())
    }

    /// Runs claim admission without inserting; returns the consumed
    /// outpoints and the fee the transaction pays.
    pub async fn try_claim(&self, txn: &Transaction, verify: bool) -> Result<(Spents, u64)> {
        let state = self.state.read().await;
        self.try_claim_inner(&state, txn, verify)
            .await
            .map_err(|err| err.in_stage("claim(Transaction)"))
    }

    async fn try_claim_inner(
        &self,
        state: &ChainState,
        txn: &Transaction,
        verify: bool,
    ) -> Result<(Spents, u64)> {
        let txid = txn.compute_txid();
        if state.claims.have(&txid) {
            return Err(Error::DuplicateClaim(txid));
        }
        if txn.is_coinbase() {
            return Err(Error::CoinbaseClaim);
        }
        check_transaction_sanity(txn)?;

        let strict_p2sh = unix_now() > u64::from(self.chain.time_stamp(SoftFork::Bip16));
        let raw = bitcoin::consensus::serialize(txn);

        let mut conn = if state.validation_depth == 0 {
            Some(self.store.acquire().await?)
        } else {
            None
        };

        let mut spents = Spents::new();
        let mut value_in: u64 = 0;
        for (in_idx, input) in txn.input.iter().enumerate() {
            let outpoint = input.previous_output;

            if state.claims.spent(&outpoint) || spents.contains(&outpoint) {
                return Err(Error::CoinAlreadySpent(outpoint));
            }

            // Resolution order: outputs of earlier claims, then the
            // committed coin set.
            let (value, script) = if let Some(output) = state.claims.prev(&outpoint) {
                (output.value.to_sat(), output.script_pubkey.clone())
            } else if let Some(conn) = conn.as_mut() {
                let coin = self
                    .store
                    .unspent_by_outpoint(conn, &outpoint)
                    .await?
                    .ok_or(Error::CoinNotFound(outpoint))?;
                if coin.count < 0 && state.tree.count() + coin.count < COINBASE_MATURITY {
                    return Err(Error::ImmatureCoinbase(outpoint));
                }
                (coin.value, coin.script)
            } else if let Some(coin) = state.spendables.find(&outpoint) {
                (coin.value, coin.script.clone())
            } else if state.immature_coinbases.find(&outpoint).is_some() {
                return Err(Error::ImmatureCoinbase(outpoint));
            } else {
                return Err(Error::CoinNotFound(outpoint));
            };

            spents.insert(outpoint);

            if !money_range(Amount::from_sat(value)) {
                return Err(Error::InputValueOutOfRange);
            }
            value_in = value_in
                .checked_add(value)
                .ok_or(Error::InputValueOutOfRange)?;

            if verify {
                let spent_output = TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: script,
                };
                self.signatures
                    .verify_signature(&spent_output, &raw, in_idx, strict_p2sh, 0)
                    .map_err(Error::SignatureFailed)?;
            }
        }

        let value_out = txn.output.iter().map(|out| out.value.to_sat()).sum::<u64>();
        let fee = value_in.checked_sub(value_out).ok_or(Error::NegativeFee)?;
        let min_fee = self.chain.min_fee();
        if fee < min_fee {
            return Err(Error::FeeBelowMinimum {
                got: fee,
                min: min_fee,
            });
        }

        Ok((spents, fee))
    }

    /// Sets the purge depth and discards history at or below it.
    pub async fn set_purge_depth(&self, depth: i64) -> Result<()> {
        let mut state = self.state.write().await;
        state.purge_depth = depth;
        let mut conn = self.store.acquire().await?;
        self.store.purge(&mut conn, depth).await?;
        Ok(())
    }

    pub async fn purge_depth(&self) -> i64 {
        self.state.read().await.purge_depth
    }

    /// Sets the block count above which the authenticated trie is active.
    /// Zero disables trie validation in favor of the unique outpoint index.
    pub async fn set_validation_depth(&self, depth: i64) -> Result<()> {
        let mut state = self.state.write().await;
        if depth == state.validation_depth {
            return Ok(());
        }
        state.validation_depth = depth;

        if depth == 0 {
            self.store.create_unspent_index().await?;
            state.spendables = Spendables::new();
            state.immature_coinbases = Spendables::new();
            return Ok(());
        }

        self.store.drop_unspent_index().await?;

        let bound = state.tree.count() - COINBASE_MATURITY;
        let mut spendables = Spendables::new();
        for row in self.store.spendable_rows(bound).await? {
            spendables.insert(row);
        }
        let mut immature = Spendables::new();
        for row in self.store.immature_rows(bound).await? {
            immature.insert(row);
        }
        spendables.authenticate(state.tree.count() >= depth);
        if let Some(root) = spendables.root() {
            tracing::info!(%root, "merkle trie hashing on");
        }
        state.spendables = spendables;
        state.immature_coinbases = immature;
        Ok(())
    }

    /// Sets the height above which input signatures are verified.
    pub async fn set_verification_depth(&self, depth: i64) {
        self.state.write().await.verification_depth = depth;
    }

    /// Enables or disables the script index backing [`Self::get_unspents`].
    pub async fn set_script_to_unspents(&self, enable: bool) -> Result<()> {
        Ok(self.store.set_script_index(enable).await?)
    }

    pub async fn script_to_unspents(&self) -> Result<bool> {
        Ok(self.store.has_script_index().await?)
    }

    // ========== Queries ==========

    pub async fn have_block(&self, hash: &BlockHash) -> bool {
        self.state.read().await.tree.find(hash).is_some()
    }

    /// Whether the transaction is known to the claim pool.
    pub async fn have_tx(&self, txid: &Txid) -> bool {
        self.state.read().await.claims.have(txid)
    }

    pub async fn is_in_main_chain(&self, hash: &BlockHash) -> bool {
        let state = self.state.read().await;
        state
            .tree
            .find(hash)
            .is_some_and(|node| state.tree.height_of(node) >= 0)
    }

    /// Height of a known block, regardless of its branch.
    pub async fn get_height(&self, hash: &BlockHash) -> Option<i64> {
        let state = self.state.read().await;
        state
            .tree
            .find(hash)
            .map(|node| state.tree.height_of(node).abs())
    }

    pub async fn tree_height(&self) -> i64 {
        self.state.read().await.tree.height()
    }

    pub async fn tree_count(&self) -> i64 {
        self.state.read().await.tree.count()
    }

    pub async fn best_hash(&self) -> BlockHash {
        let state = self.state.read().await;
        state.tree.reference(state.tree.best()).hash
    }

    pub async fn genesis_hash(&self) -> BlockHash {
        let state = self.state.read().await;
        state.tree.reference(state.tree.genesis()).hash
    }

    /// Whether no unspent coin exists at `outpoint`.
    pub async fn is_spent(&self, outpoint: &OutPoint) -> Result<bool> {
        let state = self.state.read().await;
        if state.validation_depth == 0 {
            let mut conn = self.store.acquire().await?;
            Ok(!self.store.is_unspent(&mut conn, outpoint).await?)
        } else {
            Ok(state.spendables.find(outpoint).is_none()
                && state.immature_coinbases.find(outpoint).is_none())
        }
    }

    /// A block by hash, served from the pending bodies or the store.
    pub async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let state = self.state.read().await;
        if let Some(block) = state.branches.get(hash) {
            return Ok(Some(block.clone()));
        }
        let Some(node) = state.tree.find(hash) else {
            return Ok(None);
        };
        if state.tree.height_of(node) < 0 {
            return Ok(None);
        }
        self.get_block_by_count(state.tree.count_of(node)).await
    }

    pub async fn get_block_by_count(&self, count: i64) -> Result<Option<Block>> {
        let mut conn = self.store.acquire().await?;
        Ok(self.store.block(&mut conn, count).await?)
    }

    pub async fn get_block_header(&self, count: i64) -> Result<Option<Header>> {
        let mut conn = self.store.acquire().await?;
        Ok(self.store.block_header(&mut conn, count).await?)
    }

    /// A confirmed transaction by confirmation id, with the height and time
    /// of its confirming block.
    pub async fn get_transaction_by_cnf(
        &self,
        cnf: i64,
    ) -> Result<Option<(Transaction, i64, i64)>> {
        let state = self.state.read().await;
        let mut conn = self.store.acquire().await?;
        let Some((txn, count)) = self.store.transaction_by_cnf(&mut conn, cnf).await? else {
            return Ok(None);
        };
        Ok(Some(Self::locate_transaction(&state.tree, txn, count)))
    }

    /// A confirmed transaction by hash.
    pub async fn get_transaction(&self, txid: &Txid) -> Result<Option<(Transaction, i64, i64)>> {
        let state = self.state.read().await;
        let mut conn = self.store.acquire().await?;
        let Some(cnf) = self.store.cnf_by_txid(&mut conn, txid).await? else {
            return Ok(None);
        };
        let Some((txn, count)) = self.store.transaction_by_cnf(&mut conn, cnf).await? else {
            return Ok(None);
        };
        Ok(Some(Self::locate_transaction(&state.tree, txn, count)))
    }

    fn locate_transaction(
        tree: &BlockTree,
        txn: Transaction,
        count: i64,
    ) -> (Transaction, i64, i64) {
        if count > LOCK_TIME_THRESHOLD {
            // Recorded without a block; the count field carries a timestamp.
            (txn, -1, count)
        } else {
            let time = tree
                .at_height(count - 1)
                .map_or(0, |node| i64::from(tree.reference(node).time));
            (txn, count - 1, time)
        }
    }

    /// Transactions currently held by the claim pool.
    pub async fn unconfirmed_transactions(&self) -> Vec<Transaction> {
        self.state.read().await.claims.unconfirmed()
    }

    /// Unspent coins locked to `script`, including unconfirmed claim outputs
    /// when `before` does not exclude them. Requires the script index.
    pub async fn get_unspents(&self, script: &ScriptBuf, before: u32) -> Result<Vec<Unspent>> {
        let state = self.state.read().await;
        if !self.store.has_script_index().await? {
            return Err(Error::MissingScriptIndex);
        }

        let mut conn = self.store.acquire().await?;
        let mut unspents = self.store.unspents_by_script(&mut conn, script).await?;
        drop(conn);

        if before == 0 || i64::from(before) > LOCK_TIME_THRESHOLD {
            for (outpoint, output) in state.claims.claimed(script.as_script()) {
                let timestamp = state.claims.timestamp(&outpoint.txid).unwrap_or(0);
                if before == 0 || timestamp <= u64::from(before) {
                    unspents.push(Unspent {
                        coin: 0,
                        hash: outpoint.txid,
                        idx: outpoint.vout,
                        value: output.value.to_sat(),
                        script: output.script_pubkey,
                        count: timestamp as i64,
                        cnf: 0,
                    });
                }
            }
        } else {
            unspents.retain(|unspent| unspent.count <= i64::from(before));
        }

        unspents.retain(|unspent| !state.claims.spent(&unspent.outpoint()));
        Ok(unspents)
    }

    pub async fn get_best_locator(&self) -> BlockLocator {
        self.state.read().await.best_locator.clone()
    }

    /// How far back the sender's chain forked from ours, judging by their
    /// locator.
    pub async fn get_distance_back(&self, locator: &BlockLocator) -> i64 {
        let state = self.state.read().await;
        let mut distance = 0;
        let mut step = 1;
        for hash in &locator.have {
            if state.tree.find(hash).is_some() {
                return distance;
            }
            distance += step;
            if distance > 10 {
                step *= 2;
            }
        }
        distance
    }

    /// Difficulty of a block as a multiple of the minimum difficulty; the
    /// best tip when `hash` is `None`.
    pub async fn get_difficulty(&self, hash: Option<&BlockHash>) -> Option<f64> {
        let state = self.state.read().await;
        let node = match hash {
            Some(hash) => state.tree.find(hash)?,
            None => state.tree.best(),
        };
        Some(compact_to_difficulty(state.tree.reference(node).bits))
    }

    /// Assembles an unmined block on top of the best tip: fee-ordered claims,
    /// plus a version 3 coinbase committing to the height and the simulated
    /// spendables root, with rewards split over `payees`.
    pub async fn get_block_template(
        &self,
        payees: &[ScriptBuf],
        fractions: &[u64],
        fee_fractions: &[u64],
    ) -> Result<Block> {
        let state = self.state.read().await;

        if payees.is_empty() {
            return Err(Error::EmptyPayees);
        }
        if !fractions.is_empty() && fractions.len() != payees.len() {
            return Err(Error::FractionMismatch);
        }
        if !fee_fractions.is_empty() && fee_fractions.len() != payees.len() {
            return Err(Error::FractionMismatch);
        }

        let best = state.tree.best();
        let bits = self.chain.next_work_required(&state.tree, best);
        let prev_hash = state.tree.reference(best).hash;
        // The new block's height equals the current block count.
        let height = state.tree.count();

        let mut fee: u64 = 0;
        let txns = state.claims.transactions(&mut fee);

        // Simulate the spendable set after this block to pin its root.
        let mut spendables = state.spendables.clone();
        for txn in &txns {
            let txid = txn.compute_txid();
            for (vout, output) in txn.output.iter().enumerate() {
                spendables.insert(Unspent {
                    coin: 0,
                    hash: txid,
                    idx: vout as u32,
                    value: output.value.to_sat(),
                    script: output.script_pubkey.clone(),
                    count: 0,
                    cnf: 0,
                });
            }
            for input in &txn.input {
                spendables.remove(&input.previous_output);
            }
        }
        let new_count = height + 1;
        if new_count > COINBASE_MATURITY {
            let mut conn = self.store.acquire().await?;
            for coin in self
                .store
                .coinbase_unspents(&mut conn, new_count - COINBASE_MATURITY)
                .await?
            {
                spendables.insert(coin);
            }
        }
        let root = spendables.root().unwrap_or_else(sha256d::Hash::all_zeros);

        let denominator: u64 = if fractions.is_empty() {
            payees.len() as u64
        } else {
            fractions.iter().sum()
        };
        let fee_denominator: u64 = if fee_fractions.is_empty() {
            denominator
        } else {
            fee_fractions.iter().sum()
        };
        if denominator == 0 || fee_denominator == 0 {
            return Err(Error::FractionMismatch);
        }

        let subsidy = self.chain.subsidy(height);
        let mut outputs = Vec::with_capacity(payees.len());
        for (i, payee) in payees.iter().enumerate() {
            let nominator = if fractions.is_empty() { 1 } else { fractions[i] };
            let fee_nominator = if fee_fractions.is_empty() {
                nominator
            } else {
                fee_fractions[i]
            };
            let mut value = nominator * subsidy / denominator + fee_nominator * fee / fee_denominator;
            if i == 0 {
                // The first payee absorbs the rounding remainders.
                value += subsidy % denominator + fee % fee_denominator;
            }
            outputs.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: payee.clone(),
            });
        }

        let coinbase = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: commitment::coinbase_script(height, &root),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs,
        };

        let mut txdata = vec![coinbase];
        txdata.extend(txns);

        let mut block = Block {
            header: Header {
                version: bitcoin::block::Version::from_consensus(3),
                prev_blockhash: prev_hash,
                merkle_root: TxMerkleNode::all_zeros(),
                time: unix_now() as u32,
                bits,
                nonce: 0,
            },
            txdata,
        };
        block.header.merkle_root = block
            .compute_merkle_root()
            .expect("template holds at least the coinbase; qed");

        Ok(block)
    }

    // ========== Internals ==========

    /// Scans back from the tip binning block versions; the lowest version
    /// holding a super-majority within the quorum window becomes the floor.
    fn min_version_by_quorum(&self, tree: &BlockTree, quorum: usize, majority: usize) -> i32 {
        let mut bins: BTreeMap<i32, usize> = BTreeMap::new();
        for (blocks, node) in tree.ancestors(tree.best()).enumerate() {
            let version = tree.reference(node).version;
            let bin = bins.entry(version).or_insert(0);
            *bin += 1;
            if *bin > majority {
                return version;
            }
            if blocks + 1 > quorum {
                let mut cumulative = 0;
                for (&candidate, &count) in bins.iter().rev() {
                    cumulative += count;
                    if cumulative > majority {
                        return candidate;
                    }
                }
            }
        }
        1
    }

    /// Median of the previous eleven block times, walking back from `node`.
    fn median_time_past(tree: &BlockTree, node: NodeId) -> i64 {
        let mut times: Vec<u32> = tree
            .ancestors(node)
            .take(11)
            .map(|id| tree.reference(id).time)
            .collect();
        times.sort_unstable();
        i64::from(times[times.len() / 2])
    }

    fn build_locator(tree: &BlockTree) -> BlockLocator {
        let mut have: Vec<BlockHash> = BlockLocator::heights(tree.height())
            .into_iter()
            .filter_map(|height| tree.at_height(height))
            .map(|node| tree.reference(node).hash)
            .collect();
        let genesis = tree.reference(tree.genesis()).hash;
        if have.last() != Some(&genesis) {
            have.push(genesis);
        }
        BlockLocator { have }
    }
}

#[cfg(test)]
impl<C: Chain> LedgerEngine<C> {
    pub(crate) async fn trie_sizes(&self) -> (usize, usize) {
        let state = self.state.read().await;
        (state.spendables.len(), state.immature_coinbases.len())
    }

    pub(crate) async fn spendables_root(&self) -> Option<sha256d::Hash> {
        self.state.read().await.spendables.root()
    }

    pub(crate) async fn trie_value_total(&self) -> u64 {
        let state = self.state.read().await;
        state
            .spendables
            .iter()
            .chain(state.immature_coinbases.iter())
            .map(|coin| coin.value)
            .sum()
    }

    pub(crate) async fn store_unspent_count(&self) -> i64 {
        self.store.unspent_count().await.expect("count query")
    }
}

/// Context-free structural pass over an offered block.
fn check_block_sanity(block: &Block) -> Result<()> {
    if block.txdata.is_empty() {
        return Err(Error::EmptyTransactionList);
    }
    if !block.txdata[0].is_coinbase() {
        return Err(Error::FirstTransactionNotCoinbase);
    }
    for (index, txn) in block.txdata.iter().enumerate() {
        if index > 0 && txn.is_coinbase() {
            return Err(Error::MultipleCoinbase);
        }
        check_transaction_sanity(txn)?;
    }

    let merkle_root = block.compute_merkle_root().ok_or(Error::BadMerkleRoot)?;
    if merkle_root != block.header.merkle_root {
        return Err(Error::BadMerkleRoot);
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs()
}
