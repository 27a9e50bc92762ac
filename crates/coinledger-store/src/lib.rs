//! SQLite persistence of the confirmed chain.
//!
//! Four tables mirror the ledger data model: `Blocks` (main-chain headers by
//! block count), `Confirmations` (transaction positions), `Unspents` (the
//! live coin set) and `Spendings` (archived consumptions kept for rollback
//! and historical blocks). Every mutator takes a `&mut SqliteConnection` so
//! the engine can compose them inside one transaction per appended block;
//! read helpers borrow the same connection type and run either inside that
//! transaction or on a connection acquired from the pool.
//!
//! The pool holds a single connection: the writer owns it for the duration of
//! a block transaction, matching the engine's single-writer discipline.

use bitcoin::absolute::LockTime;
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
    TxOut, Txid, Witness,
};
use coinledger_primitives::{BlockRef, Spending, Unspent};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl Error {
    /// Whether the underlying failure is a uniqueness violation, e.g. a
    /// duplicate coinbase outpoint hitting the conditional unspent index.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            Error::Database(sqlx::Error::Database(db)) if db.is_unique_violation()
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stored output index of the coinbase pseudo-spending's null outpoint.
const NULL_VOUT: i64 = u32::MAX as i64;

/// Connection type the engine threads through block transactions.
pub type Connection = SqliteConnection;

/// SQLite-backed chain store.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the store under `data_dir`, or entirely in memory when the
    /// directory is empty.
    pub async fn open(data_dir: &str) -> Result<Self> {
        let options = if data_dir.is_empty() {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            let db_path = Path::new(data_dir).join("blockchain.sqlite3");
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };

        let options = options
            .synchronous(SqliteSynchronous::Off)
            .foreign_keys(false)
            .pragma("temp_store", "MEMORY")
            .pragma("cache_size", "-65536");

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        tracing::info!(
            backing = if data_dir.is_empty() { "memory" } else { "wal" },
            "chain store opened"
        );

        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS Blocks (
                count INTEGER PRIMARY KEY,
                hash BLOB NOT NULL,
                version INTEGER NOT NULL,
                prev BLOB NOT NULL,
                mrkl BLOB NOT NULL,
                time INTEGER NOT NULL,
                bits INTEGER NOT NULL,
                nonce INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Confirmations (
                cnf INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                locktime INTEGER NOT NULL,
                count INTEGER NOT NULL,
                idx INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Unspents (
                coin INTEGER PRIMARY KEY AUTOINCREMENT,
                hash BLOB NOT NULL,
                idx INTEGER NOT NULL,
                value INTEGER NOT NULL,
                script BLOB NOT NULL,
                count INTEGER NOT NULL,
                ocnf INTEGER NOT NULL REFERENCES Confirmations(cnf)
            );
            CREATE INDEX IF NOT EXISTS UnspentsOut ON Unspents (ocnf);
            CREATE INDEX IF NOT EXISTS UnspentCount ON Unspents (count);

            CREATE TABLE IF NOT EXISTS Spendings (
                ocnf INTEGER NOT NULL,
                coin INTEGER PRIMARY KEY,
                hash BLOB NOT NULL,
                idx INTEGER NOT NULL,
                value INTEGER NOT NULL,
                script BLOB NOT NULL,
                signature BLOB NOT NULL,
                sequence INTEGER NOT NULL,
                icnf INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS SpendingsIn ON Spendings (icnf);
            CREATE INDEX IF NOT EXISTS SpendingsOut ON Spendings (ocnf);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// A pooled connection for read paths outside a block transaction.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Begins the logical transaction spanning one appended block.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    // ========== Startup ==========

    /// Main-chain block references in count order, for the tree rebuild.
    pub async fn load_refs(&self) -> Result<Vec<BlockRef>> {
        let rows: Vec<(i64, Vec<u8>, Vec<u8>, i64, i64)> = sqlx::query_as(
            "SELECT version, hash, prev, time, bits FROM Blocks ORDER BY count",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(version, hash, prev, time, bits)| {
                Ok(BlockRef {
                    version: version as i32,
                    hash: BlockHash::from_byte_array(hash32(&hash)?),
                    prev: BlockHash::from_byte_array(hash32(&prev)?),
                    time: time as u32,
                    bits: CompactTarget::from_consensus(bits as u32),
                })
            })
            .collect()
    }

    /// Lowest block count with a recorded confirmation; recovers the purge
    /// depth after a restart. Zero when no confirmation is recorded.
    pub async fn minimum_confirmation_count(&self) -> Result<i64> {
        let min: i64 = sqlx::query_scalar(
            "SELECT CASE WHEN COUNT(*) = 0 THEN 0 ELSE MIN(count) END FROM Confirmations",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(min)
    }

    /// Number of live unspent rows.
    pub async fn unspent_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM Unspents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn has_unspent_index(&self) -> Result<bool> {
        self.index_exists("UnspentIndex").await
    }

    pub async fn has_script_index(&self) -> Result<bool> {
        self.index_exists("ScriptIndex").await
    }

    async fn index_exists(&self, name: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE name = ?")
                .bind(name)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Unique outpoint index, maintained only while trie validation is off.
    pub async fn create_unspent_index(&self) -> Result<()> {
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS UnspentIndex ON Unspents (hash, idx)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn drop_unspent_index(&self) -> Result<()> {
        sqlx::query("DROP INDEX IF EXISTS UnspentIndex")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Enables or disables the script index backing address queries.
    pub async fn set_script_index(&self, enable: bool) -> Result<()> {
        let sql = if enable {
            "CREATE INDEX IF NOT EXISTS ScriptIndex ON Unspents (script)"
        } else {
            "DROP INDEX IF EXISTS ScriptIndex"
        };
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Unspent rows old enough to be spendable: `count >= -bound`, where
    /// `bound` is the tree count minus the coinbase maturity.
    pub async fn spendable_rows(&self, bound: i64) -> Result<Vec<Unspent>> {
        let rows: Vec<UnspentRow> = sqlx::query_as(
            "SELECT coin, hash, idx, value, script, count, ocnf FROM Unspents WHERE count >= ?",
        )
        .bind(-bound)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(unspent_from_row).collect()
    }

    /// Coinbase rows still under maturity: `count < -bound`.
    pub async fn immature_rows(&self, bound: i64) -> Result<Vec<Unspent>> {
        let rows: Vec<UnspentRow> = sqlx::query_as(
            "SELECT coin, hash, idx, value, script, count, ocnf FROM Unspents WHERE count < ?",
        )
        .bind(-bound)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(unspent_from_row).collect()
    }

    // ========== Block transaction mutators ==========

    pub async fn insert_block_header(
        &self,
        conn: &mut SqliteConnection,
        count: i64,
        header: &Header,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO Blocks (count, hash, version, prev, mrkl, time, bits, nonce) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(count)
        .bind(header.block_hash().to_byte_array().to_vec())
        .bind(i64::from(header.version.to_consensus()))
        .bind(header.prev_blockhash.to_byte_array().to_vec())
        .bind(header.merkle_root.to_byte_array().to_vec())
        .bind(i64::from(header.time))
        .bind(i64::from(header.bits.to_consensus()))
        .bind(i64::from(header.nonce))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Inserts a regular confirmation and returns its autoincrement id.
    pub async fn insert_confirmation(
        &self,
        conn: &mut SqliteConnection,
        version: i32,
        locktime: u32,
        count: i64,
        idx: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO Confirmations (locktime, version, count, idx) VALUES (?, ?, ?, ?)",
        )
        .bind(i64::from(locktime))
        .bind(i64::from(version))
        .bind(count)
        .bind(idx)
        .execute(conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Inserts the coinbase confirmation with its reserved id `-count`.
    pub async fn insert_coinbase_confirmation(
        &self,
        conn: &mut SqliteConnection,
        version: i32,
        locktime: u32,
        count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO Confirmations (cnf, locktime, version, count, idx) \
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(-count)
        .bind(i64::from(locktime))
        .bind(i64::from(version))
        .bind(count)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Writes an unspent row and returns its coin id. With `unique` the
    /// insert is strict and a duplicate outpoint surfaces as a uniqueness
    /// violation through the conditional unspent index; otherwise a duplicate
    /// silently replaces the earlier row.
    pub async fn insert_unspent(
        &self,
        conn: &mut SqliteConnection,
        txid: &Txid,
        vout: u32,
        value: u64,
        script: &ScriptBuf,
        count: i64,
        ocnf: i64,
        unique: bool,
    ) -> Result<i64> {
        let sql = if unique {
            "INSERT INTO Unspents (hash, idx, value, script, count, ocnf) VALUES (?, ?, ?, ?, ?, ?)"
        } else {
            "INSERT OR REPLACE INTO Unspents (hash, idx, value, script, count, ocnf) \
             VALUES (?, ?, ?, ?, ?, ?)"
        };
        let result = sqlx::query(sql)
            .bind(txid.to_byte_array().to_vec())
            .bind(i64::from(vout))
            .bind(value as i64)
            .bind(script.as_bytes())
            .bind(count)
            .bind(ocnf)
            .execute(conn)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn delete_unspent(&self, conn: &mut SqliteConnection, coin: i64) -> Result<()> {
        sqlx::query("DELETE FROM Unspents WHERE coin = ?")
            .bind(coin)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn unspent_by_outpoint(
        &self,
        conn: &mut SqliteConnection,
        outpoint: &OutPoint,
    ) -> Result<Option<Unspent>> {
        let row: Option<UnspentRow> = sqlx::query_as(
            "SELECT coin, hash, idx, value, script, count, ocnf FROM Unspents \
             WHERE hash = ? AND idx = ?",
        )
        .bind(outpoint.txid.to_byte_array().to_vec())
        .bind(i64::from(outpoint.vout))
        .fetch_optional(conn)
        .await?;
        row.map(unspent_from_row).transpose()
    }

    /// Archives a consumed coin.
    pub async fn insert_spending(
        &self,
        conn: &mut SqliteConnection,
        spending: &Spending,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO Spendings (coin, ocnf, hash, idx, value, script, signature, sequence, icnf) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(spending.coin)
        .bind(spending.ocnf)
        .bind(spending.hash.to_byte_array().to_vec())
        .bind(i64::from(spending.idx))
        .bind(spending.value as i64)
        .bind(spending.script.as_bytes())
        .bind(spending.signature.as_bytes())
        .bind(i64::from(spending.sequence))
        .bind(spending.icnf)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Archives the coinbase input as a pseudo-spending: `ocnf = 0` marks it
    /// as introducing no coin, `coin = -count` keeps the key space disjoint
    /// from real coins, and the null outpoint is stored verbatim so block
    /// reconstruction recovers the coinbase input exactly.
    pub async fn insert_coinbase_spending(
        &self,
        conn: &mut SqliteConnection,
        count: i64,
        value: u64,
        signature: &ScriptBuf,
        sequence: Sequence,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO Spendings (coin, ocnf, hash, idx, value, script, signature, sequence, icnf) \
             VALUES (?, 0, ?, ?, ?, X'', ?, ?, ?)",
        )
        .bind(-count)
        .bind(Txid::all_zeros().to_byte_array().to_vec())
        .bind(NULL_VOUT)
        .bind(value as i64)
        .bind(signature.as_bytes())
        .bind(i64::from(sequence.0))
        .bind(-count)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Coinbase unspents confirmed at exactly `count`; feeds maturation.
    pub async fn coinbase_unspents(
        &self,
        conn: &mut SqliteConnection,
        count: i64,
    ) -> Result<Vec<Unspent>> {
        let rows: Vec<UnspentRow> = sqlx::query_as(
            "SELECT coin, hash, idx, value, script, count, ocnf FROM Unspents WHERE count = ?",
        )
        .bind(-count)
        .fetch_all(conn)
        .await?;
        rows.into_iter().map(unspent_from_row).collect()
    }

    /// Discards spendings and confirmations at or below the purge depth.
    pub async fn purge(&self, conn: &mut SqliteConnection, depth: i64) -> Result<()> {
        sqlx::query(
            "DELETE FROM Spendings WHERE icnf IN (SELECT cnf FROM Confirmations WHERE count <= ?)",
        )
        .bind(depth)
        .execute(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM Confirmations WHERE count <= ?")
            .bind(depth)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ========== Rollback ==========

    /// Confirmation ids of a block in transaction-index order.
    pub async fn block_confirmations(
        &self,
        conn: &mut SqliteConnection,
        count: i64,
    ) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT cnf FROM Confirmations WHERE count = ? ORDER BY idx")
                .bind(count)
                .fetch_all(conn)
                .await?;
        Ok(rows.into_iter().map(|(cnf,)| cnf).collect())
    }

    /// Coins the confirmation consumed, re-materialized as unspent rows. The
    /// original signed count is recovered through the introducing
    /// confirmation; `fallback_count` stands in when that confirmation is no
    /// longer recorded. The coinbase pseudo-spending (`ocnf = 0`) is not a
    /// coin and is excluded.
    pub async fn resurrectable_spendings(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
        fallback_count: i64,
    ) -> Result<Vec<Unspent>> {
        let rows: Vec<UnspentRow> = sqlx::query_as(
            "SELECT s.coin, s.hash, s.idx, s.value, s.script, \
                    CASE WHEN s.ocnf < 0 THEN -COALESCE(c.count, ?1) \
                         ELSE COALESCE(c.count, ?1) END, \
                    s.ocnf \
             FROM Spendings s LEFT JOIN Confirmations c ON c.cnf = s.ocnf \
             WHERE s.icnf = ?2 AND s.ocnf <> 0",
        )
        .bind(fallback_count)
        .bind(cnf)
        .fetch_all(conn)
        .await?;
        rows.into_iter().map(unspent_from_row).collect()
    }

    /// Outpoints the confirmation introduced, for trie removal on rollback.
    pub async fn unspent_outpoints_of(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
    ) -> Result<Vec<OutPoint>> {
        let rows: Vec<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT hash, idx FROM Unspents WHERE ocnf = ?")
                .bind(cnf)
                .fetch_all(conn)
                .await?;
        rows.into_iter()
            .map(|(hash, idx)| {
                Ok(OutPoint {
                    txid: Txid::from_byte_array(hash32(&hash)?),
                    vout: idx as u32,
                })
            })
            .collect()
    }

    /// Undoes one confirmation in the store: consumed coins return to the
    /// Unspents table with their original coin ids and signed counts, so the
    /// trie and the maturity predicates stay aligned, and the confirmation's
    /// own rows disappear.
    pub async fn rollback_confirmation(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
        fallback_count: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO Unspents (coin, hash, idx, value, script, count, ocnf) \
             SELECT s.coin, s.hash, s.idx, s.value, s.script, \
                    CASE WHEN s.ocnf < 0 THEN -COALESCE(c.count, ?1) \
                         ELSE COALESCE(c.count, ?1) END, \
                    s.ocnf \
             FROM Spendings s LEFT JOIN Confirmations c ON c.cnf = s.ocnf \
             WHERE s.icnf = ?2 AND s.ocnf <> 0",
        )
        .bind(fallback_count)
        .bind(cnf)
        .execute(&mut *conn)
        .await?;
        sqlx::query("DELETE FROM Spendings WHERE icnf = ?")
            .bind(cnf)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM Unspents WHERE ocnf = ?")
            .bind(cnf)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM Confirmations WHERE cnf = ?")
            .bind(cnf)
            .execute(conn)
            .await?;
        Ok(())
    }

    pub async fn confirmation_block_count(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT count FROM Confirmations WHERE cnf = ?")
            .bind(cnf)
            .fetch_optional(conn)
            .await?;
        Ok(row.map(|(count,)| count))
    }

    pub async fn delete_block(&self, conn: &mut SqliteConnection, count: i64) -> Result<()> {
        sqlx::query("DELETE FROM Blocks WHERE count = ?")
            .bind(count)
            .execute(conn)
            .await?;
        Ok(())
    }

    // ========== Historical reads ==========

    pub async fn block_header(
        &self,
        conn: &mut SqliteConnection,
        count: i64,
    ) -> Result<Option<Header>> {
        let row: Option<(i64, Vec<u8>, Vec<u8>, i64, i64, i64)> = sqlx::query_as(
            "SELECT version, prev, mrkl, time, bits, nonce FROM Blocks WHERE count = ?",
        )
        .bind(count)
        .fetch_optional(conn)
        .await?;

        row.map(|(version, prev, mrkl, time, bits, nonce)| {
            Ok(Header {
                version: bitcoin::block::Version::from_consensus(version as i32),
                prev_blockhash: BlockHash::from_byte_array(hash32(&prev)?),
                merkle_root: TxMerkleNode::from_byte_array(hash32(&mrkl)?),
                time: time as u32,
                bits: CompactTarget::from_consensus(bits as u32),
                nonce: nonce as u32,
            })
        })
        .transpose()
    }

    /// Reconstructs a full block from confirmations, spendings and unspents.
    pub async fn block(&self, conn: &mut SqliteConnection, count: i64) -> Result<Option<Block>> {
        let Some(header) = self.block_header(conn, count).await? else {
            return Ok(None);
        };

        let confs: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT cnf, version, locktime FROM Confirmations WHERE count = ? ORDER BY idx",
        )
        .bind(count)
        .fetch_all(&mut *conn)
        .await?;

        let mut txdata = Vec::with_capacity(confs.len());
        for (cnf, version, locktime) in confs {
            txdata.push(
                self.assemble_transaction(conn, cnf, version as i32, locktime as u32)
                    .await?,
            );
        }

        Ok(Some(Block { header, txdata }))
    }

    /// A confirmed transaction by its confirmation id, together with the
    /// count of the confirming block.
    pub async fn transaction_by_cnf(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
    ) -> Result<Option<(Transaction, i64)>> {
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            "SELECT version, locktime, count FROM Confirmations WHERE cnf = ?",
        )
        .bind(cnf)
        .fetch_optional(&mut *conn)
        .await?;

        let Some((version, locktime, count)) = row else {
            return Ok(None);
        };

        let tx = self
            .assemble_transaction(conn, cnf, version as i32, locktime as u32)
            .await?;
        Ok(Some((tx, count)))
    }

    /// Confirmation id of the transaction that created `txid`'s outputs,
    /// found through the unspents and then the spendings.
    pub async fn cnf_by_txid(
        &self,
        conn: &mut SqliteConnection,
        txid: &Txid,
    ) -> Result<Option<i64>> {
        let hash = txid.to_byte_array().to_vec();
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT ocnf FROM Unspents WHERE hash = ? LIMIT 1")
                .bind(&hash)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some((ocnf,)) = row {
            return Ok(Some(ocnf));
        }

        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT ocnf FROM Spendings WHERE hash = ? AND ocnf <> 0 LIMIT 1",
        )
        .bind(&hash)
        .fetch_optional(conn)
        .await?;
        Ok(row.map(|(ocnf,)| ocnf))
    }

    pub async fn is_unspent(
        &self,
        conn: &mut SqliteConnection,
        outpoint: &OutPoint,
    ) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT coin FROM Unspents WHERE hash = ? AND idx = ?")
                .bind(outpoint.txid.to_byte_array().to_vec())
                .bind(i64::from(outpoint.vout))
                .fetch_optional(conn)
                .await?;
        Ok(row.is_some())
    }

    /// Unspent rows locked to `script`. Callers must ensure the script index
    /// exists; without it the scan cost is unbounded.
    pub async fn unspents_by_script(
        &self,
        conn: &mut SqliteConnection,
        script: &ScriptBuf,
    ) -> Result<Vec<Unspent>> {
        let rows: Vec<UnspentRow> = sqlx::query_as(
            "SELECT coin, hash, idx, value, script, count, ocnf FROM Unspents WHERE script = ?",
        )
        .bind(script.as_bytes())
        .fetch_all(conn)
        .await?;
        rows.into_iter().map(unspent_from_row).collect()
    }

    /// Rebuilds a transaction from its archived inputs and outputs, with
    /// every column projected explicitly.
    async fn assemble_transaction(
        &self,
        conn: &mut SqliteConnection,
        cnf: i64,
        version: i32,
        locktime: u32,
    ) -> Result<Transaction> {
        let input_rows: Vec<(Vec<u8>, i64, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT hash, idx, signature, sequence FROM Spendings WHERE icnf = ? ORDER BY coin",
        )
        .bind(cnf)
        .fetch_all(&mut *conn)
        .await?;

        let output_rows: Vec<(i64, Vec<u8>)> = sqlx::query_as(
            "SELECT value, script FROM ( \
                 SELECT value, script, idx FROM Unspents WHERE ocnf = ?1 \
                 UNION ALL \
                 SELECT value, script, idx FROM Spendings WHERE ocnf = ?1 \
             ) ORDER BY idx ASC",
        )
        .bind(cnf)
        .fetch_all(conn)
        .await?;

        let input = input_rows
            .into_iter()
            .map(|(hash, idx, signature, sequence)| {
                Ok(TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_byte_array(hash32(&hash)?),
                        vout: idx as u32,
                    },
                    script_sig: ScriptBuf::from_bytes(signature),
                    sequence: Sequence(sequence as u32),
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let output = output_rows
            .into_iter()
            .map(|(value, script)| TxOut {
                value: bitcoin::Amount::from_sat(value as u64),
                script_pubkey: ScriptBuf::from_bytes(script),
            })
            .collect();

        Ok(Transaction {
            version: Version(version),
            lock_time: LockTime::from_consensus(locktime),
            input,
            output,
        })
    }
}

type UnspentRow = (i64, Vec<u8>, i64, i64, Vec<u8>, i64, i64);

fn unspent_from_row(row: UnspentRow) -> Result<Unspent> {
    let (coin, hash, idx, value, script, count, ocnf) = row;
    Ok(Unspent {
        coin,
        hash: Txid::from_byte_array(hash32(&hash)?),
        idx: idx as u32,
        value: value as u64,
        script: ScriptBuf::from_bytes(script),
        count,
        cnf: ocnf,
    })
}

fn hash32(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::CorruptRow(format!("expected 32-byte hash, got {}", bytes.len())))
}
