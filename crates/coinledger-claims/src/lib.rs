//! Pool of unconfirmed transactions awaiting a block.
//!
//! A claim is a transaction the engine has validated against the committed
//! coin set and the outputs of earlier claims. The pool tracks which
//! outpoints each claim spends (for double-spend detection), exposes claim
//! outputs so later claims can chain on them, and hands out a fee-ordered,
//! dependency-respecting selection for block templates.
//!
//! Input resolution itself lives on the engine, which owns the committed
//! state the resolution runs against; the pool only supplies membership and
//! conflict primitives.

use bitcoin::{OutPoint, Script, Transaction, TxOut, Txid};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// An admitted unconfirmed transaction.
#[derive(Debug, Clone)]
pub struct Claim {
    pub tx: Transaction,
    /// Outpoints this claim consumes.
    pub spents: HashSet<OutPoint>,
    /// Fee paid, in minor units.
    pub fee: u64,
    /// Admission time, unix seconds.
    pub timestamp: u64,
}

impl Claim {
    /// Fee per kilo-vbyte, the template ordering key.
    fn fee_rate(&self) -> u64 {
        let vsize = self.tx.vsize().max(1) as u64;
        self.fee.saturating_mul(1000) / vsize
    }
}

/// The set of outpoints consumed by a claim, resolved during admission.
pub type Spents = HashSet<OutPoint>;

/// Unconfirmed transaction pool.
#[derive(Debug, Clone, Default)]
pub struct ClaimPool {
    /// Claims in admission order.
    claims: IndexMap<Txid, Claim>,
    /// Outpoint -> the claim spending it.
    spent_by: HashMap<OutPoint, Txid>,
}

impl ClaimPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits an already-validated claim.
    pub fn insert(&mut self, tx: Transaction, spents: Spents, fee: u64, timestamp: u64) {
        let txid = tx.compute_txid();
        for outpoint in &spents {
            self.spent_by.insert(*outpoint, txid);
        }
        self.claims.insert(
            txid,
            Claim {
                tx,
                spents,
                fee,
                timestamp,
            },
        );
    }

    pub fn have(&self, txid: &Txid) -> bool {
        self.claims.contains_key(txid)
    }

    /// Whether some claim already consumes `outpoint`.
    pub fn spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_by.contains_key(outpoint)
    }

    /// The output a claim introduced at `outpoint`, letting a later claim
    /// chain on an earlier one.
    pub fn prev(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.claims
            .get(&outpoint.txid)?
            .tx
            .output
            .get(outpoint.vout as usize)
    }

    /// Admission time of a claim.
    pub fn timestamp(&self, txid: &Txid) -> Option<u64> {
        self.claims.get(txid).map(|claim| claim.timestamp)
    }

    /// Drops a claim, releasing the outpoints it held.
    pub fn erase(&mut self, txid: &Txid) -> Option<Claim> {
        let claim = self.claims.shift_remove(txid)?;
        for outpoint in &claim.spents {
            self.spent_by.remove(outpoint);
        }
        Some(claim)
    }

    /// Drops every claim admitted before `cutoff`.
    pub fn purge(&mut self, cutoff: u64) {
        let stale: Vec<Txid> = self
            .claims
            .iter()
            .filter(|(_, claim)| claim.timestamp < cutoff)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in stale {
            self.erase(&txid);
        }
    }

    /// Fee-ordered selection for template assembly. Claims chaining on other
    /// claims are emitted after their in-pool parents; `total_fee`
    /// accumulates the fees of the selection.
    pub fn transactions(&self, total_fee: &mut u64) -> Vec<Transaction> {
        let mut order: Vec<&Txid> = self.claims.keys().collect();
        order.sort_by_key(|txid| std::cmp::Reverse(self.claims[*txid].fee_rate()));

        let mut selected = Vec::with_capacity(order.len());
        let mut emitted: HashSet<Txid> = HashSet::with_capacity(order.len());

        // Repeated passes resolve in-pool dependencies; each pass emits at
        // least one claim or the remainder is cyclic and dropped.
        while emitted.len() < order.len() {
            let mut progressed = false;
            for txid in &order {
                if emitted.contains(*txid) {
                    continue;
                }
                let claim = &self.claims[*txid];
                let parents_ready = claim.spents.iter().all(|outpoint| {
                    !self.claims.contains_key(&outpoint.txid) || emitted.contains(&outpoint.txid)
                });
                if parents_ready {
                    emitted.insert(**txid);
                    *total_fee += claim.fee;
                    selected.push(claim.tx.clone());
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        selected
    }

    /// Claim outputs locked to `script`, for address queries.
    pub fn claimed(&self, script: &Script) -> Vec<(OutPoint, TxOut)> {
        let mut outputs = Vec::new();
        for (txid, claim) in &self.claims {
            for (vout, output) in claim.tx.output.iter().enumerate() {
                if output.script_pubkey.as_script() == script {
                    outputs.push((
                        OutPoint {
                            txid: *txid,
                            vout: vout as u32,
                        },
                        output.clone(),
                    ));
                }
            }
        }
        outputs
    }

    /// All pooled transactions in admission order.
    pub fn unconfirmed(&self) -> Vec<Transaction> {
        self.claims.values().map(|claim| claim.tx.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}
