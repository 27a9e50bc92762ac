//! Batched signature verification.
//!
//! The append pipeline enqueues one check per redeemed input and joins the
//! batch once per attached block; checks run on the rayon pool. Verification
//! itself is delegated to a [`VerifySignature`] backend, by default the
//! libbitcoinconsensus bindings, so tests can substitute a stub.

use bitcoin::TxOut;
use rayon::prelude::*;
use std::sync::Arc;

/// Script/signature evaluation seam.
pub trait VerifySignature: Send + Sync {
    /// Checks the input at `input_index` of the serialized transaction `tx`
    /// against the output it spends.
    fn verify_signature(
        &self,
        spent_output: &TxOut,
        tx: &[u8],
        input_index: usize,
        strict_p2sh: bool,
        flags: u32,
    ) -> Result<(), String>;
}

/// Production backend over libbitcoinconsensus.
pub struct ConsensusVerifier;

impl VerifySignature for ConsensusVerifier {
    fn verify_signature(
        &self,
        spent_output: &TxOut,
        tx: &[u8],
        input_index: usize,
        strict_p2sh: bool,
        flags: u32,
    ) -> Result<(), String> {
        let mut flags = flags;
        if strict_p2sh {
            flags |= bitcoinconsensus::VERIFY_P2SH;
        }

        bitcoinconsensus::verify_with_flags(
            spent_output.script_pubkey.as_bytes(),
            spent_output.value.to_sat(),
            tx,
            None,
            input_index,
            flags,
        )
        .map_err(|err| format!("{err:?}"))
    }
}

struct Check {
    spent_output: TxOut,
    tx: Arc<Vec<u8>>,
    input_index: usize,
    strict_p2sh: bool,
    flags: u32,
}

/// Accumulates signature checks for one block and joins them at the commit
/// barrier. Does not touch ledger state; given the same checks it always
/// reports the same outcome and the same (lowest-index) failure.
pub struct Verifier {
    backend: Arc<dyn VerifySignature>,
    checks: Vec<Check>,
    reason: Option<String>,
}

impl Verifier {
    pub fn new(backend: Arc<dyn VerifySignature>) -> Self {
        Self {
            backend,
            checks: Vec::new(),
            reason: None,
        }
    }

    pub fn reset(&mut self) {
        self.checks.clear();
        self.reason = None;
    }

    /// Enqueues a check; evaluation happens at [`Verifier::yield_success`].
    pub fn verify(
        &mut self,
        spent_output: TxOut,
        tx: Arc<Vec<u8>>,
        input_index: usize,
        strict_p2sh: bool,
        flags: u32,
    ) {
        self.checks.push(Check {
            spent_output,
            tx,
            input_index,
            strict_p2sh,
            flags,
        });
    }

    /// Runs every queued check and returns the aggregate result; the first
    /// failure (by enqueue order) is retained as [`Verifier::reason`].
    pub fn yield_success(&mut self) -> bool {
        let backend = &self.backend;
        let failure = self
            .checks
            .par_iter()
            .enumerate()
            .filter_map(|(index, check)| {
                backend
                    .verify_signature(
                        &check.spent_output,
                        &check.tx,
                        check.input_index,
                        check.strict_p2sh,
                        check.flags,
                    )
                    .err()
                    .map(|reason| (index, reason))
            })
            .min_by_key(|(index, _)| *index);

        self.checks.clear();
        self.reason = failure.map(|(_, reason)| reason);
        self.reason.is_none()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}
