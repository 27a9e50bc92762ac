//! Context-free transaction checks shared by the claim pool and the append
//! pipeline.

use bitcoin::absolute::{LockTime, LOCK_TIME_THRESHOLD};
use bitcoin::{Amount, Transaction};
use std::collections::HashSet;

/// Structural transaction error, always a consensus violation.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction has no inputs")]
    EmptyInput,
    #[error("transaction has no outputs")]
    EmptyOutput,
    #[error("transaction contains duplicate inputs at index {0}")]
    DuplicateTxInput(usize),
    #[error("output value {0} is out of range")]
    OutputValueTooLarge(Amount),
    #[error("total output value {0} is out of range")]
    TotalOutputValueTooLarge(Amount),
    #[error("transaction input refers to a previous output that is null")]
    PreviousOutputNull,
}

/// Checks whether `value` lies within the monetary range.
pub fn money_range(value: Amount) -> bool {
    value <= Amount::MAX_MONEY
}

/// Checks whether the transaction is final at the given height and block
/// time.
///
/// A zero lock time is always final; otherwise the lock time is compared
/// against the height or the time depending on which side of the threshold it
/// falls. Even an unsatisfied lock time is ignored when every input carries
/// the final sequence number.
pub fn is_final_tx(tx: &Transaction, height: i64, block_time: i64) -> bool {
    if tx.lock_time == LockTime::ZERO {
        return true;
    }

    let lock_time = i64::from(tx.lock_time.to_consensus_u32());
    let limit = if lock_time < i64::from(LOCK_TIME_THRESHOLD) {
        height
    } else {
        block_time
    };

    if lock_time < limit {
        return true;
    }

    tx.input.iter().all(|txin| txin.sequence.is_final())
}

/// Context-free sanity pass over a single transaction.
///
/// - Inputs and outputs must be non-empty.
/// - Every output value and their sum must stay within the monetary range.
/// - No two inputs may share an outpoint.
/// - Non-coinbase inputs must not reference the null outpoint.
pub fn check_transaction_sanity(tx: &Transaction) -> Result<(), TxError> {
    if tx.input.is_empty() {
        return Err(TxError::EmptyInput);
    }

    if tx.output.is_empty() {
        return Err(TxError::EmptyOutput);
    }

    let mut value_out = Amount::ZERO;
    for txout in &tx.output {
        if !money_range(txout.value) {
            return Err(TxError::OutputValueTooLarge(txout.value));
        }
        value_out = value_out
            .checked_add(txout.value)
            .ok_or(TxError::TotalOutputValueTooLarge(Amount::MAX_MONEY))?;
        if !money_range(value_out) {
            return Err(TxError::TotalOutputValueTooLarge(value_out));
        }
    }

    let mut seen_inputs = HashSet::with_capacity(tx.input.len());
    for (index, txin) in tx.input.iter().enumerate() {
        if !seen_inputs.insert(txin.previous_output) {
            return Err(TxError::DuplicateTxInput(index));
        }
    }

    if !tx.is_coinbase() && tx.input.iter().any(|txin| txin.previous_output.is_null()) {
        return Err(TxError::PreviousOutputNull);
    }

    Ok(())
}
