//! Core ledger engine of a full node.
//!
//! [`LedgerEngine`] ingests candidate blocks, maintains the canonical best
//! chain under reorganizations, validates every transaction against the
//! unspent coin set, persists confirmed state durably and assembles block
//! templates for miners. Chain parameters ([`Chain`]) and signature
//! evaluation ([`VerifySignature`]) are consumed through narrow interfaces.

mod chain;
mod commitment;
mod engine;
mod error;
mod tree;
mod verifier;

#[cfg(test)]
mod tests;

pub use self::chain::{Chain, Mainnet, SoftFork};
pub use self::engine::LedgerEngine;
pub use self::error::{Error, Result, Severity};
pub use self::tree::{BlockTree, Changes, NodeId, TreeError};
pub use self::verifier::{ConsensusVerifier, Verifier, VerifySignature};
