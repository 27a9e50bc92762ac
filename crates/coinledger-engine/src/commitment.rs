//! Coinbase script commitments gated by block version.
//!
//! Version 2 blocks encode their height as the first push of the coinbase
//! script; version 3 blocks additionally push the 32-byte spendables root, so
//! miners and light clients can pin the UTXO state without replaying history.

use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::{Script, ScriptBuf};

/// Builds the template coinbase script: the block height followed by the
/// spendables root.
pub(crate) fn coinbase_script(height: i64, root: &sha256d::Hash) -> ScriptBuf {
    Builder::new()
        .push_int(height)
        .push_slice(&root.to_byte_array())
        .into_script()
}

/// Whether the first push of `script` encodes `height`.
pub(crate) fn has_height(script: &Script, height: i64) -> bool {
    match script.instructions().next() {
        Some(Ok(Instruction::PushBytes(push))) => decode_scriptint(push.as_bytes()) == Some(height),
        Some(Ok(Instruction::Op(op))) => {
            let byte = op.to_u8();
            if (0x51..=0x60).contains(&byte) {
                i64::from(byte - 0x50) == height
            } else {
                // OP_0 pushes an empty vector, the minimal encoding of zero.
                byte == 0x00 && height == 0
            }
        }
        _ => false,
    }
}

/// Whether any push of `script` equals `root`.
pub(crate) fn has_root(script: &Script, root: &sha256d::Hash) -> bool {
    script.instructions().any(|instruction| {
        matches!(
            instruction,
            Ok(Instruction::PushBytes(push)) if push.as_bytes() == root.as_byte_array()
        )
    })
}

/// Minimal little-endian signed script-number decoding, up to eight bytes.
fn decode_scriptint(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return Some(0);
    }
    if bytes.len() > 8 {
        return None;
    }

    let mut value: i64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i + 1 == bytes.len() {
            let negative = byte & 0x80 != 0;
            value |= i64::from(byte & 0x7f) << (8 * i);
            if negative {
                value = -value;
            }
        } else {
            value |= i64::from(byte) << (8 * i);
        }
    }
    Some(value)
}
