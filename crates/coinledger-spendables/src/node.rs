//! Structurally shared trie nodes.
//!
//! The trie is a crit-bit tree over fixed-width 36-byte keys (txid bytes
//! followed by the big-endian output index). A branch stores the index of the
//! first bit where its two subtrees differ; bit indexes strictly increase
//! along every path. The shape is therefore canonical for a given key set,
//! which makes the root digest independent of insertion history.

use bitcoin::hashes::{sha256d, Hash, HashEngine};
use coinledger_primitives::Unspent;
use std::sync::Arc;

pub(crate) type Key = [u8; 36];

pub(crate) fn key_of(txid: &bitcoin::Txid, vout: u32) -> Key {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(txid.as_byte_array());
    key[32..].copy_from_slice(&vout.to_be_bytes());
    key
}

/// MSB-first bit access; `bit == KEY_BITS` is the out-of-range sentinel.
pub(crate) fn bit_at(key: &Key, bit: u16) -> u8 {
    (key[usize::from(bit) / 8] >> (7 - bit % 8)) & 1
}

/// First bit where two keys differ, if any.
pub(crate) fn critical_bit(a: &Key, b: &Key) -> Option<u16> {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return Some(i as u16 * 8 + diff.leading_zeros() as u16);
        }
    }
    None
}

pub(crate) enum Node {
    Leaf {
        key: Key,
        unspent: Unspent,
        digest: Option<sha256d::Hash>,
    },
    Branch {
        bit: u16,
        left: Arc<Node>,
        right: Arc<Node>,
        leaves: usize,
        digest: Option<sha256d::Hash>,
    },
}

impl Node {
    pub(crate) fn leaf(unspent: Unspent, hashed: bool) -> Arc<Self> {
        let key = key_of(&unspent.hash, unspent.idx);
        let digest = hashed.then(|| leaf_digest(&key, &unspent));
        Arc::new(Node::Leaf {
            key,
            unspent,
            digest,
        })
    }

    pub(crate) fn branch(bit: u16, left: Arc<Node>, right: Arc<Node>, hashed: bool) -> Arc<Self> {
        let leaves = left.leaves() + right.leaves();
        let digest = hashed.then(|| branch_digest(&left, &right));
        Arc::new(Node::Branch {
            bit,
            left,
            right,
            leaves,
            digest,
        })
    }

    pub(crate) fn leaves(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Branch { leaves, .. } => *leaves,
        }
    }

    pub(crate) fn digest(&self) -> Option<sha256d::Hash> {
        match self {
            Node::Leaf { digest, .. } | Node::Branch { digest, .. } => *digest,
        }
    }

    pub(crate) fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Branch { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    /// Recomputes every digest; used when authentication is switched on over
    /// an unhashed trie.
    pub(crate) fn rehash(node: &Arc<Node>) -> Arc<Node> {
        match node.as_ref() {
            Node::Leaf { unspent, .. } => Node::leaf(unspent.clone(), true),
            Node::Branch {
                bit, left, right, ..
            } => {
                let left = Self::rehash(left);
                let right = Self::rehash(right);
                Node::branch(*bit, left, right, true)
            }
        }
    }
}

/// Leaf digest over the immutable coin identity only: the outpoint key, the
/// value, and the locking script. Row ids and block counts are excluded so a
/// root simulated ahead of a block equals the root after it attaches.
fn leaf_digest(key: &Key, unspent: &Unspent) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(key);
    engine.input(&unspent.value.to_le_bytes());
    engine.input(unspent.script.as_bytes());
    sha256d::Hash::from_engine(engine)
}

fn branch_digest(left: &Node, right: &Node) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(
        left.digest()
            .expect("hashed branch built from hashed children")
            .as_byte_array(),
    );
    engine.input(
        right
            .digest()
            .expect("hashed branch built from hashed children")
            .as_byte_array(),
    );
    sha256d::Hash::from_engine(engine)
}
