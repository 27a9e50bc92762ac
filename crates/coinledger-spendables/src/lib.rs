//! Authenticated ordered map over the spendable coins.
//!
//! [`Spendables`] keeps every unspent coin in a structurally shared merkle
//! trie keyed by outpoint. Cloning the map is O(1) and yields a value-semantic
//! snapshot: the engine clones it before each block append and assigns the
//! clone back to undo a failed append without replaying mutations.
//!
//! Digest maintenance can be switched off while the chain is below the
//! validation depth; switching it back on recomputes every digest. The root
//! digest covers only the coin identity (outpoint, value, script), so the
//! same coin set always produces the same root no matter how it was reached.

mod node;

use self::node::{bit_at, critical_bit, key_of, Key, Node};
use bitcoin::hashes::sha256d;
use bitcoin::OutPoint;
use coinledger_primitives::Unspent;
use std::fmt;
use std::sync::Arc;

/// The spendable-coin set with an optional merkle digest over its contents.
#[derive(Clone, Default)]
pub struct Spendables {
    root: Option<Arc<Node>>,
    hashed: bool,
}

impl Spendables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether digests are being maintained.
    pub fn is_authenticated(&self) -> bool {
        self.hashed
    }

    /// Enables or disables digest maintenance. Enabling over an unhashed trie
    /// recomputes every digest.
    pub fn authenticate(&mut self, on: bool) {
        if on == self.hashed {
            return;
        }
        self.hashed = on;
        if on {
            self.root = self.root.as_ref().map(Node::rehash);
        }
    }

    /// Root digest of the coin set; `None` while authentication is disabled
    /// or the set is empty.
    pub fn root(&self) -> Option<sha256d::Hash> {
        if !self.hashed {
            return None;
        }
        self.root.as_ref().and_then(|node| node.digest())
    }

    pub fn len(&self) -> usize {
        self.root.as_ref().map_or(0, |node| node.leaves())
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Inserts a coin, replacing any previous coin with the same outpoint.
    pub fn insert(&mut self, unspent: Unspent) {
        let key = key_of(&unspent.hash, unspent.idx);
        match self.root.take() {
            None => self.root = Some(Node::leaf(unspent, self.hashed)),
            Some(root) => self.root = Some(self.graft(&root, &key, unspent)),
        }
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<&Unspent> {
        let key = key_of(&outpoint.txid, outpoint.vout);
        let mut node = self.root.as_deref()?;
        loop {
            match node {
                Node::Leaf {
                    key: leaf_key,
                    unspent,
                    ..
                } => return (*leaf_key == key).then_some(unspent),
                Node::Branch {
                    bit, left, right, ..
                } => {
                    node = if bit_at(&key, *bit) == 0 { left } else { right };
                }
            }
        }
    }

    /// Removes the coin at `outpoint` and returns it.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<Unspent> {
        let key = key_of(&outpoint.txid, outpoint.vout);
        let root = self.root.take()?;
        match self.prune(&root, &key) {
            Ok((replacement, removed)) => {
                self.root = replacement;
                Some(removed)
            }
            Err(()) => {
                self.root = Some(root);
                None
            }
        }
    }

    /// All coins in key order; used by tests and statistics.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            stack: self.root.as_deref().into_iter().collect(),
        }
    }

    pub fn statistics(&self) -> Statistics {
        let leaves = self.len();
        Statistics {
            leaves,
            branches: leaves.saturating_sub(1),
            depth: self.root.as_ref().map_or(0, |node| node.depth()),
        }
    }

    /// Inserts `unspent` into the subtree rooted at `node`, rebuilding the
    /// path down to the branch point.
    fn graft(&self, node: &Arc<Node>, key: &Key, unspent: Unspent) -> Arc<Node> {
        // Locate the nearest existing key to determine where the new leaf
        // branches off.
        let nearest = {
            let mut cursor = node.as_ref();
            loop {
                match cursor {
                    Node::Leaf { key: leaf_key, .. } => break *leaf_key,
                    Node::Branch {
                        bit, left, right, ..
                    } => {
                        cursor = if bit_at(key, *bit) == 0 { left } else { right };
                    }
                }
            }
        };

        let Some(crit) = critical_bit(&nearest, key) else {
            // Same outpoint: replace the value.
            return self.replace(node, key, unspent);
        };

        self.graft_at(node, key, crit, unspent)
    }

    fn graft_at(&self, node: &Arc<Node>, key: &Key, crit: u16, unspent: Unspent) -> Arc<Node> {
        if let Node::Branch {
            bit, left, right, ..
        } = node.as_ref()
        {
            if *bit < crit {
                return if bit_at(key, *bit) == 0 {
                    let left = self.graft_at(left, key, crit, unspent);
                    Node::branch(*bit, left, Arc::clone(right), self.hashed)
                } else {
                    let right = self.graft_at(right, key, crit, unspent);
                    Node::branch(*bit, Arc::clone(left), right, self.hashed)
                };
            }
        }

        let leaf = Node::leaf(unspent, self.hashed);
        if bit_at(key, crit) == 0 {
            Node::branch(crit, leaf, Arc::clone(node), self.hashed)
        } else {
            Node::branch(crit, Arc::clone(node), leaf, self.hashed)
        }
    }

    fn replace(&self, node: &Arc<Node>, key: &Key, unspent: Unspent) -> Arc<Node> {
        match node.as_ref() {
            Node::Leaf { .. } => Node::leaf(unspent, self.hashed),
            Node::Branch {
                bit, left, right, ..
            } => {
                if bit_at(key, *bit) == 0 {
                    let left = self.replace(left, key, unspent);
                    Node::branch(*bit, left, Arc::clone(right), self.hashed)
                } else {
                    let right = self.replace(right, key, unspent);
                    Node::branch(*bit, Arc::clone(left), right, self.hashed)
                }
            }
        }
    }

    /// Removes `key` from the subtree; `Ok((replacement, coin))` on success,
    /// `Err(())` when the key is absent.
    fn prune(&self, node: &Arc<Node>, key: &Key) -> Result<(Option<Arc<Node>>, Unspent), ()> {
        match node.as_ref() {
            Node::Leaf {
                key: leaf_key,
                unspent,
                ..
            } => {
                if leaf_key == key {
                    Ok((None, unspent.clone()))
                } else {
                    Err(())
                }
            }
            Node::Branch {
                bit, left, right, ..
            } => {
                if bit_at(key, *bit) == 0 {
                    let (replacement, removed) = self.prune(left, key)?;
                    Ok(match replacement {
                        Some(left) => (
                            Some(Node::branch(*bit, left, Arc::clone(right), self.hashed)),
                            removed,
                        ),
                        None => (Some(Arc::clone(right)), removed),
                    })
                } else {
                    let (replacement, removed) = self.prune(right, key)?;
                    Ok(match replacement {
                        Some(right) => (
                            Some(Node::branch(*bit, Arc::clone(left), right, self.hashed)),
                            removed,
                        ),
                        None => (Some(Arc::clone(left)), removed),
                    })
                }
            }
        }
    }
}

/// In-order iterator over the coins.
pub struct Iter<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Unspent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Node::Leaf { unspent, .. } => return Some(unspent),
                Node::Branch { left, right, .. } => {
                    self.stack.push(right);
                    self.stack.push(left);
                }
            }
        }
    }
}

/// Shape summary, logged periodically by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Statistics {
    pub leaves: usize,
    pub branches: usize,
    pub depth: usize,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spendables: {} coins, {} branches, depth {}",
            self.leaves, self.branches, self.depth
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, Txid};

    fn coin(txid_byte: u8, vout: u32, value: u64) -> Unspent {
        Unspent {
            coin: 0,
            hash: Txid::from_byte_array([txid_byte; 32]),
            idx: vout,
            value,
            script: ScriptBuf::from_bytes(vec![txid_byte, 0xac]),
            count: 1,
            cnf: 1,
        }
    }

    fn outpoint(txid_byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([txid_byte; 32]),
            vout,
        }
    }

    #[test]
    fn insert_find_remove() {
        let mut spendables = Spendables::new();
        for vout in 0..4 {
            spendables.insert(coin(1, vout, 50 + u64::from(vout)));
        }
        spendables.insert(coin(2, 0, 99));
        assert_eq!(spendables.len(), 5);

        let found = spendables.find(&outpoint(1, 2)).unwrap();
        assert_eq!(found.value, 52);

        assert!(spendables.find(&outpoint(3, 0)).is_none());
        assert!(spendables.remove(&outpoint(3, 0)).is_none());

        let removed = spendables.remove(&outpoint(1, 2)).unwrap();
        assert_eq!(removed.value, 52);
        assert_eq!(spendables.len(), 4);
        assert!(spendables.find(&outpoint(1, 2)).is_none());
    }

    #[test]
    fn insert_replaces_same_outpoint() {
        let mut spendables = Spendables::new();
        spendables.insert(coin(1, 0, 50));
        spendables.insert(coin(1, 0, 75));
        assert_eq!(spendables.len(), 1);
        assert_eq!(spendables.find(&outpoint(1, 0)).unwrap().value, 75);
    }

    #[test]
    fn snapshot_restores_previous_state() {
        let mut spendables = Spendables::new();
        spendables.authenticate(true);
        spendables.insert(coin(1, 0, 50));
        spendables.insert(coin(2, 0, 60));

        let snapshot = spendables.clone();
        let root_before = spendables.root();

        spendables.remove(&outpoint(1, 0));
        spendables.insert(coin(3, 0, 70));
        assert_ne!(spendables.root(), root_before);

        spendables = snapshot;
        assert_eq!(spendables.root(), root_before);
        assert_eq!(spendables.len(), 2);
        assert!(spendables.find(&outpoint(1, 0)).is_some());
    }

    #[test]
    fn root_is_history_independent() {
        let mut forward = Spendables::new();
        forward.authenticate(true);
        for byte in 1..=8u8 {
            forward.insert(coin(byte, 0, u64::from(byte)));
        }

        let mut shuffled = Spendables::new();
        shuffled.authenticate(true);
        for byte in [5u8, 2, 8, 1, 7, 3, 6, 4] {
            shuffled.insert(coin(byte, 0, u64::from(byte)));
        }
        assert_eq!(forward.root(), shuffled.root());

        // Removing and re-adding a coin returns to the same root.
        let root = forward.root();
        forward.remove(&outpoint(4, 0));
        assert_ne!(forward.root(), root);
        forward.insert(coin(4, 0, 4));
        assert_eq!(forward.root(), root);
    }

    #[test]
    fn authentication_toggle_recomputes_root() {
        let mut plain = Spendables::new();
        for byte in 1..=5u8 {
            plain.insert(coin(byte, 1, u64::from(byte) * 10));
        }
        assert_eq!(plain.root(), None);

        plain.authenticate(true);
        let root = plain.root();
        assert!(root.is_some());

        let mut hashed = Spendables::new();
        hashed.authenticate(true);
        for byte in 1..=5u8 {
            hashed.insert(coin(byte, 1, u64::from(byte) * 10));
        }
        assert_eq!(hashed.root(), root);
    }

    #[test]
    fn iteration_is_key_ordered() {
        let mut spendables = Spendables::new();
        for byte in [9u8, 3, 12, 1] {
            spendables.insert(coin(byte, 0, 1));
        }
        spendables.insert(coin(3, 7, 1));

        let keys: Vec<(Txid, u32)> = spendables.iter().map(|u| (u.hash, u.idx)).collect();
        let mut sorted = keys.clone();
        sorted.sort_by_key(|(txid, vout)| {
            let mut key = [0u8; 36];
            key[..32].copy_from_slice(txid.as_byte_array());
            key[32..].copy_from_slice(&vout.to_be_bytes());
            key
        });
        assert_eq!(keys, sorted);
    }

    #[test]
    fn digest_ignores_row_metadata() {
        let mut a = Spendables::new();
        a.authenticate(true);
        a.insert(coin(1, 0, 50));

        let mut b = Spendables::new();
        b.authenticate(true);
        let mut shifted = coin(1, 0, 50);
        shifted.coin = 77;
        shifted.count = -12;
        shifted.cnf = 1234;
        b.insert(shifted);

        assert_eq!(a.root(), b.root());
    }
}
