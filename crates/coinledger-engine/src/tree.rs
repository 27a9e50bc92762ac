//! In-memory forest of block headers with best-chain selection.
//!
//! Nodes live in an arena keyed by block hash; parents are arena indexes, so
//! there are no owning cycles. The `trunk` vector materializes the main
//! chain: the best tip is the branch with the strictly greatest cumulative
//! work, ties going to the first-seen branch. [`BlockTree::insert`] reports
//! the reorganization change-set and keeps enough undo state for one
//! [`BlockTree::pop_back`], which the engine uses to restore the pre-append
//! tree after a failed attach.

use bitcoin::pow::Work;
use bitcoin::BlockHash;
use coinledger_primitives::BlockRef;
use std::collections::HashMap;

/// Stable handle to a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("block already in the tree")]
    Duplicate,
    #[error("parent block not in the tree")]
    UnknownParent,
}

/// Reorganization change-set produced by an insert.
///
/// `deleted` lists the blocks to detach, old tip first down to the block just
/// above the fork point; `inserted` lists the blocks to attach, new tip first
/// down to the fork child. Both are empty when the insert does not improve on
/// the current best chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub deleted: Vec<BlockHash>,
    pub inserted: Vec<BlockHash>,
}

struct NodeData {
    reference: BlockRef,
    parent: usize,
    height: i64,
    work: Work,
}

struct Undo {
    trunk_truncate_at: usize,
    trunk_tail: Vec<usize>,
}

#[derive(Default)]
pub struct BlockTree {
    nodes: Vec<NodeData>,
    index: HashMap<BlockHash, usize>,
    trunk: Vec<usize>,
    undo: Option<Undo>,
}

impl BlockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the tree from a persisted main chain in count order. The
    /// first reference is the genesis, every later one extends the previous.
    pub fn assign(&mut self, refs: Vec<BlockRef>) {
        self.nodes.clear();
        self.index.clear();
        self.trunk.clear();
        self.undo = None;

        let mut work = None;
        for (height, reference) in refs.into_iter().enumerate() {
            let cumulative = match work {
                None => reference.work(),
                Some(prev) => prev + reference.work(),
            };
            work = Some(cumulative);
            let idx = self.nodes.len();
            self.index.insert(reference.hash, idx);
            self.nodes.push(NodeData {
                reference,
                parent: idx.saturating_sub(1),
                height: height as i64,
                work: cumulative,
            });
            self.trunk.push(idx);
        }
    }

    /// Splices a new header under its declared parent and reports what the
    /// best chain gained and lost.
    pub fn insert(&mut self, reference: BlockRef) -> Result<Changes, TreeError> {
        if self.index.contains_key(&reference.hash) {
            return Err(TreeError::Duplicate);
        }
        let parent = *self
            .index
            .get(&reference.prev)
            .ok_or(TreeError::UnknownParent)?;

        let height = self.nodes[parent].height + 1;
        let work = self.nodes[parent].work + reference.work();
        let idx = self.nodes.len();
        self.index.insert(reference.hash, idx);
        self.nodes.push(NodeData {
            reference,
            parent,
            height,
            work,
        });

        let best_work = self.nodes[*self.trunk.last().expect("tree holds genesis; qed")].work;
        if work <= best_work {
            self.undo = Some(Undo {
                trunk_truncate_at: self.trunk.len(),
                trunk_tail: Vec::new(),
            });
            return Ok(Changes::default());
        }

        // Walk from the new node down to the first ancestor on the trunk;
        // that ancestor is the fork point.
        let mut path = vec![idx];
        let mut cursor = parent;
        while !self.on_trunk(cursor) {
            path.push(cursor);
            cursor = self.nodes[cursor].parent;
        }
        let fork_height = self.nodes[cursor].height as usize;

        let deleted: Vec<BlockHash> = self.trunk[fork_height + 1..]
            .iter()
            .rev()
            .map(|&node| self.nodes[node].reference.hash)
            .collect();
        let inserted: Vec<BlockHash> = path
            .iter()
            .map(|&node| self.nodes[node].reference.hash)
            .collect();

        self.undo = Some(Undo {
            trunk_truncate_at: fork_height + 1,
            trunk_tail: self.trunk[fork_height + 1..].to_vec(),
        });
        self.trunk.truncate(fork_height + 1);
        self.trunk.extend(path.iter().rev());

        Ok(Changes { deleted, inserted })
    }

    /// Removes the most recently inserted node and restores the trunk, the
    /// counterpart to a failed append.
    pub fn pop_back(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        if let Some(node) = self.nodes.pop() {
            self.index.remove(&node.reference.hash);
        }
        self.trunk.truncate(undo.trunk_truncate_at);
        self.trunk.extend(undo.trunk_tail);
    }

    pub fn find(&self, hash: &BlockHash) -> Option<NodeId> {
        self.index.get(hash).copied().map(NodeId)
    }

    /// The best tip. The tree always holds at least the genesis.
    pub fn best(&self) -> NodeId {
        NodeId(*self.trunk.last().expect("tree holds genesis; qed"))
    }

    pub fn genesis(&self) -> NodeId {
        NodeId(*self.trunk.first().expect("tree holds genesis; qed"))
    }

    pub fn reference(&self, id: NodeId) -> &BlockRef {
        &self.nodes[id.0].reference
    }

    /// Signed height: non-negative on the main chain, negated off it, so
    /// `height(id) >= 0` is the main-chain test. Height 0 is the genesis.
    pub fn height_of(&self, id: NodeId) -> i64 {
        let height = self.nodes[id.0].height;
        if self.on_trunk(id.0) {
            height
        } else {
            -height
        }
    }

    /// Monotone positive identifier `height + 1`, the store's primary key.
    pub fn count_of(&self, id: NodeId) -> i64 {
        self.nodes[id.0].height + 1
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        (self.nodes[id.0].height > 0).then(|| NodeId(self.nodes[id.0].parent))
    }

    /// The node itself followed by its ancestors up to the genesis.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut next = Some(id);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.parent(current);
            Some(current)
        })
    }

    /// Main-chain node at the given height.
    pub fn at_height(&self, height: i64) -> Option<NodeId> {
        if height < 0 {
            return None;
        }
        self.trunk.get(height as usize).copied().map(NodeId)
    }

    /// Height of the best chain; 0 when only the genesis is known.
    pub fn height(&self) -> i64 {
        self.trunk.len() as i64 - 1
    }

    /// Number of blocks on the best chain.
    pub fn count(&self) -> i64 {
        self.trunk.len() as i64
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn on_trunk(&self, idx: usize) -> bool {
        let height = self.nodes[idx].height;
        height >= 0 && self.trunk.get(height as usize) == Some(&idx)
    }
}
