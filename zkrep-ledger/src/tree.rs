//! Merkle trees backing the global state tree and the epoch trees.
//!
//! The global state tree is an append-only incremental tree: inserting a
//! leaf touches one node per level and yields the new root. Epoch trees are
//! sparse trees keyed by epoch key and only ever need a root, computed once
//! when the epoch is sealed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zkrep_common::{hash_left_right, FieldElement};

/// `zeros[i]` is the root of an empty subtree of height `i`.
pub fn zero_hashes(depth: u32) -> Vec<FieldElement> {
    let mut zeros = Vec::with_capacity(depth as usize + 1);
    zeros.push(FieldElement::zero());
    for level in 0..depth as usize {
        let below = zeros[level];
        zeros.push(hash_left_right(&below, &below));
    }
    zeros
}

/// Append-only binary Merkle tree.
///
/// Persisted as `{depth, leaves}`; the frontier is rebuilt on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TreeRepr", into = "TreeRepr")]
pub struct IncrementalMerkleTree {
    depth: u32,
    zeros: Vec<FieldElement>,
    /// Left siblings on the path of the next insertion.
    frontier: Vec<FieldElement>,
    leaves: Vec<FieldElement>,
    root: FieldElement,
}

#[derive(Serialize, Deserialize)]
struct TreeRepr {
    depth: u32,
    leaves: Vec<FieldElement>,
}

impl IncrementalMerkleTree {
    pub fn new(depth: u32) -> Self {
        let zeros = zero_hashes(depth);
        let root = zeros[depth as usize];
        Self {
            depth,
            frontier: zeros[..depth as usize].to_vec(),
            zeros,
            leaves: Vec::new(),
            root,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    pub fn len(&self) -> u64 {
        self.leaves.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn root(&self) -> FieldElement {
        self.root
    }

    pub fn leaves(&self) -> &[FieldElement] {
        &self.leaves
    }

    /// Appends `leaf` and returns the new root, or `None` when the tree is full.
    pub fn insert(&mut self, leaf: FieldElement) -> Option<FieldElement> {
        let mut index = self.len();
        if index >= self.capacity() {
            return None;
        }
        let mut node = leaf;
        for level in 0..self.depth as usize {
            if index & 1 == 0 {
                self.frontier[level] = node;
                node = hash_left_right(&node, &self.zeros[level]);
            } else {
                node = hash_left_right(&self.frontier[level], &node);
            }
            index >>= 1;
        }
        self.leaves.push(leaf);
        self.root = node;
        Some(node)
    }
}

impl TryFrom<TreeRepr> for IncrementalMerkleTree {
    type Error = String;

    fn try_from(repr: TreeRepr) -> Result<Self, Self::Error> {
        if !(1..=32).contains(&repr.depth) {
            return Err(format!("unsupported tree depth {}", repr.depth));
        }
        let mut tree = IncrementalMerkleTree::new(repr.depth);
        for leaf in repr.leaves {
            tree.insert(leaf)
                .ok_or_else(|| format!("too many leaves for depth {}", repr.depth))?;
        }
        Ok(tree)
    }
}

impl From<IncrementalMerkleTree> for TreeRepr {
    fn from(tree: IncrementalMerkleTree) -> Self {
        TreeRepr {
            depth: tree.depth,
            leaves: tree.leaves,
        }
    }
}

/// Root of a sparse tree of `depth` levels holding `leaves` (index → value).
///
/// Absent leaves are zero. Indices must be below `2^depth`.
pub fn sparse_merkle_root(depth: u32, leaves: &BTreeMap<u64, FieldElement>) -> FieldElement {
    let zeros = zero_hashes(depth);
    let mut level_nodes: BTreeMap<u64, FieldElement> = leaves
        .iter()
        .filter(|(_, value)| !value.is_zero())
        .map(|(index, value)| (*index, *value))
        .collect();

    for level in 0..depth as usize {
        let mut parents = BTreeMap::new();
        for (&index, node) in &level_nodes {
            let parent = index >> 1;
            if parents.contains_key(&parent) {
                continue;
            }
            let (left, right) = if index & 1 == 0 {
                let sibling = level_nodes.get(&(index | 1)).unwrap_or(&zeros[level]);
                (*node, *sibling)
            } else {
                let sibling = level_nodes.get(&(index & !1)).unwrap_or(&zeros[level]);
                (*sibling, *node)
            };
            parents.insert(parent, hash_left_right(&left, &right));
        }
        level_nodes = parents;
    }

    level_nodes
        .get(&0)
        .copied()
        .unwrap_or(zeros[depth as usize])
}
