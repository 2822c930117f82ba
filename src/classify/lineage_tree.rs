// src/classify/lineage_tree.rs

use ahash::AHashMap;

use crate::types::{Lineage, LineagePair};

#[derive(Debug, Clone)]
struct TreeNode {
    /// `None` only for the synthetic root
    pair: Option<LineagePair>,
    children: Vec<usize>,
}

/// Prefix tree over lineages, stored as an arena. Node 0 is the synthetic
/// root; lineages sharing a prefix share nodes.
#[derive(Debug, Clone)]
pub struct LineageTree {
    nodes: Vec<TreeNode>,
}

impl Default for LineageTree {
    fn default() -> Self {
        Self::new()
    }
}

impl LineageTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode { pair: None, children: Vec::new() }],
        }
    }

    pub fn from_lineages<'a, I>(lineages: I) -> Self
    where
        I: IntoIterator<Item = &'a Lineage>,
    {
        let mut tree = Self::new();
        for lineage in lineages {
            tree.insert(lineage.pairs());
        }
        tree
    }

    /// Adds one root-to-leaf path. Pairs with an empty name are skipped.
    pub fn insert<'a, I>(&mut self, path: I)
    where
        I: IntoIterator<Item = &'a LineagePair>,
    {
        let mut node = 0;
        for pair in path {
            if pair.name.is_empty() {
                continue;
            }
            let existing = self.nodes[node]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].pair.as_ref() == Some(pair));

            node = match existing {
                Some(child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(TreeNode {
                        pair: Some(pair.clone()),
                        children: Vec::new(),
                    });
                    self.nodes[node].children.push(child);
                    child
                }
            };
        }
    }

    /// Number of nodes, the synthetic root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descends from the root while there is exactly one child. Returns the
    /// stopping node (`None` = root) and its child count: 0 for a leaf (full
    /// agreement), >1 for a branch (disagreement below this node).
    pub fn find_lca(&self) -> (Option<&LineagePair>, usize) {
        let mut node = 0;
        loop {
            let children = &self.nodes[node].children;
            if children.len() == 1 {
                node = children[0];
            } else {
                return (self.nodes[node].pair.as_ref(), children.len());
            }
        }
    }
}

/// child -> parent over every lineage node seen; `None` parent is the root.
#[derive(Debug, Clone, Default)]
pub struct LineageParents {
    parents: AHashMap<LineagePair, Option<LineagePair>>,
}

impl LineageParents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, lineage: &Lineage) {
        let mut last: Option<&LineagePair> = None;
        for pair in lineage.pairs() {
            if pair.name.is_empty() {
                continue;
            }
            self.parents.insert(pair.clone(), last.cloned());
            last = Some(pair);
        }
    }

    pub fn parent_of(&self, pair: &LineagePair) -> Option<&LineagePair> {
        self.parents.get(pair).and_then(Option::as_ref)
    }

    /// Path from just below the root down to `pair` (inclusive).
    pub fn path_from_root(&self, pair: &LineagePair) -> Vec<LineagePair> {
        let mut path = vec![pair.clone()];
        let mut cur = pair;
        while let Some(parent) = self.parent_of(cur) {
            // conflicting lineages could in principle chain into a loop
            if path.len() > self.parents.len() {
                log::warn!("parent cycle while walking up from {pair}");
                break;
            }
            path.push(parent.clone());
            cur = parent;
        }
        path.reverse();
        path
    }
}
