//! Tree-structured speculation.
//!
//! A [`SpeculativeTree`] holds multiple candidate continuations branching
//! from the current context. Nodes live in one contiguous arena and refer
//! to their parents by index (never by owning pointer), so the whole tree
//! is freed in one step when verification completes. Parents always
//! precede their children in the arena.

/// One candidate token in the speculation tree.
#[derive(Debug, Clone, Copy)]
pub struct TreeNode {
    /// Proposed token id.
    pub token: u32,
    /// Arena index of the parent, or None for a first-level candidate.
    pub parent: Option<usize>,
    /// Draft probability claimed for this token (1.0 for pattern
    /// proposals).
    pub draft_prob: f32,
}

/// Arena of speculation candidates.
#[derive(Debug, Clone, Default)]
pub struct SpeculativeTree {
    nodes: Vec<TreeNode>,
}

impl SpeculativeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a single-chain tree from a flat draft (each token parented on
    /// the previous one).
    pub fn from_chain(tokens: &[u32], draft_probs: Option<&[f32]>) -> Self {
        let mut tree = Self::new();
        let mut parent = None;
        for (i, &token) in tokens.iter().enumerate() {
            let prob = draft_probs.map_or(1.0, |p| p[i]);
            parent = Some(tree.add_node(token, parent, prob));
        }
        tree
    }

    /// Append a node. The parent, when present, must already be in the
    /// arena.
    pub fn add_node(&mut self, token: u32, parent: Option<usize>, draft_prob: f32) -> usize {
        if let Some(p) = parent {
            assert!(p < self.nodes.len(), "parent index out of bounds");
        }
        self.nodes.push(TreeNode {
            token,
            parent,
            draft_prob,
        });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Children of `parent` (None for first-level candidates), in arena
    /// order.
    pub fn children(&self, parent: Option<usize>) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent == parent)
            .map(|(i, _)| i)
            .collect()
    }

    /// Token path from the root down to `idx`, inclusive.
    pub fn path_tokens(&self, idx: usize) -> Vec<u32> {
        let mut path = Vec::new();
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            path.push(self.nodes[i].token);
            cursor = self.nodes[i].parent;
        }
        path.reverse();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_construction() {
        let tree = SpeculativeTree::from_chain(&[5, 7, 2], None);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.node(0).parent, None);
        assert_eq!(tree.node(1).parent, Some(0));
        assert_eq!(tree.node(2).parent, Some(1));
        assert_eq!(tree.path_tokens(2), vec![5, 7, 2]);
        assert_eq!(tree.node(0).draft_prob, 1.0);
    }

    #[test]
    fn test_branching() {
        let mut tree = SpeculativeTree::new();
        let a = tree.add_node(10, None, 0.6);
        let b = tree.add_node(11, None, 0.4);
        let a1 = tree.add_node(20, Some(a), 0.9);

        assert_eq!(tree.children(None), vec![a, b]);
        assert_eq!(tree.children(Some(a)), vec![a1]);
        assert!(tree.children(Some(b)).is_empty());
        assert_eq!(tree.path_tokens(a1), vec![10, 20]);
    }

    #[test]
    #[should_panic(expected = "parent index out of bounds")]
    fn test_forward_parent_rejected() {
        let mut tree = SpeculativeTree::new();
        tree.add_node(1, Some(3), 1.0);
    }
}
