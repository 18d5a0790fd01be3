//! Pre-order tree walk with a deadline check between nodes
//!
//! The walk keeps an explicit stack instead of recursing, so the only place
//! it can stop is between two pops.

use crate::cancel::{Deadline, Interrupted};
use crate::plan::OperatorNode;

/// A node together with the local context rules may inspect
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub node: &'a OperatorNode,
    pub parent: Option<&'a OperatorNode>,
    /// Pre-order position within the tree
    pub position: usize,
    /// Root is depth 0
    pub depth: usize,
}

impl<'a> NodeContext<'a> {
    /// Immediate children of the node
    pub fn children(&self) -> &'a [OperatorNode] {
        &self.node.children
    }
}

/// Visits every node under `root` in pre-order
///
/// Returns `Interrupted` as soon as the deadline is observed at a node
/// boundary; every node visited before that point has been fully processed
/// by `visit`.
pub fn walk_preorder<'a, F>(
    root: &'a OperatorNode,
    deadline: &Deadline,
    mut visit: F,
) -> Result<(), Interrupted>
where
    F: FnMut(NodeContext<'a>),
{
    let mut stack: Vec<(&'a OperatorNode, Option<&'a OperatorNode>, usize)> = vec![(root, None, 0)];
    let mut position = 0;

    while let Some((node, parent, depth)) = stack.pop() {
        deadline.check()?;

        visit(NodeContext {
            node,
            parent,
            position,
            depth,
        });
        position += 1;

        for child in node.children.iter().rev() {
            stack.push((child, Some(node), depth + 1));
        }
    }

    Ok(())
}
