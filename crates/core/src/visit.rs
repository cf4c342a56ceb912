//! Depth-first traversal with pre-order visiting, post-order exit callbacks
//! and short-circuit abort.
//!
//! The visitor is invoked with the node id and its ancestor chain before any
//! of the node's children are visited. Child ids are snapshotted when the
//! descent enters a node, so a visitor that rewrites the node it is standing
//! on gets its replacement children walked, while edits made to a *sibling*
//! subtree from an exit callback are only observed if that subtree is
//! explicitly rewalked.

use crate::ast::{Ast, NodeId};

/// A post-order callback scheduled by a visitor for when the walk leaves the
/// node's subtree.
pub type LeaveFn = Box<dyn FnOnce(&mut Ast)>;

/// What a visitor wants the walk to do next.
pub enum Visit {
    /// Keep descending.
    Continue,
    /// Abort the entire traversal immediately.
    Exit,
    /// Keep descending, then run this callback when the subtree is done.
    Leave(LeaveFn),
}

/// The ancestor chain of the node currently being visited, closest first.
pub struct Ancestors<'a> {
    // Stored root-first; the accessors below present it closest-first.
    chain: &'a [NodeId],
}

impl<'a> Ancestors<'a> {
    /// Wraps a chain stored root-first (the shape [`Ancestors::root_first`]
    /// returns), for callers that captured one into owned storage.
    pub fn new(chain: &'a [NodeId]) -> Self {
        Self { chain }
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// The direct parent, if the node is not the walk root.
    pub fn parent(&self) -> Option<NodeId> {
        self.chain.last().copied()
    }

    /// The `n`-th ancestor, closest first (0 is the parent).
    pub fn nth(&self, n: usize) -> Option<NodeId> {
        self.chain.iter().rev().nth(n).copied()
    }

    /// Iterates ancestors closest first.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + 'a {
        self.chain.iter().rev().copied()
    }

    /// The raw chain, root first. Useful for capturing into owned storage.
    pub fn root_first(&self) -> &'a [NodeId] {
        self.chain
    }
}

/// Walks the subtree rooted at `root`, invoking `visitor` for every node in
/// pre-order. Returns `true` if the traversal was aborted by [`Visit::Exit`].
pub fn walk<F>(ast: &mut Ast, root: NodeId, visitor: &mut F) -> bool
where
    F: FnMut(&mut Ast, NodeId, &Ancestors<'_>) -> Visit,
{
    let mut chain = Vec::new();
    go(ast, root, &mut chain, visitor)
}

fn go<F>(ast: &mut Ast, id: NodeId, chain: &mut Vec<NodeId>, visitor: &mut F) -> bool
where
    F: FnMut(&mut Ast, NodeId, &Ancestors<'_>) -> Visit,
{
    let mut on_leave = None;
    match visitor(ast, id, &Ancestors::new(chain)) {
        Visit::Continue => {}
        Visit::Exit => return true,
        Visit::Leave(cb) => on_leave = Some(cb),
    }

    // Snapshot children after the pre-visit: a visitor that replaced this
    // node in place gets its new children walked.
    let children = ast.children_of(id);
    chain.push(id);
    for child in children {
        if go(ast, child, chain, visitor) {
            // An aborted walk skips all pending exit callbacks.
            chain.pop();
            return true;
        }
    }
    chain.pop();

    if let Some(cb) = on_leave {
        cb(ast);
    }
    false
}
