//! Boundary assignment from a flat `{id, parent_id}` list.
//!
//! Children are visited in the order they appear in the input. The traversal
//! is iterative, so tree depth is bounded by memory rather than the call stack,
//! and the boundary counter is threaded through explicitly: callers pass the
//! first boundary in and receive the next free one back.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::NestedSetError;
use crate::node::{Boundary, FlatNode, NodeId};

/// What to do with a `parent_id` that is not part of the input.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OrphanPolicy {
    /// Fail with `NotFound(parent)`.
    Reject,
    /// Treat the node as a root.
    Promote,
}

/// What to do with nodes that are not reachable from any root.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CyclePolicy {
    /// Fail with `Cycle(id)`.
    Reject,
    /// Promote the first unreached node to a root and keep going.
    Break,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BuildOptions {
    pub orphans: OrphanPolicy,
    pub cycles: CyclePolicy,
}

impl BuildOptions {
    /// Reject anything that is not a well-formed forest.
    pub const STRICT: Self = Self {
        orphans: OrphanPolicy::Reject,
        cycles: CyclePolicy::Reject,
    };

    /// Produce a forest no matter what `parent_id` says.
    pub const REPAIR: Self = Self {
        orphans: OrphanPolicy::Promote,
        cycles: CyclePolicy::Break,
    };
}

/// Boundaries computed for one node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Assignment {
    pub id: NodeId,
    /// Effective parent; `None` for roots, including promoted ones.
    pub parent_id: Option<NodeId>,
    pub lft: Boundary,
    pub rgt: Boundary,
}

/// Result of one traversal, in pre-order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Layout {
    pub assignments: Vec<Assignment>,
    /// First boundary after the last `rgt` handed out.
    pub next: Boundary,
}

impl Layout {
    pub fn roots(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.iter().filter(|a| a.parent_id.is_none())
    }

    pub fn get(&self, id: NodeId) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }
}

pub fn assign_boundaries(
    items: &[FlatNode],
    first: Boundary,
    options: BuildOptions,
) -> Result<Layout, NestedSetError> {
    let mut index = HashMap::with_capacity(items.len());
    for (pos, item) in items.iter().enumerate() {
        if index.insert(item.id, pos).is_some() {
            return Err(NestedSetError::invariant(format!(
                "node {} appears twice in the rebuild input",
                item.id
            )));
        }
    }

    let mut parents = Vec::with_capacity(items.len());
    for item in items {
        let parent = match item.parent_id {
            Some(parent) if parent == item.id => match options.cycles {
                CyclePolicy::Reject => return Err(NestedSetError::Cycle(item.id)),
                CyclePolicy::Break => None,
            },
            Some(parent) if !index.contains_key(&parent) => match options.orphans {
                OrphanPolicy::Reject => return Err(NestedSetError::NotFound(parent)),
                OrphanPolicy::Promote => None,
            },
            other => other,
        };
        parents.push(parent);
    }

    let mut children: HashMap<NodeId, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (pos, parent) in parents.iter().enumerate() {
        match parent {
            Some(parent) => children.entry(*parent).or_default().push(pos),
            None => roots.push(pos),
        }
    }

    let mut walk = Walk {
        items,
        parents: &mut parents,
        children: &children,
        visited: vec![false; items.len()],
        out: Vec::with_capacity(items.len()),
    };

    let mut counter = first;
    for root in roots {
        counter = walk.visit(root, counter);
    }

    while walk.out.len() < items.len() {
        let Some(stray) = walk.visited.iter().position(|seen| !seen) else {
            break;
        };
        match options.cycles {
            CyclePolicy::Reject => return Err(NestedSetError::Cycle(items[stray].id)),
            CyclePolicy::Break => {
                walk.parents[stray] = None;
                counter = walk.visit(stray, counter);
            }
        }
    }

    Ok(Layout {
        assignments: walk.out,
        next: counter,
    })
}

struct Walk<'a> {
    items: &'a [FlatNode],
    parents: &'a mut Vec<Option<NodeId>>,
    children: &'a HashMap<NodeId, Vec<usize>>,
    visited: Vec<bool>,
    out: Vec<Assignment>,
}

impl Walk<'_> {
    /// Pre-order walk from `root`; returns the next free boundary.
    fn visit(&mut self, root: usize, mut counter: Boundary) -> Boundary {
        // (item position, slot in `out`, next child cursor)
        let mut stack: Vec<(usize, usize, usize)> = Vec::new();
        counter = self.enter(root, counter, &mut stack);

        while let Some(top) = stack.last_mut() {
            let (pos, slot, cursor) = *top;
            let next_child = self
                .children
                .get(&self.items[pos].id)
                .and_then(|kids| kids.get(cursor))
                .copied();

            match next_child {
                Some(child) => {
                    top.2 += 1;
                    if !self.visited[child] {
                        counter = self.enter(child, counter, &mut stack);
                    }
                }
                None => {
                    self.out[slot].rgt = counter;
                    counter += 1;
                    stack.pop();
                }
            }
        }
        counter
    }

    fn enter(
        &mut self,
        pos: usize,
        counter: Boundary,
        stack: &mut Vec<(usize, usize, usize)>,
    ) -> Boundary {
        self.visited[pos] = true;
        self.out.push(Assignment {
            id: self.items[pos].id,
            parent_id: self.parents[pos],
            lft: counter,
            rgt: counter,
        });
        stack.push((pos, self.out.len() - 1, 0));
        counter + 1
    }
}
