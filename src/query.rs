//! Translation of tree relations into boundary range predicates.
//!
//! Every relation is expressed as a [`NodeFilter`]: a conjunction of
//! comparisons against `lft`, `rgt` and `parent_id`. Stores either evaluate the
//! filter directly ([`NodeFilter::matches`]) or render it as SQL; results are
//! always ordered by `lft` ascending.

use crate::node::{Boundary, Node, NodeId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cmp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Cmp {
    pub fn eval(self, left: Boundary, right: Boundary) -> bool {
        match self {
            Cmp::Lt => left < right,
            Cmp::Le => left <= right,
            Cmp::Eq => left == right,
            Cmp::Ge => left >= right,
            Cmp::Gt => left > right,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Eq => "=",
            Cmp::Ge => ">=",
            Cmp::Gt => ">",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    Lft(Cmp, Boundary),
    Rgt(Cmp, Boundary),
    /// `parent_id` equals the value; `None` matches roots.
    Parent(Option<NodeId>),
    ExcludeId(NodeId),
    /// `rgt = lft + 1`
    Leaf,
}

impl Predicate {
    pub fn matches(&self, node: &Node) -> bool {
        match *self {
            Predicate::Lft(cmp, value) => cmp.eval(node.lft, value),
            Predicate::Rgt(cmp, value) => cmp.eval(node.rgt, value),
            Predicate::Parent(parent) => node.parent_id == parent,
            Predicate::ExcludeId(id) => node.id != id,
            Predicate::Leaf => node.is_leaf(),
        }
    }
}

/// Conjunction of predicates evaluated inside one scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeFilter {
    predicates: Vec<Predicate>,
    include_deleted: bool,
}

impl NodeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Include soft-deleted rows in the result.
    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn include_deleted(&self) -> bool {
        self.include_deleted
    }

    pub fn matches(&self, node: &Node) -> bool {
        (self.include_deleted || !node.is_deleted())
            && self.predicates.iter().all(|predicate| predicate.matches(node))
    }
}

/// Nodes strictly containing `node`, root first.
pub fn ancestors(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Lft(Cmp::Lt, node.lft))
        .with(Predicate::Rgt(Cmp::Gt, node.rgt))
}

pub fn ancestors_and_self(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Lft(Cmp::Le, node.lft))
        .with(Predicate::Rgt(Cmp::Ge, node.rgt))
}

/// Nodes strictly inside `node`, in pre-order.
pub fn descendants(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Lft(Cmp::Gt, node.lft))
        .with(Predicate::Rgt(Cmp::Lt, node.rgt))
}

pub fn self_and_descendants(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Lft(Cmp::Ge, node.lft))
        .with(Predicate::Rgt(Cmp::Le, node.rgt))
}

/// Direct children: rows pointing at `node` that also sit inside its range.
pub fn children(node: &Node) -> NodeFilter {
    descendants(node).with(Predicate::Parent(Some(node.id)))
}

pub fn siblings(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Parent(node.parent_id))
        .with(Predicate::ExcludeId(node.id))
}

/// Siblings to the left of `node`, nearest last.
pub fn prev_siblings(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Parent(node.parent_id))
        .with(Predicate::Rgt(Cmp::Lt, node.lft))
}

/// Siblings to the right of `node`, nearest first.
pub fn next_siblings(node: &Node) -> NodeFilter {
    NodeFilter::new()
        .with(Predicate::Parent(node.parent_id))
        .with(Predicate::Lft(Cmp::Gt, node.rgt))
}

pub fn leaves(node: &Node) -> NodeFilter {
    descendants(node).with(Predicate::Leaf)
}

pub fn roots() -> NodeFilter {
    NodeFilter::new().with(Predicate::Parent(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Scope;

    fn node(id: i64, parent: Option<i64>, lft: Boundary, rgt: Boundary) -> Node {
        Node {
            id: NodeId::new(id),
            parent_id: parent.map(NodeId::new),
            lft,
            rgt,
            scope: Scope::global(),
            deleted_at: None,
        }
    }

    fn sample() -> Vec<Node> {
        vec![
            node(1, None, 1, 10),
            node(2, Some(1), 2, 7),
            node(3, Some(2), 3, 4),
            node(4, Some(2), 5, 6),
            node(5, Some(1), 8, 9),
        ]
    }

    fn ids(filter: &NodeFilter, rows: &[Node]) -> Vec<i64> {
        rows.iter()
            .filter(|node| filter.matches(node))
            .map(|node| node.id.get())
            .collect()
    }

    #[test]
    fn range_relations() {
        let rows = sample();
        assert_eq!(ids(&ancestors(&rows[2]), &rows), vec![1, 2]);
        assert_eq!(ids(&ancestors_and_self(&rows[2]), &rows), vec![1, 2, 3]);
        assert_eq!(ids(&descendants(&rows[1]), &rows), vec![3, 4]);
        assert_eq!(ids(&self_and_descendants(&rows[1]), &rows), vec![2, 3, 4]);
        assert_eq!(ids(&leaves(&rows[0]), &rows), vec![3, 4, 5]);
    }

    #[test]
    fn sibling_relations() {
        let rows = sample();
        assert_eq!(ids(&children(&rows[0]), &rows), vec![2, 5]);
        assert_eq!(ids(&siblings(&rows[2]), &rows), vec![4]);
        assert_eq!(ids(&prev_siblings(&rows[4]), &rows), vec![2]);
        assert_eq!(ids(&next_siblings(&rows[1]), &rows), vec![5]);
        assert_eq!(ids(&roots(), &rows), vec![1]);
    }

    #[test]
    fn soft_deleted_rows_are_hidden_by_default() {
        let mut rows = sample();
        rows[3].deleted_at = Some(chrono::Utc::now());
        assert_eq!(ids(&descendants(&rows[1]), &rows), vec![3]);
        assert_eq!(ids(&descendants(&rows[1]).with_deleted(), &rows), vec![3, 4]);
    }
}
