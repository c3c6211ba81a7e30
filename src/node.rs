use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::boundary;

/// Integer boundary value stored in the `lft`/`rgt` columns.
///
/// Well-formed trees only ever hold values `>= 1`; the mutator temporarily
/// parks moving subtrees at non-positive values inside a transaction.
pub type Boundary = i64;

/// Stable identifier of a node row.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(i64);

impl NodeId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for NodeId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<i32> for NodeId {
    fn from(value: i32) -> Self {
        Self(i64::from(value))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One typed component of a scope key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScopeValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<i32> for ScopeValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for ScopeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for ScopeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<String> for ScopeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for ScopeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl fmt::Display for ScopeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeValue::Bool(value) => write!(f, "{value}"),
            ScopeValue::Int(value) => write!(f, "{value}"),
            ScopeValue::Text(value) => write!(f, "{value:?}"),
        }
    }
}

/// Partition key separating independent trees stored in one table.
///
/// The values line up positionally with the model's scope columns. The empty
/// scope is a single global tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Vec<ScopeValue>);

impl Scope {
    pub fn global() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ScopeValue>,
    {
        Self(values.into_iter().map(Into::into).collect())
    }

    pub fn values(&self) -> &[ScopeValue] {
        &self.0
    }

    pub fn is_global(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

/// Structural view of one stored row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub lft: Boundary,
    pub rgt: Boundary,
    pub scope: Scope,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.rgt == self.lft + 1
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Number of boundary slots the subtree rooted here occupies.
    pub fn width(&self) -> Boundary {
        boundary::width(self.lft, self.rgt)
    }

    /// Number of nodes below this one, soft-deleted rows included.
    pub fn descendant_count(&self) -> i64 {
        (self.rgt - self.lft - 1) / 2
    }

    pub fn is_descendant_of(&self, other: &Node) -> bool {
        self.scope == other.scope && other.lft < self.lft && self.rgt < other.rgt
    }

    pub fn is_ancestor_of(&self, other: &Node) -> bool {
        other.is_descendant_of(self)
    }

    /// Whether `boundary` lies inside this node's interval, edges included.
    pub fn spans(&self, boundary: Boundary) -> bool {
        self.lft <= boundary && boundary <= self.rgt
    }

    pub fn flat(&self) -> FlatNode {
        FlatNode {
            id: self.id,
            parent_id: self.parent_id,
        }
    }
}

/// `{id, parent_id}` pair consumed by the rebuild operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlatNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
}

impl FlatNode {
    pub fn root(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    pub fn child(id: impl Into<NodeId>, parent_id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            parent_id: Some(parent_id.into()),
        }
    }
}

/// Position a freshly inserted row will occupy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeSlot {
    pub parent_id: Option<NodeId>,
    pub lft: Boundary,
    pub rgt: Boundary,
}

/// Nested view built from one range scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub node: Node,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Assemble nested values from rows ordered by `lft`.
    ///
    /// Rows whose parent is not part of `rows` become top-level entries.
    pub fn assemble(rows: Vec<Node>) -> Vec<TreeNode> {
        let mut roots: Vec<TreeNode> = Vec::new();
        let mut open: Vec<TreeNode> = Vec::new();

        for node in rows {
            while let Some(top) = open.last() {
                if top.node.lft < node.lft && node.rgt < top.node.rgt {
                    break;
                }
                close_top(&mut open, &mut roots);
            }
            open.push(TreeNode {
                node,
                children: Vec::new(),
            });
        }
        while !open.is_empty() {
            close_top(&mut open, &mut roots);
        }
        roots
    }

    pub fn len(&self) -> usize {
        1 + self.children.iter().map(TreeNode::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

fn close_top(open: &mut Vec<TreeNode>, roots: &mut Vec<TreeNode>) {
    if let Some(done) = open.pop() {
        // A filtered-out parent (soft-deleted) hands its children to the
        // nearest visible container.
        match open.last_mut() {
            Some(parent) => parent.children.push(done),
            None => roots.push(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn leaf_and_width() {
        let leaf = node(2, Some(1), 2, 3);
        let inner = node(1, None, 1, 6);
        assert!(leaf.is_leaf());
        assert!(!inner.is_leaf());
        assert_eq!(inner.width(), 6);
        assert_eq!(inner.descendant_count(), 2);
        assert!(leaf.is_descendant_of(&inner));
        assert!(inner.is_ancestor_of(&leaf));
    }

    #[test]
    fn assemble_nests_rows_in_lft_order() {
        let rows = vec![
            node(1, None, 1, 8),
            node(2, Some(1), 2, 5),
            node(3, Some(2), 3, 4),
            node(4, Some(1), 6, 7),
            node(5, None, 9, 10),
        ];
        let forest = TreeNode::assemble(rows);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].len(), 4);
        assert_eq!(forest[0].children[0].children[0].node.id, NodeId::new(3));
        assert_eq!(forest[0].children[1].node.id, NodeId::new(4));
        assert_eq!(forest[1].node.id, NodeId::new(5));
    }

    #[test]
    fn scope_display_lists_values() {
        let scope = Scope::new([ScopeValue::Int(7), ScopeValue::from("menu")]);
        assert_eq!(scope.to_string(), "(7, \"menu\")");
        assert!(Scope::global().is_global());
    }
}
