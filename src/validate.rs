//! Structural health checks over the rows of one scope.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::NestedSetError;
use crate::node::{Boundary, Node, NodeId, Scope};
use crate::query::NodeFilter;
use crate::repository::NestedSetRepository;
use crate::store::{NodeStore, StoreTransaction};

/// Violation counters for one scope. All zero means the tree is sound.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    /// Rows with `rgt <= lft` or a missing/non-positive boundary.
    pub oddness: u64,
    /// Pairs of rows sharing a boundary value.
    pub duplicates: u64,
    /// Rows whose `parent_id` is not the nearest interval containing them.
    pub wrong_parent: u64,
    /// Rows pointing at a parent absent from the scope.
    pub missing_parent: u64,
}

impl ErrorCounts {
    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }

    pub fn total(&self) -> u64 {
        self.oddness + self.duplicates + self.wrong_parent + self.missing_parent
    }
}

impl fmt::Display for ErrorCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "oddness={}, duplicates={}, wrong_parent={}, missing_parent={}",
            self.oddness, self.duplicates, self.wrong_parent, self.missing_parent
        )
    }
}

fn is_well_formed(node: &Node) -> bool {
    node.lft >= 1 && node.lft < node.rgt
}

/// Run all four checks over `rows` (one scope, soft-deleted rows included).
pub fn count_errors(rows: &[Node]) -> ErrorCounts {
    let ids: HashSet<NodeId> = rows.iter().map(|node| node.id).collect();

    let oddness = rows.iter().filter(|node| !is_well_formed(node)).count() as u64;

    let missing_parent = rows
        .iter()
        .filter(|node| node.parent_id.is_some_and(|parent| !ids.contains(&parent)))
        .count() as u64;

    let expected = expected_parents(rows);
    let wrong_parent = rows
        .iter()
        .filter(|node| match node.parent_id {
            Some(parent) if !ids.contains(&parent) => false,
            actual => expected.get(&node.id).copied().flatten() != actual,
        })
        .count() as u64;

    ErrorCounts {
        oddness,
        duplicates: duplicate_pairs(rows),
        wrong_parent,
        missing_parent,
    }
}

fn duplicate_pairs(rows: &[Node]) -> u64 {
    let mut holders: HashMap<Boundary, HashSet<NodeId>> = HashMap::new();
    for node in rows {
        holders.entry(node.lft).or_default().insert(node.id);
        holders.entry(node.rgt).or_default().insert(node.id);
    }
    holders
        .values()
        .map(|ids| {
            let n = ids.len() as u64;
            n * n.saturating_sub(1) / 2
        })
        .sum()
}

/// Parent implied by the intervals: the nearest well-formed row strictly
/// containing each row.
fn expected_parents(rows: &[Node]) -> HashMap<NodeId, Option<NodeId>> {
    let mut order: Vec<&Node> = rows.iter().collect();
    order.sort_by_key(|node| (node.lft, std::cmp::Reverse(node.rgt), node.id));

    let mut open: Vec<&Node> = Vec::new();
    let mut expected = HashMap::with_capacity(rows.len());
    for node in order {
        // Containers ending before this row cannot contain it or anything after.
        while open.last().is_some_and(|top| top.rgt < node.lft) {
            open.pop();
        }
        let container = open
            .iter()
            .rev()
            .find(|candidate| candidate.lft < node.lft && node.rgt < candidate.rgt)
            .map(|candidate| candidate.id);
        expected.insert(node.id, container);
        if is_well_formed(node) {
            open.push(node);
        }
    }
    expected
}

impl<S> NestedSetRepository<S>
where
    S: NodeStore,
{
    /// Violation counters for `scope`, soft-deleted rows included.
    pub async fn count_errors(&self, scope: &Scope) -> Result<ErrorCounts, NestedSetError> {
        let mut txn = self.store().begin_read(scope).await?;
        let result = txn.select(&NodeFilter::new().with_deleted()).await;
        let rows = self.finish(txn, result).await?;
        Ok(count_errors(&rows))
    }

    /// Counters for every scope holding rows.
    pub async fn count_errors_all(&self) -> Result<Vec<(Scope, ErrorCounts)>, NestedSetError> {
        let scopes = self.store().scopes().await?;
        let mut report = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let counts = self.count_errors(&scope).await?;
            report.push((scope, counts));
        }
        Ok(report)
    }

    pub async fn is_broken(&self, scope: &Scope) -> Result<bool, NestedSetError> {
        Ok(!self.count_errors(scope).await?.is_clean())
    }

    /// Fail with `CorruptionDetected` unless `scope` passes every check.
    pub async fn ensure_valid(&self, scope: &Scope) -> Result<(), NestedSetError> {
        let counts = self.count_errors(scope).await?;
        if counts.is_clean() {
            return Ok(());
        }
        tracing::warn!(%scope, %counts, "nested-set corruption detected");
        Err(NestedSetError::CorruptionDetected(counts))
    }
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

    fn chain() -> Vec<Node> {
        vec![
            node(1, None, 1, 6),
            node(2, Some(1), 2, 3),
            node(3, Some(1), 4, 5),
        ]
    }

    #[test]
    fn sound_tree_has_no_errors() {
        assert!(count_errors(&chain()).is_clean());
        assert!(count_errors(&[]).is_clean());
    }

    #[test]
    fn collapsed_interval_is_oddness_only() {
        let mut rows = chain();
        rows[1].rgt = rows[1].lft;
        let counts = count_errors(&rows);
        assert_eq!(
            counts,
            ErrorCounts {
                oddness: 1,
                ..ErrorCounts::default()
            }
        );
    }

    #[test]
    fn shared_boundaries_are_duplicates() {
        let mut rows = chain();
        rows[2].lft = 2;
        rows[2].rgt = 3;
        let counts = count_errors(&rows);
        // two rows share both 2 and 3
        assert_eq!(counts.duplicates, 2);
        assert_eq!(counts.oddness, 0);
    }

    #[test]
    fn parent_disagreeing_with_intervals_is_wrong_parent() {
        let mut rows = chain();
        rows[2].parent_id = Some(NodeId::new(2));
        let counts = count_errors(&rows);
        assert_eq!(counts.wrong_parent, 1);

        let mut rows = chain();
        rows[0].parent_id = Some(NodeId::new(3));
        let counts = count_errors(&rows);
        assert_eq!(counts.wrong_parent, 1);
    }

    #[test]
    fn dangling_parent_is_missing_parent_not_wrong_parent() {
        let mut rows = chain();
        rows[2].parent_id = Some(NodeId::new(42));
        let counts = count_errors(&rows);
        assert_eq!(counts.missing_parent, 1);
        assert_eq!(counts.wrong_parent, 0);
    }

    #[test]
    fn display_lists_every_counter() {
        let counts = ErrorCounts {
            oddness: 1,
            duplicates: 2,
            wrong_parent: 3,
            missing_parent: 4,
        };
        assert_eq!(
            counts.to_string(),
            "oddness=1, duplicates=2, wrong_parent=3, missing_parent=4"
        );
        assert_eq!(counts.total(), 10);
    }
}
