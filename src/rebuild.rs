//! Bulk construction and repair on top of [`assign_boundaries`].

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::boundary::Shift;
use crate::builder::{assign_boundaries, Assignment, BuildOptions, Layout};
use crate::config::RootPolicy;
use crate::error::NestedSetError;
use crate::node::{Boundary, FlatNode, Node, NodeId, Scope};
use crate::query::{self, NodeFilter};
use crate::repository::NestedSetRepository;
use crate::store::{NodeStore, StoreTransaction};

/// Row counts touched by a rebuild.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
}

impl<S> NestedSetRepository<S>
where
    S: NodeStore,
{
    /// Replace the structure of `scope` with `items`.
    ///
    /// The list is authoritative: rows it names get fresh boundaries (and are
    /// created if missing), rows it does not name are removed. Soft-delete
    /// markers of surviving rows are kept.
    pub async fn rebuild_tree(
        &self,
        scope: &Scope,
        items: &[FlatNode],
    ) -> Result<RebuildReport, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.rebuild_tree_on(&mut txn, items).await;
        self.finish(txn, result).await
    }

    /// Rebuild the descendants of `root` from `items`.
    ///
    /// An entry for `root` itself is ignored. Boundaries are reassigned from
    /// `root.lft`, subtree rows missing from `items` are removed and the rest of
    /// the scope is shifted if the subtree changed width.
    pub async fn rebuild_subtree(
        &self,
        scope: &Scope,
        root: NodeId,
        items: &[FlatNode],
    ) -> Result<RebuildReport, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.rebuild_subtree_on(&mut txn, root, items).await;
        self.finish(txn, result).await
    }

    /// Recompute every boundary of `scope` from `parent_id`, keeping sibling
    /// order. Returns the number of rows rewritten.
    pub async fn fix_tree(&self, scope: &Scope) -> Result<u64, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = fix_tree_on(&mut txn).await;
        self.finish(txn, result).await
    }

    /// Like [`fix_tree`](Self::fix_tree), limited to the nodes reachable from
    /// `root` through `parent_id`.
    ///
    /// Fails with `Invariant` when those nodes and the rows inside the root's
    /// interval are not the same set; only `fix_tree` can repair that.
    pub async fn fix_subtree(&self, scope: &Scope, root: NodeId) -> Result<u64, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = fix_subtree_on(&mut txn, root).await;
        self.finish(txn, result).await
    }

    async fn rebuild_tree_on(
        &self,
        txn: &mut S::Transaction,
        items: &[FlatNode],
    ) -> Result<RebuildReport, NestedSetError> {
        let layout = assign_boundaries(items, 1, BuildOptions::STRICT)?;
        if self.root_policy() == RootPolicy::Single && layout.roots().count() > 1 {
            return Err(NestedSetError::invariant(format!(
                "scope {} allows a single root",
                txn.scope()
            )));
        }

        let existing = by_id(txn.select(&NodeFilter::new().with_deleted()).await?);
        let wanted: HashSet<NodeId> = layout.assignments.iter().map(|a| a.id).collect();

        let mut report = RebuildReport::default();
        for id in existing.keys().filter(|id| !wanted.contains(*id)) {
            report.deleted += txn.delete_node(*id).await?;
        }
        for assignment in &layout.assignments {
            match existing.get(&assignment.id) {
                Some(row) => {
                    if write_if_changed(txn, row, assignment).await? {
                        report.updated += 1;
                    }
                }
                None => {
                    let row = fresh_row(txn.scope(), assignment);
                    txn.write_node(&row).await?;
                    report.inserted += 1;
                }
            }
        }

        tracing::debug!(
            scope = %txn.scope(),
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            "rebuilt tree"
        );
        Ok(report)
    }

    async fn rebuild_subtree_on(
        &self,
        txn: &mut S::Transaction,
        root_id: NodeId,
        items: &[FlatNode],
    ) -> Result<RebuildReport, NestedSetError> {
        let root = txn.read_node(root_id).await?;

        let mut list = Vec::with_capacity(items.len() + 1);
        list.push(FlatNode::root(root.id));
        list.extend(items.iter().filter(|item| item.id != root.id).copied());

        let layout = assign_boundaries(&list, root.lft, BuildOptions::STRICT)?;
        if layout.roots().count() != 1 {
            return Err(NestedSetError::invariant(format!(
                "every rebuilt node must descend from {}",
                root.id
            )));
        }

        let existing = by_id(
            txn.select(&query::self_and_descendants(&root).with_deleted())
                .await?,
        );
        for assignment in &layout.assignments {
            if existing.contains_key(&assignment.id) {
                continue;
            }
            match txn.read_node(assignment.id).await {
                Ok(_) | Err(NestedSetError::ScopeMismatch { .. }) => {
                    return Err(NestedSetError::invariant(format!(
                        "node {} lives outside the subtree of {}",
                        assignment.id, root.id
                    )));
                }
                Err(NestedSetError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let wanted: HashSet<NodeId> = layout.assignments.iter().map(|a| a.id).collect();
        let mut report = RebuildReport::default();
        for id in existing.keys().filter(|id| !wanted.contains(*id)) {
            report.deleted += txn.delete_node(*id).await?;
        }

        // Everything after the old subtree follows its new right edge.
        let shift = width_change(&root, &layout);
        txn.shift_boundaries(shift).await?;

        for assignment in &layout.assignments {
            let mut assignment = *assignment;
            if assignment.id == root.id {
                assignment.parent_id = root.parent_id;
            }
            match existing.get(&assignment.id) {
                Some(row) => {
                    if write_if_changed(txn, row, &assignment).await? {
                        report.updated += 1;
                    }
                }
                None => {
                    let row = fresh_row(txn.scope(), &assignment);
                    txn.write_node(&row).await?;
                    report.inserted += 1;
                }
            }
        }

        tracing::debug!(
            scope = %txn.scope(),
            root = %root.id,
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            "rebuilt subtree"
        );
        Ok(report)
    }
}

async fn fix_tree_on<T>(txn: &mut T) -> Result<u64, NestedSetError>
where
    T: StoreTransaction,
{
    let rows = txn.select(&NodeFilter::new().with_deleted()).await?;
    let items: Vec<FlatNode> = rows.iter().map(Node::flat).collect();
    let layout = assign_boundaries(&items, 1, BuildOptions::REPAIR)?;

    let existing = by_id(rows);
    let mut fixed = 0;
    for assignment in &layout.assignments {
        if let Some(row) = existing.get(&assignment.id) {
            if write_if_changed(txn, row, assignment).await? {
                fixed += 1;
            }
        }
    }
    if fixed > 0 {
        tracing::warn!(scope = %txn.scope(), fixed, "repaired tree boundaries");
    }
    Ok(fixed)
}

async fn fix_subtree_on<T>(txn: &mut T, root_id: NodeId) -> Result<u64, NestedSetError>
where
    T: StoreTransaction,
{
    let root = txn.read_node(root_id).await?;
    if root.lft < 1 || root.lft >= root.rgt {
        return Err(NestedSetError::invariant(format!(
            "subtree root {} has malformed boundaries [{}, {}]",
            root.id, root.lft, root.rgt
        )));
    }

    let rows = txn.select(&NodeFilter::new().with_deleted()).await?;
    let members = reachable_from(&root, &rows);
    if let Some(id) = disagreeing_row(&root, &rows, &members) {
        return Err(NestedSetError::invariant(format!(
            "node {id} is placed by parent_id and boundaries on different sides of subtree {}; \
             repair the scope with fix_tree",
            root.id
        )));
    }
    let mut items = vec![FlatNode::root(root.id)];
    items.extend(
        rows.iter()
            .filter(|node| node.id != root.id && members.contains(&node.id))
            .map(Node::flat),
    );
    let layout = assign_boundaries(&items, root.lft, BuildOptions::REPAIR)?;

    let shift = width_change(&root, &layout);
    let mut fixed = txn.shift_boundaries(shift).await?;

    // Compare against the rows as the shift left them.
    let mut existing = by_id(rows);
    for row in existing.values_mut() {
        shift.apply_to(row);
    }
    for assignment in &layout.assignments {
        let mut assignment = *assignment;
        if assignment.id == root.id {
            assignment.parent_id = root.parent_id;
        }
        if let Some(row) = existing.get(&assignment.id) {
            if write_if_changed(txn, row, &assignment).await? {
                fixed += 1;
            }
        }
    }
    if fixed > 0 {
        tracing::warn!(scope = %txn.scope(), root = %root.id, fixed, "repaired subtree boundaries");
    }
    Ok(fixed)
}

/// Ids whose `parent_id` chain reaches `root`, `root` excluded.
fn reachable_from(root: &Node, rows: &[Node]) -> HashSet<NodeId> {
    let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in rows {
        if let Some(parent) = node.parent_id {
            children.entry(parent).or_default().push(node.id);
        }
    }

    let mut seen = HashSet::new();
    let mut pending = vec![root.id];
    while let Some(id) = pending.pop() {
        for child in children.get(&id).into_iter().flatten() {
            if *child != root.id && seen.insert(*child) {
                pending.push(*child);
            }
        }
    }
    seen
}

/// First row whose membership by `parent_id` differs from its membership by
/// boundaries. A row is inside by boundaries when either end lies in the
/// root's interval.
fn disagreeing_row(root: &Node, rows: &[Node], members: &HashSet<NodeId>) -> Option<NodeId> {
    let inside = |value: Boundary| (root.lft..=root.rgt).contains(&value);
    rows.iter()
        .filter(|node| node.id != root.id)
        .find(|node| members.contains(&node.id) != (inside(node.lft) || inside(node.rgt)))
        .map(|node| node.id)
}

/// Shift for everything right of `root` once its subtree spans `layout`.
fn width_change(root: &Node, layout: &Layout) -> Shift {
    let new_width: Boundary = layout.next - root.lft;
    Shift {
        start: root.rgt + 1,
        end: Boundary::MAX,
        delta: new_width - root.width(),
    }
}

fn by_id(rows: Vec<Node>) -> HashMap<NodeId, Node> {
    rows.into_iter().map(|node| (node.id, node)).collect()
}

fn fresh_row(scope: &Scope, assignment: &Assignment) -> Node {
    Node {
        id: assignment.id,
        parent_id: assignment.parent_id,
        lft: assignment.lft,
        rgt: assignment.rgt,
        scope: scope.clone(),
        deleted_at: None,
    }
}

async fn write_if_changed<T>(
    txn: &mut T,
    row: &Node,
    assignment: &Assignment,
) -> Result<bool, NestedSetError>
where
    T: StoreTransaction,
{
    if row.lft == assignment.lft && row.rgt == assignment.rgt && row.parent_id == assignment.parent_id
    {
        return Ok(false);
    }
    let mut updated = row.clone();
    updated.lft = assignment.lft;
    updated.rgt = assignment.rgt;
    updated.parent_id = assignment.parent_id;
    txn.write_node(&updated).await?;
    Ok(true)
}
