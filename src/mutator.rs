//! Structural mutations. Each public operation is one store transaction; the
//! `*_on` helpers do the work against an open transaction so operations can
//! compose (`move_up` is a `move` under the same lock).

use chrono::{DateTime, Duration, Utc};

use crate::boundary;
use crate::config::RootPolicy;
use crate::error::NestedSetError;
use crate::node::{Boundary, Node, NodeId, NodeSlot, Scope};
use crate::query::{self, NodeFilter, Predicate};
use crate::repository::NestedSetRepository;
use crate::store::{NodeStore, StoreTransaction};

/// Where a node is inserted or moved to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// New last root of the scope.
    Root,
    AppendTo(NodeId),
    PrependTo(NodeId),
    Before(NodeId),
    After(NodeId),
}

impl Placement {
    fn reference(self) -> Option<NodeId> {
        match self {
            Placement::Root => None,
            Placement::AppendTo(id)
            | Placement::PrependTo(id)
            | Placement::Before(id)
            | Placement::After(id) => Some(id),
        }
    }

    fn nests_under_reference(self) -> bool {
        matches!(self, Placement::AppendTo(_) | Placement::PrependTo(_))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeleteMode {
    /// Stamp a deletion marker; boundaries stay allocated.
    Soft,
    /// Remove the rows and reclaim their boundaries.
    Hard,
}

/// Resolved insertion point.
#[derive(Copy, Clone, Debug)]
struct Target {
    pivot: Boundary,
    parent_id: Option<NodeId>,
}

impl<S> NestedSetRepository<S>
where
    S: NodeStore,
{
    pub async fn create_root(&self, scope: &Scope, draft: S::Draft) -> Result<Node, NestedSetError> {
        self.insert(scope, Placement::Root, draft).await
    }

    pub async fn append_child(
        &self,
        scope: &Scope,
        parent: NodeId,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        self.insert(scope, Placement::AppendTo(parent), draft).await
    }

    pub async fn prepend_child(
        &self,
        scope: &Scope,
        parent: NodeId,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        self.insert(scope, Placement::PrependTo(parent), draft).await
    }

    pub async fn insert_before(
        &self,
        scope: &Scope,
        sibling: NodeId,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        self.insert(scope, Placement::Before(sibling), draft).await
    }

    pub async fn insert_after(
        &self,
        scope: &Scope,
        sibling: NodeId,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        self.insert(scope, Placement::After(sibling), draft).await
    }

    /// Insert a new leaf at `placement`.
    pub async fn insert(
        &self,
        scope: &Scope,
        placement: Placement,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.insert_on(&mut txn, placement, draft).await;
        self.finish(txn, result).await
    }

    /// Relocate `id` and its subtree to `placement`.
    pub async fn move_node(
        &self,
        scope: &Scope,
        id: NodeId,
        placement: Placement,
    ) -> Result<Node, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.move_on(&mut txn, id, placement).await;
        self.finish(txn, result).await
    }

    /// Move `id` up to `steps` places left among its live siblings; returns
    /// how many places it actually moved.
    pub async fn move_up(
        &self,
        scope: &Scope,
        id: NodeId,
        steps: usize,
    ) -> Result<usize, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.shift_among_siblings(&mut txn, id, steps, true).await;
        self.finish(txn, result).await
    }

    /// Move `id` up to `steps` places right among its live siblings.
    pub async fn move_down(
        &self,
        scope: &Scope,
        id: NodeId,
        steps: usize,
    ) -> Result<usize, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.shift_among_siblings(&mut txn, id, steps, false).await;
        self.finish(txn, result).await
    }

    /// Delete `id` and its subtree; returns the number of rows affected.
    pub async fn delete(
        &self,
        scope: &Scope,
        id: NodeId,
        mode: DeleteMode,
    ) -> Result<u64, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = match mode {
            DeleteMode::Soft => self.soft_delete_on(&mut txn, id).await,
            DeleteMode::Hard => self.hard_delete_on(&mut txn, id).await,
        };
        self.finish(txn, result).await
    }

    /// Undo the soft delete that hid `id`, together with every descendant
    /// hidden by the same call. Returns the number of rows restored.
    pub async fn restore(&self, scope: &Scope, id: NodeId) -> Result<u64, NestedSetError> {
        let mut txn = self.store().begin(scope).await?;
        let result = self.restore_on(&mut txn, id).await;
        self.finish(txn, result).await
    }

    async fn insert_on(
        &self,
        txn: &mut S::Transaction,
        placement: Placement,
        draft: S::Draft,
    ) -> Result<Node, NestedSetError> {
        let target = self.resolve(txn, placement).await?;
        self.check_root_policy(txn, target.parent_id, None).await?;

        txn.shift_boundaries(boundary::insertion_shift(target.pivot, 2))
            .await?;
        let node = txn
            .insert_node(
                draft,
                NodeSlot {
                    parent_id: target.parent_id,
                    lft: target.pivot,
                    rgt: target.pivot + 1,
                },
            )
            .await?;

        tracing::debug!(
            scope = %node.scope,
            id = %node.id,
            lft = node.lft,
            rgt = node.rgt,
            "inserted node"
        );
        Ok(node)
    }

    async fn move_on(
        &self,
        txn: &mut S::Transaction,
        id: NodeId,
        placement: Placement,
    ) -> Result<Node, NestedSetError> {
        let node = live_node(txn, id).await?;

        if let Some(reference_id) = placement.reference() {
            let reference = live_node(txn, reference_id).await?;
            if reference.id == node.id {
                if placement.nests_under_reference() {
                    return Err(NestedSetError::Cycle(node.id));
                }
                return Ok(node);
            }
            if reference.is_descendant_of(&node) {
                return Err(NestedSetError::Cycle(node.id));
            }
        }

        let target = self.resolve(txn, placement).await?;
        if target.parent_id == node.parent_id
            && (target.pivot == node.lft || target.pivot == node.rgt + 1)
        {
            return Ok(node);
        }
        self.check_root_policy(txn, target.parent_id, Some(node.id))
            .await?;

        let width = node.width();
        txn.shift_boundaries(boundary::park(node.lft, node.rgt))
            .await?;
        txn.shift_boundaries(boundary::removal_shift(node.lft, width))
            .await?;
        // The reference may have shifted while the subtree was detached.
        let target = self.resolve(txn, placement).await?;
        txn.shift_boundaries(boundary::insertion_shift(target.pivot, width))
            .await?;
        txn.shift_boundaries(boundary::unpark(node.lft, node.rgt, target.pivot))
            .await?;

        let mut moved = txn.read_node(node.id).await?;
        moved.parent_id = target.parent_id;
        txn.write_node(&moved).await?;

        tracing::debug!(
            scope = %moved.scope,
            id = %moved.id,
            from = node.lft,
            to = moved.lft,
            width,
            "moved subtree"
        );
        Ok(moved)
    }

    async fn shift_among_siblings(
        &self,
        txn: &mut S::Transaction,
        id: NodeId,
        steps: usize,
        up: bool,
    ) -> Result<usize, NestedSetError> {
        let node = live_node(txn, id).await?;
        let filter = if up {
            query::prev_siblings(&node)
        } else {
            query::next_siblings(&node)
        };
        let siblings = txn.select(&filter).await?;
        let moved = steps.min(siblings.len());
        if moved == 0 {
            return Ok(0);
        }

        // Siblings come back in `lft` order; count outward from `node`.
        let placement = if up {
            Placement::Before(siblings[siblings.len() - moved].id)
        } else {
            Placement::After(siblings[moved - 1].id)
        };
        self.move_on(txn, id, placement).await?;
        Ok(moved)
    }

    async fn soft_delete_on(
        &self,
        txn: &mut S::Transaction,
        id: NodeId,
    ) -> Result<u64, NestedSetError> {
        let node = txn.read_node(id).await?;
        if node.is_deleted() {
            return Ok(0);
        }
        let marker = next_marker(txn).await?;
        let hidden = txn.mark_deleted(node.lft, node.rgt, marker).await?;
        tracing::debug!(scope = %node.scope, id = %node.id, hidden, %marker, "soft-deleted subtree");
        Ok(hidden)
    }

    async fn hard_delete_on(
        &self,
        txn: &mut S::Transaction,
        id: NodeId,
    ) -> Result<u64, NestedSetError> {
        let node = txn.read_node(id).await?;
        let removed = txn.delete_range(node.lft, node.rgt).await?;
        txn.shift_boundaries(boundary::removal_shift(node.lft, node.width()))
            .await?;
        tracing::debug!(scope = %node.scope, id = %node.id, removed, "deleted subtree");
        Ok(removed)
    }

    async fn restore_on(&self, txn: &mut S::Transaction, id: NodeId) -> Result<u64, NestedSetError> {
        let node = txn.read_node(id).await?;
        let Some(marker) = node.deleted_at else {
            return Ok(0);
        };
        let restored = txn.clear_deleted(node.lft, node.rgt, marker).await?;
        tracing::debug!(scope = %node.scope, id = %node.id, restored, "restored subtree");
        Ok(restored)
    }

    async fn resolve(
        &self,
        txn: &mut S::Transaction,
        placement: Placement,
    ) -> Result<Target, NestedSetError> {
        let target = match placement {
            Placement::Root => Target {
                pivot: boundary::root_pivot(txn.max_rgt().await?),
                parent_id: None,
            },
            Placement::AppendTo(parent) => {
                let parent = live_node(txn, parent).await?;
                Target {
                    pivot: boundary::append_pivot(&parent),
                    parent_id: Some(parent.id),
                }
            }
            Placement::PrependTo(parent) => {
                let parent = live_node(txn, parent).await?;
                Target {
                    pivot: boundary::prepend_pivot(&parent),
                    parent_id: Some(parent.id),
                }
            }
            Placement::Before(sibling) => {
                let sibling = live_node(txn, sibling).await?;
                Target {
                    pivot: boundary::before_pivot(&sibling),
                    parent_id: sibling.parent_id,
                }
            }
            Placement::After(sibling) => {
                let sibling = live_node(txn, sibling).await?;
                Target {
                    pivot: boundary::after_pivot(&sibling),
                    parent_id: sibling.parent_id,
                }
            }
        };
        Ok(target)
    }

    /// Under [`RootPolicy::Single`], refuse to add a second root.
    async fn check_root_policy(
        &self,
        txn: &mut S::Transaction,
        parent_id: Option<NodeId>,
        moving: Option<NodeId>,
    ) -> Result<(), NestedSetError> {
        if self.root_policy() != RootPolicy::Single || parent_id.is_some() {
            return Ok(());
        }
        let mut filter = NodeFilter::new()
            .with(Predicate::Parent(None))
            .with_deleted();
        if let Some(id) = moving {
            filter = filter.with(Predicate::ExcludeId(id));
        }
        if txn.count(&filter).await? > 0 {
            return Err(NestedSetError::invariant(format!(
                "scope {} already has a root",
                txn.scope()
            )));
        }
        Ok(())
    }
}

/// Read `id`, treating soft-deleted rows as absent.
async fn live_node<T>(txn: &mut T, id: NodeId) -> Result<Node, NestedSetError>
where
    T: StoreTransaction,
{
    let node = txn.read_node(id).await?;
    if node.is_deleted() {
        return Err(NestedSetError::NotFound(id));
    }
    Ok(node)
}

/// Deletion marker for a new batch: millisecond precision, strictly after
/// every marker already in the scope.
async fn next_marker<T>(txn: &mut T) -> Result<DateTime<Utc>, NestedSetError>
where
    T: StoreTransaction,
{
    let now = Utc::now();
    let now = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now);
    Ok(match txn.latest_deletion().await? {
        Some(latest) if latest >= now => latest + Duration::milliseconds(1),
        _ => now,
    })
}

