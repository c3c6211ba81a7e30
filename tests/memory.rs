use std::time::Duration;

use nested_set::{
    DeleteMode, ErrorCounts, FlatNode, MemoryStore, NestedSetError, NestedSetRepository, Node,
    NodeId, NodeSlot, NodeStore, Placement, RootPolicy, Scope, StoreTransaction,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn repository() -> NestedSetRepository<MemoryStore> {
    NestedSetRepository::new(MemoryStore::new())
}

fn ids(nodes: &[Node]) -> Vec<NodeId> {
    nodes.iter().map(|node| node.id).collect()
}

async fn bounds(
    repo: &NestedSetRepository<MemoryStore>,
    scope: &Scope,
    id: NodeId,
) -> Result<(i64, i64), NestedSetError> {
    let node = repo.node(scope, id).await?;
    Ok((node.lft, node.rgt))
}

/// Every row of `scope` passes the validator and the boundaries are exactly
/// `1..=2N`.
async fn assert_sound(repo: &NestedSetRepository<MemoryStore>, scope: &Scope) -> TestResult {
    let counts = repo.count_errors(scope).await?;
    assert_eq!(counts, ErrorCounts::default(), "violations in {scope}");

    let rows = repo.store().nodes(scope)?;
    let mut boundaries: Vec<i64> = rows.iter().flat_map(|node| [node.lft, node.rgt]).collect();
    boundaries.sort_unstable();
    let expected: Vec<i64> = (1..=2 * rows.len() as i64).collect();
    assert_eq!(boundaries, expected, "boundaries of {scope} are not contiguous");
    Ok(())
}

/// A with children B and C.
async fn abc(repo: &NestedSetRepository<MemoryStore>, scope: &Scope) -> Result<(Node, Node, Node), NestedSetError> {
    let a = repo.create_root(scope, None).await?;
    let b = repo.append_child(scope, a.id, None).await?;
    let c = repo.append_child(scope, a.id, None).await?;
    Ok((a, b, c))
}

#[tokio::test]
async fn appended_children_follow_their_parent() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;

    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 6));
    assert_eq!(bounds(&repo, &scope, b.id).await?, (2, 3));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (4, 5));

    assert_eq!(ids(&repo.ancestors(&scope, c.id).await?), vec![a.id]);
    assert_eq!(ids(&repo.siblings(&scope, b.id).await?), vec![c.id]);
    assert_eq!(ids(&repo.children(&scope, a.id).await?), vec![b.id, c.id]);
    assert_eq!(ids(&repo.leaves(&scope, a.id).await?), vec![b.id, c.id]);
    assert!(repo.is_leaf(&scope, b.id).await?);
    assert!(!repo.is_leaf(&scope, a.id).await?);
    assert!(repo.is_root(&scope, a.id).await?);
    assert_eq!(repo.depth(&scope, c.id).await?, 1);
    assert_eq!(repo.depth(&scope, a.id).await?, 0);
    assert_eq!(repo.parent(&scope, b.id).await?.map(|p| p.id), Some(a.id));
    assert_eq!(repo.parent(&scope, a.id).await?, None);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn moving_into_a_sibling_nests_the_subtree() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;

    let moved = repo.move_node(&scope, b.id, Placement::AppendTo(c.id)).await?;
    assert_eq!((moved.lft, moved.rgt), (3, 4));
    assert_eq!(moved.parent_id, Some(c.id));

    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 6));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (2, 5));
    assert_eq!(bounds(&repo, &scope, b.id).await?, (3, 4));
    assert_eq!(ids(&repo.ancestors(&scope, b.id).await?), vec![a.id, c.id]);
    assert_eq!(repo.depth(&scope, b.id).await?, 2);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn collapsed_interval_is_detected_and_repaired() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;

    let mut broken = repo.node(&scope, b.id).await?;
    broken.rgt = broken.lft;
    repo.store().overwrite(broken)?;

    let counts = repo.count_errors(&scope).await?;
    assert_eq!(
        counts,
        ErrorCounts {
            oddness: 1,
            ..ErrorCounts::default()
        }
    );
    assert!(repo.is_broken(&scope).await?);
    let err = repo.ensure_valid(&scope).await.unwrap_err();
    assert!(matches!(err, NestedSetError::CorruptionDetected(found) if found == counts));

    assert_eq!(repo.fix_tree(&scope).await?, 1);
    assert!(!repo.is_broken(&scope).await?);
    repo.ensure_valid(&scope).await?;
    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 6));
    assert_eq!(bounds(&repo, &scope, b.id).await?, (2, 3));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (4, 5));
    assert_eq!(repo.fix_tree(&scope).await?, 0);
    Ok(())
}

#[tokio::test]
async fn every_mutation_keeps_the_tree_sound() -> TestResult {
    let repo = repository();
    let scope = Scope::new([1]);

    let root = repo.create_root(&scope, None).await?;
    assert_sound(&repo, &scope).await?;
    let x1 = repo.append_child(&scope, root.id, None).await?;
    let x2 = repo.append_child(&scope, root.id, None).await?;
    let x3 = repo.append_child(&scope, root.id, None).await?;
    assert_sound(&repo, &scope).await?;

    let first = repo.prepend_child(&scope, root.id, None).await?;
    let before_x2 = repo.insert_before(&scope, x2.id, None).await?;
    let after_x3 = repo.insert_after(&scope, x3.id, None).await?;
    let grandchild = repo.append_child(&scope, x1.id, None).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(
        ids(&repo.children(&scope, root.id).await?),
        vec![first.id, x1.id, before_x2.id, x2.id, x3.id, after_x3.id]
    );

    repo.move_node(&scope, x1.id, Placement::After(after_x3.id)).await?;
    assert_sound(&repo, &scope).await?;
    repo.move_node(&scope, grandchild.id, Placement::PrependTo(root.id)).await?;
    assert_sound(&repo, &scope).await?;
    repo.move_node(&scope, x2.id, Placement::AppendTo(first.id)).await?;
    assert_sound(&repo, &scope).await?;
    repo.move_node(&scope, first.id, Placement::Root).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(ids(&repo.roots(&scope).await?), vec![root.id, first.id]);

    let second_root = repo.insert_before(&scope, root.id, None).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(
        ids(&repo.roots(&scope).await?),
        vec![second_root.id, root.id, first.id]
    );

    repo.move_node(&scope, first.id, Placement::AppendTo(second_root.id)).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(ids(&repo.descendants(&scope, second_root.id).await?), vec![first.id, x2.id]);

    repo.delete(&scope, x3.id, DeleteMode::Hard).await?;
    assert_sound(&repo, &scope).await?;
    repo.delete(&scope, second_root.id, DeleteMode::Hard).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(ids(&repo.roots(&scope).await?), vec![root.id]);
    assert_eq!(bounds(&repo, &scope, root.id).await?.0, 1);
    Ok(())
}

#[tokio::test]
async fn rebuild_restores_boundaries_from_parent_ids() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, _c) = abc(&repo, &scope).await?;
    repo.append_child(&scope, b.id, None).await?;
    repo.create_root(&scope, None).await?;
    repo.prepend_child(&scope, a.id, None).await?;

    let before = repo.store().nodes(&scope)?;
    let items: Vec<FlatNode> = before.iter().map(Node::flat).collect();

    for node in &before {
        let mut wiped = node.clone();
        wiped.lft = 0;
        wiped.rgt = 0;
        repo.store().overwrite(wiped)?;
    }
    assert!(repo.is_broken(&scope).await?);

    let report = repo.rebuild_tree(&scope, &items).await?;
    assert_eq!(report.updated, before.len() as u64);
    assert_eq!((report.inserted, report.deleted), (0, 0));
    assert_eq!(repo.store().nodes(&scope)?, before);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn rebuild_tree_inserts_and_removes_rows() -> TestResult {
    let repo = repository();
    let scope = Scope::new(["menu"]);
    let (a, b, c) = abc(&repo, &scope).await?;

    let items = [
        FlatNode::root(a.id),
        FlatNode::child(100, c.id),
        FlatNode::child(c.id, a.id),
    ];
    let report = repo.rebuild_tree(&scope, &items).await?;
    assert_eq!(report.inserted, 1);
    assert_eq!(report.deleted, 1);
    assert!(matches!(
        repo.node(&scope, b.id).await,
        Err(NestedSetError::NotFound(id)) if id == b.id
    ));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (2, 5));
    assert_eq!(bounds(&repo, &scope, NodeId::new(100)).await?, (3, 4));
    assert_sound(&repo, &scope).await?;

    let cyclic = [FlatNode::child(1, 2), FlatNode::child(2, 1)];
    let err = repo.rebuild_tree(&scope, &cyclic).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Cycle(_)));
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn rebuild_subtree_replaces_descendants_and_shifts_the_rest() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let root = repo.create_root(&scope, None).await?;
    let a = repo.append_child(&scope, root.id, None).await?;
    let a1 = repo.append_child(&scope, a.id, None).await?;
    let a2 = repo.append_child(&scope, a.id, None).await?;
    let b = repo.append_child(&scope, root.id, None).await?;

    let items = [
        FlatNode::child(50, a.id),
        FlatNode::child(a2.id, 50),
        FlatNode::child(51, a.id),
        FlatNode::root(a.id),
    ];
    let report = repo.rebuild_subtree(&scope, a.id, &items).await?;
    assert_eq!(report.deleted, 1);
    assert_eq!(report.inserted, 2);
    assert_sound(&repo, &scope).await?;

    assert!(repo.node(&scope, a1.id).await.is_err());
    assert_eq!(
        ids(&repo.descendants(&scope, a.id).await?),
        vec![NodeId::new(50), a2.id, NodeId::new(51)]
    );
    assert_eq!(repo.parent(&scope, a.id).await?.map(|p| p.id), Some(root.id));
    assert_eq!(bounds(&repo, &scope, b.id).await?, (10, 11));

    let outsider = [FlatNode::child(b.id, a.id)];
    let err = repo.rebuild_subtree(&scope, a.id, &outsider).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn fix_subtree_repairs_only_what_hangs_below_the_root() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let root = repo.create_root(&scope, None).await?;
    let a = repo.append_child(&scope, root.id, None).await?;
    let a1 = repo.append_child(&scope, a.id, None).await?;
    repo.append_child(&scope, root.id, None).await?;

    let mut broken = repo.node(&scope, a1.id).await?;
    broken.lft = 9;
    broken.rgt = 4;
    repo.store().overwrite(broken)?;
    assert!(repo.is_broken(&scope).await?);

    assert_eq!(repo.fix_subtree(&scope, a.id).await?, 1);
    assert_sound(&repo, &scope).await?;
    assert_eq!(bounds(&repo, &scope, a1.id).await?, (3, 4));

    let mut root_row = repo.node(&scope, root.id).await?;
    root_row.rgt = 0;
    repo.store().overwrite(root_row)?;
    let err = repo.fix_subtree(&scope, root.id).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    Ok(())
}

#[tokio::test]
async fn fix_subtree_refuses_rows_reparented_out_of_its_range() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;
    let e = repo.create_root(&scope, None).await?;

    let mut moved = repo.node(&scope, c.id).await?;
    moved.parent_id = Some(e.id);
    repo.store().overwrite(moved)?;
    let counts = repo.count_errors(&scope).await?;
    assert_eq!(counts.wrong_parent, 1);

    let before = repo.store().nodes(&scope)?;
    let err = repo.fix_subtree(&scope, a.id).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    assert_eq!(repo.store().nodes(&scope)?, before);
    assert_eq!(repo.count_errors(&scope).await?, counts);

    repo.fix_tree(&scope).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 4));
    assert_eq!(bounds(&repo, &scope, b.id).await?, (2, 3));
    assert_eq!(bounds(&repo, &scope, e.id).await?, (5, 8));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (6, 7));
    Ok(())
}

#[tokio::test]
async fn fix_subtree_refuses_rows_adopted_from_outside_its_range() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, _, _) = abc(&repo, &scope).await?;
    let e = repo.create_root(&scope, None).await?;

    let mut adopted = repo.node(&scope, e.id).await?;
    adopted.parent_id = Some(a.id);
    repo.store().overwrite(adopted)?;

    let err = repo.fix_subtree(&scope, a.id).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));

    repo.fix_tree(&scope).await?;
    assert_sound(&repo, &scope).await?;
    assert_eq!(repo.children(&scope, a.id).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn moves_carry_the_whole_subtree() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;
    let b1 = repo.append_child(&scope, b.id, None).await?;
    let b2 = repo.append_child(&scope, b.id, None).await?;
    repo.append_child(&scope, b1.id, None).await?;

    let shape = |rows: Vec<Node>| {
        let base = rows.first().map_or(0, |node| node.lft);
        rows.into_iter()
            .map(|node| (node.id, node.lft - base, node.rgt - base))
            .collect::<Vec<_>>()
    };
    let before = shape(repo.self_and_descendants(&scope, b.id).await?);
    let total = repo.store().nodes(&scope)?.len();

    repo.move_node(&scope, b.id, Placement::AppendTo(c.id)).await?;
    assert_eq!(shape(repo.self_and_descendants(&scope, b.id).await?), before);
    assert_eq!(repo.store().nodes(&scope)?.len(), total);
    assert_eq!(repo.depth(&scope, b2.id).await?, 3);
    assert_sound(&repo, &scope).await?;

    repo.move_node(&scope, b.id, Placement::Root).await?;
    assert_eq!(shape(repo.self_and_descendants(&scope, b.id).await?), before);
    assert_eq!(repo.depth(&scope, b2.id).await?, 1);
    assert_eq!(ids(&repo.roots(&scope).await?), vec![a.id, b.id]);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn moving_into_own_subtree_is_rejected_without_changes() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, _c) = abc(&repo, &scope).await?;
    let before = repo.store().nodes(&scope)?;

    let err = repo
        .move_node(&scope, a.id, Placement::AppendTo(b.id))
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::Cycle(id) if id == a.id));
    let err = repo
        .move_node(&scope, a.id, Placement::PrependTo(a.id))
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::Cycle(_)));
    let err = repo
        .move_node(&scope, a.id, Placement::After(b.id))
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::Cycle(_)));

    let unchanged = repo.move_node(&scope, b.id, Placement::Before(b.id)).await?;
    assert_eq!((unchanged.lft, unchanged.rgt), (2, 3));
    repo.move_node(&scope, b.id, Placement::PrependTo(a.id)).await?;
    assert_eq!(repo.store().nodes(&scope)?, before);
    Ok(())
}

#[tokio::test]
async fn move_up_and_down_reorder_siblings() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let parent = repo.create_root(&scope, None).await?;
    let mut kids = Vec::new();
    for _ in 0..4 {
        kids.push(repo.append_child(&scope, parent.id, None).await?.id);
    }
    let (c1, c2, c3, c4) = (kids[0], kids[1], kids[2], kids[3]);

    assert_eq!(repo.move_down(&scope, c1, 2).await?, 2);
    assert_eq!(ids(&repo.children(&scope, parent.id).await?), vec![c2, c3, c1, c4]);

    assert_eq!(repo.move_up(&scope, c4, 10).await?, 3);
    assert_eq!(ids(&repo.children(&scope, parent.id).await?), vec![c4, c2, c3, c1]);

    assert_eq!(repo.move_up(&scope, c4, 1).await?, 0);
    assert_eq!(repo.move_down(&scope, c1, 1).await?, 0);
    assert_eq!(ids(&repo.prev_siblings(&scope, c3).await?), vec![c4, c2]);
    assert_eq!(ids(&repo.next_siblings(&scope, c3).await?), vec![c1]);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn soft_delete_and_restore_are_symmetric() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;
    let b1 = repo.append_child(&scope, b.id, None).await?;
    let before = repo.store().nodes(&scope)?;

    assert_eq!(repo.delete(&scope, b.id, DeleteMode::Soft).await?, 2);
    assert_eq!(repo.delete(&scope, b.id, DeleteMode::Soft).await?, 0);
    assert_eq!(ids(&repo.descendants(&scope, a.id).await?), vec![c.id]);
    assert!(repo.node(&scope, b1.id).await?.is_deleted());
    assert_sound(&repo, &scope).await?;

    let err = repo.append_child(&scope, b.id, None).await.unwrap_err();
    assert!(matches!(err, NestedSetError::NotFound(id) if id == b.id));

    assert_eq!(repo.restore(&scope, b.id).await?, 2);
    assert_eq!(repo.restore(&scope, b.id).await?, 0);
    assert_eq!(repo.store().nodes(&scope)?, before);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn restore_only_revives_its_own_batch() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, _c) = abc(&repo, &scope).await?;
    let b1 = repo.append_child(&scope, b.id, None).await?;

    assert_eq!(repo.delete(&scope, b1.id, DeleteMode::Soft).await?, 1);
    assert_eq!(repo.delete(&scope, a.id, DeleteMode::Soft).await?, 3);

    let first = repo.node(&scope, b1.id).await?.deleted_at;
    let second = repo.node(&scope, a.id).await?.deleted_at;
    assert!(first < second);

    assert_eq!(repo.restore(&scope, a.id).await?, 3);
    assert!(repo.node(&scope, b1.id).await?.is_deleted());
    assert_eq!(repo.restore(&scope, b1.id).await?, 1);
    assert!(repo.store().nodes(&scope)?.iter().all(|node| !node.is_deleted()));
    Ok(())
}

#[tokio::test]
async fn hard_delete_reclaims_the_subtree_width() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let (a, b, c) = abc(&repo, &scope).await?;
    repo.append_child(&scope, b.id, None).await?;
    repo.delete(&scope, c.id, DeleteMode::Soft).await?;

    assert_eq!(repo.delete(&scope, b.id, DeleteMode::Hard).await?, 2);
    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 4));
    assert_eq!(bounds(&repo, &scope, c.id).await?, (2, 3));
    assert_sound(&repo, &scope).await?;

    assert_eq!(repo.delete(&scope, c.id, DeleteMode::Hard).await?, 1);
    assert_eq!(bounds(&repo, &scope, a.id).await?, (1, 2));
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn scopes_hold_independent_trees() -> TestResult {
    let repo = repository();
    let tenant_a = Scope::new([7]);
    let tenant_b = Scope::new([8]);

    let root_a = repo.create_root(&tenant_a, None).await?;
    let root_b = repo.create_root(&tenant_b, None).await?;
    repo.append_child(&tenant_b, root_b.id, None).await?;

    assert_eq!(bounds(&repo, &tenant_a, root_a.id).await?, (1, 2));
    assert_eq!(bounds(&repo, &tenant_b, root_b.id).await?, (1, 4));

    let err = repo.node(&tenant_b, root_a.id).await.unwrap_err();
    assert!(matches!(
        err,
        NestedSetError::ScopeMismatch { id, ref actual, .. } if id == root_a.id && *actual == tenant_a
    ));
    let err = repo
        .append_child(&tenant_b, root_a.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::ScopeMismatch { .. }));

    let all = repo.count_errors_all().await?;
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|(_, counts)| counts.is_clean()));

    let forest = repo.tree(&tenant_b).await?;
    assert_eq!(forest.len(), 1);
    assert_eq!(forest[0].children.len(), 1);
    assert_eq!(repo.subtree(&tenant_b, root_b.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn single_root_policy_refuses_a_second_root() -> TestResult {
    let repo = repository().with_root_policy(RootPolicy::Single);
    let scope = Scope::global();
    let root = repo.create_root(&scope, None).await?;
    let child = repo.append_child(&scope, root.id, None).await?;

    let err = repo.create_root(&scope, None).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    let err = repo.insert_after(&scope, root.id, None).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    let err = repo
        .move_node(&scope, child.id, Placement::Root)
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));

    let unchanged = repo.move_node(&scope, root.id, Placement::Root).await?;
    assert_eq!((unchanged.lft, unchanged.rgt), (1, 4));
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn writers_time_out_on_a_held_scope_lock() -> TestResult {
    let repo = NestedSetRepository::new(MemoryStore::with_lock_timeout(Duration::from_millis(20)));
    let scope = Scope::global();
    let root = repo.create_root(&scope, None).await?;

    let held = nested_set::NodeStore::begin(repo.store(), &scope).await?;
    let err = repo.append_child(&scope, root.id, None).await.unwrap_err();
    assert!(matches!(err, NestedSetError::ConcurrentModification(_)));
    assert!(err.is_retryable());

    // Readers do not wait for writers.
    assert_eq!(bounds(&repo, &scope, root.id).await?, (1, 2));
    drop(held);

    repo.append_child(&scope, root.id, None).await?;
    assert_sound(&repo, &scope).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_writers_on_one_scope_are_serialized() -> TestResult {
    let store = MemoryStore::new();
    let scope = Scope::global();
    let root = NestedSetRepository::new(store.clone())
        .create_root(&scope, None)
        .await?;
    let root_id = root.id;

    let mut writers = tokio::task::JoinSet::new();
    for i in 0..16 {
        let repo = NestedSetRepository::new(store.clone());
        let scope = scope.clone();
        writers.spawn(async move {
            if i % 2 == 0 {
                repo.create_root(&scope, None).await
            } else {
                repo.append_child(&scope, root_id, None).await
            }
        });
    }
    while let Some(joined) = writers.join_next().await {
        joined??;
    }

    let repo = NestedSetRepository::new(store);
    assert_eq!(repo.store().nodes(&scope)?.len(), 17);
    assert_eq!(repo.roots(&scope).await?.len(), 9);
    assert_eq!(repo.children(&scope, root.id).await?.len(), 8);
    assert_sound(&repo, &scope).await
}

#[tokio::test]
async fn open_transactions_in_different_scopes_cannot_share_an_id() -> TestResult {
    let store = MemoryStore::new();
    let slot = NodeSlot {
        parent_id: None,
        lft: 1,
        rgt: 2,
    };
    let id = NodeId::new(42);

    let mut first = store.begin(&Scope::new([1])).await?;
    let mut second = store.begin(&Scope::new([2])).await?;
    first.insert_node(Some(id), slot.clone()).await?;
    let err = second.insert_node(Some(id), slot.clone()).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    second.rollback().await?;
    first.rollback().await?;

    // A rolled back insert frees the id.
    let repo = NestedSetRepository::new(store);
    let root = repo.create_root(&Scope::new([2]), Some(id)).await?;
    assert_eq!(root.id, id);
    let err = repo.create_root(&Scope::new([1]), Some(id)).await.unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    Ok(())
}

#[tokio::test]
async fn explicit_ids_must_be_unique() -> TestResult {
    let repo = repository();
    let scope = Scope::global();
    let root = repo.create_root(&scope, Some(NodeId::new(10))).await?;
    assert_eq!(root.id, NodeId::new(10));

    let err = repo
        .append_child(&scope, root.id, Some(NodeId::new(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, NestedSetError::Invariant(_)));
    assert_sound(&repo, &scope).await?;

    let next = repo.append_child(&scope, root.id, None).await?;
    assert!(next.id > NodeId::new(10));
    Ok(())
}
